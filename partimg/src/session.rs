//! Drive every discovered partition through decode and describe

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::classify::{discover, PartitionSource};
use crate::config::Config;
use crate::describe::{Describer, Description};
use crate::error::{PartimgError, PartitionFailure, Stage};
use crate::pipeline::{Decoded, Pipeline};
use crate::tool::ToolRunner;

/// Outcome of a whole unpack run
#[derive(Debug, Default)]
pub struct RunReport {
    pub described: Vec<Description>,
    /// Failures that only cost their own partition
    pub failures: Vec<PartitionFailure>,
    /// Failure that stopped the run, partitions after it were never started
    pub aborted: Option<PartitionFailure>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.aborted.is_none()
    }

    /// Exit code of the first failure, aborts win over per-partition failures
    pub fn exit_code(&self) -> u8 {
        self.aborted
            .as_ref()
            .or_else(|| self.failures.first())
            .map(|f| f.source.exit_code())
            .unwrap_or(0)
    }
}

pub struct Unpacker {
    config: Config,
    pipeline: Pipeline,
    describer: Describer,
    interrupt: Option<&'static AtomicBool>,
}

impl Unpacker {
    pub fn new(config: &Config, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            config: config.clone(),
            pipeline: Pipeline::new(config, runner.clone()),
            describer: Describer::new(config, runner),
            interrupt: None,
        }
    }

    /// Use an already built pipeline, mostly for swapping in fake transforms
    pub fn with_pipeline(config: &Config, pipeline: Pipeline, runner: Arc<dyn ToolRunner>) -> Self {
        Self { config: config.clone(), pipeline, describer: Describer::new(config, runner), interrupt: None }
    }

    /// Stop before the next partition once `flag` is set, usually from a signal handler
    pub fn with_interrupt(mut self, flag: &'static AtomicBool) -> Self {
        self.interrupt = Some(flag);
        self
    }

    /// Discover sources under the configured source directory and unpack them
    pub fn run(&self) -> Result<RunReport, PartimgError> {
        let sources = discover(&self.config.source_dir, &self.config.partitions)?;
        if sources.is_empty() {
            warn!("nothing to unpack in {}", self.config.source_dir.display());
        }
        Ok(self.unpack(sources))
    }

    /// Process `sources` in order. Partitions split out of a super image are handled before the
    /// remaining sources.
    pub fn unpack(&self, sources: Vec<PartitionSource>) -> RunReport {
        let mut report = RunReport::default();
        let mut queue = VecDeque::from(sources);

        while let Some(source) = queue.pop_front() {
            if self.interrupted() {
                let failure = PartitionFailure::new(
                    &source.name,
                    Stage::Classify,
                    PartimgError::Interrupted("unpack".to_string()),
                );
                error!("{failure}");
                report.aborted = Some(failure);
                break;
            }

            match self.unpack_one(&source) {
                Ok(description) => report.described.push(description),
                Err(Next::Split(parts)) => {
                    info!("{} split into {} partitions", source.name, parts.len());
                    for part in parts.into_iter().rev() {
                        queue.push_front(part);
                    }
                }
                Err(Next::Failed(failure)) if failure.source.aborts_run() => {
                    error!("{failure}, stopping");
                    report.aborted = Some(failure);
                    break;
                }
                Err(Next::Failed(failure)) => {
                    error!("{failure}");
                    report.failures.push(failure);
                }
            }
        }
        report
    }

    fn unpack_one(&self, source: &PartitionSource) -> Result<Description, Next> {
        info!("unpacking {}", source.name);
        match self.pipeline.decode(source).map_err(Next::Failed)? {
            Decoded::Split(parts) => Err(Next::Split(parts)),
            Decoded::Image(image) => self.describer.describe(&image).map_err(Next::Failed),
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt.is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

/// Anything other than a described partition
enum Next {
    Split(Vec<PartitionSource>),
    Failed(PartitionFailure),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::TransformKind;

    fn failure(source: PartimgError) -> PartitionFailure {
        PartitionFailure::new("vendor", Stage::Decode(TransformKind::BrotliDecompress), source)
    }

    #[test]
    fn report_exit_codes() {
        let mut report = RunReport::default();
        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);

        report.failures.push(failure(PartimgError::Format("no signature".to_string())));
        assert!(!report.is_success());
        assert_eq!(report.exit_code(), 1);

        report.aborted = Some(failure(PartimgError::ToolFailure {
            tool: "mke2fs".to_string(),
            status: 1,
            output: String::new(),
        }));
        assert_eq!(report.exit_code(), 4);
    }

    #[test]
    fn format_errors_do_not_stop_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_project(dir.path());
        std::fs::create_dir_all(&config.source_dir).unwrap();
        let odm = config.source_dir.join("odm.img");
        let product = config.source_dir.join("product.img");
        std::fs::write(&odm, vec![0xaa; 4096]).unwrap();
        std::fs::write(&product, vec![0xbb; 4096]).unwrap();

        let unpacker = Unpacker::new(&config, Arc::new(crate::tool::ProcessRunner));
        let report = unpacker.unpack(vec![
            PartitionSource::single("odm", &odm),
            PartitionSource::single("product", &product),
        ]);
        assert!(report.aborted.is_none());
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].partition, "odm");
        assert_eq!(report.failures[1].partition, "product");
        assert!(report.failures.iter().all(|f| matches!(f.source, PartimgError::Format(_))));
    }

    #[test]
    fn interrupt_stops_before_next_partition() {
        static FLAG: AtomicBool = AtomicBool::new(true);
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_project(dir.path());
        let unpacker = Unpacker::new(&config, Arc::new(crate::tool::ProcessRunner)).with_interrupt(&FLAG);
        let report = unpacker.unpack(vec![PartitionSource::single("odm", dir.path().join("odm.img"))]);
        let aborted = report.aborted.unwrap();
        assert_eq!(aborted.partition, "odm");
        assert!(matches!(aborted.source, PartimgError::Interrupted(_)));
    }
}
