use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{CommandFactory, Parser};
use clap_complete::{generate, Shell};
use indicatif::{HumanDuration, ProgressBar};
use partimg::{PartimgError, Partition, PartitionFailure, ProcessRunner, RebuildPlanner, Stage, TransformKind};
use partimg_cli::{
    after_help_common, failed, install_interrupt_handler, interrupted, load_config, status, BLUE_BOLD,
    RED_BOLD,
};
use tracing_subscriber::EnvFilter;

// -musl malloc is slow, use jemalloc
#[cfg(all(target_env = "musl", target_pointer_width = "64"))]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// tool to rebuild Android partition images from an unpacked tree and its metadata
///
/// Without any of --raw, --sparse or --brotli every stage runs.
#[derive(Parser)]
#[command(author,
          version,
          name = "repack-partimg",
          after_help = after_help_common(),
          max_term_width = 98,
          styles = clap_cargo::style::CLAP_STYLING,
)]
struct Args {
    /// Partitions to rebuild, defaults to every extracted partition with a features file
    partitions: Vec<String>,

    /// Project directory holding source/, config/, output/ and build/
    #[arg(short, long, default_value = ".", name = "DIR")]
    project: PathBuf,

    /// TOML configuration, defaults to DIR/partimg.toml when present
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Create build/<partition>.img with mke2fs and e2fsdroid
    #[arg(long)]
    raw: bool,

    /// Convert build/<partition>.img to build/<partition>.sparse
    #[arg(long)]
    sparse: bool,

    /// Convert build/<partition>.sparse to build/<partition>.new.dat.br
    #[arg(long)]
    brotli: bool,

    /// Emit shell completion scripts
    #[arg(long)]
    completions: Option<Shell>,

    /// Silence all progress bar and RUST_LOG output
    #[arg(long)]
    quiet: bool,
}

impl Args {
    fn all_stages(&self) -> bool {
        !(self.raw || self.sparse || self.brotli)
    }

    /// First stage a partition goes through
    fn first_stage(&self) -> Stage {
        if self.raw || self.all_stages() {
            Stage::FilesystemCreate
        } else if self.sparse {
            Stage::Encode(TransformKind::SparseEncode)
        } else {
            Stage::Encode(TransformKind::TransferListEncode)
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    if !args.quiet {
        // setup tracing to RUST_LOG or just warnings
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(io::stderr).init();
    }

    if let Some(completions) = args.completions {
        let mut cmd = Args::command();
        let name = cmd.get_name().to_string();
        generate(completions, &mut cmd, name, &mut io::stdout());
        return ExitCode::SUCCESS;
    }

    let pb = if args.quiet { ProgressBar::hidden() } else { ProgressBar::new_spinner() };

    let config = match load_config(args.config.as_deref(), &args.project) {
        Ok(config) => config,
        Err(e) => {
            failed(&pb, &format!("could not load config: {e}"));
            return ExitCode::FAILURE;
        }
    };
    let planner = RebuildPlanner::new(&config, Arc::new(ProcessRunner));

    let partitions = if args.partitions.is_empty() {
        match planner.buildable() {
            Ok(partitions) => partitions,
            Err(e) => {
                failed(&pb, &format!("{}: {e}", config.output_dir.display()));
                return ExitCode::FAILURE;
            }
        }
    } else {
        args.partitions.iter().map(Partition::new).collect()
    };
    if partitions.is_empty() {
        failed(&pb, &format!("nothing to rebuild in {}", config.output_dir.display()));
        return ExitCode::FAILURE;
    }

    if args.raw || args.all_stages() {
        if let Err(e) = planner.assemble_global_contexts() {
            failed(&pb, &e.to_string());
            return ExitCode::from(e.exit_code());
        }
    }

    install_interrupt_handler();

    let start = Instant::now();
    if !args.quiet {
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message(format!("{:>16}", BLUE_BOLD.apply_to("Repacking")));
    }

    let mut code = 0;
    for partition in &partitions {
        if interrupted() {
            let failure = PartitionFailure::new(
                partition.name(),
                args.first_stage(),
                PartimgError::Interrupted("repack".to_string()),
            );
            tracing::error!("{failure}");
            failed(&pb, &failure.to_string());
            code = failure.source.exit_code();
            break;
        }
        match repack(&args, &planner, partition, &pb) {
            Ok(()) => {}
            Err(failure) if failure.source.aborts_run() => {
                failed(&pb, &failure.to_string());
                code = failure.source.exit_code();
                break;
            }
            Err(failure) => {
                failed(&pb, &failure.to_string());
                if code == 0 {
                    code = failure.source.exit_code();
                }
            }
        }
    }

    if !args.quiet {
        let line = if code == 0 {
            format!("{:>16} in {}", BLUE_BOLD.apply_to("Finished"), HumanDuration(start.elapsed()))
        } else {
            format!("{:>16} in {}", RED_BOLD.apply_to("Finished with errors"), HumanDuration(start.elapsed()))
        };
        pb.finish_with_message(line);
    }

    ExitCode::from(code)
}

fn repack(
    args: &Args,
    planner: &RebuildPlanner,
    partition: &Partition,
    pb: &ProgressBar,
) -> Result<(), PartitionFailure> {
    if args.raw || args.all_stages() {
        let image = planner.build_raw(partition)?;
        status(pb, "Created", &image.display().to_string());
    }
    if args.sparse || args.all_stages() {
        let image = planner.encode_sparse(partition)?;
        status(pb, "Converted", &image.display().to_string());
    }
    if args.brotli || args.all_stages() {
        let image = planner.encode_brotli(partition)?;
        status(pb, "Compressed", &image.display().to_string());
    }
    Ok(())
}
