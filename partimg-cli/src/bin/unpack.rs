use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{CommandFactory, Parser};
use clap_complete::{generate, Shell};
use indicatif::{HumanDuration, ProgressBar};
use partimg::classify::discover;
use partimg::partition::partition_name;
use partimg::{FirmwareIntake, PartitionSource, ProcessRunner, RomInfo, Unpacker};
use partimg_cli::{
    after_help_unpack, failed, install_interrupt_handler, load_config, status, BLUE_BOLD, RED_BOLD,
};
use tracing_subscriber::EnvFilter;

// -musl malloc is slow, use jemalloc
#[cfg(all(target_env = "musl", target_pointer_width = "64"))]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// tool to classify, decode and describe Android partition images
#[derive(Parser)]
#[command(author,
          version,
          name = "unpack-partimg",
          after_help = after_help_unpack(),
          max_term_width = 98,
          styles = clap_cargo::style::CLAP_STYLING,
)]
struct Args {
    /// Unpack only this image, instead of every partition in the source directory
    #[arg(required = false)]
    image: Option<PathBuf>,

    /// Firmware zip, its partition files are extracted into the source directory first
    #[arg(short, long, conflicts_with = "image")]
    archive: Option<PathBuf>,

    /// Project directory holding source/, config/, output/ and build/
    #[arg(short, long, default_value = ".", name = "DIR")]
    project: PathBuf,

    /// TOML configuration, defaults to DIR/partimg.toml when present
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the container and filesystem of every source, do not decode
    #[arg(long)]
    classify: bool,

    /// Emit shell completion scripts
    #[arg(long)]
    completions: Option<Shell>,

    /// Silence all progress bar and RUST_LOG output
    #[arg(long)]
    quiet: bool,
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

    if let Some(archive) = &args.archive {
        match FirmwareIntake::new(&config, Arc::new(ProcessRunner)).intake(archive) {
            Ok(intake) => {
                let payload = if intake.payload { ", payload dumped" } else { "" };
                let detail = format!("{} ({} files{payload})", archive.display(), intake.extracted.len());
                status(&pb, "Extracted", &detail);
            }
            Err(failure) => {
                failed(&pb, &failure.to_string());
                return ExitCode::from(failure.source.exit_code());
            }
        }
    }

    let sources = match &args.image {
        Some(image) => {
            let file_name = image.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            vec![PartitionSource::single(partition_name(&file_name), image)]
        }
        None => match discover(&config.source_dir, &config.partitions) {
            Ok(sources) => sources,
            Err(e) => {
                failed(&pb, &format!("{}: {e}", config.source_dir.display()));
                return ExitCode::FAILURE;
            }
        },
    };

    if args.classify {
        return classify(&config, &sources, &pb);
    }

    let interrupt = install_interrupt_handler();

    let start = Instant::now();
    if !args.quiet {
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message(format!("{:>16}", BLUE_BOLD.apply_to("Unpacking")));
    }

    let unpacker = Unpacker::new(&config, Arc::new(ProcessRunner)).with_interrupt(interrupt);
    let report = unpacker.unpack(sources);

    for description in &report.described {
        let detail = match description.counts {
            Some(counts) => format!(
                "{} ({}, {} directories, {} files, {} symlinks)",
                description.partition,
                description.filesystem,
                counts.directories,
                counts.files,
                counts.symlinks
            ),
            None => format!("{} ({})", description.partition, description.filesystem),
        };
        status(&pb, "Described", &detail);
    }
    for failure in report.failures.iter().chain(&report.aborted) {
        failed(&pb, &failure.to_string());
    }

    if !args.quiet {
        let line = if report.is_success() {
            format!("{:>16} in {}", BLUE_BOLD.apply_to("Finished"), HumanDuration(start.elapsed()))
        } else {
            format!("{:>16} in {}", RED_BOLD.apply_to("Finished with errors"), HumanDuration(start.elapsed()))
        };
        pb.finish_with_message(line);
    }

    if let Some(prop) = RomInfo::find(&config.output_dir) {
        match RomInfo::from_build_prop(&prop) {
            Ok(info) => {
                for (label, value) in info.fields() {
                    println!("{:>16} {value}", BLUE_BOLD.apply_to(label));
                }
            }
            Err(e) => tracing::warn!("could not read {}: {e}", prop.display()),
        }
    }

    ExitCode::from(report.exit_code())
}

fn classify(config: &partimg::Config, sources: &[PartitionSource], pb: &ProgressBar) -> ExitCode {
    let classifier = partimg::Classifier::new(config);
    let mut code = ExitCode::SUCCESS;
    for source in sources {
        match classifier.classify_source(source) {
            Ok(class) => println!("{} {} {}", source.name, class.container, class.filesystem),
            Err(e) => {
                failed(pb, &format!("{}: {e}", source.name));
                code = ExitCode::from(e.exit_code());
            }
        }
    }
    code
}
