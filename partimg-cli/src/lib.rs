use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;

use indicatif::ProgressBar;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use partimg::{Config, PartimgError};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_: nix::libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

#[doc(hidden)]
pub static RED_BOLD: LazyLock<console::Style> =
    LazyLock::new(|| console::Style::new().red().bold());
#[doc(hidden)]
pub static BLUE_BOLD: LazyLock<console::Style> =
    LazyLock::new(|| console::Style::new().blue().bold());

#[doc(hidden)]
pub fn after_help_unpack() -> String {
    let mut s = String::new();

    let header = color_print::cstr!("<green, bold>Decompressors available:</>\n");
    s.push_str(header);

    #[cfg(feature = "gzip")]
    s.push_str(color_print::cstr!("  <cyan, bold>gzip\n"));

    #[cfg(feature = "zstd")]
    s.push_str(color_print::cstr!("  <cyan, bold>zstd\n"));

    s.push_str(color_print::cstr!("  <cyan, bold>sparse, sparse chunks, transfer list\n"));
    s.push_str(color_print::cstr!("  <cyan, bold>zip archives\n"));
    s.push_str(color_print::cstr!("  <cyan, bold>brotli, super, payload.bin</> (external tools)\n"));

    s.push_str(&after_help_common());
    s
}

#[doc(hidden)]
pub fn after_help_common() -> String {
    let mut s = String::new();

    s.push_str(color_print::cstr!("<green, bold>Exit Codes:\n"));
    s.push_str(color_print::cstr!("  <cyan, bold>0:"));
    s.push_str("  success\n");
    s.push_str(color_print::cstr!("  <cyan, bold>1:"));
    s.push_str("  unrecognized format, missing input or failed tool\n");
    s.push_str(color_print::cstr!("  <cyan, bold>4:"));
    s.push_str("  filesystem creation failed\n");

    s.push_str(color_print::cstr!("<green, bold>Environment Variables:\n"));
    s.push_str(color_print::cstr!("  <cyan, bold>RUST_LOG:"));
    s.push_str("    https://docs.rs/tracing-subscriber/latest/tracing_subscriber/fmt/index.html#filtering-events-with-environment-variables");
    s
}

/// `--config` if given, else `<project>/partimg.toml` if it exists, else defaults for `project`
pub fn load_config(config: Option<&Path>, project: &Path) -> Result<Config, PartimgError> {
    let default = project.join("partimg.toml");
    match config {
        Some(path) => Config::from_path(path),
        None if default.exists() => Config::from_path(&default),
        None => Ok(Config::with_project(project)),
    }
}

/// Catch the first `SIGINT` into the returned flag
///
/// The running tool still dies from the signal, the caller stops before its next partition. A
/// second interrupt terminates.
pub fn install_interrupt_handler() -> &'static AtomicBool {
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::SA_RESETHAND,
        SigSet::empty(),
    );
    // SAFETY: the handler only stores to an atomic
    if let Err(e) = unsafe { sigaction(Signal::SIGINT, &action) } {
        tracing::warn!("could not install interrupt handler: {e}");
    }
    &INTERRUPTED
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

pub fn status(pb: &ProgressBar, verb: &str, s: &str) {
    let line = format!("{:>16} {}", BLUE_BOLD.apply_to(verb), s);
    pb.println(line);
}

pub fn failed(pb: &ProgressBar, s: &str) {
    let line = format!("{:>16} {}", RED_BOLD.apply_to("Failed"), s);
    pb.println(line);
}
