//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::prelude::*;

/// Initialize tracing.
///
/// `RUST_LOG` takes precedence; otherwise only warnings and errors are shown,
/// or everything down to debug level when `debug` is set.
pub fn initialize_tracing(debug: bool) {
    // When running as root (the usual case, since oz-install drives qemu-kvm)
    // key messages (info, warn, error) also go to the journal.
    let journald_layer = if rustix::process::getuid().is_root() {
        tracing_journald::layer()
            .ok()
            .map(|layer| layer.with_filter(tracing_subscriber::filter::LevelFilter::INFO))
    } else {
        None
    };

    let default_directive = if debug {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::WARN
    };
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_directive.into())
        .from_env_lossy();

    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();

    let fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr)
        .with_filter(filter);

    match journald_layer {
        Some(journald) => {
            tracing_subscriber::registry()
                .with(fmt_layer)
                .with(journald)
                .init();
        }
        None => {
            tracing_subscriber::registry().with(fmt_layer).init();
        }
    }
}
