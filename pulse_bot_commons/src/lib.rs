//! Common plumbing shared by the pulse bots: logging and runtime
//! bootstrap, plus a couple of Telegram send helpers.

pub mod useful_methods;

use std::future::Future;

/// Initialize logging and run the `closure` to completion in a fresh
/// multi-threaded async runtime. The log filter defaults to `info` and can
/// be overridden with the `RUST_LOG` environment variable; this uses
/// [pretty_env_logger][] under the hood, see its documentation for details.
///
/// When running as a systemd service the journal already stamps every line,
/// so the timestamped format is only used for interactive runs.
///
/// [pretty_env_logger]: https://docs.rs/pretty_env_logger
pub fn start_everything(closure: impl Future<Output = ()>) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| String::from("info"));

    // systemd sets this for services with journal-connected stdout.
    let journald = std::env::var_os("JOURNAL_STREAM").is_some();

    let mut builder = if journald {
        pretty_env_logger::formatted_builder()
    } else {
        pretty_env_logger::formatted_timed_builder()
    };

    builder.parse_filters(&log_filter);

    if builder.try_init().is_err() {
        log::error!("Tried to init logger twice!");
    }

    log::info!("Logging is up.");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build the async runtime!")
        .block_on(closure);
}
