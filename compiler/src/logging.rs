//! Logging configuration for the escape analysis engine
//!
//! Initializes the `log` facade with `env_logger`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use pea_compiler::logging;
//!
//! // Initialize with default level (Warn)
//! logging::init();
//!
//! // Or initialize from RUST_LOG environment variable
//! logging::init_from_env();
//!
//! // Or initialize with a specific level
//! logging::init_with_level(log::LevelFilter::Debug);
//! ```
//!
//! # Log Levels
//!
//! - `warn!` - ensure-virtualized violations and ignored settings
//! - `debug!` - loop iterations, merge results, materializations, effect replay
//! - `trace!` - per-block walk and per-node decisions
//!
//! # Environment Variable
//!
//! ```bash
//! RUST_LOG=debug pea demo loop
//! RUST_LOG=pea_compiler::phases::ea::closure=trace pea demo nested-loops
//! ```

use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize logging at Warn level. Subsequent calls are no-ops.
pub fn init() {
    init_with_level(LevelFilter::Warn);
}

/// Initialize logging with a specific level.
///
/// This only initializes once; subsequent calls are no-ops.
pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| {
        Builder::new()
            .filter_level(level)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{:5}] {} - {}",
                    record.level(),
                    record.module_path().unwrap_or("unknown"),
                    record.args()
                )
            })
            .init();
    });
}

/// Initialize logging from RUST_LOG, defaulting to Warn
pub fn init_from_env() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    });
}

/// Logging for the `pea` binary: Debug for this crate when `verbose`, otherwise
/// whatever `RUST_LOG` asks for
pub fn init_cli(verbose: bool) {
    if verbose {
        INIT.call_once(|| {
            Builder::new()
                .filter_level(LevelFilter::Warn)
                .filter_module("pea_compiler", LevelFilter::Debug)
                .format(|buf, record| writeln!(buf, "[{:5}] {}", record.level(), record.args()))
                .init();
        });
    } else {
        init_from_env();
    }
}

/// Initialize logging for tests; safe to call from every test
pub fn init_test() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Warn)
        .is_test(true)
        .try_init();
}

/// Whether one of the `init*` functions other than `init_test` ran
pub fn is_initialized() -> bool {
    INIT.is_completed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_test_is_idempotent() {
        init_test();
        init_test();
        log::debug!("still fine");
    }
}
