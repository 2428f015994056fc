//! `tracing` subscriber setup.
//!
//! All roomcast crates log through `tracing` macros. The host application
//! decides where the output goes; these helpers cover the two common cases:
//!
//! - [`init_subscriber`]: compact human-readable lines on stderr
//! - [`init_json_subscriber`]: one JSON object per line on stderr
//!
//! `RUST_LOG` takes precedence over the level passed in. Both helpers are
//! no-ops once a global subscriber is installed.
//!
//! [`test_utils`] captures events in memory so tests can assert on logs.

pub mod test_utils;

pub use test_utils::{CapturedEvent, CapturedLogs, capture_logs};

use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` if set and valid, `level` otherwise.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install a compact stderr subscriber.
///
/// Returns `false` if a global subscriber was already set.
pub fn init_subscriber(level: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .is_ok()
}

/// Install a JSON-lines stderr subscriber.
///
/// Returns `false` if a global subscriber was already set.
pub fn init_json_subscriber(level: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(true)
        .with_writer(std::io::stderr)
        .json()
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_noop() {
        // Whichever call wins, the other must report the subscriber as taken.
        let first = init_subscriber("warn");
        let second = init_json_subscriber("warn");
        assert!(!(first && second));
        assert!(!init_subscriber("debug"));
    }
}
