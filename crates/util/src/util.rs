//! Shared utilities for fleetcast.

use rand::Rng;
use std::time::Duration;

/// Panic in debug builds, log error with backtrace in release.
///
/// Use for invariants that a release build should survive and report
/// instead of tearing the whole engine down.
#[macro_export]
macro_rules! debug_panic {
    ( $($fmt_arg:tt)* ) => {
        if cfg!(debug_assertions) {
            panic!( $($fmt_arg)* );
        } else {
            let backtrace = std::backtrace::Backtrace::capture();
            tracing::error!("{}\n{:?}", format_args!($($fmt_arg)*), backtrace);
        }
    };
}

/// Pick a random delay in `[0, max)`.
///
/// Workers sleep for this long before their first pull so a freshly started
/// pool does not open all of its connections in the same instant.
pub fn start_jitter(max: Duration) -> Duration {
    let max_micros = max.as_micros().min(u64::MAX as u128) as u64;
    if max_micros == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(rand::rng().random_range(0..max_micros))
}

/// Substitute `$NAME` placeholders in `template`.
///
/// Longer names are replaced first so `$HOST_PORT` is not clobbered by a
/// shorter `$HOST` variable.
pub fn expand_vars<'a>(
    template: &str,
    vars: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> String {
    let mut vars: Vec<(&str, &str)> = vars.into_iter().collect();
    vars.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut expanded = template.to_string();
    for (name, value) in vars {
        if name.is_empty() {
            continue;
        }
        expanded = expanded.replace(&format!("${name}"), value);
    }
    expanded
}
