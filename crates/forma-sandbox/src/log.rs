//! Quiet-mode aware logging. With FORMA_QUIET=1 routine `[INFO]` lines from
//! the worker supervisor are dropped; warnings always get through.

#[macro_export]
macro_rules! info_log {
    ($($arg:tt)*) => {{
        if !$crate::log::is_quiet() {
            tracing::info!($($arg)*);
        }
    }};
}

pub fn is_quiet() -> bool {
    forma_core::config::ObservabilityConfig::from_env().quiet
}
