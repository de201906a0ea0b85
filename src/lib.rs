/// Macro for prefixed progress logging.
///
/// Routes through `tracing` so progress lines share the subscriber, filter
/// and output stream with the rest of the library's diagnostics.
///
/// Usage:
/// ```ignore
/// log_status!("ssh", "Opening session to {}", host);
/// log_status!("provision", "Stage {} completed", step);
/// ```
#[macro_export]
macro_rules! log_status {
    ($prefix:expr, $($arg:tt)*) => {
        ::tracing::info!(scope = $prefix, "{}", format_args!($($arg)*))
    };
}

pub mod core;
pub mod utils;

// Re-export everything from core for ergonomic library use
// Users can write `sitewright::site` instead of `sitewright::core::site`
pub use core::*;
pub use utils::*;
