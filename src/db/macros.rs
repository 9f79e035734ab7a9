//! Database dispatch macros for reducing code duplication.
//!
//! Pools and connections are per-driver enums; these macros generate the
//! match arms so driver-specific code stays side by side.

/// Macro for generating database dispatch match arms.
///
/// The first argument names the enum (`DbPool` or `DbConnection`) in
/// `crate::db::pool`.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(DbPool, pool, {
///     Postgres(p) => p.size(),
///     SQLite(p) => p.size(),
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($kind:ident, $value:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $value {
            $(
                $crate::db::pool::$kind::$variant($p) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;
