/// Panics in debug builds; logs an error via `tracing::error!` in release
/// builds. For states a stage worker can survive but should never reach.
#[macro_export]
macro_rules! safe_panic {
    ($($arg:tt)*) => (if cfg!(debug_assertions) { panic!($($arg)*); } else { tracing::error!($($arg)*) })
}
