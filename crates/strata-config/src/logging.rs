//! Structured logging utilities for Strata components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//! Field values are recorded through their `Display` impl.
//!
//! # Usage
//!
//! ```ignore
//! use strata_config::{log_transfer_warn, log_reclaim_info};
//!
//! log_transfer_warn!("Durable write failed, retrying", name = name, attempt = 2);
//! log_reclaim_info!("Reclaimed removable chunks", freed = 4096);
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const STORE: &'static str = "STORE";
    pub const CACHE: &'static str = "CACHE";
    pub const TRANSFER: &'static str = "TRANSFER";
    pub const RECLAIM: &'static str = "RECLAIM";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

// === STORE logging macros ===

#[macro_export]
macro_rules! log_store_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "STORE", $($key = tracing::field::display(&$value),)* $msg)
    };
}

#[macro_export]
macro_rules! log_store_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "STORE", $($key = tracing::field::display(&$value),)* $msg)
    };
}

#[macro_export]
macro_rules! log_store_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "STORE", $($key = tracing::field::display(&$value),)* $msg)
    };
}

// === CACHE logging macros ===

#[macro_export]
macro_rules! log_cache_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CACHE", $($key = tracing::field::display(&$value),)* $msg)
    };
}

#[macro_export]
macro_rules! log_cache_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "CACHE", $($key = tracing::field::display(&$value),)* $msg)
    };
}

// === TRANSFER logging macros ===

#[macro_export]
macro_rules! log_transfer_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "TRANSFER", $($key = tracing::field::display(&$value),)* $msg)
    };
}

#[macro_export]
macro_rules! log_transfer_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "TRANSFER", $($key = tracing::field::display(&$value),)* $msg)
    };
}

#[macro_export]
macro_rules! log_transfer_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "TRANSFER", $($key = tracing::field::display(&$value),)* $msg)
    };
}

// === RECLAIM logging macros ===

#[macro_export]
macro_rules! log_reclaim_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "RECLAIM", $($key = tracing::field::display(&$value),)* $msg)
    };
}

#[macro_export]
macro_rules! log_reclaim_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "RECLAIM", $($key = tracing::field::display(&$value),)* $msg)
    };
}

#[macro_export]
macro_rules! log_reclaim_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "RECLAIM", $($key = tracing::field::display(&$value),)* $msg)
    };
}

/// Initialize logging with the given level filter. `RUST_LOG` overrides it.
///
/// Returns false if a global subscriber was already installed.
pub fn init_logging(level: LogLevel) -> bool {
    use tracing_subscriber::EnvFilter;

    let filter = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_test_writer()
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::STORE, "STORE");
        assert_eq!(Component::TRANSFER, "TRANSFER");
        assert_eq!(Component::RECLAIM, "RECLAIM");
    }

    #[test]
    fn test_macros_expand_without_subscriber() {
        let name = String::from("abcd");
        log_store_debug!("Stored chunk", name = name, size = 12u64);
        log_reclaim_info!("Reclaimed", freed = 4096u64);
        log_transfer_warn!("Retrying", attempt = 1u32);
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging(LogLevel::Warn);
        assert!(!init_logging(LogLevel::Debug));
    }
}
