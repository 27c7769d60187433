//! Structured log sink consumed by the orchestrator (§6).
//!
//! A PSR-3-shaped interface with no format contract — the core only needs
//! somewhere to send `debug`/`info`/`warning`/`alert`/`error` events.
//! [`TracingLogger`] bridges that to the `tracing` crate, already used
//! throughout this codebase (`server.rs`, `db.rs`, `connection.rs`)
//! instead of hand-rolling a sink.
/// Severity levels the core may log at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Alert,
    Error,
}

/// A structured log sink. Embedders may implement this to route core
/// events into whatever logging stack their application already uses.
///
/// Methods take `&str` rather than `impl fmt::Display` so the trait stays
/// object-safe — the core stores this behind `Arc<dyn Logger>` throughout,
/// and a generic method would make that impossible to compile.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);

    fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    fn warning(&self, message: &str) {
        self.log(LogLevel::Warning, message);
    }

    fn alert(&self, message: &str) {
        self.log(LogLevel::Alert, message);
    }

    fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

/// Default [`Logger`] that forwards to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warning => tracing::warn!("{message}"),
            // `tracing` has no distinct "alert" level; treat it as an
            // elevated warning the way the PHP PSR-3 levels above "warning"
            // collapse onto a handful of `tracing` levels.
            LogLevel::Alert => tracing::warn!(alert = true, "{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }
    }
}
