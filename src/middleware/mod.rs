//! HTTP middleware: structured request logging and request/error counters
//! for `/metrics`. WebSocket traffic after the handshake bypasses both.

pub mod logging;
pub mod metrics;

pub use logging::RequestLogging;
pub use metrics::MetricsMiddleware;
