//! Streaming support — progress reporting from inside request handlers.

pub mod progress;

pub use progress::ProgressReporter;
