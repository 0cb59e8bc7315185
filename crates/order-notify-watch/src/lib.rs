/*
[INPUT]:  Public API exports for order-notify-watch crate
[OUTPUT]: Module declarations and public re-exports
[POS]:    Crate root - library entry point
[UPDATE]: When adding new modules or public exports
*/

pub mod config;
pub mod output;

pub use config::{RetrySettings, WatchConfig};
pub use output::{EventPrinter, OutputFormat};
