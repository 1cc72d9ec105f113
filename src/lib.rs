pub mod config;
pub mod errors;
pub mod preview;
pub mod ui;

pub use errors::{PreviewError, PreviewResult};
