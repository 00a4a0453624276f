//! Terminal rendering of run progress for the CLI.

pub mod icons;
pub mod progress;

pub use progress::{RunUi, UiMode, format_duration};
