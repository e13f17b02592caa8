pub mod config;
pub mod error;
pub mod task;
pub mod time;

pub use config::{ExporterConfig, PushConfig, PushMethod};
pub use error::{Result, StatheError};
pub use task::ScheduledTask;
