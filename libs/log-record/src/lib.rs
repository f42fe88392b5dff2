pub mod error;
mod format;
mod level;
mod record;

pub use error::DecodeError;
pub use format::{OutputMode, TIME_LAYOUT, format_line};
pub use level::Level;
pub use record::LogRecord;
