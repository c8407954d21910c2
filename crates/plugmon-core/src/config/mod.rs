mod dirs;
mod settings;

pub use dirs::Directories;
pub use settings::{Config, DEFAULT_CLOSE_TIMEOUT_MS, DEFAULT_QUEUE_CAPACITY};
