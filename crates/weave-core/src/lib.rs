pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{ErrorKind, Result, WeaveError};
pub use event::{EventBus, EventFilter, Subscription, TaskEvent};
pub use types::*;
