mod connection;
pub mod helpers;
mod migrations;
pub mod models;
mod repositories;

pub use connection::Database;
pub use models::{SessionState, UsageEvent, UsageEventKind};
pub use repositories::usage_events::EVENT_RETENTION;
