pub mod session_state;
pub mod usage_event;

pub use session_state::SessionState;
pub use usage_event::{UsageEvent, UsageEventKind};
