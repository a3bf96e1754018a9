pub mod session_state;
pub mod usage_events;
