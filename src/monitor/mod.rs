pub mod controller;
pub mod loop_worker;
pub mod state;

pub use controller::MonitorController;
pub use loop_worker::MonitorCommand;
pub use state::{
    resume_decision, MonitorState, TickOutcome, UsageEngine, STALE_SESSION_BOUND, TICK_INTERVAL,
};
