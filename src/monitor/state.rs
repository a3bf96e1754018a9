use std::time::Duration;

use crate::db::SessionState;
use crate::settings::TrackedConfig;

/// Fixed polling period of the engine.
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// A persisted session older than this is not resumed after a restart. Long
/// enough that one or two missed ticks keep a session alive, short enough
/// that a process dead for a while starts over.
pub const STALE_SESSION_BOUND: Duration = Duration::from_secs(4 * 60);

const MS_PER_MINUTE: u64 = 60_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MonitorState {
    #[default]
    Idle,
    Accumulating { package: String, elapsed_ms: u64 },
}

impl MonitorState {
    pub fn package(&self) -> &str {
        match self {
            MonitorState::Idle => "",
            MonitorState::Accumulating { package, .. } => package,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        match self {
            MonitorState::Idle => 0,
            MonitorState::Accumulating { elapsed_ms, .. } => *elapsed_ms,
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Detector saw nothing; state left as it was.
    Unchanged,
    /// Foreground app is not tracked.
    Reset,
    /// A tracked app took the foreground; its counter starts at zero.
    SessionStarted,
    Accumulated { elapsed_ms: u64 },
    /// Threshold reached on this tick; the counter is back at zero.
    AlertFired { package: String, minutes_used: u64 },
}

/// The consecutive-usage state machine. Pure: no clocks, no I/O.
#[derive(Debug, Clone)]
pub struct UsageEngine {
    state: MonitorState,
    tick_ms: u64,
}

impl UsageEngine {
    pub fn new(tick_interval: Duration) -> Self {
        Self::with_state(MonitorState::Idle, tick_interval)
    }

    pub fn with_state(state: MonitorState, tick_interval: Duration) -> Self {
        Self {
            state,
            tick_ms: tick_interval.as_millis() as u64,
        }
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    pub fn tick(&mut self, detected: Option<&str>, config: &TrackedConfig) -> TickOutcome {
        // A miss is usually the detector window edge, not the user leaving.
        let Some(detected) = detected else {
            return TickOutcome::Unchanged;
        };

        if !config.is_tracked(detected) {
            self.state = MonitorState::Idle;
            return TickOutcome::Reset;
        }

        let tick_ms = self.tick_ms;
        if let MonitorState::Accumulating {
            package,
            elapsed_ms,
        } = &mut self.state
        {
            if package.as_str() == detected {
                *elapsed_ms += tick_ms;
                if *elapsed_ms < config.threshold_ms() {
                    return TickOutcome::Accumulated {
                        elapsed_ms: *elapsed_ms,
                    };
                }

                let minutes_used = *elapsed_ms / MS_PER_MINUTE;
                *elapsed_ms = 0;
                return TickOutcome::AlertFired {
                    package: package.clone(),
                    minutes_used,
                };
            }
        }

        self.state = MonitorState::Accumulating {
            package: detected.to_string(),
            elapsed_ms: 0,
        };
        TickOutcome::SessionStarted
    }

    /// Explicit "no foreground app" (screen off/locked).
    pub fn reset(&mut self) {
        self.state = MonitorState::Idle;
    }

    /// Zero the counter but keep the session's package.
    pub fn dismiss(&mut self) {
        if let MonitorState::Accumulating { elapsed_ms, .. } = &mut self.state {
            *elapsed_ms = 0;
        }
    }
}

/// Decide whether a persisted session can be picked up again.
///
/// Resumes only when the save is recent (`0 <= gap < stale_bound`) and the
/// app now in the foreground is the one the session was counting. The
/// elapsed time is floored to a whole number of ticks.
pub fn resume_decision(
    persisted: &SessionState,
    detected: Option<&str>,
    now_ms: i64,
    stale_bound: Duration,
    tick_interval: Duration,
) -> MonitorState {
    if persisted.last_tracked_package.is_empty() || persisted.last_update_ms <= 0 {
        return MonitorState::Idle;
    }

    let gap_ms = now_ms - persisted.last_update_ms;
    if gap_ms < 0 || gap_ms >= stale_bound.as_millis() as i64 {
        return MonitorState::Idle;
    }

    if detected != Some(persisted.last_tracked_package.as_str()) {
        return MonitorState::Idle;
    }

    let tick_ms = (tick_interval.as_millis() as u64).max(1);
    MonitorState::Accumulating {
        package: persisted.last_tracked_package.clone(),
        elapsed_ms: persisted.consecutive_ms - persisted.consecutive_ms % tick_ms,
    }
}
