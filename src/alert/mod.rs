//! Delivery of "time's up" alerts.
//!
//! The engine only knows [`AlertSink`]. The default sink, [`AlertDispatcher`],
//! fans an alert out to independent channels: a visible notice, a chime and a
//! buzz. A failing channel is logged and skipped; it never stops the others.

mod audio;
pub mod tones;

pub use audio::{AlertAudio, BuzzChannel, ChimeChannel};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;
use uuid::Uuid;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlertPreferences {
    pub sound: bool,
    pub vibration: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageAlert {
    pub id: String,
    pub package: String,
    pub minutes_used: u64,
    pub fired_at: DateTime<Utc>,
}

impl UsageAlert {
    pub fn new(package: impl Into<String>, minutes_used: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            package: package.into(),
            minutes_used,
            fired_at: Utc::now(),
        }
    }

    pub fn message(&self) -> String {
        format!(
            "Time's up! You've used {} for {} minutes.",
            self.package, self.minutes_used
        )
    }
}

/// Receiver of threshold crossings. Implementations must not block for long:
/// they are called from inside a tick.
pub trait AlertSink: Send + Sync {
    fn deliver(&self, alert: &UsageAlert, preferences: AlertPreferences);
}

/// One way of getting an alert in front of the user.
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &'static str;
    fn deliver(&self, alert: &UsageAlert) -> Result<()>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NoticeLine<'a> {
    event: &'static str,
    #[serde(flatten)]
    alert: &'a UsageAlert,
    message: String,
}

/// Visible alert: a log line plus one JSON line on the notice writer
/// (stdout for the daemon) that a desktop notifier can pick up.
pub struct NoticeChannel {
    out: Mutex<Box<dyn Write + Send>>,
}

impl NoticeChannel {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }
}

impl AlertChannel for NoticeChannel {
    fn name(&self) -> &'static str {
        "notice"
    }

    fn deliver(&self, alert: &UsageAlert) -> Result<()> {
        log_info!("{}", alert.message());

        let line = serde_json::to_string(&NoticeLine {
            event: "time_up",
            alert,
            message: alert.message(),
        })?;

        let mut out = self
            .out
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writeln!(out, "{line}").context("failed to write alert notice")?;
        out.flush().context("failed to flush alert notice")?;
        Ok(())
    }
}

pub struct AlertDispatcher {
    notice: Box<dyn AlertChannel>,
    sound: Box<dyn AlertChannel>,
    vibration: Box<dyn AlertChannel>,
}

impl AlertDispatcher {
    pub fn new(
        notice: Box<dyn AlertChannel>,
        sound: Box<dyn AlertChannel>,
        vibration: Box<dyn AlertChannel>,
    ) -> Self {
        Self {
            notice,
            sound,
            vibration,
        }
    }

    /// Stdout notice plus speaker chime and buzz sharing one audio thread.
    pub fn desktop() -> Self {
        let audio = AlertAudio::new();
        Self::new(
            Box::new(NoticeChannel::stdout()),
            Box::new(ChimeChannel::new(audio.clone())),
            Box::new(BuzzChannel::new(audio)),
        )
    }

    /// Deliver through every enabled channel, returning the names of the
    /// channels that failed.
    pub fn dispatch(&self, alert: &UsageAlert, preferences: AlertPreferences) -> Vec<&'static str> {
        let mut channels: Vec<&dyn AlertChannel> = vec![self.notice.as_ref()];
        if preferences.sound {
            channels.push(self.sound.as_ref());
        }
        if preferences.vibration {
            channels.push(self.vibration.as_ref());
        }

        let mut failed = Vec::new();
        for channel in channels {
            if let Err(err) = channel.deliver(alert) {
                log_warn!("{} alert delivery failed: {err:#}", channel.name());
                failed.push(channel.name());
            }
        }
        failed
    }
}

impl AlertSink for AlertDispatcher {
    fn deliver(&self, alert: &UsageAlert, preferences: AlertPreferences) {
        self.dispatch(alert, preferences);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Arc;

    struct Recording {
        name: &'static str,
        fail: bool,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl AlertChannel for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        fn deliver(&self, _alert: &UsageAlert) -> Result<()> {
            self.calls.lock().unwrap().push(self.name);
            if self.fail {
                Err(anyhow!("{} unavailable", self.name))
            } else {
                Ok(())
            }
        }
    }

    fn dispatcher(fail_sound: bool) -> (AlertDispatcher, Arc<Mutex<Vec<&'static str>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let channel = |name, fail| -> Box<dyn AlertChannel> {
            Box::new(Recording {
                name,
                fail,
                calls: calls.clone(),
            })
        };
        let dispatcher = AlertDispatcher::new(
            channel("notice", false),
            channel("sound", fail_sound),
            channel("vibration", false),
        );
        (dispatcher, calls)
    }

    #[test]
    fn sound_failure_does_not_block_other_channels() {
        let (dispatcher, calls) = dispatcher(true);
        let failed = dispatcher.dispatch(
            &UsageAlert::new("com.example.feed", 20),
            AlertPreferences {
                sound: true,
                vibration: true,
            },
        );

        assert_eq!(failed, vec!["sound"]);
        assert_eq!(*calls.lock().unwrap(), vec!["notice", "sound", "vibration"]);
    }

    #[test]
    fn disabled_channels_are_skipped() {
        let (dispatcher, calls) = dispatcher(false);
        let failed = dispatcher.dispatch(
            &UsageAlert::new("com.example.feed", 20),
            AlertPreferences {
                sound: false,
                vibration: true,
            },
        );

        assert!(failed.is_empty());
        assert_eq!(*calls.lock().unwrap(), vec!["notice", "vibration"]);
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn notice_writes_one_json_line() {
        let buffer = SharedBuffer::default();
        let notice = NoticeChannel::new(Box::new(buffer.clone()));
        notice
            .deliver(&UsageAlert::new("com.example.feed", 20))
            .unwrap();

        let written = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert_eq!(written.lines().count(), 1);

        let value: serde_json::Value = serde_json::from_str(written.trim()).unwrap();
        assert_eq!(value["event"], "time_up");
        assert_eq!(value["package"], "com.example.feed");
        assert_eq!(value["minutesUsed"], 20);
    }
}
