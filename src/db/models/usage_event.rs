use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UsageEventKind {
    Resumed,
    Paused,
}

impl UsageEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageEventKind::Resumed => "resumed",
            UsageEventKind::Paused => "paused",
        }
    }
}

impl FromStr for UsageEventKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "resumed" => Ok(UsageEventKind::Resumed),
            "paused" => Ok(UsageEventKind::Paused),
            other => Err(anyhow!("unknown usage event kind '{other}'")),
        }
    }
}

impl fmt::Display for UsageEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the usage event log: an app came to the foreground
/// (`Resumed`) or left it (`Paused`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub package: String,
    pub kind: UsageEventKind,
    pub occurred_at_ms: i64,
}

impl UsageEvent {
    pub fn resumed(package: impl Into<String>, occurred_at_ms: i64) -> Self {
        Self {
            package: package.into(),
            kind: UsageEventKind::Resumed,
            occurred_at_ms,
        }
    }

    pub fn paused(package: impl Into<String>, occurred_at_ms: i64) -> Self {
        Self {
            package: package.into(),
            kind: UsageEventKind::Paused,
            occurred_at_ms,
        }
    }
}
