use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
    time::{Duration, SystemTime},
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::alert::AlertPreferences;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub const DEFAULT_THRESHOLD_MINUTES: f32 = 20.0;
pub const MIN_THRESHOLD_MINUTES: f32 = 5.0;
pub const MAX_THRESHOLD_MINUTES: f32 = 120.0;

/// How often the daemon checks the settings file for edits made by other
/// processes.
pub const SETTINGS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// What the engine needs from the settings: a read-only snapshot that is
/// replaced wholesale whenever the settings change.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedConfig {
    pub tracked_packages: BTreeSet<String>,
    pub threshold: Duration,
    pub sound_enabled: bool,
    pub vibration_enabled: bool,
}

impl Default for TrackedConfig {
    fn default() -> Self {
        UserSettings::default().tracked_config()
    }
}

impl TrackedConfig {
    pub fn is_tracked(&self, package: &str) -> bool {
        self.tracked_packages.contains(package)
    }

    pub fn threshold_ms(&self) -> u64 {
        self.threshold.as_millis() as u64
    }

    pub fn alert_preferences(&self) -> AlertPreferences {
        AlertPreferences {
            sound: self.sound_enabled,
            vibration: self.vibration_enabled,
        }
    }
}

/// On-disk settings document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    pub tracked_packages: BTreeSet<String>,
    pub threshold_minutes: f32,
    pub sound_enabled: bool,
    pub vibration_enabled: bool,
    /// Set while the user wants monitoring on; the watchdog only revives the
    /// daemon when this is true.
    pub monitoring_enabled: bool,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            tracked_packages: BTreeSet::new(),
            threshold_minutes: DEFAULT_THRESHOLD_MINUTES,
            sound_enabled: true,
            vibration_enabled: true,
            monitoring_enabled: false,
        }
    }
}

impl UserSettings {
    /// Clamp the threshold into range and drop blank identifiers.
    pub fn sanitized(mut self) -> Self {
        self.threshold_minutes = clamp_threshold_minutes(self.threshold_minutes);
        self.tracked_packages = self
            .tracked_packages
            .into_iter()
            .map(|package| package.trim().to_string())
            .filter(|package| !package.is_empty())
            .collect();
        self
    }

    pub fn tracked_config(&self) -> TrackedConfig {
        let minutes = clamp_threshold_minutes(self.threshold_minutes);
        TrackedConfig {
            tracked_packages: self.tracked_packages.clone(),
            threshold: Duration::from_millis((f64::from(minutes) * 60_000.0) as u64),
            sound_enabled: self.sound_enabled,
            vibration_enabled: self.vibration_enabled,
        }
    }
}

pub fn clamp_threshold_minutes(minutes: f32) -> f32 {
    if minutes.is_nan() {
        return DEFAULT_THRESHOLD_MINUTES;
    }
    minutes.clamp(MIN_THRESHOLD_MINUTES, MAX_THRESHOLD_MINUTES)
}

/// JSON-file backed settings with a live [`TrackedConfig`] feed.
pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<UserSettings>,
    modified: Mutex<Option<SystemTime>>,
    config_tx: watch::Sender<Arc<TrackedConfig>>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            match serde_json::from_str::<UserSettings>(&contents) {
                Ok(settings) => settings.sanitized(),
                Err(err) => {
                    log_warn!(
                        "settings at {} are unreadable ({err}); using defaults",
                        path.display()
                    );
                    UserSettings::default()
                }
            }
        } else {
            UserSettings::default()
        };

        let (config_tx, _) = watch::channel(Arc::new(data.tracked_config()));

        Ok(Self {
            modified: Mutex::new(modified_time(&path)),
            path,
            data: RwLock::new(data),
            config_tx,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> UserSettings {
        self.data
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn tracked_config(&self) -> Arc<TrackedConfig> {
        self.config_tx.borrow().clone()
    }

    /// Live feed of engine-facing configuration. The current value is
    /// available immediately.
    pub fn subscribe(&self) -> watch::Receiver<Arc<TrackedConfig>> {
        self.config_tx.subscribe()
    }

    /// Apply `change`, validate, persist and publish. Returns the stored value.
    pub fn update<F>(&self, change: F) -> Result<UserSettings>
    where
        F: FnOnce(&mut UserSettings),
    {
        let updated = {
            let mut guard = self
                .data
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut next = guard.clone();
            change(&mut next);
            let next = next.sanitized();
            self.persist(&next)?;
            *guard = next.clone();
            next
        };

        self.publish(&updated);
        Ok(updated)
    }

    pub fn track(&self, package: &str) -> Result<UserSettings> {
        let package = package.to_string();
        self.update(move |settings| {
            settings.tracked_packages.insert(package);
        })
    }

    pub fn untrack(&self, package: &str) -> Result<UserSettings> {
        self.update(|settings| {
            settings.tracked_packages.remove(package);
        })
    }

    pub fn set_threshold_minutes(&self, minutes: f32) -> Result<UserSettings> {
        self.update(|settings| settings.threshold_minutes = minutes)
    }

    pub fn set_sound_enabled(&self, enabled: bool) -> Result<UserSettings> {
        self.update(|settings| settings.sound_enabled = enabled)
    }

    pub fn set_vibration_enabled(&self, enabled: bool) -> Result<UserSettings> {
        self.update(|settings| settings.vibration_enabled = enabled)
    }

    pub fn set_monitoring_enabled(&self, enabled: bool) -> Result<UserSettings> {
        self.update(|settings| settings.monitoring_enabled = enabled)
    }

    /// Re-read the file if it changed on disk since we last saw it.
    /// Returns whether a new value was loaded. A half-written or invalid file
    /// keeps the previous settings.
    pub fn reload(&self) -> Result<bool> {
        let current_modified = modified_time(&self.path);
        {
            let mut seen = self
                .modified
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if current_modified.is_none() || *seen == current_modified {
                return Ok(false);
            }
            *seen = current_modified;
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings from {}", self.path.display()))?;
        let data: UserSettings = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse settings in {}", self.path.display()))?;
        let data = data.sanitized();

        {
            let mut guard = self
                .data
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *guard == data {
                return Ok(false);
            }
            *guard = data.clone();
        }

        self.publish(&data);
        Ok(true)
    }

    fn publish(&self, data: &UserSettings) {
        let config = data.tracked_config();
        self.config_tx.send_if_modified(|current| {
            if **current == config {
                false
            } else {
                *current = Arc::new(config);
                true
            }
        });
    }

    fn persist(&self, data: &UserSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let serialized = serde_json::to_string_pretty(data)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, serialized)
            .with_context(|| format!("Failed to write settings to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))?;

        let mut seen = self
            .modified
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *seen = modified_time(&self.path);
        Ok(())
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Poll the settings file until cancelled, publishing edits made by other
/// processes (for example `focuswatch config ...`).
pub async fn watch_settings(store: Arc<SettingsStore>, cancel_token: CancellationToken) {
    let mut ticker = tokio::time::interval(SETTINGS_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.reload() {
                    Ok(true) => log_info!("settings reloaded from {}", store.path().display()),
                    Ok(false) => {}
                    Err(err) => log_warn!("settings reload skipped: {err:#}"),
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_when_file_is_missing() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json")).unwrap();

        let config = store.tracked_config();
        assert!(config.tracked_packages.is_empty());
        assert_eq!(config.threshold, Duration::from_secs(20 * 60));
        assert!(config.sound_enabled);
        assert!(config.vibration_enabled);
        assert!(!store.snapshot().monitoring_enabled);
    }

    #[test]
    fn garbled_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        let store = SettingsStore::new(path).unwrap();
        assert_eq!(store.snapshot(), UserSettings::default());
    }

    #[test]
    fn threshold_is_clamped_into_range() {
        assert_eq!(clamp_threshold_minutes(0.0), MIN_THRESHOLD_MINUTES);
        assert_eq!(clamp_threshold_minutes(-3.0), MIN_THRESHOLD_MINUTES);
        assert_eq!(clamp_threshold_minutes(500.0), MAX_THRESHOLD_MINUTES);
        assert_eq!(clamp_threshold_minutes(f32::NAN), DEFAULT_THRESHOLD_MINUTES);
        assert_eq!(clamp_threshold_minutes(45.0), 45.0);
    }

    #[test]
    fn fractional_minutes_become_milliseconds() {
        let settings = UserSettings {
            threshold_minutes: 7.5,
            ..UserSettings::default()
        };
        assert_eq!(settings.tracked_config().threshold_ms(), 450_000);
    }

    #[test]
    fn updates_persist_and_publish() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::new(path.clone()).unwrap();
        let mut rx = store.subscribe();

        store.track("com.example.feed").unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_tracked("com.example.feed"));

        store.set_threshold_minutes(1.0).unwrap();
        assert_eq!(rx.borrow_and_update().threshold, Duration::from_secs(5 * 60));

        let reopened = SettingsStore::new(path).unwrap();
        let settings = reopened.snapshot();
        assert!(settings.tracked_packages.contains("com.example.feed"));
        assert_eq!(settings.threshold_minutes, MIN_THRESHOLD_MINUTES);
    }

    #[test]
    fn monitoring_flag_does_not_wake_config_subscribers() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json")).unwrap();
        let rx = store.subscribe();

        store.set_monitoring_enabled(true).unwrap();
        assert!(!rx.has_changed().unwrap());
        assert!(store.snapshot().monitoring_enabled);
    }

    #[test]
    fn reload_picks_up_external_edits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::new(path.clone()).unwrap();
        store.set_sound_enabled(true).unwrap();

        let writer = SettingsStore::new(path).unwrap();
        writer.track("com.example.chat").unwrap();

        // Force a different mtime even on coarse filesystems.
        *store.modified.lock().unwrap() = None;
        assert!(store.reload().unwrap());
        assert!(store.tracked_config().is_tracked("com.example.chat"));
        assert!(!store.reload().unwrap());
    }

    #[test]
    fn garbled_reload_keeps_previous_settings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::new(path.clone()).unwrap();
        store.track("com.example.feed").unwrap();

        fs::write(&path, "{ half written").unwrap();
        *store.modified.lock().unwrap() = None;

        assert!(store.reload().is_err());
        assert!(store.tracked_config().is_tracked("com.example.feed"));
    }

    #[test]
    fn blank_identifiers_are_dropped() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json")).unwrap();
        store
            .update(|settings| {
                settings.tracked_packages.insert("   ".into());
                settings.tracked_packages.insert(" com.example.feed ".into());
            })
            .unwrap();

        let packages = store.snapshot().tracked_packages;
        assert_eq!(packages.len(), 1);
        assert!(packages.contains("com.example.feed"));
    }
}
