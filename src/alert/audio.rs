use anyhow::{anyhow, Result};
use rodio::{OutputStream, Sink};
use std::sync::{
    mpsc::{self, Sender},
    Arc, Mutex,
};
use std::thread;

use super::tones::{BuzzPattern, Chime};
use super::{AlertChannel, UsageAlert};

const ENABLE_LOGS: bool = true;

use crate::log_warn;

enum AudioCommand {
    Chime,
    Buzz,
}

/// Lazily started audio thread. rodio's output stream is not `Send`, so the
/// stream and sink live on one thread that receives play commands.
#[derive(Clone)]
pub struct AlertAudio {
    tx: Arc<Mutex<Option<Sender<AudioCommand>>>>,
}

impl Default for AlertAudio {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertAudio {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(Mutex::new(None)),
        }
    }

    fn ensure_thread(&self) -> Result<Sender<AudioCommand>> {
        let mut guard = self
            .tx
            .lock()
            .map_err(|_| anyhow!("audio sender lock poisoned"))?;
        if let Some(tx) = guard.as_ref() {
            return Ok(tx.clone());
        }

        let (tx, rx) = mpsc::channel::<AudioCommand>();

        thread::Builder::new()
            .name("alert-audio".to_string())
            .spawn(move || {
                let mut _stream: Option<OutputStream> = None;
                let mut sink: Option<Sink> = None;

                fn ensure_sink(
                    stream: &mut Option<OutputStream>,
                    sink: &mut Option<Sink>,
                ) -> Result<(), String> {
                    if sink.is_none() {
                        let (s, handle) = OutputStream::try_default()
                            .map_err(|e| format!("Failed to create audio output stream: {}", e))?;
                        let new_sink = Sink::try_new(&handle)
                            .map_err(|e| format!("Failed to create audio sink: {}", e))?;
                        *stream = Some(s);
                        *sink = Some(new_sink);
                    }
                    Ok(())
                }

                while let Ok(cmd) = rx.recv() {
                    if let Err(err) = ensure_sink(&mut _stream, &mut sink) {
                        log_warn!("alert audio unavailable: {err}");
                        continue;
                    }
                    if let Some(ref s) = sink {
                        match cmd {
                            AudioCommand::Chime => s.append(Chime::new()),
                            AudioCommand::Buzz => s.append(BuzzPattern::new()),
                        }
                    }
                }
            })
            .map_err(|e| anyhow!("failed to spawn audio thread: {e}"))?;

        *guard = Some(tx.clone());
        Ok(tx)
    }

    fn send(&self, command: AudioCommand) -> Result<()> {
        let tx = self.ensure_thread()?;
        if tx.send(command).is_err() {
            // Thread died; forget it so the next alert starts a fresh one.
            if let Ok(mut guard) = self.tx.lock() {
                *guard = None;
            }
            return Err(anyhow!("audio thread is not running"));
        }
        Ok(())
    }

    pub fn play_chime(&self) -> Result<()> {
        self.send(AudioCommand::Chime)
    }

    pub fn play_buzz(&self) -> Result<()> {
        self.send(AudioCommand::Buzz)
    }
}

/// Sound delivery.
pub struct ChimeChannel {
    audio: AlertAudio,
}

impl ChimeChannel {
    pub fn new(audio: AlertAudio) -> Self {
        Self { audio }
    }
}

impl AlertChannel for ChimeChannel {
    fn name(&self) -> &'static str {
        "sound"
    }

    fn deliver(&self, _alert: &UsageAlert) -> Result<()> {
        self.audio.play_chime()
    }
}

/// Vibration delivery, rendered as a buzz pattern through the speakers.
pub struct BuzzChannel {
    audio: AlertAudio,
}

impl BuzzChannel {
    pub fn new(audio: AlertAudio) -> Self {
        Self { audio }
    }
}

impl AlertChannel for BuzzChannel {
    fn name(&self) -> &'static str {
        "vibration"
    }

    fn deliver(&self, _alert: &UsageAlert) -> Result<()> {
        self.audio.play_buzz()
    }
}
