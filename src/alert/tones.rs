use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rodio::Source;
use std::f32::consts::PI;
use std::time::Duration;

const SAMPLE_RATE: u32 = 44100;

/// Off/on segments in milliseconds, starting with "off". Same shape as the
/// classic notification vibration: wait, buzz, pause, buzz, pause, long buzz.
pub const BUZZ_PATTERN_MS: [u64; 6] = [0, 500, 200, 500, 200, 1000];

fn ms_to_samples(ms: u64) -> usize {
    (ms * SAMPLE_RATE as u64 / 1000) as usize
}

/// Two-note descending chime with an exponential decay on each note.
pub struct Chime {
    num_sample: usize,
    note_samples: usize,
    notes: [f32; 2],
}

impl Default for Chime {
    fn default() -> Self {
        Self::new()
    }
}

impl Chime {
    pub fn new() -> Self {
        Self {
            num_sample: 0,
            note_samples: ms_to_samples(450),
            notes: [1318.5, 880.0],
        }
    }

    fn total_samples(&self) -> usize {
        self.note_samples * self.notes.len()
    }
}

impl Iterator for Chime {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        if self.num_sample >= self.total_samples() {
            return None;
        }

        let note = self.num_sample / self.note_samples;
        let within = self.num_sample % self.note_samples;
        self.num_sample += 1;

        let t = within as f32 / SAMPLE_RATE as f32;
        let envelope = (-6.0 * t).exp();
        Some((2.0 * PI * self.notes[note] * t).sin() * envelope * 0.25)
    }
}

impl Source for Chime {
    fn current_frame_len(&self) -> Option<usize> {
        Some(self.total_samples().saturating_sub(self.num_sample))
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        Some(Duration::from_millis(900))
    }
}

/// Low rumble played in [`BUZZ_PATTERN_MS`] pulses. Stands in for a vibration
/// motor on machines that have none.
pub struct BuzzPattern {
    num_sample: usize,
    /// Cumulative segment boundaries in samples.
    boundaries: Vec<usize>,
    rng: StdRng,
}

impl Default for BuzzPattern {
    fn default() -> Self {
        Self::new()
    }
}

impl BuzzPattern {
    pub fn new() -> Self {
        let mut boundaries = Vec::with_capacity(BUZZ_PATTERN_MS.len());
        let mut total = 0;
        for segment_ms in BUZZ_PATTERN_MS {
            total += ms_to_samples(segment_ms);
            boundaries.push(total);
        }

        Self {
            num_sample: 0,
            boundaries,
            rng: StdRng::from_entropy(),
        }
    }

    fn total_samples(&self) -> usize {
        self.boundaries.last().copied().unwrap_or(0)
    }

    /// Odd segments are "on".
    fn is_on(&self, sample: usize) -> bool {
        self.boundaries
            .iter()
            .position(|&end| sample < end)
            .map(|segment| segment % 2 == 1)
            .unwrap_or(false)
    }
}

impl Iterator for BuzzPattern {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        if self.num_sample >= self.total_samples() {
            return None;
        }

        let sample = self.num_sample;
        self.num_sample += 1;

        if !self.is_on(sample) {
            return Some(0.0);
        }

        let t = sample as f32 / SAMPLE_RATE as f32;
        // Square-ish 150 Hz carrier with a little noise so it reads as a rattle.
        let carrier = (2.0 * PI * 150.0 * t).sin().signum();
        let jitter: f32 = self.rng.gen_range(-0.15..0.15);
        Some((carrier + jitter) * 0.2)
    }
}

impl Source for BuzzPattern {
    fn current_frame_len(&self) -> Option<usize> {
        Some(self.total_samples().saturating_sub(self.num_sample))
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        Some(Duration::from_millis(BUZZ_PATTERN_MS.iter().sum()))
    }
}
