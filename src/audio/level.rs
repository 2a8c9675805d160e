//! Pegel-Analyse im Frequenzbereich
//!
//! Bildet das Verhalten eines Analyser-Knotens nach: FFT über die jüngsten
//! Samples, Magnituden in dB, Abbildung von [-100 dB, -30 dB] auf [0, 1],
//! Mittelwert über alle Bins.

use super::buffer::SampleRing;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::Serialize;
use std::sync::Arc;

/// FFT-Größe (ergibt FFT_SIZE / 2 Frequenz-Bins)
pub const FFT_SIZE: usize = 256;

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Normalisierte Pegel von Eingang und Ausgang, jeweils in [0, 1]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AudioLevels {
    pub input: f32,
    pub output: f32,
}

impl AudioLevels {
    pub const SILENT: AudioLevels = AudioLevels {
        input: 0.0,
        output: 0.0,
    };

    pub fn new(input: f32, output: f32) -> Self {
        Self {
            input: clamp_unit(input),
            output: clamp_unit(output),
        }
    }

    /// Größte Abweichung zu `other` über beide Pfade
    pub fn distance(&self, other: &AudioLevels) -> f32 {
        (self.input - other.input)
            .abs()
            .max((self.output - other.output).abs())
    }
}

/// Klemmt auf [0, 1], NaN wird zu 0
pub fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// FFT-basierter Pegelmesser
pub struct LevelAnalyser {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
}

impl LevelAnalyser {
    pub fn new() -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);

        // Blackman-Fenster wie beim Web-Audio Analyser
        let n = FFT_SIZE as f32;
        let window = (0..FFT_SIZE)
            .map(|i| {
                let x = i as f32 / n;
                0.42 - 0.5 * (2.0 * std::f32::consts::PI * x).cos()
                    + 0.08 * (4.0 * std::f32::consts::PI * x).cos()
            })
            .collect();

        Self { fft, window }
    }

    /// Pegel der jüngsten Samples im Tap
    pub fn level(&self, tap: &SampleRing) -> f32 {
        self.level_of(&tap.latest(FFT_SIZE))
    }

    /// Pegel eines Sample-Blocks (zu kurze Blöcke werden mit Stille aufgefüllt)
    pub fn level_of(&self, samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }

        let offset = FFT_SIZE.saturating_sub(samples.len());
        let mut buffer = vec![Complex::new(0.0f32, 0.0); FFT_SIZE];
        for (i, sample) in samples.iter().rev().take(FFT_SIZE).enumerate() {
            let idx = FFT_SIZE - 1 - i;
            if idx >= offset {
                buffer[idx] = Complex::new(sample * self.window[idx], 0.0);
            }
        }

        self.fft.process(&mut buffer);

        let bins = FFT_SIZE / 2;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        let sum: f32 = buffer
            .iter()
            .take(bins)
            .map(|c| {
                let magnitude = c.norm() / FFT_SIZE as f32;
                let db = if magnitude > 0.0 {
                    20.0 * magnitude.log10()
                } else {
                    MIN_DECIBELS
                };
                clamp_unit((db - MIN_DECIBELS) / range)
            })
            .sum();

        clamp_unit(sum / bins as f32)
    }
}

impl Default for LevelAnalyser {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LevelAnalyser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevelAnalyser")
            .field("fft_size", &FFT_SIZE)
            .finish()
    }
}
