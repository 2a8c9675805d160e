//! Geteilter Sample-Ring-Buffer
//!
//! Wird für Capture-Feed, Playback-Queue und die Analyse-Taps verwendet.
//! Die Audio-Callbacks laufen auf eigenen Threads, daher Arc<Mutex<..>>.

use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;

/// Ring-Buffer für f32-Samples, billig klonbar
#[derive(Clone)]
pub struct SampleRing {
    inner: Arc<Mutex<HeapRb<f32>>>,
    capacity: usize,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HeapRb::new(capacity))),
            capacity,
        }
    }

    /// Schreibt Samples; bei vollem Buffer werden neue Samples verworfen
    pub fn push_slice(&self, samples: &[f32]) {
        let mut buffer = self.inner.lock();
        for sample in samples {
            if buffer.try_push(*sample).is_err() {
                break;
            }
        }
    }

    /// Schreibt Samples und überschreibt bei Bedarf die ältesten
    pub fn push_overwrite(&self, samples: &[f32]) {
        let mut buffer = self.inner.lock();
        for sample in samples {
            let _ = buffer.push_overwrite(*sample);
        }
    }

    /// Liest einen kompletten Frame, falls genug Samples vorhanden sind
    pub fn read_frame(&self, frame_size: usize) -> Option<Vec<f32>> {
        let mut buffer = self.inner.lock();
        if buffer.occupied_len() < frame_size {
            return None;
        }
        let mut frame = Vec::with_capacity(frame_size);
        for _ in 0..frame_size {
            if let Some(sample) = buffer.try_pop() {
                frame.push(sample);
            }
        }
        Some(frame)
    }

    /// Füllt `out` so weit wie möglich, Rest mit Stille
    pub fn pop_into(&self, out: &mut [f32]) -> usize {
        let mut buffer = self.inner.lock();
        let mut filled = 0;
        for slot in out.iter_mut() {
            match buffer.try_pop() {
                Some(sample) => {
                    *slot = sample;
                    filled += 1;
                }
                None => *slot = 0.0,
            }
        }
        filled
    }

    /// Kopiert die jüngsten `count` Samples ohne sie zu entnehmen
    pub fn latest(&self, count: usize) -> Vec<f32> {
        let buffer = self.inner.lock();
        let (head, tail) = buffer.as_slices();
        let mut all = Vec::with_capacity(head.len() + tail.len());
        all.extend_from_slice(head);
        all.extend_from_slice(tail);
        let start = all.len().saturating_sub(count);
        all.split_off(start)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Verwirft alle Samples
    pub fn reset(&self) {
        *self.inner.lock() = HeapRb::new(self.capacity);
    }
}

impl std::fmt::Debug for SampleRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleRing")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
