//! Lock-free metric slots written by the audio thread and polled by the UI.
//!
//! Each slot is an independent atomic. A reader may see `rms_out_l` from one
//! block and `tonal_energy` from the next; one block of staleness is accepted.

use std::sync::atomic::{AtomicU64, Ordering};

use atomic_float::AtomicF32;

/// One reading of every metric slot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricSample {
    pub rms_in_l: f32,
    pub rms_in_r: f32,
    pub rms_out_l: f32,
    pub rms_out_r: f32,
    /// 0..=1
    pub tonal_energy: f32,
    /// 0..=1
    pub rhythm_energy: f32,
}

pub struct MetricsChannel {
    rms_in_l: AtomicF32,
    rms_in_r: AtomicF32,
    rms_out_l: AtomicF32,
    rms_out_r: AtomicF32,
    tonal_energy: AtomicF32,
    rhythm_energy: AtomicF32,
    blocks: AtomicU64,
    failed_blocks: AtomicU64,
}

impl Default for MetricsChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsChannel {
    pub fn new() -> Self {
        Self {
            rms_in_l: AtomicF32::new(0.0),
            rms_in_r: AtomicF32::new(0.0),
            rms_out_l: AtomicF32::new(0.0),
            rms_out_r: AtomicF32::new(0.0),
            tonal_energy: AtomicF32::new(0.0),
            rhythm_energy: AtomicF32::new(0.0),
            blocks: AtomicU64::new(0),
            failed_blocks: AtomicU64::new(0),
        }
    }

    /// Store every field of `sample`. Audio thread only.
    #[inline]
    pub fn publish(&self, sample: &MetricSample) {
        self.rms_in_l.store(sample.rms_in_l, Ordering::Relaxed);
        self.rms_in_r.store(sample.rms_in_r, Ordering::Relaxed);
        self.rms_out_l.store(sample.rms_out_l, Ordering::Relaxed);
        self.rms_out_r.store(sample.rms_out_r, Ordering::Relaxed);
        self.tonal_energy.store(sample.tonal_energy, Ordering::Relaxed);
        self.rhythm_energy.store(sample.rhythm_energy, Ordering::Relaxed);
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_failed_block(&self) {
        self.failed_blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// The last published value of each slot, read one by one.
    pub fn current(&self) -> MetricSample {
        MetricSample {
            rms_in_l: self.rms_in_l.load(Ordering::Relaxed),
            rms_in_r: self.rms_in_r.load(Ordering::Relaxed),
            rms_out_l: self.rms_out_l.load(Ordering::Relaxed),
            rms_out_r: self.rms_out_r.load(Ordering::Relaxed),
            tonal_energy: self.tonal_energy.load(Ordering::Relaxed),
            rhythm_energy: self.rhythm_energy.load(Ordering::Relaxed),
        }
    }

    /// Blocks published since startup.
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    /// Blocks the plugin failed to process (output was silenced).
    pub fn failed_blocks(&self) -> u64 {
        self.failed_blocks.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn starts_at_zero() {
        let metrics = MetricsChannel::new();
        assert_eq!(metrics.current(), MetricSample::default());
        assert_eq!(metrics.blocks(), 0);
        assert_eq!(metrics.failed_blocks(), 0);
    }

    #[test]
    fn publish_then_read_back() {
        let metrics = MetricsChannel::new();
        let sample = MetricSample {
            rms_in_l: 0.25,
            rms_in_r: 0.5,
            rms_out_l: 0.125,
            rms_out_r: 0.0,
            tonal_energy: 0.25,
            rhythm_energy: 1.0,
        };
        metrics.publish(&sample);
        assert_eq!(metrics.current(), sample);
        assert_eq!(metrics.blocks(), 1);
    }

    #[test]
    fn failed_blocks_count_separately() {
        let metrics = MetricsChannel::new();
        metrics.record_failed_block();
        metrics.record_failed_block();
        assert_eq!(metrics.failed_blocks(), 2);
        assert_eq!(metrics.blocks(), 0);
    }

    /// A concurrent reader never sees a torn float, but may mix fields from
    /// different blocks. Every observed field must be one of the published values.
    #[test]
    fn concurrent_reader_sees_only_published_values() {
        let metrics = Arc::new(MetricsChannel::new());
        let writer = {
            let metrics = metrics.clone();
            std::thread::spawn(move || {
                for i in 0..10_000 {
                    let v = if i % 2 == 0 { 0.25 } else { 0.75 };
                    metrics.publish(&MetricSample {
                        rms_in_l: v,
                        rms_in_r: v,
                        rms_out_l: v,
                        rms_out_r: v,
                        tonal_energy: v,
                        rhythm_energy: v,
                    });
                }
            })
        };

        for _ in 0..10_000 {
            let s = metrics.current();
            for v in [
                s.rms_in_l,
                s.rms_in_r,
                s.rms_out_l,
                s.rms_out_r,
                s.tonal_energy,
                s.rhythm_energy,
            ] {
                assert!(v == 0.0 || v == 0.25 || v == 0.75, "torn value {v}");
            }
        }

        writer.join().unwrap();
        assert_eq!(metrics.blocks(), 10_000);
    }
}
