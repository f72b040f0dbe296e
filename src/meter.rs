//! One-line terminal meter polled from the control thread.

use std::sync::Arc;

use ringbuf::HeapCons;
use ringbuf::traits::Consumer;

use crate::host::HostStatus;
use crate::metrics::{MetricSample, MetricsChannel};

const BAR_WIDTH: usize = 10;
const SPARK_WIDTH: usize = 24;
const FLOOR_DB: f32 = -60.0;
const SPARK_LEVELS: [char; 9] = [' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// What the control thread knows about the host while the bridge is attached.
#[derive(Debug, Clone, Copy)]
pub struct MeterStatus {
    pub host: HostStatus,
    pub bypassed: bool,
}

pub struct Meter {
    metrics: Arc<MetricsChannel>,
    waveform: HeapCons<f32>,
    scratch: Vec<f32>,
    sparkline: String,
}

impl Meter {
    pub fn new(metrics: Arc<MetricsChannel>, waveform: HeapCons<f32>, capacity: usize) -> Self {
        Self {
            metrics,
            waveform,
            scratch: vec![0.0; capacity.max(1)],
            sparkline: " ".repeat(SPARK_WIDTH),
        }
    }

    /// Read the latest metrics and drain captured samples into the sparkline.
    pub fn poll(&mut self, status: MeterStatus) -> String {
        let popped = self.waveform.pop_slice(&mut self.scratch);
        if popped > 0 {
            self.sparkline = sparkline(&self.scratch[..popped], SPARK_WIDTH);
        }
        render_meter_line(
            &self.metrics.current(),
            status,
            self.metrics.failed_blocks(),
            &self.sparkline,
        )
    }
}

pub fn render_meter_line(
    sample: &MetricSample,
    status: MeterStatus,
    failed_blocks: u64,
    waveform: &str,
) -> String {
    format!(
        "IN {}{} OUT {}{} tonal {:.2} rhythm {:.2} | {:<9} | failed {} |{}|",
        level_bar(sample.rms_in_l),
        level_bar(sample.rms_in_r),
        level_bar(sample.rms_out_l),
        level_bar(sample.rms_out_r),
        sample.tonal_energy,
        sample.rhythm_energy,
        state_label(status),
        failed_blocks,
        waveform,
    )
}

fn state_label(status: MeterStatus) -> &'static str {
    if status.bypassed {
        return "BYPASS";
    }
    match status.host {
        HostStatus::Prepared => "ACTIVE",
        HostStatus::Instantiated => "IDLE",
        HostStatus::Unloaded => "NO PLUGIN",
    }
}

/// RMS on a dB scale from -60 dB (empty) to 0 dB (full).
fn level_bar(rms: f32) -> String {
    let filled = if rms > 0.0 {
        let db = 20.0 * rms.log10();
        (((db - FLOOR_DB) / -FLOOR_DB).clamp(0.0, 1.0) * BAR_WIDTH as f32).round() as usize
    } else {
        0
    };
    format!("[{}{}]", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled))
}

/// Peak magnitude of `samples` split into `width` columns.
fn sparkline(samples: &[f32], width: usize) -> String {
    if samples.is_empty() || width == 0 {
        return " ".repeat(width);
    }
    let top = (SPARK_LEVELS.len() - 1) as f32;
    (0..width)
        .map(|col| {
            let start = col * samples.len() / width;
            let end = ((col + 1) * samples.len() / width).max(start + 1).min(samples.len());
            let peak = samples[start.min(samples.len() - 1)..end]
                .iter()
                .fold(0.0f32, |acc, s| acc.max(s.abs()));
            let level = if peak.is_finite() {
                (peak.min(1.0) * top).round() as usize
            } else {
                0
            };
            SPARK_LEVELS[level]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use ringbuf::HeapRb;
    use ringbuf::traits::{Producer, Split};

    use super::*;

    fn active() -> MeterStatus {
        MeterStatus {
            host: HostStatus::Prepared,
            bypassed: false,
        }
    }

    #[test]
    fn level_bar_scales_in_db() {
        assert_eq!(level_bar(0.0), "[----------]");
        assert_eq!(level_bar(1.0), "[##########]");
        assert_eq!(level_bar(0.001), "[----------]");
        // -30 dB is half way
        assert_eq!(level_bar(0.031_622_8), "[#####-----]");
        assert_eq!(level_bar(4.0), "[##########]");
    }

    #[test]
    fn state_labels() {
        assert_eq!(state_label(active()), "ACTIVE");
        let bypassed = MeterStatus {
            host: HostStatus::Unloaded,
            bypassed: true,
        };
        assert_eq!(state_label(bypassed), "BYPASS");
        let empty = MeterStatus {
            host: HostStatus::Unloaded,
            bypassed: false,
        };
        assert_eq!(state_label(empty), "NO PLUGIN");
        let idle = MeterStatus {
            host: HostStatus::Instantiated,
            bypassed: false,
        };
        assert_eq!(state_label(idle), "IDLE");
    }

    #[test]
    fn sparkline_takes_column_peaks() {
        let samples = [0.0, 0.0, -1.0, 0.5, 0.5, 0.25];
        assert_eq!(sparkline(&samples, 3), " █▄");
    }

    #[test]
    fn sparkline_with_fewer_samples_than_columns() {
        let line = sparkline(&[1.0], 4);
        assert_eq!(line.chars().count(), 4);
        assert!(line.chars().all(|c| c == '█'));
    }

    #[test]
    fn sparkline_ignores_nan() {
        assert_eq!(sparkline(&[f32::NAN], 1), " ");
        assert_eq!(sparkline(&[], 2), "  ");
    }

    #[test]
    fn meter_line_contains_every_field() {
        let sample = MetricSample {
            rms_in_l: 1.0,
            rms_in_r: 0.0,
            rms_out_l: 1.0,
            rms_out_r: 1.0,
            tonal_energy: 0.5,
            rhythm_energy: 0.25,
        };
        let line = render_meter_line(&sample, active(), 3, "▁▂");
        assert!(line.starts_with("IN [##########][----------] OUT"));
        assert!(line.contains("tonal 0.50 rhythm 0.25"));
        assert!(line.contains("ACTIVE"));
        assert!(line.contains("failed 3"));
        assert!(line.ends_with("|▁▂|"));
    }

    #[test]
    fn poll_drains_waveform_and_keeps_last_line() {
        let metrics = Arc::new(MetricsChannel::new());
        let (mut prod, cons) = HeapRb::<f32>::new(64).split();
        let mut meter = Meter::new(metrics.clone(), cons, 64);

        prod.push_slice(&[1.0; 48]);
        let first = meter.poll(active());
        assert!(first.contains(&"█".repeat(SPARK_WIDTH)));

        // Nothing new captured: the previous waveform stays on screen.
        let second = meter.poll(active());
        assert_eq!(first, second);

        metrics.record_failed_block();
        assert!(meter.poll(active()).contains("failed 1"));
    }
}
