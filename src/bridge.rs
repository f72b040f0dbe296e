//! Per-block real-time entry point.
//!
//! Everything reachable from [`AudioBridge::process`] runs on the audio thread:
//! no allocation, no locks, no I/O, cost linear in the block length.

use std::sync::Arc;

use ringbuf::HeapProd;
use ringbuf::traits::Producer;

use crate::bypass::BypassController;
use crate::host::PluginHost;
use crate::metrics::{MetricSample, MetricsChannel};

/// Weight of the current envelope when updating the follower state.
const ENVELOPE_ATTACK: f32 = 0.9;
const TONAL_GAIN: f32 = 2.0;
const RHYTHM_GAIN: f32 = 8.0;

pub struct AudioBridge {
    host: PluginHost,
    bypass: Arc<BypassController>,
    metrics: Arc<MetricsChannel>,
    prev_energy: f32,
    waveform: Option<HeapProd<f32>>,
}

impl AudioBridge {
    pub fn new(
        host: PluginHost,
        bypass: Arc<BypassController>,
        metrics: Arc<MetricsChannel>,
    ) -> Self {
        Self {
            host,
            bypass,
            metrics,
            prev_energy: 0.0,
            waveform: None,
        }
    }

    /// Forward channel-0 output to `sink`. Samples are dropped when it is full.
    pub fn with_waveform_sink(mut self, sink: HeapProd<f32>) -> Self {
        self.waveform = Some(sink);
        self
    }

    pub fn host(&self) -> &PluginHost {
        &self.host
    }

    /// Lifecycle access. Only reachable while the bridge is off the audio thread.
    pub fn host_mut(&mut self) -> &mut PluginHost {
        &mut self.host
    }

    pub fn bypass(&self) -> &Arc<BypassController> {
        &self.bypass
    }

    pub fn metrics(&self) -> &Arc<MetricsChannel> {
        &self.metrics
    }

    /// Process one block of up to two planar channels in place and publish metrics.
    ///
    /// Without a prepared instance the block is silenced and the rhythm follower is
    /// reset, whatever the bypass flag says. With one, bypass passes the block
    /// through untouched.
    pub fn process(&mut self, buffer: &mut [&mut [f32]]) {
        let rms_in = [channel_rms(buffer, 0), channel_rms(buffer, 1)];

        if !self.host.is_prepared() {
            silence(buffer);
            self.prev_energy = 0.0;
        } else if self.bypass.is_bypassed() {
            // dry
        } else if self.host.process(buffer, &[]).is_err() {
            silence(buffer);
            self.metrics.record_failed_block();
        }

        let rms_out = [channel_rms(buffer, 0), channel_rms(buffer, 1)];
        let tonal_energy = unit(TONAL_GAIN * rms_out[0].max(rms_out[1]));

        let envelope = 0.5 * (rms_out[0] + rms_out[1]);
        let delta = (envelope - self.prev_energy).max(0.0);
        self.prev_energy = ENVELOPE_ATTACK * envelope + (1.0 - ENVELOPE_ATTACK) * self.prev_energy;
        let rhythm_energy = unit(RHYTHM_GAIN * delta);

        self.metrics.publish(&MetricSample {
            rms_in_l: rms_in[0],
            rms_in_r: rms_in[1],
            rms_out_l: rms_out[0],
            rms_out_r: rms_out[1],
            tonal_energy,
            rhythm_energy,
        });

        if let (Some(sink), Some(first)) = (self.waveform.as_mut(), buffer.first()) {
            sink.push_slice(first);
        }
    }
}

/// RMS of one channel. An absent channel, or one holding a non-finite sample,
/// reads as 0 so the follower state stays finite.
#[inline]
fn channel_rms(buffer: &[&mut [f32]], channel: usize) -> f32 {
    let Some(samples) = buffer.get(channel) else {
        return 0.0;
    };
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    let rms = (sum / samples.len().max(1) as f64).sqrt() as f32;
    if rms.is_finite() { rms } else { 0.0 }
}

#[inline]
fn silence(buffer: &mut [&mut [f32]]) {
    for channel in buffer.iter_mut() {
        channel.fill(0.0);
    }
}

/// Clamp to 0..=1, mapping NaN to 0.
#[inline]
fn unit(x: f32) -> f32 {
    if x.is_nan() { 0.0 } else { x.clamp(0.0, 1.0) }
}
