use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::bridge::AudioBridge;
use crate::host::AudioConfig;
use crate::plugin::HOST_CHANNELS;

/// Callback-sized blocks the capture ring can hold before dropping input.
const INPUT_RING_BLOCKS: usize = 8;
const DETACH_TIMEOUT: Duration = Duration::from_millis(500);

/// Commands from the control thread to the output callback.
pub enum BridgeCommand {
    /// Install a bridge. A bridge already installed is sent back on the return channel.
    Attach(Box<AudioBridge>),
    /// Send the installed bridge back on the return channel.
    Detach,
}

/// Device selection and stream format.
#[derive(Debug, Clone)]
pub struct AudioOptions {
    pub output_device: Option<String>,
    /// `Some("none")` disables capture.
    pub input_device: Option<String>,
    pub sample_rate: u32,
    pub buffer_size: u32,
}

pub struct AudioEngine {
    output: cpal::Stream,
    input: Option<cpal::Stream>,
    config: AudioConfig,
    cmd_tx: Sender<BridgeCommand>,
    return_rx: Receiver<Box<AudioBridge>>,
    running: Arc<AtomicBool>,
}

impl AudioEngine {
    /// Open the devices and start streaming. Outputs silence until a bridge is attached.
    pub fn start(options: &AudioOptions) -> anyhow::Result<Self> {
        let host = cpal::default_host();
        let block_size = options.buffer_size as usize;

        let device = match options.output_device.as_deref() {
            Some(name) => host
                .output_devices()?
                .find(|d| d.name().map(|n| n.contains(name)).unwrap_or(false))
                .ok_or_else(|| anyhow::anyhow!("Audio output device not found: {name}"))?,
            None => host
                .default_output_device()
                .ok_or_else(|| anyhow::anyhow!("No default audio output device"))?,
        };
        log::info!(
            "Using audio output device: {}",
            device.name().unwrap_or_else(|_| "Unknown".into())
        );

        let (producer, consumer) =
            HeapRb::<f32>::new(block_size * HOST_CHANNELS * INPUT_RING_BLOCKS).split();

        let input = match open_input(&host, options, producer) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Audio input unavailable, processing silence: {e:#}");
                None
            }
        };

        let stream_config = cpal::StreamConfig {
            channels: HOST_CHANNELS as u16,
            sample_rate: cpal::SampleRate(options.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(options.buffer_size),
        };
        log::info!(
            "Audio config: {}ch, {}Hz, buffer={}",
            HOST_CHANNELS,
            options.sample_rate,
            options.buffer_size
        );

        let (cmd_tx, cmd_rx) = crossbeam_channel::bounded::<BridgeCommand>(8);
        let (return_tx, return_rx) = crossbeam_channel::bounded::<Box<AudioBridge>>(8);
        let running = Arc::new(AtomicBool::new(false));
        let mut callback =
            OutputCallback::new(block_size, consumer, cmd_rx, return_tx, running.clone());

        let output = device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                callback.render(data, HOST_CHANNELS);
            },
            move |err| {
                log::error!("Audio output stream error: {err}");
            },
            None,
        )?;

        output.play()?;
        if let Some(input) = &input {
            input.play()?;
        }
        log::info!("Audio stream started");

        Ok(AudioEngine {
            output,
            input,
            config: AudioConfig::new(options.sample_rate as f64, block_size),
            cmd_tx,
            return_rx,
            running,
        })
    }

    /// The configuration the streams were opened with.
    pub fn config(&self) -> AudioConfig {
        self.config
    }

    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    /// Whether the output callback has been called at least once.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Hand `bridge` to the audio thread.
    pub fn attach(&self, bridge: AudioBridge) -> anyhow::Result<()> {
        self.cmd_tx
            .send(BridgeCommand::Attach(Box::new(bridge)))
            .map_err(|_| anyhow::anyhow!("audio command channel closed"))
    }

    /// Take the bridge back from the audio thread.
    ///
    /// Once this returns, no audio callback can touch the bridge until it is attached again.
    pub fn detach(&self) -> anyhow::Result<AudioBridge> {
        self.cmd_tx
            .send(BridgeCommand::Detach)
            .map_err(|_| anyhow::anyhow!("audio command channel closed"))?;
        let bridge = self
            .return_rx
            .recv_timeout(DETACH_TIMEOUT)
            .map_err(|_| anyhow::anyhow!("audio thread did not return the bridge"))?;
        Ok(*bridge)
    }

    /// Stop both streams and reclaim a bridge the callback still held.
    ///
    /// Detach first so the plugin is released while the stream runs. A bridge that
    /// could not be detached comes back here once the callback state is dropped.
    pub fn stop(self) -> Option<AudioBridge> {
        if let Err(e) = self.output.pause() {
            log::warn!("Failed to pause audio output stream: {e}");
        }
        if let Some(input) = &self.input {
            if let Err(e) = input.pause() {
                log::warn!("Failed to pause audio input stream: {e}");
            }
        }
        // Give the audio callback time to finish if it's mid-flight
        std::thread::sleep(Duration::from_millis(50));
        drop(self.output);
        drop(self.input);
        log::info!("Audio stream stopped");
        self.return_rx.try_iter().last().map(|bridge| *bridge)
    }
}

/// Open the capture stream selected by `options`, pushing stereo frames into `producer`.
fn open_input(
    host: &cpal::Host,
    options: &AudioOptions,
    mut producer: HeapProd<f32>,
) -> anyhow::Result<Option<cpal::Stream>> {
    let device = match options.input_device.as_deref() {
        Some(name) if name.eq_ignore_ascii_case("none") => {
            log::info!("Audio input disabled");
            return Ok(None);
        }
        Some(name) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n.contains(name)).unwrap_or(false))
            .ok_or_else(|| anyhow::anyhow!("Audio input device not found: {name}"))?,
        None => match host.default_input_device() {
            Some(device) => device,
            None => {
                log::info!("No default audio input device");
                return Ok(None);
            }
        },
    };

    let channels = device
        .default_input_config()?
        .channels()
        .clamp(1, HOST_CHANNELS as u16);
    let stream_config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(options.sample_rate),
        buffer_size: cpal::BufferSize::Fixed(options.buffer_size),
    };
    log::info!(
        "Using audio input device: {} ({}ch)",
        device.name().unwrap_or_else(|_| "Unknown".into()),
        channels
    );

    let channels = channels as usize;
    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            push_stereo(&mut producer, data, channels);
        },
        move |err| {
            log::error!("Audio input stream error: {err}");
        },
        None,
    )?;
    Ok(Some(stream))
}

/// Push interleaved `data` as stereo frames; a mono channel is duplicated.
/// Frames that do not fit are dropped.
fn push_stereo(producer: &mut HeapProd<f32>, data: &[f32], channels: usize) {
    if channels == HOST_CHANNELS {
        producer.push_slice(data);
        return;
    }
    for frame in data.chunks_exact(channels) {
        let left = frame[0];
        let right = frame.get(1).copied().unwrap_or(left);
        if producer.push_slice(&[left, right]) < HOST_CHANNELS {
            break;
        }
    }
}

/// State owned by the output callback. Buffers are allocated once, here.
struct OutputCallback {
    block_size: usize,
    bridge: Option<Box<AudioBridge>>,
    input: HeapCons<f32>,
    interleaved: Vec<f32>,
    left: Vec<f32>,
    right: Vec<f32>,
    cmd_rx: Receiver<BridgeCommand>,
    return_tx: Sender<Box<AudioBridge>>,
    /// A bridge the return channel had no room for. Sent before new commands are taken.
    pending_return: Option<Box<AudioBridge>>,
    running: Arc<AtomicBool>,
}

impl OutputCallback {
    fn new(
        block_size: usize,
        input: HeapCons<f32>,
        cmd_rx: Receiver<BridgeCommand>,
        return_tx: Sender<Box<AudioBridge>>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            block_size,
            bridge: None,
            input,
            interleaved: vec![0.0; block_size * HOST_CHANNELS],
            left: vec![0.0; block_size],
            right: vec![0.0; block_size],
            cmd_rx,
            return_tx,
            pending_return: None,
            running,
        }
    }

    /// Apply queued commands. Bridges are never dropped here: one that cannot be
    /// returned yet is parked and further commands wait for the next callback.
    fn drain_commands(&mut self) {
        if let Some(bridge) = self.pending_return.take() {
            if let Err(bridge) = self.send_back(bridge) {
                self.pending_return = Some(bridge);
                return;
            }
        }
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            let previous = match cmd {
                BridgeCommand::Attach(bridge) => self.bridge.replace(bridge),
                BridgeCommand::Detach => self.bridge.take(),
            };
            if let Some(bridge) = previous {
                if let Err(bridge) = self.send_back(bridge) {
                    self.pending_return = Some(bridge);
                    return;
                }
            }
        }
    }

    fn send_back(&self, bridge: Box<AudioBridge>) -> Result<(), Box<AudioBridge>> {
        match self.return_tx.try_send(bridge) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(bridge) | TrySendError::Disconnected(bridge)) => Err(bridge),
        }
    }

    /// Fill `data` (interleaved, `channels` wide) in chunks of at most `block_size` frames.
    fn render(&mut self, data: &mut [f32], channels: usize) {
        if !self.running.load(Ordering::Relaxed) {
            self.running.store(true, Ordering::Relaxed);
        }

        self.drain_commands();

        for chunk in data.chunks_mut(self.block_size * channels) {
            let frames = chunk.len() / channels;
            let captured = &mut self.interleaved[..frames * HOST_CHANNELS];
            let got = self.input.pop_slice(captured);
            captured[got..].fill(0.0);

            let left = &mut self.left[..frames];
            let right = &mut self.right[..frames];
            deinterleave(captured, left, right);

            match self.bridge.as_mut() {
                Some(bridge) => {
                    let mut block: [&mut [f32]; HOST_CHANNELS] = [left, right];
                    bridge.process(&mut block);
                    let [left, right] = block;
                    interleave(left, right, chunk, channels);
                }
                None => chunk.fill(0.0),
            }
        }
    }
}

impl Drop for OutputCallback {
    /// Hand any bridge still held back to the control side, wherever the stream
    /// drops this state.
    fn drop(&mut self) {
        for bridge in [self.pending_return.take(), self.bridge.take()]
            .into_iter()
            .flatten()
        {
            let _ = self.return_tx.try_send(bridge);
        }
    }
}

/// Split stereo-interleaved `src` into planar `left`/`right`.
fn deinterleave(src: &[f32], left: &mut [f32], right: &mut [f32]) {
    for ((frame, l), r) in src.chunks_exact(2).zip(left.iter_mut()).zip(right.iter_mut()) {
        *l = frame[0];
        *r = frame[1];
    }
}

/// Write planar `left`/`right` into `out`, `channels` wide. Extra channels are silenced.
fn interleave(left: &[f32], right: &[f32], out: &mut [f32], channels: usize) {
    for ((frame, &l), &r) in out.chunks_exact_mut(channels).zip(left).zip(right) {
        frame[0] = l;
        if let Some(second) = frame.get_mut(1) {
            *second = r;
        }
        for extra in frame.iter_mut().skip(2) {
            *extra = 0.0;
        }
    }
}
