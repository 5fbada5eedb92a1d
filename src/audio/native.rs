// Native audio devices - lock-free, real-time safe
//
// Architecture:
// 1. Each cpal stream lives on its own device thread, so the handles the engine
//    holds are Send on every platform
// 2. Input callback only downmixes and pushes into an SPSC ring buffer
// 3. A capture worker drains the ring, resamples and cuts fixed-size frames
// 4. Output callback mixes scheduled voices; starts arrive over a second ring,
//    stop-all is a single atomic cutoff and finished voices go back over a third

use crate::audio::chunk::AudioChunk;
use crate::audio::device::{
    AudioBackend, DeviceError, FrameSink, InputPath, OutputPath, PlaybackId, PlaybackNotifier,
};
use crate::audio::resample::{PlaybackResampler, StreamingResampler};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Seconds of microphone audio the capture ring can hold.
const CAPTURE_RING_SECONDS: usize = 2;
/// Pending voice starts the mixer accepts between two callbacks.
const MIXER_COMMAND_CAPACITY: usize = 256;
/// Simultaneous voices the mixer keeps without reallocating.
const MIXER_VOICE_CAPACITY: usize = 64;
/// Stopped voices fade out over this fraction of a second instead of clicking.
const FADE_OUT_SECONDS: f64 = 0.005;
/// Poll interval of the capture worker and the playback notifier.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// cpal-backed microphone and speaker.
#[derive(Debug, Clone, Default)]
pub struct NativeAudio {
    input_device: Option<String>,
    output_device: Option<String>,
}

impl NativeAudio {
    /// `None` selects the host's default device.
    pub fn new(input_device: Option<String>, output_device: Option<String>) -> Self {
        Self {
            input_device,
            output_device,
        }
    }
}

impl AudioBackend for NativeAudio {
    fn open_output(
        &self,
        sample_rate: u32,
        notifier: PlaybackNotifier,
    ) -> Result<Box<dyn OutputPath>, DeviceError> {
        Ok(Box::new(NativeOutput::open(
            self.output_device.clone(),
            sample_rate,
            notifier,
        )?))
    }

    fn open_input(&self, sample_rate: u32) -> Result<Box<dyn InputPath>, DeviceError> {
        Ok(Box::new(NativeInput::open(self.input_device.clone(), sample_rate)?))
    }
}

enum StreamCommand {
    Play,
    Pause,
    Close,
}

/// Owns a cpal stream on a dedicated thread and forwards play/pause/close to it.
struct DeviceThread {
    control: mpsc::Sender<StreamCommand>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceThread {
    /// Build a stream on a new thread. `build` returns the stream and the rate the
    /// device actually runs at.
    fn spawn<F>(name: &str, build: F) -> Result<(Self, u32), DeviceError>
    where
        F: FnOnce() -> Result<(Stream, u32), DeviceError> + Send + 'static,
    {
        let (control, commands) = mpsc::channel::<StreamCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<u32, DeviceError>>();
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                for command in commands {
                    let result = match command {
                        StreamCommand::Play => stream.play().map_err(|e| e.to_string()),
                        StreamCommand::Pause => stream.pause().map_err(|e| e.to_string()),
                        StreamCommand::Close => break,
                    };
                    if let Err(e) = result {
                        tracing::warn!("{}: stream control failed: {}", thread_name, e);
                    }
                }
                drop(stream);
                tracing::debug!("{}: stream released", thread_name);
            })
            .map_err(|e| DeviceError::Stream(format!("failed to spawn device thread: {}", e)))?;

        let rate = ready_rx
            .recv()
            .map_err(|_| DeviceError::Stream("device thread exited during setup".to_string()))??;

        Ok((
            Self {
                control,
                handle: Some(handle),
            },
            rate,
        ))
    }

    fn send(&self, command: StreamCommand) {
        let _ = self.control.send(command);
    }

    fn close(&mut self) {
        self.send(StreamCommand::Close);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn map_build_error(err: impl std::fmt::Display) -> DeviceError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        DeviceError::PermissionDenied
    } else {
        DeviceError::Stream(message)
    }
}

fn find_device(
    host: &cpal::Host,
    name: Option<&str>,
    input: bool,
) -> Result<cpal::Device, DeviceError> {
    match name {
        Some(name) => {
            let devices: Vec<cpal::Device> = if input {
                host.input_devices().map_err(map_build_error)?.collect()
            } else {
                host.output_devices().map_err(map_build_error)?.collect()
            };
            devices
                .into_iter()
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| DeviceError::NotFound(name.to_string()))
        }
        None => {
            let device = if input {
                host.default_input_device()
            } else {
                host.default_output_device()
            };
            let role = if input { "default input" } else { "default output" };
            device.ok_or_else(|| DeviceError::NotFound(role.to_string()))
        }
    }
}

/// Prefer a config running at `preferred` Hz (f32 first), else the device default.
fn pick_config<I>(ranges: I, preferred: u32) -> Option<cpal::SupportedStreamConfig>
where
    I: Iterator<Item = cpal::SupportedStreamConfigRange>,
{
    let mut fallback = None;
    for range in ranges {
        if range.min_sample_rate().0 <= preferred && preferred <= range.max_sample_rate().0 {
            let config = range.with_sample_rate(SampleRate(preferred));
            if config.sample_format() == SampleFormat::F32 {
                return Some(config);
            }
            fallback.get_or_insert(config);
        }
    }
    fallback
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

struct CaptureWorker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<HeapCons<f32>>,
}

pub struct NativeInput {
    target_rate: u32,
    device_rate: u32,
    device: DeviceThread,
    capturing: Arc<AtomicBool>,
    consumer: Option<HeapCons<f32>>,
    worker: Option<CaptureWorker>,
    closed: bool,
}

impl NativeInput {
    fn open(device_name: Option<String>, target_rate: u32) -> Result<Self, DeviceError> {
        let capturing = Arc::new(AtomicBool::new(false));
        let callback_flag = capturing.clone();
        let (consumer_tx, consumer_rx) = mpsc::channel::<HeapCons<f32>>();

        let (device, device_rate) = DeviceThread::spawn("audio-input", move || {
            let host = cpal::default_host();
            let device = find_device(&host, device_name.as_deref(), true)?;
            let supported = match device.supported_input_configs() {
                Ok(ranges) => pick_config(ranges, target_rate),
                Err(e) => return Err(map_build_error(e)),
            };
            let supported = match supported {
                Some(config) => config,
                None => device.default_input_config().map_err(map_build_error)?,
            };

            let sample_format = supported.sample_format();
            let config: StreamConfig = supported.config();
            let rate = config.sample_rate.0;
            let ring = HeapRb::<f32>::new(rate as usize * CAPTURE_RING_SECONDS);
            let (producer, consumer) = ring.split();

            tracing::info!(
                "Microphone: {}, {}Hz, {} channels, {:?}",
                device.name().unwrap_or_default(),
                rate,
                config.channels,
                sample_format
            );

            let stream = match sample_format {
                SampleFormat::F32 => build_input::<f32>(&device, &config, producer, callback_flag),
                SampleFormat::I16 => build_input::<i16>(&device, &config, producer, callback_flag),
                SampleFormat::U16 => build_input::<u16>(&device, &config, producer, callback_flag),
                SampleFormat::I32 => build_input::<i32>(&device, &config, producer, callback_flag),
                other => Err(DeviceError::Unsupported(format!("sample format {:?}", other))),
            }?;

            let _ = consumer_tx.send(consumer);
            Ok((stream, rate))
        })?;

        let consumer = consumer_rx
            .recv()
            .map_err(|_| DeviceError::Stream("capture buffer was not handed over".to_string()))?;

        Ok(Self {
            target_rate,
            device_rate,
            device,
            capturing,
            consumer: Some(consumer),
            worker: None,
            closed: false,
        })
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: HeapProd<f32>,
    capturing: Arc<AtomicBool>,
) -> Result<Stream, DeviceError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !capturing.load(Ordering::Relaxed) {
                    return;
                }
                for frame in data.chunks(channels) {
                    let sum: f32 = frame.iter().map(|s| s.to_sample::<f32>()).sum();
                    let _ = producer.try_push(sum / frame.len() as f32);
                }
            },
            |err| tracing::error!("Microphone stream error: {}", err),
            None,
        )
        .map_err(map_build_error)
}

fn run_capture_worker(
    mut consumer: HeapCons<f32>,
    mut resampler: StreamingResampler,
    frame_samples: usize,
    mut sink: FrameSink,
    running: Arc<AtomicBool>,
) -> HeapCons<f32> {
    let mut scratch = vec![0.0f32; 1024];
    let mut pending: Vec<f32> = Vec::with_capacity(frame_samples * 2);

    while running.load(Ordering::Acquire) {
        let n = consumer.pop_slice(&mut scratch);
        if n == 0 {
            thread::sleep(POLL_INTERVAL);
            continue;
        }
        pending.extend(resampler.resample(&scratch[..n]));
        while pending.len() >= frame_samples {
            let frame: Vec<f32> = pending.drain(..frame_samples).collect();
            sink(frame);
        }
    }
    consumer
}

impl InputPath for NativeInput {
    fn sample_rate(&self) -> u32 {
        self.target_rate
    }

    fn start(&mut self, frame_samples: usize, sink: FrameSink) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::Closed);
        }
        if self.worker.is_some() {
            return Ok(());
        }
        let mut consumer = self
            .consumer
            .take()
            .ok_or_else(|| DeviceError::Stream("capture buffer unavailable".to_string()))?;
        consumer.clear();

        let running = Arc::new(AtomicBool::new(true));
        let worker_flag = running.clone();
        let resampler = StreamingResampler::new(self.device_rate, self.target_rate);

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                run_capture_worker(consumer, resampler, frame_samples, sink, worker_flag)
            })
            .map_err(|e| DeviceError::Stream(format!("failed to spawn capture worker: {}", e)))?;

        self.worker = Some(CaptureWorker { running, handle });
        self.capturing.store(true, Ordering::Release);
        self.device.send(StreamCommand::Play);
        Ok(())
    }

    fn stop(&mut self) {
        self.capturing.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            self.device.send(StreamCommand::Pause);
            worker.running.store(false, Ordering::Release);
            match worker.handle.join() {
                Ok(consumer) => self.consumer = Some(consumer),
                Err(_) => tracing::error!("Capture worker panicked"),
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.stop();
        self.device.close();
        self.closed = true;
        tracing::debug!("Microphone closed");
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for NativeInput {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

struct StartVoice {
    id: PlaybackId,
    samples: Arc<[f32]>,
    start_frame: u64,
}

struct Voice {
    id: PlaybackId,
    samples: Arc<[f32]>,
    start_frame: u64,
    position: usize,
    fade_remaining: Option<usize>,
}

impl Voice {
    fn next(&mut self, frame: u64, fade_frames: usize) -> f32 {
        if frame < self.start_frame || self.position >= self.samples.len() {
            return 0.0;
        }
        let gain = match self.fade_remaining {
            Some(0) => return 0.0,
            Some(remaining) => {
                self.fade_remaining = Some(remaining - 1);
                remaining as f32 / fade_frames.max(1) as f32
            }
            None => 1.0,
        };
        let sample = self.samples[self.position] * gain;
        self.position += 1;
        sample
    }

    /// Fade out if already audible, otherwise drop silently.
    fn stop(&mut self, now: u64, fade_frames: usize) {
        if self.fade_remaining.is_none() {
            let started = now >= self.start_frame && self.position > 0;
            self.fade_remaining = Some(if started { fade_frames } else { 0 });
        }
    }

    fn finished(&self) -> bool {
        self.fade_remaining.is_none() && self.position >= self.samples.len()
    }

    fn silenced(&self) -> bool {
        match self.fade_remaining {
            Some(remaining) => remaining == 0 || self.position >= self.samples.len(),
            None => false,
        }
    }
}

/// Runs inside the output callback. Never blocks.
struct Mixer {
    starts: HeapCons<StartVoice>,
    /// Every voice with an id at or below this value has been stopped.
    cutoff: Arc<AtomicU64>,
    retired: HeapProd<PlaybackId>,
    voices: Vec<Voice>,
    clock: Arc<AtomicU64>,
    frame: u64,
    fade_frames: usize,
}

impl Mixer {
    fn apply_commands(&mut self) {
        while let Some(start) = self.starts.try_pop() {
            self.voices.push(Voice {
                id: start.id,
                samples: start.samples,
                start_frame: start.start_frame.max(self.frame),
                position: 0,
                fade_remaining: None,
            });
        }

        // Read after draining, so a start queued before the cutoff is caught too.
        let cutoff = self.cutoff.load(Ordering::Acquire);
        let (now, fade) = (self.frame, self.fade_frames);
        for voice in self.voices.iter_mut().filter(|v| v.id.0 <= cutoff) {
            voice.stop(now, fade);
        }
    }

    fn render<T>(&mut self, data: &mut [T], channels: usize)
    where
        T: Sample + FromSample<f32>,
    {
        self.apply_commands();

        for out in data.chunks_mut(channels) {
            let mut mixed = 0.0f32;
            for voice in self.voices.iter_mut() {
                mixed += voice.next(self.frame, self.fade_frames);
            }
            let value = T::from_sample(mixed.clamp(-1.0, 1.0));
            for sample in out.iter_mut() {
                *sample = value;
            }
            self.frame += 1;
        }

        let retired = &mut self.retired;
        self.voices.retain(|voice| {
            if voice.finished() {
                let _ = retired.try_push(voice.id);
                false
            } else {
                !voice.silenced()
            }
        });
        self.clock.store(self.frame, Ordering::Release);
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut mixer: Mixer,
) -> Result<Stream, DeviceError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| mixer.render(data, channels),
            |err| tracing::error!("Speaker stream error: {}", err),
            None,
        )
        .map_err(map_build_error)
}

pub struct NativeOutput {
    device_rate: u32,
    device: DeviceThread,
    starts: HeapProd<StartVoice>,
    cutoff: Arc<AtomicU64>,
    last_started: u64,
    converter: PlaybackResampler,
    clock: Arc<AtomicU64>,
    notifier_stop: Arc<AtomicBool>,
    notifier_thread: Option<JoinHandle<()>>,
    closed: bool,
}

impl NativeOutput {
    fn open(
        device_name: Option<String>,
        preferred_rate: u32,
        notifier: PlaybackNotifier,
    ) -> Result<Self, DeviceError> {
        let clock = Arc::new(AtomicU64::new(0));
        let cutoff = Arc::new(AtomicU64::new(0));
        let (starts, start_rx) = HeapRb::<StartVoice>::new(MIXER_COMMAND_CAPACITY).split();
        let (retired_tx, mut retired_rx) =
            HeapRb::<PlaybackId>::new(MIXER_COMMAND_CAPACITY).split();
        let mixer_clock = clock.clone();
        let mixer_cutoff = cutoff.clone();

        let (device, device_rate) = DeviceThread::spawn("audio-output", move || {
            let host = cpal::default_host();
            let device = find_device(&host, device_name.as_deref(), false)?;
            let supported = match device.supported_output_configs() {
                Ok(ranges) => pick_config(ranges, preferred_rate),
                Err(e) => return Err(map_build_error(e)),
            };
            let supported = match supported {
                Some(config) => config,
                None => device.default_output_config().map_err(map_build_error)?,
            };

            let sample_format = supported.sample_format();
            let config: StreamConfig = supported.config();
            let rate = config.sample_rate.0;

            tracing::info!(
                "Speaker: {}, {}Hz, {} channels, {:?}",
                device.name().unwrap_or_default(),
                rate,
                config.channels,
                sample_format
            );

            let mixer = Mixer {
                starts: start_rx,
                cutoff: mixer_cutoff,
                retired: retired_tx,
                voices: Vec::with_capacity(MIXER_VOICE_CAPACITY),
                clock: mixer_clock,
                frame: 0,
                fade_frames: (rate as f64 * FADE_OUT_SECONDS) as usize,
            };

            let stream = match sample_format {
                SampleFormat::F32 => build_output::<f32>(&device, &config, mixer),
                SampleFormat::I16 => build_output::<i16>(&device, &config, mixer),
                SampleFormat::U16 => build_output::<u16>(&device, &config, mixer),
                SampleFormat::I32 => build_output::<i32>(&device, &config, mixer),
                other => Err(DeviceError::Unsupported(format!("sample format {:?}", other))),
            }?;
            Ok((stream, rate))
        })?;
        device.send(StreamCommand::Play);

        let notifier_stop = Arc::new(AtomicBool::new(false));
        let stop_flag = notifier_stop.clone();
        let notifier_thread = thread::Builder::new()
            .name("audio-playback-notifier".to_string())
            .spawn(move || loop {
                while let Some(id) = retired_rx.try_pop() {
                    notifier(id);
                }
                if stop_flag.load(Ordering::Acquire) {
                    break;
                }
                thread::sleep(POLL_INTERVAL);
            })
            .map_err(|e| DeviceError::Stream(format!("failed to spawn notifier: {}", e)))?;

        Ok(Self {
            device_rate,
            device,
            starts,
            cutoff,
            last_started: 0,
            converter: PlaybackResampler::new(device_rate),
            clock,
            notifier_stop,
            notifier_thread: Some(notifier_thread),
            closed: false,
        })
    }
}

impl OutputPath for NativeOutput {
    fn sample_rate(&self) -> u32 {
        self.device_rate
    }

    fn now(&self) -> f64 {
        self.clock.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }

    fn start(&mut self, id: PlaybackId, chunk: AudioChunk, at: f64) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::Closed);
        }
        let samples = self.converter.convert(chunk);
        let start_frame = (at.max(0.0) * self.device_rate as f64).round() as u64;
        self.starts
            .try_push(StartVoice {
                id,
                samples,
                start_frame,
            })
            .map_err(|_| DeviceError::Stream("playback queue is full".to_string()))?;
        self.last_started = self.last_started.max(id.0);
        Ok(())
    }

    fn stop_all(&mut self) {
        if self.closed {
            return;
        }
        self.cutoff.store(self.last_started, Ordering::Release);
        self.converter.reset();
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.device.close();
        self.notifier_stop.store(true, Ordering::Release);
        if let Some(handle) = self.notifier_thread.take() {
            let _ = handle.join();
        }
        tracing::debug!("Speaker closed");
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for NativeOutput {
    fn drop(&mut self) {
        self.close();
    }
}
