//! In-memory audio devices and transport for tests.
//!
//! The fakes record every call and let the test drive the output clock by hand,
//! so playback completion happens exactly when a test says it does.

use crate::audio::chunk::AudioChunk;
use crate::audio::codec::AudioPayload;
use crate::audio::device::{
    AudioBackend, DeviceError, FrameSink, InputPath, OutputPath, PlaybackId, PlaybackNotifier,
};
use crate::config::AppConfig;
use crate::session::context::FixedLocation;
use crate::session::engine::{EngineSettings, VoiceEngine};
use crate::transport::{
    EventSink, SessionConfig, Transport, TransportError, TransportEvent, TransportHandle,
};
use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tokio::sync::Notify;

/// Counts devices held open at the same time.
#[derive(Debug, Default)]
pub(crate) struct DeviceLedger {
    inputs: AtomicUsize,
    max_inputs: AtomicUsize,
    outputs: AtomicUsize,
    max_outputs: AtomicUsize,
    output_opens: AtomicUsize,
}

impl DeviceLedger {
    fn open_input(&self) {
        let now = self.inputs.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inputs.fetch_max(now, Ordering::SeqCst);
    }

    fn close_input(&self) {
        self.inputs.fetch_sub(1, Ordering::SeqCst);
    }

    fn open_output(&self) {
        self.output_opens.fetch_add(1, Ordering::SeqCst);
        let now = self.outputs.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_outputs.fetch_max(now, Ordering::SeqCst);
    }

    fn close_output(&self) {
        self.outputs.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn inputs_active(&self) -> usize {
        self.inputs.load(Ordering::SeqCst)
    }

    pub(crate) fn max_inputs_active(&self) -> usize {
        self.max_inputs.load(Ordering::SeqCst)
    }

    pub(crate) fn outputs_active(&self) -> usize {
        self.outputs.load(Ordering::SeqCst)
    }

    pub(crate) fn max_outputs_active(&self) -> usize {
        self.max_outputs.load(Ordering::SeqCst)
    }

    pub(crate) fn output_opens(&self) -> usize {
        self.output_opens.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct OutputState {
    now: f64,
    active: BTreeMap<PlaybackId, f64>,
    started: Vec<(PlaybackId, f64, f64)>,
    stopped: Vec<PlaybackId>,
    closed: bool,
    close_calls: usize,
}

/// Speaker whose clock only moves when the probe says so.
pub(crate) struct FakeOutput {
    sample_rate: u32,
    state: Arc<Mutex<OutputState>>,
    ledger: Option<Arc<DeviceLedger>>,
}

/// Test-side view of a [`FakeOutput`].
#[derive(Clone)]
pub(crate) struct OutputProbe {
    state: Arc<Mutex<OutputState>>,
    notifier: PlaybackNotifier,
}

impl FakeOutput {
    pub(crate) fn new(sample_rate: u32) -> (Self, OutputProbe) {
        Self::with_notifier(sample_rate, Arc::new(|_: PlaybackId| {}), None)
    }

    fn with_notifier(
        sample_rate: u32,
        notifier: PlaybackNotifier,
        ledger: Option<Arc<DeviceLedger>>,
    ) -> (Self, OutputProbe) {
        let state = Arc::new(Mutex::new(OutputState::default()));
        if let Some(ledger) = &ledger {
            ledger.open_output();
        }
        let output = Self {
            sample_rate,
            state: state.clone(),
            ledger,
        };
        (output, OutputProbe { state, notifier })
    }
}

impl OutputPath for FakeOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> f64 {
        self.state.lock().unwrap().now
    }

    fn start(&mut self, id: PlaybackId, chunk: AudioChunk, at: f64) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(DeviceError::Closed);
        }
        let start = at.max(state.now);
        let duration = chunk.duration_seconds();
        state.active.insert(id, start + duration);
        state.started.push((id, start, duration));
        Ok(())
    }

    fn stop_all(&mut self) {
        let mut state = self.state.lock().unwrap();
        let cut: Vec<PlaybackId> = std::mem::take(&mut state.active).into_keys().collect();
        state.stopped.extend(cut);
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.close_calls += 1;
        if !state.closed {
            state.closed = true;
            state.active.clear();
            if let Some(ledger) = &self.ledger {
                ledger.close_output();
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl Drop for FakeOutput {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.close();
        }
    }
}

impl OutputProbe {
    /// Move the clock forward and report every playback that ended on its own.
    pub(crate) fn advance(&self, seconds: f64) {
        let finished: Vec<PlaybackId> = {
            let mut state = self.state.lock().unwrap();
            state.now += seconds;
            let now = state.now;
            let mut done: Vec<(PlaybackId, f64)> = state
                .active
                .iter()
                .filter(|(_, end)| **end <= now + 1e-9)
                .map(|(id, end)| (*id, *end))
                .collect();
            done.sort_by(|a, b| a.1.total_cmp(&b.1));
            for (id, _) in &done {
                state.active.remove(id);
            }
            done.into_iter().map(|(id, _)| id).collect()
        };
        for id in finished {
            (self.notifier)(id);
        }
    }

    /// `(id, start, duration)` for every playback started, in call order.
    pub(crate) fn started(&self) -> Vec<(PlaybackId, f64, f64)> {
        self.state.lock().unwrap().started.clone()
    }

    pub(crate) fn stopped(&self) -> Vec<PlaybackId> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub(crate) fn close_count(&self) -> usize {
        self.state.lock().unwrap().close_calls
    }
}

#[derive(Default)]
struct InputState {
    sink: Option<FrameSink>,
    /// Sink that was active when `stop` ran, kept to simulate an in-flight frame.
    stale_sink: Option<FrameSink>,
    frame_samples: Option<usize>,
    starts: usize,
    close_calls: usize,
    closed: bool,
}

/// Microphone fed by hand through its probe.
pub(crate) struct FakeInput {
    sample_rate: u32,
    state: Arc<Mutex<InputState>>,
    ledger: Option<Arc<DeviceLedger>>,
}

#[derive(Clone)]
pub(crate) struct InputProbe {
    state: Arc<Mutex<InputState>>,
}

impl FakeInput {
    pub(crate) fn new(sample_rate: u32) -> (Self, InputProbe) {
        Self::with_ledger(sample_rate, None)
    }

    fn with_ledger(sample_rate: u32, ledger: Option<Arc<DeviceLedger>>) -> (Self, InputProbe) {
        let state = Arc::new(Mutex::new(InputState::default()));
        if let Some(ledger) = &ledger {
            ledger.open_input();
        }
        let input = Self {
            sample_rate,
            state: state.clone(),
            ledger,
        };
        (input, InputProbe { state })
    }
}

impl InputPath for FakeInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, frame_samples: usize, sink: FrameSink) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(DeviceError::Closed);
        }
        state.starts += 1;
        state.frame_samples = Some(frame_samples);
        state.sink = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state.lock().unwrap();
        if let Some(sink) = state.sink.take() {
            state.stale_sink = Some(sink);
        }
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.close_calls += 1;
        if !state.closed {
            state.closed = true;
            if let Some(sink) = state.sink.take() {
                state.stale_sink = Some(sink);
            }
            if let Some(ledger) = &self.ledger {
                ledger.close_input();
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl Drop for FakeInput {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.close();
        }
    }
}

impl InputProbe {
    /// Deliver a frame through the running sink, if any.
    pub(crate) fn push_frame(&self, samples: Vec<f32>) {
        let mut state = self.state.lock().unwrap();
        if let Some(sink) = state.sink.as_mut() {
            sink(samples);
        }
    }

    /// Deliver a frame through the sink that was running before `stop`.
    pub(crate) fn push_stale_frame(&self, samples: Vec<f32>) {
        let mut state = self.state.lock().unwrap();
        if let Some(sink) = state.stale_sink.as_mut() {
            sink(samples);
        }
    }

    pub(crate) fn frame_samples(&self) -> Option<usize> {
        self.state.lock().unwrap().frame_samples
    }

    pub(crate) fn start_count(&self) -> usize {
        self.state.lock().unwrap().starts
    }

    pub(crate) fn close_count(&self) -> usize {
        self.state.lock().unwrap().close_calls
    }
}

/// Backend handing out fake devices and remembering the latest pair.
#[derive(Default)]
pub(crate) struct FakeBackend {
    deny_microphone: AtomicBool,
    /// While set, opening the speaker blocks like a slow audio stack.
    held: Mutex<bool>,
    unheld: Condvar,
    blocked_opens: AtomicUsize,
    ledger: Arc<DeviceLedger>,
    last_output: Mutex<Option<OutputProbe>>,
    last_input: Mutex<Option<InputProbe>>,
}

impl FakeBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn deny_microphone(&self, deny: bool) {
        self.deny_microphone.store(deny, Ordering::SeqCst);
    }

    pub(crate) fn hold_devices(&self) {
        *self.held.lock().unwrap() = true;
    }

    pub(crate) fn release_devices(&self) {
        *self.held.lock().unwrap() = false;
        self.unheld.notify_all();
    }

    /// Opens currently waiting on [`hold_devices`](Self::hold_devices).
    pub(crate) fn blocked_opens(&self) -> usize {
        self.blocked_opens.load(Ordering::SeqCst)
    }

    pub(crate) fn ledger(&self) -> Arc<DeviceLedger> {
        self.ledger.clone()
    }

    pub(crate) fn last_output(&self) -> Option<OutputProbe> {
        self.last_output.lock().unwrap().clone()
    }

    pub(crate) fn last_input(&self) -> Option<InputProbe> {
        self.last_input.lock().unwrap().clone()
    }
}

impl AudioBackend for FakeBackend {
    fn open_output(
        &self,
        sample_rate: u32,
        notifier: PlaybackNotifier,
    ) -> Result<Box<dyn OutputPath>, DeviceError> {
        {
            let mut held = self.held.lock().unwrap();
            if *held {
                self.blocked_opens.fetch_add(1, Ordering::SeqCst);
                while *held {
                    held = self.unheld.wait(held).unwrap();
                }
                self.blocked_opens.fetch_sub(1, Ordering::SeqCst);
            }
        }
        let (output, probe) =
            FakeOutput::with_notifier(sample_rate, notifier, Some(self.ledger.clone()));
        *self.last_output.lock().unwrap() = Some(probe);
        Ok(Box::new(output))
    }

    fn open_input(&self, sample_rate: u32) -> Result<Box<dyn InputPath>, DeviceError> {
        if self.deny_microphone.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied);
        }
        let (input, probe) = FakeInput::with_ledger(sample_rate, Some(self.ledger.clone()));
        *self.last_input.lock().unwrap() = Some(probe);
        Ok(Box::new(input))
    }
}

#[derive(Default)]
struct TransportState {
    opens: usize,
    configs: Vec<SessionConfig>,
    sinks: Vec<EventSink>,
    sent_audio: Vec<AudioPayload>,
    sent_text: Vec<String>,
    live_links: usize,
    failure: Option<TransportError>,
    fail_next_send: bool,
    fail_close: bool,
    close_failures: usize,
}

/// Transport that opens instantly (or when its gate is released) and, unless
/// built with [`silent`](FakeTransport::silent), emits `Opened` before handing
/// over the link.
#[derive(Default)]
pub(crate) struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
    gate: Option<Arc<Notify>>,
    silent: bool,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every `open` waits for [`release_gate`](Self::release_gate).
    pub(crate) fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Arc::new(Notify::new())),
            ..Self::default()
        })
    }

    /// `open` returns the link without emitting `Opened`; the test emits it later.
    pub(crate) fn silent() -> Arc<Self> {
        Arc::new(Self {
            silent: true,
            ..Self::default()
        })
    }

    pub(crate) fn release_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_waiters();
            gate.notify_one();
        }
    }

    pub(crate) fn fail_open(&self, error: TransportError) {
        self.state.lock().unwrap().failure = Some(error);
    }

    pub(crate) fn clear_failure(&self) {
        self.state.lock().unwrap().failure = None;
    }

    /// The next `send_audio` on any link fails.
    pub(crate) fn fail_next_send(&self) {
        self.state.lock().unwrap().fail_next_send = true;
    }

    /// Every `close` reports an error (the link is still gone afterwards).
    pub(crate) fn fail_close(&self) {
        self.state.lock().unwrap().fail_close = true;
    }

    pub(crate) fn close_failures(&self) -> usize {
        self.state.lock().unwrap().close_failures
    }

    /// Emit an event on the most recently opened session.
    pub(crate) fn emit(&self, event: TransportEvent) {
        if let Some(sink) = self.last_sink() {
            sink.emit(event);
        }
    }

    pub(crate) fn last_sink(&self) -> Option<EventSink> {
        self.state.lock().unwrap().sinks.last().cloned()
    }

    pub(crate) fn last_config(&self) -> Option<SessionConfig> {
        self.state.lock().unwrap().configs.last().cloned()
    }

    pub(crate) fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub(crate) fn sent_audio(&self) -> Vec<AudioPayload> {
        self.state.lock().unwrap().sent_audio.clone()
    }

    pub(crate) fn sent_text(&self) -> Vec<String> {
        self.state.lock().unwrap().sent_text.clone()
    }

    pub(crate) fn live_links(&self) -> usize {
        self.state.lock().unwrap().live_links
    }
}

impl Transport for FakeTransport {
    fn open(
        &self,
        config: SessionConfig,
        events: EventSink,
    ) -> BoxFuture<'static, Result<Box<dyn TransportHandle>, TransportError>> {
        let state = self.state.clone();
        let gate = self.gate.clone();
        let silent = self.silent;
        Box::pin(async move {
            if let Some(gate) = gate {
                gate.notified().await;
            }
            {
                let mut guard = state.lock().unwrap();
                guard.opens += 1;
                guard.configs.push(config);
                guard.sinks.push(events.clone());
                if let Some(error) = guard.failure.clone() {
                    return Err(error);
                }
                guard.live_links += 1;
            }
            if !silent {
                events.emit(TransportEvent::Opened);
            }
            Ok(Box::new(FakeLink {
                state,
                closed: false,
            }) as Box<dyn TransportHandle>)
        })
    }
}

struct FakeLink {
    state: Arc<Mutex<TransportState>>,
    closed: bool,
}

impl TransportHandle for FakeLink {
    fn send_audio(&mut self, payload: AudioPayload) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next_send) {
            return Err(TransportError::Send("socket buffer full".to_string()));
        }
        state.sent_audio.push(payload);
        Ok(())
    }

    fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.state.lock().unwrap().sent_text.push(text.to_string());
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut state = self.state.lock().unwrap();
        state.live_links -= 1;
        if state.fail_close {
            state.close_failures += 1;
            return Err(TransportError::Send("close frame rejected".to_string()));
        }
        Ok(())
    }
}

impl Drop for FakeLink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Engine wired to fresh fakes, with a credential configured.
pub(crate) fn spawn_engine(
    config: &AppConfig,
) -> (VoiceEngine, Arc<FakeBackend>, Arc<FakeTransport>) {
    let backend = FakeBackend::new();
    let transport = FakeTransport::new();
    let mut settings = EngineSettings::from_config(config);
    if settings.api_key.is_empty() {
        settings.api_key = "test-key".to_string();
    }
    let engine = VoiceEngine::spawn(
        settings,
        backend.clone(),
        transport.clone(),
        Arc::new(FixedLocation(None)),
    );
    (engine, backend, transport)
}
