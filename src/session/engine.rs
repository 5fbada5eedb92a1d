//! # Voice Session Engine
//!
//! Owns the connection lifecycle and is the only component allowed to start and
//! stop the capture pipeline, the playback scheduler and the transport.
//!
//! ## Architecture:
//! - **VoiceEngine**: cheap, cloneable handle. Commands are enqueued and return
//!   immediately; state is observed through a `watch` snapshot and a `broadcast`
//!   notification stream
//! - **SessionCore**: the actor. One task drains one unbounded queue, so the
//!   playback cursor, the pending set and the status are never touched
//!   concurrently
//!
//! ## Generations:
//! Every teardown bumps a generation counter. Device callbacks, transport events
//! and setup results are tagged with the generation they were created under, and
//! anything stale is dropped on arrival (releasing whatever resource it carries).
//!
//! ## Devices:
//! Speaker and microphone are opened on the blocking pool by the setup task, so a
//! slow audio stack never stalls the actor. A device lease is held from the moment
//! an attempt starts opening until its devices are closed; the next attempt waits
//! for it, so two sets of devices are never open at once.

use crate::audio::capture::CapturePipeline;
use crate::audio::codec::{decode_payload, PcmFormat};
use crate::audio::device::{AudioBackend, DeviceError, InputPath, OutputPath, PlaybackNotifier};
use crate::audio::scheduler::PlaybackScheduler;
use crate::config::AppConfig;
use crate::error::{EngineError, SetupError};
use crate::session::context::{HotelLocation, LocationProvider, SessionContext};
use crate::session::events::{EngineEvent, Generation};
use crate::session::status::{EngineNotification, EngineSnapshot, SessionStatus};
use crate::transport::{EventSink, SessionConfig, Transport, TransportEvent, TransportHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Notifications buffered per subscriber before old ones are dropped.
const NOTIFICATION_CAPACITY: usize = 64;

/// Per-connection parameters, snapshotted at each `connect()`.
#[derive(Clone)]
pub struct EngineSettings {
    pub model: String,
    pub api_key: String,
    pub voice_name: String,
    /// Base instruction; the session context block is appended at connect time
    pub instruction: String,
    pub input_format: PcmFormat,
    pub output_format: PcmFormat,
    pub capture_frame_samples: usize,
    pub context_timeout: Duration,
    pub hotel: HotelLocation,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model: config.session.model.clone(),
            api_key: config.transport.api_key.clone(),
            voice_name: config.session.voice_name.clone(),
            instruction: config.session.instruction.clone(),
            input_format: PcmFormat::mono(config.audio.input_sample_rate),
            output_format: PcmFormat::mono(config.audio.output_sample_rate),
            capture_frame_samples: config.audio.capture_frame_samples,
            context_timeout: Duration::from_millis(config.session.context_timeout_ms),
            hotel: config.session.hotel.location(),
        }
    }

    fn session_config(&self, instruction: String) -> SessionConfig {
        SessionConfig {
            model: self.model.clone(),
            api_key: self.api_key.clone(),
            voice_name: self.voice_name.clone(),
            instruction,
            input_format: self.input_format,
            output_format: self.output_format,
        }
    }
}

/// Speaker and microphone opened for one attempt.
pub(crate) struct SessionDevices {
    output: Box<dyn OutputPath>,
    input: Box<dyn InputPath>,
    /// Dropped last, after both devices.
    lease: OwnedMutexGuard<()>,
}

impl SessionDevices {
    /// Waits for the previous attempt's devices to be released, then opens the
    /// speaker and the microphone. Blocking.
    fn acquire(
        audio: &dyn AudioBackend,
        lock: Arc<Mutex<()>>,
        settings: &EngineSettings,
        notifier: PlaybackNotifier,
    ) -> Result<Self, SetupError> {
        let lease = lock.blocking_lock_owned();
        let mut output = audio
            .open_output(settings.output_format.sample_rate, notifier)
            .map_err(SetupError::Device)?;
        let input = match audio.open_input(settings.input_format.sample_rate) {
            Ok(input) => input,
            Err(e) => {
                output.close();
                return Err(SetupError::from(e));
            }
        };
        Ok(Self {
            output,
            input,
            lease,
        })
    }

    fn release(mut self) {
        self.input.close();
        self.output.close();
    }
}

/// Handle to a running engine.
///
/// ## Usage:
/// ```ignore
/// let engine = VoiceEngine::spawn(settings, audio, transport, location);
/// engine.connect()?;
/// let mut snapshots = engine.watch();
/// snapshots.wait_for(|s| s.status == SessionStatus::Connected).await?;
/// engine.send_text_message("Is a sea-view room free tonight?")?;
/// engine.disconnect()?;
/// ```
#[derive(Clone)]
pub struct VoiceEngine {
    events: mpsc::UnboundedSender<EngineEvent>,
    snapshot: watch::Receiver<EngineSnapshot>,
    notifications: broadcast::Sender<EngineNotification>,
}

impl VoiceEngine {
    /// Start the engine actor on the current tokio runtime.
    pub fn spawn(
        settings: EngineSettings,
        audio: Arc<dyn AudioBackend>,
        transport: Arc<dyn Transport>,
        location: Arc<dyn LocationProvider>,
    ) -> Self {
        let (events, queue) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(EngineSnapshot::default());
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let core = SessionCore {
            capture: CapturePipeline::new(settings.capture_frame_samples),
            settings,
            audio,
            transport,
            location,
            queue: events.downgrade(),
            generation: 0,
            session_id: None,
            status: SessionStatus::Disconnected,
            last_error: None,
            agent_talking: false,
            scheduler: PlaybackScheduler::new(),
            device_lock: Arc::new(Mutex::new(())),
            device_lease: None,
            link: None,
            setup_task: None,
            pending_open: false,
            snapshot: snapshot_tx,
            notifications: notifications.clone(),
        };
        tokio::spawn(core.run(queue));

        Self {
            events,
            snapshot,
            notifications,
        }
    }

    fn send(&self, event: EngineEvent) -> Result<(), EngineError> {
        self.events.send(event).map_err(|_| EngineError::Stopped)
    }

    /// Start a new session, tearing down any existing one first. Valid in every
    /// state; the outcome is observed through the snapshot.
    pub fn connect(&self) -> Result<(), EngineError> {
        self.send(EngineEvent::Connect)
    }

    /// End the session. Valid in every state; always ends in `Disconnected`.
    pub fn disconnect(&self) -> Result<(), EngineError> {
        self.send(EngineEvent::Disconnect)
    }

    /// Send a user text turn. Ignored unless the session is connected.
    pub fn send_text_message(&self, text: impl Into<String>) -> Result<(), EngineError> {
        self.send(EngineEvent::SendText(text.into()))
    }

    pub fn update_settings(&self, settings: EngineSettings) -> Result<(), EngineError> {
        self.send(EngineEvent::UpdateSettings(settings))
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.snapshot.borrow().status
    }

    pub fn watch(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot.clone()
    }

    pub fn notifications(&self) -> broadcast::Receiver<EngineNotification> {
        self.notifications.subscribe()
    }

    /// Wait until every command and callback queued so far has been handled.
    pub async fn flush(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineEvent::Flush(tx))?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Tear down any session and stop the actor.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineEvent::Shutdown(tx))?;
        rx.await.map_err(|_| EngineError::Stopped)
    }
}

struct SessionCore {
    settings: EngineSettings,
    audio: Arc<dyn AudioBackend>,
    transport: Arc<dyn Transport>,
    location: Arc<dyn LocationProvider>,
    /// Weak so the actor stops once every handle and callback is gone.
    queue: mpsc::WeakUnboundedSender<EngineEvent>,

    generation: Generation,
    session_id: Option<Uuid>,
    status: SessionStatus,
    last_error: Option<String>,
    agent_talking: bool,

    scheduler: PlaybackScheduler,
    capture: CapturePipeline,
    device_lock: Arc<Mutex<()>>,
    device_lease: Option<OwnedMutexGuard<()>>,
    link: Option<Box<dyn TransportHandle>>,
    setup_task: Option<JoinHandle<()>>,
    /// `Opened` arrived before the setup task handed over the link.
    pending_open: bool,

    snapshot: watch::Sender<EngineSnapshot>,
    notifications: broadcast::Sender<EngineNotification>,
}

impl SessionCore {
    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<EngineEvent>) {
        debug!("Voice engine started");
        while let Some(event) = queue.recv().await {
            tracing::trace!(event = event.name(), generation = self.generation, "Engine event");
            match event {
                EngineEvent::Shutdown(ack) => {
                    self.teardown();
                    self.set_status(SessionStatus::Disconnected);
                    queue.close();
                    let _ = ack.send(());
                    break;
                }
                other => self.handle(other),
            }
        }
        self.teardown();
        debug!("Voice engine stopped");
    }

    fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Connect => self.connect(),
            EngineEvent::Disconnect => {
                info!(session_id = ?self.session_id, "Disconnect requested");
                self.teardown();
                self.set_status(SessionStatus::Disconnected);
            }
            EngineEvent::SendText(text) => self.send_text(text),
            EngineEvent::UpdateSettings(settings) => {
                self.settings = settings;
                debug!("Engine settings updated");
            }
            EngineEvent::Flush(ack) => {
                let _ = ack.send(());
            }
            EngineEvent::DevicesReady {
                generation,
                devices,
            } => self.devices_ready(generation, devices),
            EngineEvent::SetupFinished { generation, result } => {
                self.setup_finished(generation, result)
            }
            EngineEvent::Transport { generation, event } => {
                if generation != self.generation {
                    tracing::trace!(generation, "Dropping stale transport event");
                    return;
                }
                self.transport_event(event);
            }
            EngineEvent::CapturedAudio {
                generation,
                payload,
            } => {
                if generation != self.generation || !self.capture.is_running() {
                    return;
                }
                if let Some(link) = self.link.as_mut() {
                    if let Err(e) = link.send_audio(payload) {
                        warn!(session_id = ?self.session_id, "Failed to send audio frame: {}", e);
                    }
                }
            }
            EngineEvent::PlaybackEnded { generation, id } => {
                if generation != self.generation {
                    return;
                }
                self.scheduler.finish(id);
                self.refresh_talking();
            }
            EngineEvent::Shutdown(_) => {}
        }
    }

    fn connect(&mut self) {
        self.teardown();
        self.capture = CapturePipeline::new(self.settings.capture_frame_samples);
        let generation = self.generation;
        let session_id = Uuid::new_v4();
        self.session_id = Some(session_id);
        self.last_error = None;
        self.set_status(SessionStatus::Connecting);
        info!(%session_id, generation, "Connecting voice session");

        if self.settings.api_key.trim().is_empty() {
            self.fail(SetupError::MissingCredential.into());
            return;
        }

        let Some(queue) = self.queue.upgrade() else {
            return;
        };

        let notifier_queue = queue.clone();
        let notifier: PlaybackNotifier = Arc::new(move |id| {
            let _ = notifier_queue.send(EngineEvent::PlaybackEnded { generation, id });
        });

        let audio = self.audio.clone();
        let device_lock = self.device_lock.clone();
        let transport = self.transport.clone();
        let location = self.location.clone();
        let settings = self.settings.clone();
        let sink_queue = queue.clone();
        let events = EventSink::new(move |event| {
            let _ = sink_queue.send(EngineEvent::Transport { generation, event });
        });

        self.setup_task = Some(tokio::spawn(async move {
            let device_settings = settings.clone();
            let acquired = tokio::task::spawn_blocking(move || {
                SessionDevices::acquire(audio.as_ref(), device_lock, &device_settings, notifier)
            })
            .await
            .unwrap_or_else(|e| {
                Err(SetupError::Device(DeviceError::Stream(format!(
                    "device setup aborted: {}",
                    e
                ))))
            });
            match acquired {
                Ok(devices) => {
                    let _ = queue.send(EngineEvent::DevicesReady {
                        generation,
                        devices,
                    });
                }
                Err(e) => {
                    let _ = queue.send(EngineEvent::SetupFinished {
                        generation,
                        result: Err(e),
                    });
                    return;
                }
            }

            let context = SessionContext::gather(
                location.as_ref(),
                settings.context_timeout,
                settings.hotel.clone(),
            )
            .await;
            debug!(
                date = %context.date,
                time = %context.time,
                user_location = %context.user_location,
                "Session context gathered"
            );

            let instruction = context.compose_instruction(&settings.instruction);
            let config = settings.session_config(instruction);
            let result = transport.open(config, events).await.map_err(SetupError::from);
            let _ = queue.send(EngineEvent::SetupFinished { generation, result });
        }));
    }

    fn devices_ready(&mut self, generation: Generation, devices: SessionDevices) {
        if generation != self.generation {
            debug!("Releasing devices from abandoned attempt {}", generation);
            devices.release();
            return;
        }
        let SessionDevices {
            output,
            input,
            lease,
        } = devices;
        self.scheduler.attach(output);
        self.capture.attach(input);
        self.device_lease = Some(lease);
        debug!(session_id = ?self.session_id, "Audio devices ready");
    }

    fn setup_finished(
        &mut self,
        generation: Generation,
        result: Result<Box<dyn TransportHandle>, SetupError>,
    ) {
        if generation != self.generation {
            if let Ok(mut link) = result {
                debug!("Closing transport from abandoned attempt {}", generation);
                if let Err(e) = link.close() {
                    warn!("Failed to close abandoned transport: {}", e);
                }
            }
            return;
        }

        self.setup_task = None;
        match result {
            Ok(link) => {
                self.link = Some(link);
                if std::mem::take(&mut self.pending_open) {
                    self.opened();
                }
            }
            Err(e) => self.fail(e.into()),
        }
    }

    fn transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                if self.status != SessionStatus::Connecting {
                    debug!("Ignoring open notification while {}", self.status);
                } else if self.link.is_none() {
                    self.pending_open = true;
                } else {
                    self.opened();
                }
            }
            TransportEvent::AudioReceived(payload) => {
                match decode_payload(&payload, self.settings.output_format) {
                    Ok(chunk) => {
                        if let Err(e) = self.scheduler.schedule(chunk) {
                            warn!(
                                session_id = ?self.session_id,
                                "Could not schedule agent audio: {}",
                                e
                            );
                        }
                    }
                    Err(e) => {
                        warn!(
                            session_id = ?self.session_id,
                            "Dropping undecodable audio chunk: {}",
                            e
                        );
                    }
                }
                self.refresh_talking();
            }
            TransportEvent::TextReceived(text) => {
                debug!(session_id = ?self.session_id, "Agent text: {}", text);
                let _ = self.notifications.send(EngineNotification::TextReceived(text));
            }
            TransportEvent::Interrupted => {
                info!(session_id = ?self.session_id, "Agent interrupted");
                self.scheduler.interrupt();
                self.refresh_talking();
            }
            TransportEvent::Closed(reason) => {
                info!(
                    session_id = ?self.session_id,
                    "Session closed by remote: {}",
                    reason.as_deref().unwrap_or("no reason given")
                );
                self.teardown();
                if self.status != SessionStatus::Error {
                    self.set_status(SessionStatus::Disconnected);
                }
            }
            TransportEvent::Error(detail) => self.fail(EngineError::Transport(detail)),
        }
    }

    /// Transport is ready: go live and start the microphone exactly once.
    fn opened(&mut self) {
        self.set_status(SessionStatus::Connected);
        info!(session_id = ?self.session_id, "Voice session connected");

        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        let generation = self.generation;
        let started = self.capture.start(move |payload| {
            let _ = queue.send(EngineEvent::CapturedAudio {
                generation,
                payload,
            });
        });
        if let Err(e) = started {
            self.fail(SetupError::Device(e).into());
        }
    }

    fn send_text(&mut self, text: String) {
        if self.status != SessionStatus::Connected {
            debug!("Ignoring text message while {}", self.status);
            return;
        }
        if let Some(link) = self.link.as_mut() {
            if let Err(e) = link.send_text(&text) {
                warn!(session_id = ?self.session_id, "Failed to send text message: {}", e);
            }
        }
    }

    /// Record a fatal error, tear everything down and land in `Error`.
    fn fail(&mut self, error: EngineError) {
        warn!(session_id = ?self.session_id, "Voice session failed: {}", error);
        self.teardown();
        self.last_error = Some(error.user_message());
        self.set_status(SessionStatus::Error);
    }

    /// Release every resource the session holds. Idempotent and infallible.
    fn teardown(&mut self) {
        self.generation += 1;
        self.pending_open = false;

        if let Some(task) = self.setup_task.take() {
            task.abort();
        }
        self.capture.release();
        self.scheduler.stop();
        self.device_lease = None;
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.close() {
                warn!(session_id = ?self.session_id, "Error while closing transport: {}", e);
            }
        }
        self.refresh_talking();
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status != status {
            self.status = status;
            let _ = self
                .notifications
                .send(EngineNotification::StatusChanged(status));
        }
        self.publish();
    }

    fn refresh_talking(&mut self) {
        let talking = self.scheduler.is_playing();
        if talking != self.agent_talking {
            self.agent_talking = talking;
            let notification = if talking {
                EngineNotification::AgentStartedTalking
            } else {
                EngineNotification::AgentStoppedTalking
            };
            let _ = self.notifications.send(notification);
        }
        self.publish();
    }

    fn publish(&self) {
        let next = EngineSnapshot {
            status: self.status,
            last_error: self.last_error.clone(),
            agent_talking: self.agent_talking,
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
