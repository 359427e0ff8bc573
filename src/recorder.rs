use crate::config::{AppSessionConfig, AuthState, TICK_INTERVAL_MS};
use crate::error::RecorderError;
use crate::media::{MediaAttachment, MediaQueue};
use crate::persistence::PersistenceSink;
use crate::sample_buffer::SampleBuffer;
use crate::sensors::SensorEvent;
use crate::session::{RecordingSession, SessionState, SessionSummary, TickOutcome};
use crate::upload::{
    spawn_upload, Geocoder, RemoteService, UploadCoordinator, UploadOutcome, UploadReceipt,
    UploadRequest,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Requests from the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Ride/seat/target values confirmed by the setup collaborator
    Setup(AppSessionConfig),
    CancelSetup,
    CaptureMedia(MediaAttachment),
    Login(AuthState),
    Start,
    Stop,
    /// Answer to `SessionEvent::ChoiceRequested`
    ChooseUpload(bool),
    /// Upload the last finished session (menu entry)
    Upload,
    Shutdown,
}

/// Notices for the presentation layer. The core never calls into UI code.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SetupConfirmed { media_flushed: usize },
    SetupCancelled { media_flushed: usize },
    SetupRequired,
    LoginChanged { logged_in: bool },
    MediaCaptured { pending: usize },
    Started,
    /// First failed write of the session; recording continues in memory
    StorageWriteFailed(String),
    Stopped(SessionSummary),
    /// Row cap reached. Shown as a "time up" notice before the choice.
    AutoStopped(SessionSummary),
    ChoiceRequested { auto_stopped: bool },
    UploadStarted { rows: usize, media: usize },
    UploadPrereqMissing(String),
    NoDataToUpload,
    UploadFinished(UploadReceipt),
    UploadFailed { message: String, media_uploaded: usize },
    Summary(SessionSummary),
    /// Command not valid in the current state
    Ignored(String),
    ShutDown,
}

/// What the loop has to do after a command
#[derive(Debug, Default)]
pub struct Reaction {
    pub events: Vec<SessionEvent>,
    pub upload: Option<UploadRequest>,
    pub shutdown: bool,
}

impl Reaction {
    fn events(events: Vec<SessionEvent>) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    fn ignored(reason: &str) -> Self {
        log::debug!("ignored command: {}", reason);
        Self::events(vec![SessionEvent::Ignored(reason.to_string())])
    }
}

/// Recording core: sample buffer, session, media queue and the setup/login state.
///
/// Synchronous; `run` drives it from one task.
pub struct Recorder<S: PersistenceSink> {
    buffer: SampleBuffer,
    session: RecordingSession<S>,
    media: MediaQueue,
    media_folder: PathBuf,
    config: AppSessionConfig,
    auth: AuthState,
    /// Set by a valid `Setup`, cleared whenever a session stops
    setup_confirmed: bool,
    uploading: bool,
}

impl<S: PersistenceSink> Recorder<S> {
    pub fn new(sink: S, media_folder: PathBuf, config: AppSessionConfig, auth: AuthState) -> Self {
        Self {
            buffer: SampleBuffer::new(),
            session: RecordingSession::new(sink),
            media: MediaQueue::new(),
            media_folder,
            config,
            auth,
            setup_confirmed: false,
            uploading: false,
        }
    }

    pub fn handle_sensor(&mut self, event: SensorEvent) {
        self.buffer.apply(event);
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_recording()
    }

    pub fn is_uploading(&self) -> bool {
        self.uploading
    }

    pub fn session(&self) -> &RecordingSession<S> {
        &self.session
    }

    pub fn media(&self) -> &MediaQueue {
        &self.media
    }

    pub fn config(&self) -> &AppSessionConfig {
        &self.config
    }

    pub fn tick(&mut self) -> Vec<SessionEvent> {
        match self.session.tick(&self.buffer.snapshot()) {
            TickOutcome::Skipped => Vec::new(),
            TickOutcome::Recorded {
                storage_failure: Some(e),
                ..
            } => vec![SessionEvent::StorageWriteFailed(e.to_string())],
            TickOutcome::Recorded { .. } => Vec::new(),
            TickOutcome::AutoStopped(summary) => {
                self.setup_confirmed = false;
                vec![
                    SessionEvent::AutoStopped(summary),
                    SessionEvent::ChoiceRequested { auto_stopped: true },
                ]
            }
        }
    }

    pub fn handle_command(&mut self, command: Command) -> Reaction {
        match command {
            Command::Setup(config) => self.setup(config),
            Command::CancelSetup => {
                let media_flushed = self.media.flush(&self.config, &self.media_folder);
                Reaction::events(vec![SessionEvent::SetupCancelled { media_flushed }])
            }
            Command::CaptureMedia(attachment) => {
                self.media.capture(attachment);
                Reaction::events(vec![SessionEvent::MediaCaptured {
                    pending: self.media.pending_count(),
                }])
            }
            Command::Login(auth) => {
                self.auth = auth;
                Reaction::events(vec![SessionEvent::LoginChanged {
                    logged_in: self.auth.is_logged_in(),
                }])
            }
            Command::Start => self.start(),
            Command::Stop => match self.session.stop(true) {
                Some(summary) => {
                    self.setup_confirmed = false;
                    Reaction::events(vec![
                        SessionEvent::Stopped(summary),
                        SessionEvent::ChoiceRequested { auto_stopped: false },
                    ])
                }
                None => Reaction::default(),
            },
            Command::ChooseUpload(upload) => self.choose(upload),
            Command::Upload => {
                if self.session.is_recording() {
                    return Reaction::ignored("stop recording before uploading");
                }
                self.session.resolve_choice();
                self.begin_upload()
            }
            Command::Shutdown => self.shutdown(),
        }
    }

    fn setup(&mut self, config: AppSessionConfig) -> Reaction {
        if self.session.is_recording() {
            return Reaction::ignored("setup cannot change while recording");
        }
        self.config = config;
        self.setup_confirmed = self.config.ride_setup().is_ok();
        match self.config.ride_setup() {
            Ok(_) => {
                let media_flushed = self.media.flush(&self.config, &self.media_folder);
                Reaction::events(vec![SessionEvent::SetupConfirmed { media_flushed }])
            }
            Err(_) => Reaction::events(vec![SessionEvent::SetupRequired]),
        }
    }

    /// Every recording needs its own confirmed setup
    fn start(&mut self) -> Reaction {
        if self.session.is_recording() {
            return Reaction::ignored("already recording");
        }
        if !self.setup_confirmed {
            return Reaction::events(vec![SessionEvent::SetupRequired]);
        }
        match self.session.start(&self.config) {
            Ok(()) => Reaction::events(vec![SessionEvent::Started]),
            Err(RecorderError::AlreadyRecording) => Reaction::ignored("already recording"),
            Err(e) => {
                log::info!("Cannot start: {}", e);
                Reaction::events(vec![SessionEvent::SetupRequired])
            }
        }
    }

    fn choose(&mut self, upload: bool) -> Reaction {
        if !matches!(self.session.state(), SessionState::ChoicePending { .. }) {
            return Reaction::ignored("no finished session awaiting a choice");
        }
        self.session.resolve_choice();

        if upload {
            self.begin_upload()
        } else {
            Reaction::events(self.summary().into_iter().collect())
        }
    }

    /// Validates locally, then hands the dataset and ready media to a background upload
    fn begin_upload(&mut self) -> Reaction {
        if self.uploading {
            return Reaction::ignored("an upload is already running");
        }

        let mut request = UploadRequest::new(
            &self.config,
            &self.auth,
            self.buffer.rough_location(),
            self.session.upload_rows(),
            Vec::new(),
        );

        if let Err(e) = request.check_prerequisites() {
            let mut events = vec![Self::upload_error_event(e, 0)];
            events.extend(self.summary());
            return Reaction::events(events);
        }

        request.media = self.media.take_ready();
        self.uploading = true;
        Reaction {
            events: vec![SessionEvent::UploadStarted {
                rows: request.rows.len(),
                media: request.media.len(),
            }],
            upload: Some(request),
            shutdown: false,
        }
    }

    pub fn on_upload_finished(&mut self, outcome: UploadOutcome) -> Vec<SessionEvent> {
        self.uploading = false;
        let mut events = match outcome {
            Ok(receipt) => vec![SessionEvent::UploadFinished(receipt)],
            Err(failure) => {
                if !failure.remaining_media.is_empty() {
                    log::info!("Requeueing {} media attachment(s)", failure.remaining_media.len());
                }
                self.media.requeue(failure.remaining_media);
                vec![Self::upload_error_event(failure.error, failure.media_uploaded)]
            }
        };
        events.extend(self.summary());
        events
    }

    fn upload_error_event(error: RecorderError, media_uploaded: usize) -> SessionEvent {
        match error {
            RecorderError::NoDataToUpload => SessionEvent::NoDataToUpload,
            RecorderError::UploadPrereqMissing(reason) => SessionEvent::UploadPrereqMissing(reason),
            other => SessionEvent::UploadFailed {
                message: other.to_string(),
                media_uploaded,
            },
        }
    }

    fn summary(&self) -> Option<SessionEvent> {
        self.session.summary().map(SessionEvent::Summary)
    }

    /// Forces a running session to stop and flushes captured media
    fn shutdown(&mut self) -> Reaction {
        let mut events = Vec::new();
        if let Some(summary) = self.session.stop(true) {
            log::info!("Stopping active session for shutdown");
            self.setup_confirmed = false;
            events.push(SessionEvent::Stopped(summary));
        }
        if self.media.pending_count() > 0 {
            self.media.flush(&self.config, &self.media_folder);
        }
        events.push(SessionEvent::ShutDown);
        Reaction {
            events,
            upload: None,
            shutdown: true,
        }
    }
}

/// Event loop: sensor events, commands and upload results are handled one at a
/// time; the 200 ms tick runs only while recording.
///
/// Returns the recorder after `Command::Shutdown` or when the command channel closes.
pub async fn run<S, R, G>(
    mut recorder: Recorder<S>,
    coordinator: Arc<UploadCoordinator<R, G>>,
    mut sensors: mpsc::Receiver<SensorEvent>,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<SessionEvent>,
) -> Recorder<S>
where
    S: PersistenceSink,
    R: RemoteService,
    G: Geocoder,
{
    let (upload_tx, mut upload_rx) = mpsc::channel::<UploadOutcome>(1);
    let mut ticker = interval(Duration::from_millis(TICK_INTERVAL_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
    let mut sensors_open = true;

    loop {
        tokio::select! {
            event = sensors.recv(), if sensors_open => match event {
                Some(event) => recorder.handle_sensor(event),
                None => {
                    log::warn!("Sensor channel closed; rows will repeat the last readings");
                    sensors_open = false;
                }
            },

            _ = ticker.tick(), if recorder.is_recording() => {
                emit(&events, recorder.tick()).await;
            }

            command = commands.recv() => {
                let command = command.unwrap_or(Command::Shutdown);
                let reaction = recorder.handle_command(command);

                if reaction.events.contains(&SessionEvent::Started) {
                    // First tick one period after start
                    ticker.reset();
                }
                if let Some(request) = reaction.upload {
                    spawn_upload(coordinator.clone(), request, upload_tx.clone());
                }
                emit(&events, reaction.events).await;
                if reaction.shutdown {
                    break;
                }
            }

            Some(outcome) = upload_rx.recv() => {
                emit(&events, recorder.on_upload_finished(outcome)).await;
            }
        }
    }

    recorder
}

async fn emit(tx: &mpsc::Sender<SessionEvent>, events: Vec<SessionEvent>) {
    for event in events {
        if tx.send(event).await.is_err() {
            log::debug!("No listener for session events");
            return;
        }
    }
}
