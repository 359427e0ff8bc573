use crate::config::{AppSessionConfig, RideSetup, MAX_ROWS, TICK_INTERVAL_MS};
use crate::error::{RResult, RecorderError};
use crate::persistence::{PersistenceSink, SinkHandle};
use crate::sample_buffer::BufferSnapshot;
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Recording session state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Not recording, nothing awaiting a decision
    Idle,
    /// Tick loop active
    Recording,
    /// Stopped; waiting for the rider to decide on upload. Never re-enters Recording.
    ChoicePending { auto_stopped: bool },
}

/// One sampled record. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataRow {
    pub accel_x: f64,
    pub accel_y: f64,
    pub accel_z: f64,
    pub accel_magnitude: f64,
    /// `None` until the first fine fix
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub heading: f64,
    pub mag_x: f64,
    pub mag_y: f64,
    pub mag_z: f64,
    /// Session start epoch millis + elapsed millis
    pub timestamp_ms: i64,
}

impl DataRow {
    pub fn from_snapshot(snapshot: &BufferSnapshot, timestamp_ms: i64) -> Self {
        let accel = snapshot.acceleration;
        let mag = snapshot.magnetic_field;
        DataRow {
            accel_x: accel.x,
            accel_y: accel.y,
            accel_z: accel.z,
            accel_magnitude: accel.magnitude,
            latitude: snapshot.location.map(|p| p.latitude),
            longitude: snapshot.location.map(|p| p.longitude),
            heading: snapshot.orientation.heading,
            mag_x: mag.x,
            mag_y: mag.y,
            mag_z: mag.z,
            timestamp_ms,
        }
    }

    pub fn has_fix(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }

    /// Row in the bulk upload layout: `[ax, ay, az, |a|, lat, lon, heading, mx, my, mz, time]`
    pub fn to_upload_values(&self) -> Vec<Value> {
        vec![
            json!(round3(self.accel_x)),
            json!(round3(self.accel_y)),
            json!(round3(self.accel_z)),
            json!(round3(self.accel_magnitude)),
            json!(self.latitude),
            json!(self.longitude),
            json!(round3(self.heading)),
            json!(self.mag_x),
            json!(self.mag_y),
            json!(self.mag_z),
            json!(self.timestamp_ms),
        ]
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// What a stopped session reports for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub row_count: u32,
    pub elapsed_millis: u64,
    pub auto_stopped: bool,
    pub session_start_epoch_ms: i64,
    pub end_time: String,
    /// Base name of the CSV file, if the first tick happened
    pub file_name: Option<String>,
    pub storage_error: Option<String>,
}

impl SessionSummary {
    /// `M:SS.mmm`
    pub fn elapsed_display(&self) -> String {
        let minutes = self.elapsed_millis / 60_000;
        let seconds = (self.elapsed_millis / 1000) % 60;
        let millis = self.elapsed_millis % 1000;
        format!("{}:{:02}.{:03}", minutes, seconds, millis)
    }
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Elapsed time: {}", self.elapsed_display())?;
        writeln!(f, "Data points: {}", self.row_count)?;
        writeln!(f, "End date and time: {}", self.end_time)?;
        write!(f, "Filename: {}", self.file_name.as_deref().unwrap_or("(none)"))
    }
}

/// Result of one tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Session is not recording; nothing happened
    Skipped,
    /// A row was appended. `storage_failure` is set only on the first failed write of the session.
    Recorded {
        row_count: u32,
        storage_failure: Option<RecorderError>,
    },
    /// This tick hit the row cap and the session stopped itself
    AutoStopped(SessionSummary),
}

/// Fixed-interval recording session.
///
/// The caller drives `tick()` every `TICK_INTERVAL_MS` while `is_recording()`.
/// Rows live in memory for upload and are mirrored to the sink as they arrive.
pub struct RecordingSession<S: PersistenceSink> {
    sink: S,
    state: SessionState,
    setup: Option<RideSetup>,
    row_count: u32,
    elapsed_millis: u64,
    session_start_epoch_ms: i64,
    rows: Vec<DataRow>,
    handle: Option<SinkHandle>,
    file_name: Option<String>,
    storage_error: Option<String>,
    end_time: Option<String>,
}

impl<S: PersistenceSink> RecordingSession<S> {
    pub fn new(sink: S) -> Self {
        RecordingSession {
            sink,
            state: SessionState::Idle,
            setup: None,
            row_count: 0,
            elapsed_millis: 0,
            session_start_epoch_ms: 0,
            rows: Vec::new(),
            handle: None,
            file_name: None,
            storage_error: None,
            end_time: None,
        }
    }

    /// Idle/ChoicePending → Recording. Supersedes any previous dataset.
    pub fn start(&mut self, config: &AppSessionConfig) -> RResult<()> {
        if self.state == SessionState::Recording {
            return Err(RecorderError::AlreadyRecording);
        }
        let setup = config.ride_setup()?;

        self.rows = Vec::with_capacity(MAX_ROWS as usize);
        self.row_count = 0;
        self.elapsed_millis = 0;
        self.session_start_epoch_ms = Utc::now().timestamp_millis();
        self.handle = None;
        self.file_name = None;
        self.storage_error = None;
        self.end_time = None;
        self.state = SessionState::Recording;

        log::info!(
            "Recording started: ride={} seats={}",
            setup.ride_name,
            setup.seat_count
        );
        self.setup = Some(setup);
        Ok(())
    }

    /// Builds one row from `snapshot`, appends it, and enforces the row cap
    pub fn tick(&mut self, snapshot: &BufferSnapshot) -> TickOutcome {
        if self.state != SessionState::Recording {
            return TickOutcome::Skipped;
        }

        self.elapsed_millis += TICK_INTERVAL_MS;
        let timestamp_ms = self.session_start_epoch_ms + self.elapsed_millis as i64;
        let row = DataRow::from_snapshot(snapshot, timestamp_ms);

        self.rows.push(row);
        self.row_count += 1;
        log::debug!("row {} at {}", self.row_count, timestamp_ms);

        let storage_failure = match self.persist(&row) {
            Ok(()) => None,
            Err(e) => self.note_storage_failure(e),
        };

        if self.row_count >= MAX_ROWS {
            log::info!("Row cap of {} reached, stopping", MAX_ROWS);
            if let Some(summary) = self.finish(true) {
                return TickOutcome::AutoStopped(summary);
            }
        }

        TickOutcome::Recorded {
            row_count: self.row_count,
            storage_failure,
        }
    }

    /// Recording → ChoicePending. No-op (returns `None`) when not recording.
    pub fn stop(&mut self, user_initiated: bool) -> Option<SessionSummary> {
        self.finish(!user_initiated)
    }

    /// ChoicePending → Idle once the rider has answered the upload question
    pub fn resolve_choice(&mut self) {
        if let SessionState::ChoicePending { .. } = self.state {
            self.state = SessionState::Idle;
        }
    }

    fn finish(&mut self, auto_stopped: bool) -> Option<SessionSummary> {
        if self.state != SessionState::Recording {
            return None;
        }

        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.sink.close(handle) {
                self.note_storage_failure(e);
            }
        }

        self.end_time = Some(Local::now().format("%m-%d-%Y--%H-%M-%S").to_string());
        self.state = SessionState::ChoicePending { auto_stopped };
        log::info!(
            "Recording stopped ({}): {} rows, {} ms",
            if auto_stopped { "auto" } else { "user" },
            self.row_count,
            self.elapsed_millis
        );
        self.summary()
    }

    fn persist(&mut self, row: &DataRow) -> RResult<()> {
        let handle = match self.handle {
            Some(handle) => handle,
            // First tick opens the file; after a failed open only memory is kept
            None if self.file_name.is_none() => {
                let name = self.file_base_name();
                self.file_name = Some(name.clone());
                let handle = self.sink.open(&name)?;
                self.handle = Some(handle);
                handle
            }
            None => return Ok(()),
        };
        self.sink.append(handle, row)
    }

    /// Records the failure; returns it only the first time in this session
    fn note_storage_failure(&mut self, err: RecorderError) -> Option<RecorderError> {
        if self.storage_error.is_some() {
            log::debug!("storage still failing: {}", err);
            return None;
        }
        log::warn!("{}; continuing in memory", err);
        self.storage_error = Some(err.to_string());
        Some(err)
    }

    fn file_base_name(&self) -> String {
        let (ride, seats) = match &self.setup {
            Some(setup) => (setup.ride_name.as_str(), setup.seat_count),
            None => (crate::config::NOT_SET_RIDE, 1),
        };
        format!(
            "{}-{}-{}",
            ride,
            seats,
            Local::now().format("%m-%d-%Y--%H-%M-%S")
        )
    }

    /// Summary of the last stopped session; `None` while recording or before any session
    pub fn summary(&self) -> Option<SessionSummary> {
        let auto_stopped = match self.state {
            SessionState::Recording => return None,
            SessionState::ChoicePending { auto_stopped } => auto_stopped,
            SessionState::Idle => false,
        };
        let end_time = self.end_time.clone()?;

        Some(SessionSummary {
            row_count: self.row_count,
            elapsed_millis: self.elapsed_millis,
            auto_stopped,
            session_start_epoch_ms: self.session_start_epoch_ms,
            end_time,
            file_name: self.file_name.clone(),
            storage_error: self.storage_error.clone(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == SessionState::Recording
    }

    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    pub fn elapsed_millis(&self) -> u64 {
        self.elapsed_millis
    }

    pub fn session_start_epoch_ms(&self) -> i64 {
        self.session_start_epoch_ms
    }

    pub fn rows(&self) -> &[DataRow] {
        &self.rows
    }

    pub fn setup(&self) -> Option<&RideSetup> {
        self.setup.as_ref()
    }

    /// List-of-lists dataset for the bulk upload
    pub fn upload_rows(&self) -> Vec<Vec<Value>> {
        self.rows.iter().map(DataRow::to_upload_values).collect()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}
