// Ride Recorder
// Fixed-rate accelerometer/magnetometer/location recording for amusement park rides,
// with CSV persistence and upload to a data-sharing service

pub mod config;
pub mod error;
pub mod fusion;
pub mod media;
pub mod persistence;
pub mod recorder;
pub mod sample_buffer;
pub mod sensors;
pub mod session;
pub mod upload;

pub use config::{AppSessionConfig, AuthState, RideSetup, MAX_ROWS, TICK_INTERVAL_MS};
pub use error::{RResult, RecorderError};
pub use media::{MediaAttachment, MediaKind, MediaQueue};
pub use persistence::{CsvFileSink, PersistenceSink};
pub use recorder::{Command, Recorder, SessionEvent};
pub use sample_buffer::{BufferSnapshot, SampleBuffer};
pub use sensors::SensorEvent;
pub use session::{DataRow, RecordingSession, SessionState, SessionSummary};
pub use upload::{HttpRemoteService, NominatimGeocoder, UploadCoordinator};
