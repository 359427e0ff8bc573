use crate::config::{AppSessionConfig, AuthState};
use crate::error::{RResult, RecorderError};
use crate::media::{MediaAttachment, MediaKind};
use crate::sample_buffer::Position;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const UNNAMED_SESSION: &str = "*Session Name Not Provided*";
pub const SESSION_DESCRIPTION: &str = "Automated Submission Through Ride Recorder";
pub const UNKNOWN_FIELD: &str = "N/A";
pub const DEFAULT_COUNTRY: &str = "United States";

/// Fields of the remote session record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub target_id: String,
    pub name: String,
    pub description: String,
    pub address: String,
    pub city_state: String,
    pub country: String,
}

/// Remote data-sharing service
pub trait RemoteService: Send + Sync + 'static {
    fn create_session(&self, record: &SessionRecord) -> impl Future<Output = RResult<u64>> + Send;

    fn put_session_data(
        &self,
        session_id: u64,
        target_id: &str,
        rows: &[Vec<Value>],
    ) -> impl Future<Output = RResult<()>> + Send;

    fn upload_media(
        &self,
        file: &Path,
        target_id: &str,
        session_id: u64,
        session_name: &str,
        extra: &str,
    ) -> impl Future<Output = RResult<()>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub address_line: String,
    pub city: String,
    pub state: String,
    pub country: String,
}

/// Reverse geocoding of the coarse location
pub trait Geocoder: Send + Sync + 'static {
    fn reverse(&self, position: Position) -> impl Future<Output = RResult<Option<Address>>> + Send;
}

/// Geocoder for when no lookup is configured
pub struct NoGeocoder;

impl Geocoder for NoGeocoder {
    async fn reverse(&self, _position: Position) -> RResult<Option<Address>> {
        Ok(None)
    }
}

/// Everything an upload needs, owned so it can move to a background task
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Already validated as numeric; `None` if missing or invalid
    pub target_id: Option<String>,
    pub session_name: Option<String>,
    pub auth: AuthState,
    pub rough_location: Option<Position>,
    pub rows: Vec<Vec<Value>>,
    /// In upload order
    pub media: Vec<MediaAttachment>,
}

impl UploadRequest {
    pub fn new(
        config: &AppSessionConfig,
        auth: &AuthState,
        rough_location: Option<Position>,
        rows: Vec<Vec<Value>>,
        media: Vec<MediaAttachment>,
    ) -> Self {
        Self {
            target_id: config.valid_target_id().map(str::to_string),
            session_name: config.session_name().map(str::to_string),
            auth: auth.clone(),
            rough_location,
            rows,
            media,
        }
    }

    /// Cheap checks that need no network. Returns the target id on success.
    pub fn check_prerequisites(&self) -> RResult<&str> {
        if self.rows.is_empty() {
            return Err(RecorderError::NoDataToUpload);
        }
        if !self.auth.is_logged_in() {
            return Err(RecorderError::UploadPrereqMissing(
                "not logged in; log in and upload again from the menu".to_string(),
            ));
        }
        self.target_id.as_deref().ok_or_else(|| {
            RecorderError::UploadPrereqMissing(
                "no valid experiment id; set one and upload again from the menu".to_string(),
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadReceipt {
    pub session_id: u64,
    pub rows_sent: usize,
    pub media_uploaded: usize,
}

/// Failed upload. `remaining_media` is what was not sent and must be requeued.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadFailure {
    pub error: RecorderError,
    pub remaining_media: Vec<MediaAttachment>,
    pub media_uploaded: usize,
}

pub type UploadOutcome = Result<UploadReceipt, UploadFailure>;

/// Builds the remote session from a finished dataset and pushes data, then media
pub struct UploadCoordinator<R: RemoteService, G: Geocoder> {
    remote: R,
    geocoder: G,
}

impl<R: RemoteService, G: Geocoder> UploadCoordinator<R, G> {
    pub fn new(remote: R, geocoder: G) -> Self {
        Self { remote, geocoder }
    }

    /// Session record, falling back to placeholders when name or geocode are missing
    pub async fn session_record(&self, target_id: &str, request: &UploadRequest) -> SessionRecord {
        let address = match request.rough_location {
            Some(position) => match self.geocoder.reverse(position).await {
                Ok(address) => address,
                Err(e) => {
                    log::warn!("Reverse geocoding failed: {}", e);
                    None
                }
            },
            None => None,
        };

        let (address, city_state, country) = match address {
            Some(a) => (a.address_line, format!("{}, {}", a.city, a.state), a.country),
            None => (
                UNKNOWN_FIELD.to_string(),
                UNKNOWN_FIELD.to_string(),
                DEFAULT_COUNTRY.to_string(),
            ),
        };

        SessionRecord {
            target_id: target_id.to_string(),
            name: session_label(request).to_string(),
            description: SESSION_DESCRIPTION.to_string(),
            address,
            city_state,
            country,
        }
    }

    /// Runs the whole upload. Stops at the first failing call; whatever was sent stays sent.
    pub async fn upload(&self, request: UploadRequest) -> UploadOutcome {
        let checked = request.check_prerequisites().map(str::to_string);
        let target_id = match checked {
            Ok(id) => id,
            Err(error) => {
                return Err(UploadFailure {
                    error,
                    remaining_media: request.media,
                    media_uploaded: 0,
                })
            }
        };

        let record = self.session_record(&target_id, &request).await;
        log::info!(
            "Uploading {} rows and {} media to experiment {}",
            request.rows.len(),
            request.media.len(),
            target_id
        );

        let session_id = match self.remote.create_session(&record).await {
            Ok(id) => id,
            Err(e) => return Err(failed("creating session", e, request.media, 0)),
        };

        if let Err(e) = self
            .remote
            .put_session_data(session_id, &target_id, &request.rows)
            .await
        {
            return Err(failed("sending data", e, request.media, 0));
        }

        let name = session_label(&request).to_string();
        let mut media = request.media.into_iter();
        let mut uploaded = 0;
        while let Some(attachment) = media.next() {
            if let Err(e) = self
                .remote
                .upload_media(&attachment.path, &target_id, session_id, &name, UNKNOWN_FIELD)
                .await
            {
                let mut remaining = vec![attachment];
                remaining.extend(media);
                return Err(failed("uploading media", e, remaining, uploaded));
            }
            uploaded += 1;
        }

        log::info!("Upload complete: session {}", session_id);
        Ok(UploadReceipt {
            session_id,
            rows_sent: request.rows.len(),
            media_uploaded: uploaded,
        })
    }
}

fn session_label(request: &UploadRequest) -> &str {
    request.session_name.as_deref().unwrap_or(UNNAMED_SESSION)
}

fn failed(
    step: &str,
    err: RecorderError,
    remaining_media: Vec<MediaAttachment>,
    media_uploaded: usize,
) -> UploadFailure {
    log::warn!("Upload failed while {}: {}", step, err);
    let error = match err {
        RecorderError::UploadFailed(msg) => RecorderError::UploadFailed(format!("{}: {}", step, msg)),
        other => RecorderError::UploadFailed(format!("{}: {}", step, other)),
    };
    UploadFailure {
        error,
        remaining_media,
        media_uploaded,
    }
}

/// Runs `upload` on a background task and delivers the outcome on `tx`.
///
/// There is no cancel; the task runs to completion or failure.
pub fn spawn_upload<R: RemoteService, G: Geocoder>(
    coordinator: Arc<UploadCoordinator<R, G>>,
    request: UploadRequest,
    tx: mpsc::Sender<UploadOutcome>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let outcome = coordinator.upload(request).await;
        if tx.send(outcome).await.is_err() {
            log::warn!("Upload finished after the recorder loop went away");
        }
    })
}

/// JSON-over-HTTP client for the data-sharing service
pub struct HttpRemoteService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemoteService {
    pub fn new(base_url: &str) -> RResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("ride_recorder/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(client_error)?;

        Ok(HttpRemoteService {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn check(response: reqwest::Response) -> RResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(RecorderError::UploadFailed(format!("HTTP error: {}", status.as_u16())))
        }
    }
}

fn client_error(e: reqwest::Error) -> RecorderError {
    RecorderError::Internal(format!("building HTTP client: {}", e))
}

fn network_error(e: reqwest::Error) -> RecorderError {
    if e.is_timeout() {
        RecorderError::UploadFailed("network timeout".to_string())
    } else {
        RecorderError::UploadFailed(e.to_string())
    }
}

impl RemoteService for HttpRemoteService {
    async fn create_session(&self, record: &SessionRecord) -> RResult<u64> {
        let response = self
            .client
            .post(format!("{}/sessions", self.base_url))
            .json(record)
            .send()
            .await
            .map_err(network_error)?;

        let body: Value = Self::check(response)?.json().await.map_err(network_error)?;
        body.get("session_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| RecorderError::UploadFailed("response has no session_id".to_string()))
    }

    async fn put_session_data(&self, session_id: u64, target_id: &str, rows: &[Vec<Value>]) -> RResult<()> {
        let response = self
            .client
            .post(format!("{}/sessions/{}/data", self.base_url, session_id))
            .json(&json!({ "target_id": target_id, "data": rows }))
            .send()
            .await
            .map_err(network_error)?;
        Self::check(response).map(|_| ())
    }

    async fn upload_media(
        &self,
        file: &Path,
        target_id: &str,
        session_id: u64,
        session_name: &str,
        extra: &str,
    ) -> RResult<()> {
        let bytes = tokio::fs::read(file)
            .await
            .map_err(|e| RecorderError::UploadFailed(format!("reading {}: {}", file.display(), e)))?;
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let content_type = match file.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext == MediaKind::Video.extension() => "video/3gpp",
            _ => "image/jpeg",
        };

        let response = self
            .client
            .post(format!("{}/sessions/{}/media", self.base_url, session_id))
            .query(&[
                ("target_id", target_id),
                ("session_name", session_name),
                ("description", extra),
                ("file_name", file_name.as_str()),
            ])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(network_error)?;
        Self::check(response).map(|_| ())
    }
}

/// Reverse geocoding through OpenStreetMap Nominatim
pub struct NominatimGeocoder {
    client: reqwest::Client,
    base_url: String,
}

impl NominatimGeocoder {
    pub fn new() -> RResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(concat!("ride_recorder/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(client_error)?;

        Ok(NominatimGeocoder {
            client,
            base_url: "https://nominatim.openstreetmap.org/reverse".to_string(),
        })
    }
}

impl Geocoder for NominatimGeocoder {
    async fn reverse(&self, position: Position) -> RResult<Option<Address>> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("format", "jsonv2".to_string()),
                ("lat", position.latitude.to_string()),
                ("lon", position.longitude.to_string()),
            ])
            .send()
            .await
            .map_err(|e| RecorderError::Io(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RecorderError::Io(format!("HTTP error: {}", response.status().as_u16())));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| RecorderError::Io(e.to_string()))?;
        Ok(parse_nominatim(&body))
    }
}

/// Address from a Nominatim `jsonv2` reverse response
fn parse_nominatim(body: &Value) -> Option<Address> {
    let address = body.get("address")?;
    let field = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| address.get(*k).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string()
    };

    let street = [field(&["house_number"]), field(&["road"])]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    Some(Address {
        address_line: if street.is_empty() {
            body.get("display_name")?.as_str()?.to_string()
        } else {
            street
        },
        city: field(&["city", "town", "village"]),
        state: field(&["state"]),
        country: field(&["country"]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Create(SessionRecord),
        Data(u64, usize),
        Media(String),
    }

    #[derive(Default)]
    struct FakeRemote {
        calls: Mutex<Vec<Call>>,
        fail_create: bool,
        fail_media_at: Option<usize>,
    }

    impl FakeRemote {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RemoteService for Arc<FakeRemote> {
        async fn create_session(&self, record: &SessionRecord) -> RResult<u64> {
            self.calls.lock().unwrap().push(Call::Create(record.clone()));
            if self.fail_create {
                return Err(RecorderError::UploadFailed("HTTP error: 503".to_string()));
            }
            Ok(77)
        }

        async fn put_session_data(&self, session_id: u64, _target_id: &str, rows: &[Vec<Value>]) -> RResult<()> {
            self.calls.lock().unwrap().push(Call::Data(session_id, rows.len()));
            Ok(())
        }

        async fn upload_media(
            &self,
            file: &Path,
            _target_id: &str,
            _session_id: u64,
            _session_name: &str,
            _extra: &str,
        ) -> RResult<()> {
            let mut calls = self.calls.lock().unwrap();
            let media_so_far = calls.iter().filter(|c| matches!(c, Call::Media(_))).count();
            if self.fail_media_at == Some(media_so_far) {
                return Err(RecorderError::UploadFailed("connection reset".to_string()));
            }
            calls.push(Call::Media(file.display().to_string()));
            Ok(())
        }
    }

    struct FixedGeocoder(Option<Address>);

    impl Geocoder for FixedGeocoder {
        async fn reverse(&self, _position: Position) -> RResult<Option<Address>> {
            Ok(self.0.clone())
        }
    }

    fn request(rows: usize) -> UploadRequest {
        UploadRequest {
            target_id: Some("512".to_string()),
            session_name: None,
            auth: AuthState::logged_in_as("rider"),
            rough_location: Some(Position {
                latitude: 42.77,
                longitude: -71.22,
            }),
            rows: vec![vec![json!(1.0)]; rows],
            media: vec![
                MediaAttachment::new("p2.jpeg", MediaKind::Photo),
                MediaAttachment::new("p1.jpeg", MediaKind::Photo),
                MediaAttachment::new("v1.3gp", MediaKind::Video),
            ],
        }
    }

    fn salem() -> Address {
        Address {
            address_line: "68 Range Rd".to_string(),
            city: "Salem".to_string(),
            state: "New Hampshire".to_string(),
            country: "United States".to_string(),
        }
    }

    #[tokio::test]
    async fn test_empty_session_never_calls_remote() {
        let remote = Arc::new(FakeRemote::default());
        let coordinator = UploadCoordinator::new(remote.clone(), NoGeocoder);

        let failure = coordinator.upload(request(0)).await.unwrap_err();
        assert_eq!(failure.error, RecorderError::NoDataToUpload);
        assert_eq!(failure.remaining_media.len(), 3);
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_login_or_target() {
        let remote = Arc::new(FakeRemote::default());
        let coordinator = UploadCoordinator::new(remote.clone(), NoGeocoder);

        let mut req = request(5);
        req.auth = AuthState::default();
        let failure = coordinator.upload(req).await.unwrap_err();
        assert!(matches!(failure.error, RecorderError::UploadPrereqMissing(_)));

        let mut req = request(5);
        req.target_id = None;
        let failure = coordinator.upload(req).await.unwrap_err();
        assert!(matches!(failure.error, RecorderError::UploadPrereqMissing(_)));

        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_full_upload_order() {
        let remote = Arc::new(FakeRemote::default());
        let coordinator = UploadCoordinator::new(remote.clone(), FixedGeocoder(Some(salem())));

        let receipt = coordinator.upload(request(5)).await.unwrap();
        assert_eq!(receipt.session_id, 77);
        assert_eq!(receipt.rows_sent, 5);
        assert_eq!(receipt.media_uploaded, 3);

        let calls = remote.calls();
        match &calls[0] {
            Call::Create(record) => {
                assert_eq!(record.name, UNNAMED_SESSION);
                assert_eq!(record.address, "68 Range Rd");
                assert_eq!(record.city_state, "Salem, New Hampshire");
                assert_eq!(record.description, SESSION_DESCRIPTION);
            }
            other => panic!("expected create first, got {:?}", other),
        }
        assert_eq!(calls[1], Call::Data(77, 5));
        assert_eq!(
            &calls[2..],
            &[
                Call::Media("p2.jpeg".to_string()),
                Call::Media("p1.jpeg".to_string()),
                Call::Media("v1.3gp".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_placeholders_without_geocode() {
        let coordinator = UploadCoordinator::new(Arc::new(FakeRemote::default()), NoGeocoder);
        let mut req = request(1);
        req.session_name = Some("Night ride".to_string());

        let record = coordinator.session_record("512", &req).await;
        assert_eq!(record.name, "Night ride");
        assert_eq!(record.address, UNKNOWN_FIELD);
        assert_eq!(record.city_state, UNKNOWN_FIELD);
        assert_eq!(record.country, DEFAULT_COUNTRY);
    }

    #[tokio::test]
    async fn test_media_failure_keeps_completed_uploads() {
        let remote = Arc::new(FakeRemote {
            fail_media_at: Some(1),
            ..Default::default()
        });
        let coordinator = UploadCoordinator::new(remote.clone(), NoGeocoder);

        let failure = coordinator.upload(request(5)).await.unwrap_err();
        assert!(failure.error.is_retryable());
        assert_eq!(failure.media_uploaded, 1);
        let remaining: Vec<_> = failure
            .remaining_media
            .iter()
            .map(|a| a.path.display().to_string())
            .collect();
        assert_eq!(remaining, vec!["p1.jpeg", "v1.3gp"]);
    }

    #[tokio::test]
    async fn test_create_failure_aborts_everything() {
        let remote = Arc::new(FakeRemote {
            fail_create: true,
            ..Default::default()
        });
        let coordinator = UploadCoordinator::new(remote.clone(), NoGeocoder);

        let failure = coordinator.upload(request(5)).await.unwrap_err();
        assert!(matches!(failure.error, RecorderError::UploadFailed(ref m) if m.starts_with("creating session")));
        assert_eq!(failure.remaining_media.len(), 3);
        assert_eq!(remote.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_upload_reports_on_channel() {
        let remote = Arc::new(FakeRemote::default());
        let coordinator = Arc::new(UploadCoordinator::new(remote, NoGeocoder));
        let (tx, mut rx) = mpsc::channel(1);

        spawn_upload(coordinator, request(2), tx).await.unwrap();
        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.unwrap().rows_sent, 2);
    }

    #[test]
    fn test_http_clients_build() {
        let service = HttpRemoteService::new("https://data.example.org/api/").unwrap();
        assert_eq!(service.base_url, "https://data.example.org/api");
        assert!(NominatimGeocoder::new().is_ok());
    }

    #[test]
    fn test_parse_nominatim() {
        let body = json!({
            "display_name": "Canobie Lake Park, Salem, NH",
            "address": {
                "house_number": "85",
                "road": "North Policy Street",
                "town": "Salem",
                "state": "New Hampshire",
                "country": "United States"
            }
        });
        let address = parse_nominatim(&body).unwrap();
        assert_eq!(address.address_line, "85 North Policy Street");
        assert_eq!(address.city, "Salem");

        let bare = json!({ "display_name": "Somewhere", "address": { "country": "Canada" } });
        assert_eq!(parse_nominatim(&bare).unwrap().address_line, "Somewhere");
        assert!(parse_nominatim(&json!({ "error": "Unable to geocode" })).is_none());
    }
}
