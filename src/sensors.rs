use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::process::Command;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tokio::time::{interval, Duration};

/// Accelerometer sample (m/s^2)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccelSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub timestamp: f64,
}

impl AccelSample {
    pub fn new(x: f64, y: f64, z: f64, timestamp: f64) -> Self {
        Self { x, y, z, timestamp }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Magnetometer sample (uT)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MagSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub timestamp: f64,
}

impl MagSample {
    pub fn new(x: f64, y: f64, z: f64, timestamp: f64) -> Self {
        Self { x, y, z, timestamp }
    }
}

/// Which provider produced a location fix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationAccuracy {
    /// GPS
    Fine,
    /// Network
    Coarse,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: LocationAccuracy,
    pub timestamp: f64,
}

impl LocationFix {
    pub fn fine(latitude: f64, longitude: f64, timestamp: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: LocationAccuracy::Fine,
            timestamp,
        }
    }

    pub fn coarse(latitude: f64, longitude: f64, timestamp: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: LocationAccuracy::Coarse,
            timestamp,
        }
    }
}

/// One asynchronous input delivered to the recorder loop
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SensorEvent {
    Accel(AccelSample),
    Mag(MagSample),
    Location(LocationFix),
}

/// Accelerometer producer (~50Hz). Falls back to mock data when termux-sensor is unavailable.
pub async fn accel_loop(tx: Sender<SensorEvent>) {
    let mut interval = interval(Duration::from_millis(20));
    let mut use_mock = false;
    let mut sample_count = 0u64;

    loop {
        interval.tick().await;

        let sample = if use_mock {
            mock_accel_data()
        } else {
            match read_vector("accelerometer").await {
                Some((x, y, z)) => AccelSample::new(x, y, z, current_timestamp()),
                None => {
                    log::info!("[accel] termux-sensor unavailable, using mock data");
                    use_mock = true;
                    mock_accel_data()
                }
            }
        };

        if !forward(&tx, SensorEvent::Accel(sample), "accel", &mut sample_count) {
            break;
        }
    }
}

/// Magnetometer producer (~50Hz)
pub async fn mag_loop(tx: Sender<SensorEvent>) {
    let mut interval = interval(Duration::from_millis(20));
    let mut use_mock = false;
    let mut sample_count = 0u64;

    loop {
        interval.tick().await;

        let sample = if use_mock {
            mock_mag_data()
        } else {
            match read_vector("magnetic").await {
                Some((x, y, z)) => MagSample::new(x, y, z, current_timestamp()),
                None => {
                    log::info!("[mag] termux-sensor unavailable, using mock data");
                    use_mock = true;
                    mock_mag_data()
                }
            }
        };

        if !forward(&tx, SensorEvent::Mag(sample), "mag", &mut sample_count) {
            break;
        }
    }
}

/// Location producer: one fine fix and one coarse fix per second
pub async fn location_loop(tx: Sender<SensorEvent>) {
    let mut interval = interval(Duration::from_secs(1));
    let mut use_mock = false;
    let mut fix_count = 0u64;

    loop {
        interval.tick().await;

        let fixes = if use_mock {
            mock_location_data()
        } else {
            match (read_location("gps").await, read_location("network").await) {
                (Some(fine), coarse) => [Some(fine), coarse],
                (None, _) => {
                    log::info!("[location] termux-location unavailable, using mock data");
                    use_mock = true;
                    mock_location_data()
                }
            }
        };

        for fix in fixes.into_iter().flatten() {
            if !forward(&tx, SensorEvent::Location(fix), "location", &mut fix_count) {
                return;
            }
        }
    }
}

/// Returns false once the receiving side has gone away
fn forward(tx: &Sender<SensorEvent>, event: SensorEvent, name: &str, count: &mut u64) -> bool {
    match tx.try_send(event) {
        Ok(_) => {
            *count += 1;
            if *count % 500 == 0 {
                log::debug!("[{}] {} samples", name, count);
            }
            true
        }
        Err(TrySendError::Closed(_)) => {
            log::debug!("[{}] Channel closed after {} samples", name, count);
            false
        }
        // Loop is busy; the next sample supersedes this one anyway
        Err(TrySendError::Full(_)) => true,
    }
}

async fn read_vector(sensor: &str) -> Option<(f64, f64, f64)> {
    let output = Command::new("termux-sensor")
        .args(["-n", "1", "-s", sensor])
        .output()
        .await
        .ok()?;
    parse_sensor_output(&String::from_utf8_lossy(&output.stdout))
}

async fn read_location(provider: &str) -> Option<LocationFix> {
    let output = Command::new("termux-location")
        .args(["-p", provider, "-r", "last"])
        .output()
        .await
        .ok()?;
    let accuracy = if provider == "gps" {
        LocationAccuracy::Fine
    } else {
        LocationAccuracy::Coarse
    };
    parse_location_output(&String::from_utf8_lossy(&output.stdout), accuracy)
}

/// Parses termux-sensor JSON: `{"<sensor name>": {"values": [x, y, z]}}`
fn parse_sensor_output(output: &str) -> Option<(f64, f64, f64)> {
    let json: Value = serde_json::from_str(output.trim()).ok()?;
    let values = json.as_object()?.values().next()?.get("values")?.as_array()?;
    match values.as_slice() {
        [x, y, z, ..] => Some((x.as_f64()?, y.as_f64()?, z.as_f64()?)),
        _ => None,
    }
}

/// Parses termux-location JSON: `{"latitude": .., "longitude": .., ...}`
fn parse_location_output(output: &str, accuracy: LocationAccuracy) -> Option<LocationFix> {
    let json: Value = serde_json::from_str(output.trim()).ok()?;
    Some(LocationFix {
        latitude: json.get("latitude")?.as_f64()?,
        longitude: json.get("longitude")?.as_f64()?,
        accuracy,
        timestamp: current_timestamp(),
    })
}

fn mock_accel_data() -> AccelSample {
    use std::f64::consts::PI;
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let t = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed) as f64 * 0.02;

    // Coaster-ish profile: slow climb, then oscillating g-loads
    AccelSample::new(
        (t * 0.5 * PI).sin() * 3.0,
        (t * 0.3 * PI).cos() * 1.5,
        9.81 + (t * PI).sin() * 4.0,
        current_timestamp(),
    )
}

fn mock_mag_data() -> MagSample {
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let t = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed) as f64 * 0.02;

    MagSample::new(
        22.0 * (t * 0.2).cos(),
        22.0 * (t * 0.2).sin(),
        -40.0,
        current_timestamp(),
    )
}

fn mock_location_data() -> [Option<LocationFix>; 2] {
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed) as f64;
    let now = current_timestamp();

    [
        Some(LocationFix::fine(
            42.7762 + seq * 0.00001,
            -71.2275 + seq * 0.00001,
            now,
        )),
        Some(LocationFix::coarse(42.776, -71.227, now)),
    ]
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
