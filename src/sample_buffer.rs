use crate::fusion::{self, Orientation};
use crate::sensors::{AccelSample, LocationAccuracy, LocationFix, MagSample, SensorEvent};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Last accelerometer reading with its Euclidean norm
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Acceleration {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub magnitude: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MagneticField {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

/// Latest value from each asynchronous source. Holds no history.
///
/// Written by the accelerometer, magnetometer and location handlers, read by
/// the recording tick. All of them run on the recorder loop, so there is no
/// locking here; producers on other threads go through the loop's channel.
#[derive(Debug, Clone, Default)]
pub struct SampleBuffer {
    acceleration: Acceleration,
    magnetic_field: MagneticField,
    orientation: Orientation,
    location: Option<Position>,
    rough_location: Option<Position>,
    rough_from_network: bool,
}

/// Copy of the buffer taken at tick time
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferSnapshot {
    pub acceleration: Acceleration,
    pub magnetic_field: MagneticField,
    pub orientation: Orientation,
    pub location: Option<Position>,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: SensorEvent) {
        match event {
            SensorEvent::Accel(sample) => self.on_accel(sample),
            SensorEvent::Mag(sample) => self.on_mag(sample),
            SensorEvent::Location(fix) => self.on_location(fix),
        }
    }

    /// Magnitude is refreshed here, not at tick time
    pub fn on_accel(&mut self, sample: AccelSample) {
        self.acceleration = Acceleration {
            x: sample.x,
            y: sample.y,
            z: sample.z,
            magnitude: sample.magnitude(),
        };
    }

    /// Stores the raw field and re-derives orientation from the latest accel/mag pair
    pub fn on_mag(&mut self, sample: MagSample) {
        self.magnetic_field = MagneticField {
            x: sample.x,
            y: sample.y,
            z: sample.z,
        };

        let accel = Vector3::new(self.acceleration.x, self.acceleration.y, self.acceleration.z);
        let mag = Vector3::new(sample.x, sample.y, sample.z);
        self.orientation = fusion::fuse(&accel, &mag, self.orientation);
    }

    pub fn on_location(&mut self, fix: LocationFix) {
        let position = Position {
            latitude: fix.latitude,
            longitude: fix.longitude,
        };

        match fix.accuracy {
            LocationAccuracy::Fine => {
                self.location = Some(position);
                // Seed geocoding until the network provider reports in
                if !self.rough_from_network {
                    self.rough_location = Some(position);
                }
            }
            LocationAccuracy::Coarse => {
                self.rough_location = Some(position);
                self.rough_from_network = true;
            }
        }
    }

    pub fn snapshot(&self) -> BufferSnapshot {
        BufferSnapshot {
            acceleration: self.acceleration,
            magnetic_field: self.magnetic_field,
            orientation: self.orientation,
            location: self.location,
        }
    }

    pub fn acceleration(&self) -> Acceleration {
        self.acceleration
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn location(&self) -> Option<Position> {
        self.location
    }

    /// Only for reverse geocoding at upload time
    pub fn rough_location(&self) -> Option<Position> {
        self.rough_location
    }
}
