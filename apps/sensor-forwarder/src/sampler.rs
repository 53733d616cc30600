use crate::sensor::{Sensor, SensorError};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

pub struct Sampler<S> {
    sensor: S,
}

impl<S: Sensor> Sampler<S> {
    pub fn new(sensor: S) -> Self {
        Self { sensor }
    }

    pub fn sample(&mut self) -> Result<Reading, SensorError> {
        let value = self.sensor.read_value()?;
        Ok(Reading {
            timestamp: Utc::now(),
            value,
        })
    }
}
