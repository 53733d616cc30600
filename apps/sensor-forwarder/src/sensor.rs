use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// DS18B20 family code prefix on the 1-Wire bus.
const DS18B20_PREFIX: &str = "28-";

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor not found under {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse sensor output: {0}")]
    Parse(String),
}

/// Blocking source of one scalar value per call.
pub trait Sensor {
    fn read_value(&mut self) -> Result<f64, SensorError>;
}

/// DS18B20 thermometer exposed by the Linux `w1` sysfs bus.
#[derive(Debug, Clone)]
pub struct W1Thermometer {
    devices_dir: PathBuf,
}

impl W1Thermometer {
    pub fn new(devices_dir: impl Into<PathBuf>) -> Self {
        Self {
            devices_dir: devices_dir.into(),
        }
    }

    fn find_chip(&self) -> Result<PathBuf, SensorError> {
        let entries = fs::read_dir(&self.devices_dir)
            .map_err(|_| SensorError::NotFound(self.devices_dir.clone()))?;
        let mut chips: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|v| v.to_str())
                    .is_some_and(|name| name.starts_with(DS18B20_PREFIX))
            })
            .collect();
        // read_dir order is unspecified; pick deterministically when several chips are present.
        chips.sort();
        chips
            .into_iter()
            .next()
            .ok_or_else(|| SensorError::NotFound(self.devices_dir.clone()))
    }
}

impl Sensor for W1Thermometer {
    fn read_value(&mut self) -> Result<f64, SensorError> {
        let chip = self.find_chip()?;
        let path = chip.join("w1_slave");
        let raw = read_to_string(&path)?;
        parse_w1_slave(&raw)
    }
}

fn read_to_string(path: &Path) -> Result<String, SensorError> {
    fs::read_to_string(path).map_err(|source| SensorError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Parses the two-line `w1_slave` output, e.g.
/// `72 01 4b 46 7f ff 0e 10 57 : crc=57 YES` / `72 01 4b 46 7f ff 0e 10 57 t=23125`.
fn parse_w1_slave(raw: &str) -> Result<f64, SensorError> {
    let mut lines = raw.lines();
    let crc_line = lines
        .next()
        .ok_or_else(|| SensorError::Parse("empty w1_slave output".to_string()))?;
    if !crc_line.trim_end().ends_with("YES") {
        return Err(SensorError::Parse(format!("crc check failed: {crc_line}")));
    }

    let (_, millis) = raw
        .split_once("t=")
        .ok_or_else(|| SensorError::Parse("missing t= field".to_string()))?;
    let millis = millis
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .parse::<i64>()
        .map_err(|err| SensorError::Parse(format!("invalid temperature: {err}")))?;
    Ok(millis as f64 / 1000.0)
}
