use crate::sampler::Reading;
use bytes::Bytes;
use chrono::{Local, TimeZone};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("unknown payload format {0:?}")]
    UnknownVariant(String),

    #[error("rendered payload is {len} bytes, limit is {max}")]
    TooLarge { len: usize, max: usize },

    #[error("failed to encode payload: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVariant {
    Text,
    Json,
    Property,
}

impl FormatVariant {
    pub fn name(self) -> &'static str {
        match self {
            FormatVariant::Text => "text",
            FormatVariant::Json => "json",
            FormatVariant::Property => "property",
        }
    }
}

impl FromStr for FormatVariant {
    type Err = FormatError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "0" | "text" => Ok(FormatVariant::Text),
            "1" | "json" => Ok(FormatVariant::Json),
            "2" | "property" => Ok(FormatVariant::Property),
            _ => Err(FormatError::UnknownVariant(raw.to_string())),
        }
    }
}

impl fmt::Display for FormatVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Serialized reading, ready to publish or spool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(Bytes);

impl Payload {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Serialize)]
struct JsonDoc<'a> {
    devid: &'a str,
    time: String,
    temperature: &'a str,
}

#[derive(Serialize)]
struct PropertyDoc<'a> {
    id: String,
    version: &'static str,
    method: &'static str,
    params: PropertyParams<'a>,
}

#[derive(Serialize)]
struct PropertyParams<'a> {
    devid: &'a str,
    temperature: PropertyValue<'a>,
}

#[derive(Serialize)]
struct PropertyValue<'a> {
    value: &'a str,
    time: i64,
}

/// Renders `reading` with its time in the host's local zone.
pub fn format(
    reading: &Reading,
    identity: &str,
    variant: FormatVariant,
    max_len: usize,
) -> Result<Payload, FormatError> {
    format_in(reading, identity, variant, max_len, &Local)
}

fn format_in<Tz>(
    reading: &Reading,
    identity: &str,
    variant: FormatVariant,
    max_len: usize,
    tz: &Tz,
) -> Result<Payload, FormatError>
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    // One rendering of the value so every variant carries the same digits.
    let value = format!("{:.2}", reading.value);
    let time = reading.timestamp.with_timezone(tz).format(TIME_FORMAT).to_string();

    let rendered = match variant {
        FormatVariant::Text => format!("{identity},{time},{value}").into_bytes(),
        FormatVariant::Json => encode(&JsonDoc {
            devid: identity,
            time,
            temperature: &value,
        })?,
        FormatVariant::Property => {
            let millis = reading.timestamp.timestamp_millis();
            encode(&PropertyDoc {
                id: millis.to_string(),
                version: "1.0",
                method: "thing.event.property.post",
                params: PropertyParams {
                    devid: identity,
                    temperature: PropertyValue {
                        value: &value,
                        time: millis,
                    },
                },
            })?
        }
    };
    if rendered.len() > max_len {
        return Err(FormatError::TooLarge {
            len: rendered.len(),
            max: max_len,
        });
    }
    Ok(Payload::new(rendered))
}

fn encode<T: Serialize>(doc: &T) -> Result<Vec<u8>, FormatError> {
    serde_json::to_vec(doc).map_err(|err| FormatError::Encode(err.to_string()))
}
