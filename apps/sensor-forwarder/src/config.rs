use crate::format::{FormatVariant, DEFAULT_MAX_PAYLOAD_BYTES};
use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub device_id: String,
    pub broker: BrokerConfig,
    pub reconnect_backoff_initial: Duration,
    pub reconnect_backoff_max: Duration,

    pub sample_interval: Duration,
    pub tick_interval: Duration,
    pub payload_format: FormatVariant,
    pub max_payload_bytes: usize,
    pub w1_devices_dir: PathBuf,

    pub spool_dir: PathBuf,
    pub segment_roll_bytes: u64,

    pub http_bind: Option<String>,
    pub debug: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup: &lookup };

        let device_id = vars.string("SENSOR_DEVICE_ID", Some("rpi#0001"))?;
        if device_id.is_empty() {
            return Err(anyhow!("SENSOR_DEVICE_ID must not be empty"));
        }

        let mqtt_url = vars.string("SENSOR_MQTT_URL", Some("mqtt://127.0.0.1:1883"))?;
        let url = Url::parse(&mqtt_url).context("invalid SENSOR_MQTT_URL")?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("SENSOR_MQTT_URL missing host"))?
            .to_string();
        let port = url.port().unwrap_or(1883);

        let default_client_id = format!("sensor-forwarder-{device_id}");
        let client_id = vars.string("SENSOR_MQTT_CLIENT_ID", Some(default_client_id.as_str()))?;
        let topic = vars.string("SENSOR_MQTT_TOPIC", Some("iot/temperature"))?;
        validate_topic(&topic)?;

        let broker = BrokerConfig {
            host,
            port,
            client_id,
            username: vars.optional("SENSOR_MQTT_USERNAME"),
            password: vars.optional("SENSOR_MQTT_PASSWORD"),
            topic,
            keep_alive: Duration::from_secs(vars.u64("SENSOR_MQTT_KEEPALIVE_SECONDS", Some(15))?),
            connect_timeout: Duration::from_millis(
                vars.u64("SENSOR_MQTT_CONNECT_TIMEOUT_MS", Some(5000))?,
            ),
            publish_timeout: Duration::from_millis(
                vars.u64("SENSOR_MQTT_PUBLISH_TIMEOUT_MS", Some(5000))?,
            ),
        };

        let reconnect_backoff_initial =
            Duration::from_millis(vars.u64("SENSOR_RECONNECT_BACKOFF_INITIAL_MS", Some(1000))?);
        let reconnect_backoff_max =
            Duration::from_millis(vars.u64("SENSOR_RECONNECT_BACKOFF_MAX_MS", Some(60_000))?);

        let sample_interval = vars.u64("SENSOR_SAMPLE_INTERVAL_SECONDS", Some(60))?;
        if sample_interval == 0 {
            return Err(anyhow!("SENSOR_SAMPLE_INTERVAL_SECONDS must be > 0"));
        }
        let tick_ms = vars.u64("SENSOR_TICK_MS", Some(1000))?;
        if tick_ms == 0 {
            return Err(anyhow!("SENSOR_TICK_MS must be > 0"));
        }

        let payload_format = vars
            .string("SENSOR_PAYLOAD_FORMAT", Some("json"))?
            .parse::<FormatVariant>()
            .context("invalid SENSOR_PAYLOAD_FORMAT")?;
        let max_payload_bytes = usize::try_from(
            vars.u64("SENSOR_MAX_PAYLOAD_BYTES", Some(DEFAULT_MAX_PAYLOAD_BYTES as u64))?,
        )
        .context("invalid SENSOR_MAX_PAYLOAD_BYTES")?;

        let w1_devices_dir =
            PathBuf::from(vars.string("SENSOR_W1_DEVICES_DIR", Some("/sys/bus/w1/devices"))?);

        let spool_dir = PathBuf::from(vars.string(
            "SENSOR_FORWARDER_SPOOL_DIR",
            Some("/var/lib/sensor-forwarder/spool"),
        )?);
        let segment_roll_bytes =
            vars.u64("SENSOR_FORWARDER_SEGMENT_ROLL_BYTES", Some(1024 * 1024))?;

        let http_bind = vars.string("SENSOR_FORWARDER_HTTP_BIND", Some("127.0.0.1:9102"))?;
        let http_bind = if http_bind.is_empty() || http_bind.eq_ignore_ascii_case("off") {
            None
        } else {
            Some(http_bind)
        };

        let debug = vars.optional("SENSOR_FORWARDER_DEBUG").is_some();

        Ok(Self {
            device_id,
            broker,
            reconnect_backoff_initial,
            reconnect_backoff_max,
            sample_interval: Duration::from_secs(sample_interval),
            tick_interval: Duration::from_millis(tick_ms),
            payload_format,
            max_payload_bytes,
            w1_devices_dir,
            spool_dir,
            segment_roll_bytes,
            http_bind,
            debug,
        })
    }
}

fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(anyhow!("SENSOR_MQTT_TOPIC must not be empty"));
    }
    if topic.contains(&['+', '#'][..]) {
        return Err(anyhow!("SENSOR_MQTT_TOPIC must not contain wildcards: {topic}"));
    }
    Ok(())
}

struct Vars<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Vars<'_> {
    fn string(&self, key: &str, default: Option<&str>) -> Result<String> {
        match (self.lookup)(key) {
            Some(value) => Ok(value.trim().to_string()),
            None => default
                .map(str::to_string)
                .ok_or_else(|| anyhow!("missing env var {key}")),
        }
    }

    fn u64(&self, key: &str, default: Option<u64>) -> Result<u64> {
        match (self.lookup)(key) {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid {key}")),
            None => default.ok_or_else(|| anyhow!("missing env var {key}")),
        }
    }

    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}
