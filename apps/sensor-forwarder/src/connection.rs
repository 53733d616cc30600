use crate::broker::{BrokerClient, ConnectError, PublishError};
use crate::config::BrokerConfig;
use crate::format::Payload;
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

/// Capped exponential delay between failed connect attempts. A zero `initial` never delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    next_attempt: Option<Instant>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: Duration::ZERO,
            next_attempt: None,
        }
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.next_attempt.map_or(true, |at| now >= at)
    }

    pub fn record_failure(&mut self, now: Instant) -> Duration {
        if self.initial.is_zero() {
            return Duration::ZERO;
        }
        self.current = if self.current.is_zero() {
            self.initial
        } else {
            self.current.saturating_mul(2).min(self.max)
        };
        self.next_attempt = Some(now + self.current);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
        self.next_attempt = None;
    }
}

/// Owns at most one broker session and the reconnect policy around it.
pub struct ConnectionManager<B: BrokerClient> {
    broker: B,
    config: BrokerConfig,
    session: Option<B::Session>,
    backoff: Backoff,
}

impl<B: BrokerClient> ConnectionManager<B> {
    pub fn new(broker: B, config: BrokerConfig, backoff: Backoff) -> Self {
        Self {
            broker,
            config,
            session: None,
            backoff,
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.session.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn connect_due(&self, now: Instant) -> bool {
        self.backoff.ready(now)
    }

    pub async fn connect(&mut self, now: Instant) -> Result<(), ConnectError> {
        self.teardown().await;
        match self.broker.connect(&self.config).await {
            Ok(session) => {
                self.session = Some(session);
                self.backoff.reset();
                tracing::info!(topic = %self.config.topic, "connected to broker");
                Ok(())
            }
            Err(err) => {
                let retry_in = self.backoff.record_failure(now);
                tracing::warn!(
                    error=%err,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "broker connect failed"
                );
                Err(err)
            }
        }
    }

    /// Probes the live session; a dead one is released.
    pub async fn is_connected(&mut self) -> bool {
        let alive = match &self.session {
            Some(session) => self.broker.is_connected(session),
            None => return false,
        };
        if !alive {
            tracing::warn!("broker session lost");
            self.teardown().await;
        }
        alive
    }

    pub async fn publish(&mut self, payload: &Payload) -> Result<(), PublishError> {
        let Some(session) = self.session.as_mut() else {
            return Err(PublishError::NotConnected);
        };
        let result = self
            .broker
            .publish(session, &self.config.topic, payload.as_bytes())
            .await;
        if let Err(err) = &result {
            tracing::warn!(error=%err, "publish failed; dropping session");
            self.teardown().await;
        }
        result
    }

    pub async fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            self.broker.close(session).await;
        }
    }
}
