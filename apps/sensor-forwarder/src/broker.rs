use crate::config::BrokerConfig;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const REQUEST_CAPACITY: usize = 10;
const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("broker refused connection: {0}")]
    Refused(String),

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("no live broker session")]
    NotConnected,

    #[error("publish request failed: {0}")]
    Request(String),

    #[error("no PUBACK within {0:?}")]
    AckTimeout(Duration),

    #[error("session closed before PUBACK")]
    SessionClosed,
}

/// Message broker seam. One session is live at a time; the caller owns it.
#[allow(async_fn_in_trait)]
pub trait BrokerClient {
    type Session;

    async fn connect(&mut self, config: &BrokerConfig) -> Result<Self::Session, ConnectError>;

    fn is_connected(&self, session: &Self::Session) -> bool;

    async fn publish(
        &mut self,
        session: &mut Self::Session,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), PublishError>;

    async fn close(&mut self, session: Self::Session);
}

#[derive(Debug, Clone, Copy)]
enum SessionEvent {
    Sent(u16),
    Acked(u16),
}

pub struct MqttSession {
    client: AsyncClient,
    alive: Arc<AtomicBool>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    poller: JoinHandle<()>,
    publish_timeout: Duration,
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

/// MQTT 3.1.1 client over `rumqttc`. Publishes at QoS 1 and treats the broker PUBACK as delivery.
#[derive(Debug, Default)]
pub struct MqttBroker;

impl BrokerClient for MqttBroker {
    type Session = MqttSession;

    async fn connect(&mut self, config: &BrokerConfig) -> Result<MqttSession, ConnectError> {
        let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);
        if let Some(username) = &config.username {
            options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        tokio::time::timeout(config.connect_timeout, await_connack(&mut eventloop))
            .await
            .map_err(|_| ConnectError::Timeout(config.connect_timeout))??;

        let alive = Arc::new(AtomicBool::new(true));
        let (events_tx, events) = mpsc::unbounded_channel();
        let poller = spawn_poller(eventloop, alive.clone(), events_tx);
        tracing::info!(host = %config.host, port = config.port, client_id = %config.client_id, "mqtt session established");

        Ok(MqttSession {
            client,
            alive,
            events,
            poller,
            publish_timeout: config.publish_timeout,
        })
    }

    fn is_connected(&self, session: &MqttSession) -> bool {
        session.alive.load(Ordering::SeqCst) && !session.poller.is_finished()
    }

    async fn publish(
        &mut self,
        session: &mut MqttSession,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), PublishError> {
        if !self.is_connected(session) {
            return Err(PublishError::NotConnected);
        }
        // Events left over from an earlier timed-out publish.
        while session.events.try_recv().is_ok() {}

        session
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .map_err(|err| PublishError::Request(err.to_string()))?;

        let timeout = session.publish_timeout;
        tokio::time::timeout(timeout, await_puback(&mut session.events))
            .await
            .map_err(|_| PublishError::AckTimeout(timeout))?
    }

    async fn close(&mut self, mut session: MqttSession) {
        if self.is_connected(&session) {
            let _ = tokio::time::timeout(CLOSE_GRACE, session.client.disconnect()).await;
            let _ = tokio::time::timeout(CLOSE_GRACE, &mut session.poller).await;
        }
        session.poller.abort();
        tracing::debug!("mqtt session closed");
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), ConnectError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(ConnectError::Refused(format!("{code:?}"))),
                };
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(ConnectError::Refused(format!("{code:?}")));
            }
            Err(err) => return Err(ConnectError::Transport(err.to_string())),
        }
    }
}

async fn await_puback(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Result<(), PublishError> {
    let mut pkid = None;
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Sent(id) if pkid.is_none() => pkid = Some(id),
            SessionEvent::Acked(id) if pkid == Some(id) => return Ok(()),
            _ => {}
        }
    }
    Err(PublishError::SessionClosed)
}

fn spawn_poller(
    mut eventloop: EventLoop,
    alive: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    let _ = events.send(SessionEvent::Sent(pkid));
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    let _ = events.send(SessionEvent::Acked(ack.pkid));
                }
                Ok(Event::Incoming(Packet::Disconnect)) | Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    tracing::info!("mqtt session disconnected");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error=%err, "mqtt session lost");
                    break;
                }
            }
        }
        alive.store(false, Ordering::SeqCst);
    })
}
