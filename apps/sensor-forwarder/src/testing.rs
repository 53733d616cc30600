//! In-crate fakes for the sensor, broker and storage seams.

use crate::broker::{BrokerClient, ConnectError, PublishError};
use crate::config::BrokerConfig;
use crate::queue::{QueueStorage, StorageError};
use crate::sensor::{Sensor, SensorError};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

/// Returns scripted values in order, then repeats `fallback` (an error when `None`).
pub struct FakeSensor {
    script: VecDeque<Option<f64>>,
    fallback: Option<f64>,
}

impl FakeSensor {
    pub fn with_values(values: impl IntoIterator<Item = f64>) -> Self {
        Self::with_script(values.into_iter().map(Some))
    }

    pub fn with_script(script: impl IntoIterator<Item = Option<f64>>) -> Self {
        Self {
            script: script.into_iter().collect(),
            fallback: Some(21.5),
        }
    }

    pub fn failing() -> Self {
        Self {
            script: VecDeque::new(),
            fallback: None,
        }
    }
}

impl Sensor for FakeSensor {
    fn read_value(&mut self) -> Result<f64, SensorError> {
        self.script
            .pop_front()
            .unwrap_or(self.fallback)
            .ok_or_else(|| SensorError::NotFound(PathBuf::from("/fake/w1")))
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    connect_script: VecDeque<bool>,
    publish_script: VecDeque<bool>,
    accept_by_default: bool,
    published: Vec<Vec<u8>>,
    connect_attempts: usize,
    publish_attempts: usize,
    session_id: u64,
    alive: bool,
}

#[derive(Debug)]
pub struct FakeSession {
    id: u64,
}

/// Scripted broker. Clones share state so a test keeps a handle after moving one into the loop.
#[derive(Debug, Clone, Default)]
pub struct FakeBroker {
    state: Rc<RefCell<BrokerState>>,
}

impl FakeBroker {
    pub fn accepting() -> Self {
        let broker = Self::default();
        broker.state.borrow_mut().accept_by_default = true;
        broker
    }

    pub fn refusing() -> Self {
        Self::default()
    }

    pub fn script_connects(&self, results: impl IntoIterator<Item = bool>) {
        self.state.borrow_mut().connect_script.extend(results);
    }

    pub fn script_publishes(&self, results: impl IntoIterator<Item = bool>) {
        self.state.borrow_mut().publish_script.extend(results);
    }

    pub fn set_accepting(&self, accept: bool) {
        self.state.borrow_mut().accept_by_default = accept;
    }

    /// Kills the live session as if the broker hung up.
    pub fn drop_session(&self) {
        self.state.borrow_mut().alive = false;
    }

    pub fn published(&self) -> Vec<String> {
        self.state
            .borrow()
            .published
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect()
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.borrow().connect_attempts
    }

    pub fn publish_attempts(&self) -> usize {
        self.state.borrow().publish_attempts
    }
}

impl BrokerClient for FakeBroker {
    type Session = FakeSession;

    async fn connect(&mut self, _config: &BrokerConfig) -> Result<FakeSession, ConnectError> {
        let mut state = self.state.borrow_mut();
        state.connect_attempts += 1;
        let accept = state
            .connect_script
            .pop_front()
            .unwrap_or(state.accept_by_default);
        if !accept {
            return Err(ConnectError::Refused("scripted refusal".to_string()));
        }
        state.session_id += 1;
        state.alive = true;
        Ok(FakeSession {
            id: state.session_id,
        })
    }

    fn is_connected(&self, session: &FakeSession) -> bool {
        let state = self.state.borrow();
        state.alive && state.session_id == session.id
    }

    async fn publish(
        &mut self,
        session: &mut FakeSession,
        _topic: &str,
        payload: &[u8],
    ) -> Result<(), PublishError> {
        if !self.is_connected(session) {
            return Err(PublishError::NotConnected);
        }
        let mut state = self.state.borrow_mut();
        state.publish_attempts += 1;
        if state.publish_script.pop_front().unwrap_or(true) {
            state.published.push(payload.to_vec());
            Ok(())
        } else {
            Err(PublishError::AckTimeout(Duration::ZERO))
        }
    }

    async fn close(&mut self, session: FakeSession) {
        let mut state = self.state.borrow_mut();
        if state.session_id == session.id {
            state.alive = false;
        }
    }
}

/// Volatile queue storage; appends fail once `fail_appends` is set.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: VecDeque<Vec<u8>>,
    pub fail_appends: bool,
}

impl MemoryStorage {
    pub fn failing_appends() -> Self {
        Self {
            entries: VecDeque::new(),
            fail_appends: true,
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| String::from_utf8_lossy(e).into_owned())
            .collect()
    }
}

impl QueueStorage for MemoryStorage {
    fn append(&mut self, blob: &[u8]) -> Result<(), StorageError> {
        if self.fail_appends {
            return Err(StorageError::Io {
                context: "append to memory storage".to_string(),
                source: io::Error::other("disk full"),
            });
        }
        self.entries.push_back(blob.to_vec());
        Ok(())
    }

    fn read_oldest(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.front().cloned())
    }

    fn delete_oldest(&mut self) -> Result<(), StorageError> {
        self.entries.pop_front();
        Ok(())
    }

    fn pending(&self) -> u64 {
        self.entries.len() as u64
    }
}
