//! In-memory slave used by the connection and device tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::request::{Request, Response, WritePayload};
use super::transport::{Connector, Transport};
use crate::error::ConnError;
use crate::types::{ConnectionParams, RegisterKind};

#[derive(Debug, Default)]
pub struct MockState {
    pub calls: Vec<Request>,
    pub opens: usize,
    pub closes: usize,
    pub refuse_open: bool,
    pub failures: VecDeque<ConnError>,
    pub latencies: VecDeque<Duration>,
    pub words: HashMap<(RegisterKind, u16), u16>,
    pub bits: HashMap<(RegisterKind, u16), bool>,
}

#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_words(&self, kind: RegisterKind, address: u16, words: &[u16]) {
        let mut state = self.state();
        for (offset, word) in words.iter().enumerate() {
            state.words.insert((kind, address + offset as u16), *word);
        }
    }

    pub fn set_bit(&self, kind: RegisterKind, address: u16, bit: bool) {
        self.state().bits.insert((kind, address), bit);
    }

    pub fn fail_next(&self, error: ConnError) {
        self.state().failures.push_back(error);
    }

    pub fn delay_next(&self, latency: Duration) {
        self.state().latencies.push_back(latency);
    }

    pub fn calls(&self) -> Vec<Request> {
        self.state().calls.clone()
    }

    pub fn opens(&self) -> usize {
        self.state().opens
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, _params: &ConnectionParams) -> Result<Box<dyn Transport>, ConnError> {
        let mut state = self.state();
        if state.refuse_open {
            return Err(ConnError::ConnectionSetup("connection refused".into()));
        }
        state.opens += 1;
        Ok(Box::new(MockTransport {
            state: Arc::clone(&self.state),
        }))
    }
}

#[derive(Debug)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&mut self, request: &Request) -> Result<Response, ConnError> {
        let (latency, failure) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(request.clone());
            (state.latencies.pop_front(), state.failures.pop_front())
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(failure) = failure {
            return Err(failure);
        }

        let mut state = self.state.lock().unwrap();
        let (kind, address, quantity) = (request.kind, request.address, request.quantity);
        let span = address..address.saturating_add(quantity);
        let response = match &request.write {
            None if kind.is_bit() => Response::Bits(
                span.map(|a| state.bits.get(&(kind, a)).copied().unwrap_or(false))
                    .collect(),
            ),
            None => Response::Words(
                span.map(|a| state.words.get(&(kind, a)).copied().unwrap_or(0))
                    .collect(),
            ),
            Some(WritePayload::Bits(bits)) => {
                for (a, bit) in span.zip(bits) {
                    state.bits.insert((kind, a), *bit);
                }
                Response::Written
            }
            Some(WritePayload::Words(words)) => {
                for (a, word) in span.zip(words) {
                    state.words.insert((kind, a), *word);
                }
                Response::Written
            }
            Some(WritePayload::Mask { and_mask, or_mask }) => {
                let current = state.words.get(&(kind, address)).copied().unwrap_or(0);
                let next = (current & and_mask) | (or_mask & !and_mask);
                state.words.insert((kind, address), next);
                Response::Written
            }
            Some(WritePayload::ReadWrite {
                read_address,
                read_quantity,
                words,
            }) => {
                for (a, word) in span.zip(words) {
                    state.words.insert((kind, a), *word);
                }
                Response::Words(
                    (*read_address..read_address.saturating_add(*read_quantity))
                        .map(|a| state.words.get(&(kind, a)).copied().unwrap_or(0))
                        .collect(),
                )
            }
        };
        Ok(response)
    }

    async fn close(&mut self) {
        self.state.lock().unwrap().closes += 1;
    }
}
