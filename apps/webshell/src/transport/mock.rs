use super::decode::Utf8Decoder;
use super::{
    ChannelError, ChannelEvent, ChannelFactory, ChannelPhase, Consumer, OpenGuard, Payload,
    TransportChannel,
};
use crate::session::Session;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// How a mock channel's `open` behaves.
#[derive(Debug, Clone)]
pub enum OpenBehavior {
    Succeed,
    /// Succeeds after the given delay unless closed first.
    SucceedAfter(Duration),
    Fail(String),
    /// Never completes; only `close` settles it.
    Hang,
}

#[derive(Default)]
struct NetworkState {
    script: VecDeque<OpenBehavior>,
    fallback: Option<OpenBehavior>,
    channels: Vec<Arc<MockChannel>>,
}

/// In-memory stand-in for the terminal websocket endpoint.
///
/// Each created channel takes the next scripted behavior, falling back to the
/// default (success unless changed) once the script runs dry.
#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, behavior: OpenBehavior) -> &Self {
        self.state.lock().script.push_back(behavior);
        self
    }

    pub fn set_default(&self, behavior: OpenBehavior) {
        self.state.lock().fallback = Some(behavior);
    }

    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.state.lock().channels.clone()
    }

    pub fn last(&self) -> Option<Arc<MockChannel>> {
        self.state.lock().channels.last().cloned()
    }

    pub fn created(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Channels that are open right now.
    pub fn open_count(&self) -> usize {
        self.state
            .lock()
            .channels
            .iter()
            .filter(|channel| channel.is_open())
            .count()
    }
}

impl ChannelFactory for MockNetwork {
    fn create(&self, consumer: Consumer) -> Arc<dyn TransportChannel> {
        let mut state = self.state.lock();
        let behavior = state
            .script
            .pop_front()
            .or_else(|| state.fallback.clone())
            .unwrap_or(OpenBehavior::Succeed);
        let channel = Arc::new(MockChannel::new(behavior, consumer));
        state.channels.push(channel.clone());
        channel
    }
}

pub struct MockChannel {
    behavior: OpenBehavior,
    consumer: Consumer,
    guard: OpenGuard,
    cancel: Notify,
    decoder: Mutex<Utf8Decoder>,
    session: Mutex<Option<Session>>,
    sent: Mutex<Vec<Payload>>,
    closed_with: Mutex<Option<u16>>,
}

impl MockChannel {
    fn new(behavior: OpenBehavior, consumer: Consumer) -> Self {
        Self {
            behavior,
            consumer,
            guard: OpenGuard::new(),
            cancel: Notify::new(),
            decoder: Mutex::new(Utf8Decoder::new()),
            session: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            closed_with: Mutex::new(None),
        }
    }

    pub fn session(&self) -> Option<Session> {
        self.session.lock().clone()
    }

    pub fn sent(&self) -> Vec<Payload> {
        self.sent.lock().clone()
    }

    /// Code of the first local close, if any.
    pub fn closed_with(&self) -> Option<u16> {
        *self.closed_with.lock()
    }

    pub fn phase(&self) -> ChannelPhase {
        self.guard.phase()
    }

    pub fn deliver_text(&self, text: &str) {
        let text = self.decoder.lock().push_text(text);
        (self.consumer)(ChannelEvent::Data(text));
    }

    pub fn deliver_binary(&self, bytes: &[u8]) {
        let text = self.decoder.lock().decode(bytes);
        if !text.is_empty() {
            (self.consumer)(ChannelEvent::Data(text));
        }
    }

    pub fn remote_close(&self, code: u16, reason: &str) {
        self.guard.close();
        (self.consumer)(ChannelEvent::Closed {
            code: Some(code),
            reason: reason.to_string(),
        });
    }

    pub fn remote_fail(&self, message: &str) {
        self.guard.close();
        (self.consumer)(ChannelEvent::Failed(ChannelError::Socket(message.to_string())));
    }
}

#[async_trait]
impl TransportChannel for MockChannel {
    async fn open(&self, session: &Session) -> Result<(), ChannelError> {
        self.guard.begin()?;
        *self.session.lock() = Some(session.clone());

        let cancelled = self.cancel.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();
        if self.guard.phase() == ChannelPhase::Closed {
            return Err(ChannelError::Cancelled);
        }

        match &self.behavior {
            OpenBehavior::Succeed => {}
            OpenBehavior::SucceedAfter(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(*delay) => {}
                    _ = &mut cancelled => return Err(ChannelError::Cancelled),
                }
            }
            OpenBehavior::Fail(message) => {
                self.guard.settle_failed();
                return Err(ChannelError::Handshake(message.clone()));
            }
            OpenBehavior::Hang => {
                cancelled.await;
                return Err(ChannelError::Cancelled);
            }
        }
        if self.guard.settle_open() {
            Ok(())
        } else {
            Err(ChannelError::Cancelled)
        }
    }

    fn send(&self, payload: Payload) {
        if self.guard.phase() == ChannelPhase::Open {
            self.sent.lock().push(payload);
        }
    }

    fn close(&self, code: u16) {
        let previous = self.guard.close();
        self.cancel.notify_waiters();
        if previous != ChannelPhase::Closed {
            self.closed_with.lock().get_or_insert(code);
        }
    }

    fn is_open(&self) -> bool {
        self.guard.phase() == ChannelPhase::Open
    }
}
