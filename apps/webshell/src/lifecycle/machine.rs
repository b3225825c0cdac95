use super::error::ConnectError;
use super::state::{ConnectionState, MAX_RETRIES, Notice, RetryCounter, Status};
use crate::session::{NegotiationError, Session};
use crate::terminal::{connected_banner, status_banner};
use crate::transport::{ABNORMAL_CLOSURE, ChannelError, NORMAL_CLOSURE, Payload};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

pub type AttemptId = u64;
pub type TimerId = u64;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub target_host_id: u64,
    /// Shown in notices until a session supplies the host name.
    pub target_label: Option<String>,
    pub retry_delay: Duration,
    pub max_retries: u32,
}

impl MachineConfig {
    pub fn new(target_host_id: u64) -> Self {
        Self {
            target_host_id,
            target_label: None,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retries: MAX_RETRIES,
        }
    }
}

/// Everything the lifecycle reacts to. Results of background work carry the
/// attempt they belong to so superseded ones can be told apart.
#[derive(Debug)]
pub enum Event {
    Connect { authenticated: bool },
    Reconnect { authenticated: bool },
    Disconnect,
    Negotiated {
        attempt: AttemptId,
        result: Result<Session, Arc<NegotiationError>>,
    },
    Opened { attempt: AttemptId },
    OpenFailed {
        attempt: AttemptId,
        error: Arc<ChannelError>,
    },
    Closed {
        attempt: AttemptId,
        code: Option<u16>,
        reason: String,
    },
    Failed {
        attempt: AttemptId,
        error: Arc<ChannelError>,
    },
    Inbound { attempt: AttemptId, text: String },
    Input(Vec<u8>),
    ClearView,
    RetryFired { timer: TimerId },
    Teardown,
}

/// Side effects for the runtime to carry out, in order.
#[derive(Debug, Clone)]
pub enum Effect {
    StateChanged(ConnectionState),
    Notify(Notice),
    Negotiate {
        attempt: AttemptId,
        target_host_id: u64,
    },
    /// Replaces any current channel with a fresh one for `session`.
    OpenChannel { attempt: AttemptId, session: Session },
    CloseChannel { code: u16 },
    /// Abandons an in-flight negotiation.
    AbortPending,
    ArmRetry { timer: TimerId, delay: Duration },
    CancelRetry,
    ResetSurface { banner: String },
    WriteBanner(String),
    WriteSurface(String),
    Send(Payload),
    ClearSurface,
    DisposeSurface,
    /// Resolves every pending `connect()`.
    Settle(Result<(), ConnectError>),
}

/// The connection lifecycle as a pure transition function.
#[derive(Debug)]
pub struct Machine {
    config: MachineConfig,
    state: ConnectionState,
    retries: RetryCounter,
    session: Option<Session>,
    attempt: AttemptId,
    timer: Option<TimerId>,
    next_timer: TimerId,
    finished: bool,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        let retries = RetryCounter::new(config.max_retries);
        Self {
            config,
            state: ConnectionState::Disconnected,
            retries,
            session: None,
            attempt: 0,
            timer: None,
            next_timer: 0,
            finished: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries.count()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    pub fn armed_timer(&self) -> Option<TimerId> {
        self.timer
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn status(&self) -> Status {
        Status {
            state: self.state,
            retries: self.retries.count(),
            session: self.session.clone(),
        }
    }

    pub fn step(&mut self, event: Event) -> Vec<Effect> {
        let mut out = Vec::new();
        if self.finished {
            trace!(target: "webshell::lifecycle", ?event, "ignored after teardown");
            return out;
        }
        match event {
            Event::Connect { authenticated } | Event::Reconnect { authenticated } => {
                self.on_connect(authenticated, &mut out)
            }
            Event::Disconnect => self.on_disconnect(&mut out),
            Event::Negotiated { attempt, result } => self.on_negotiated(attempt, result, &mut out),
            Event::Opened { attempt } => self.on_opened(attempt, &mut out),
            Event::OpenFailed { attempt, error } => {
                if self.is_opening(attempt) {
                    self.fail(ConnectError::Channel(error), &mut out);
                }
            }
            Event::Closed {
                attempt,
                code,
                reason,
            } => self.on_closed(attempt, code, reason, &mut out),
            Event::Failed { attempt, error } => {
                if self.is_live(attempt) {
                    self.lost(ConnectError::Channel(error), &mut out);
                }
            }
            Event::Inbound { attempt, text } => {
                if self.is_live(attempt) {
                    out.push(Effect::WriteSurface(text));
                }
            }
            Event::Input(bytes) => {
                if self.state == ConnectionState::Connected && !bytes.is_empty() {
                    out.push(Effect::Send(Payload::from_input(bytes)));
                }
            }
            Event::ClearView => out.push(Effect::ClearSurface),
            Event::RetryFired { timer } => self.on_retry(timer, &mut out),
            Event::Teardown => self.on_teardown(&mut out),
        }
        out
    }

    fn on_connect(&mut self, authenticated: bool, out: &mut Vec<Effect>) {
        match self.state {
            ConnectionState::Connected => out.push(Effect::Settle(Ok(()))),
            ConnectionState::Connecting => {}
            ConnectionState::Disconnected | ConnectionState::Error => {
                if !authenticated {
                    out.push(Effect::Notify(Notice::error(
                        "Please log in before using WebShell",
                    )));
                    out.push(Effect::Settle(Err(ConnectError::AuthRequired)));
                    return;
                }
                if self.state == ConnectionState::Error {
                    self.retry_now(out);
                } else {
                    self.attempt += 1;
                    self.set_state(ConnectionState::Connecting, out);
                    out.push(Effect::Negotiate {
                        attempt: self.attempt,
                        target_host_id: self.config.target_host_id,
                    });
                }
            }
        }
    }

    /// Manual retry out of Error: counts against the budget and reuses the
    /// held session when there is one.
    fn retry_now(&mut self, out: &mut Vec<Effect>) {
        let n = self.retries.bump();
        self.attempt += 1;
        self.set_state(ConnectionState::Connecting, out);
        match self.session.clone() {
            Some(session) => {
                out.push(Effect::Notify(Notice::info(format!(
                    "Reconnecting ({n}/{})...",
                    self.retries.max()
                ))));
                out.push(Effect::OpenChannel {
                    attempt: self.attempt,
                    session,
                });
            }
            None => out.push(Effect::Negotiate {
                attempt: self.attempt,
                target_host_id: self.config.target_host_id,
            }),
        }
    }

    fn on_disconnect(&mut self, out: &mut Vec<Effect>) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        let was_connecting = self.state == ConnectionState::Connecting;
        self.attempt += 1;
        out.push(Effect::AbortPending);
        out.push(Effect::CloseChannel {
            code: NORMAL_CLOSURE,
        });
        self.session = None;
        self.retries.reset();
        self.set_state(ConnectionState::Disconnected, out);
        out.push(Effect::WriteBanner(status_banner("Disconnected")));
        out.push(Effect::Notify(Notice::info("Disconnected")));
        if was_connecting {
            out.push(Effect::Settle(Err(ConnectError::Cancelled)));
        }
    }

    fn on_negotiated(
        &mut self,
        attempt: AttemptId,
        result: Result<Session, Arc<NegotiationError>>,
        out: &mut Vec<Effect>,
    ) {
        if !self.is_opening(attempt) {
            trace!(target: "webshell::lifecycle", attempt, "stale negotiation result");
            return;
        }
        match result {
            Ok(session) => {
                self.session = Some(session.clone());
                out.push(Effect::OpenChannel { attempt, session });
            }
            Err(error) => self.fail(ConnectError::Negotiation(error), out),
        }
    }

    fn on_opened(&mut self, attempt: AttemptId, out: &mut Vec<Effect>) {
        if !self.is_opening(attempt) {
            trace!(target: "webshell::lifecycle", attempt, "stale channel open");
            return;
        }
        self.retries.reset();
        self.set_state(ConnectionState::Connected, out);
        let name = self.target_name();
        let banner = match &self.session {
            Some(session) => connected_banner(session),
            None => format!("Connected to {name}\r\n"),
        };
        out.push(Effect::ResetSurface { banner });
        out.push(Effect::Notify(Notice::success(format!("Connected to {name}"))));
        out.push(Effect::Settle(Ok(())));
    }

    fn on_closed(
        &mut self,
        attempt: AttemptId,
        code: Option<u16>,
        reason: String,
        out: &mut Vec<Effect>,
    ) {
        if !self.is_live(attempt) {
            return;
        }
        if code == Some(NORMAL_CLOSURE) {
            out.push(Effect::CloseChannel {
                code: NORMAL_CLOSURE,
            });
            self.session = None;
            self.retries.reset();
            self.set_state(ConnectionState::Disconnected, out);
            out.push(Effect::WriteBanner(status_banner("Connection closed")));
            out.push(Effect::Notify(Notice::info("Connection closed")));
        } else {
            let error = ChannelError::AbnormalClose {
                code: code.unwrap_or(ABNORMAL_CLOSURE),
                reason,
            };
            self.lost(ConnectError::Channel(Arc::new(error)), out);
        }
    }

    /// A connect attempt failed before reaching Connected.
    fn fail(&mut self, error: ConnectError, out: &mut Vec<Effect>) {
        out.push(Effect::CloseChannel {
            code: NORMAL_CLOSURE,
        });
        self.set_state(ConnectionState::Error, out);
        out.push(Effect::Notify(Notice::error(format!(
            "Connection failed: {error}"
        ))));
        out.push(Effect::Settle(Err(error)));
        self.schedule_retry(out);
    }

    /// An established connection broke.
    fn lost(&mut self, error: ConnectError, out: &mut Vec<Effect>) {
        out.push(Effect::CloseChannel {
            code: NORMAL_CLOSURE,
        });
        self.set_state(ConnectionState::Error, out);
        out.push(Effect::WriteBanner(status_banner("Connection lost")));
        out.push(Effect::Notify(Notice::error(format!(
            "Connection lost, please reconnect ({error})"
        ))));
        self.schedule_retry(out);
    }

    fn schedule_retry(&mut self, out: &mut Vec<Effect>) {
        if self.session.is_none() {
            return;
        }
        if self.retries.exhausted() {
            self.session = None;
            out.push(Effect::Notify(Notice::warn(format!(
                "Gave up reconnecting after {} attempts",
                self.retries.max()
            ))));
            return;
        }
        self.next_timer += 1;
        self.timer = Some(self.next_timer);
        out.push(Effect::ArmRetry {
            timer: self.next_timer,
            delay: self.config.retry_delay,
        });
    }

    fn on_retry(&mut self, timer: TimerId, out: &mut Vec<Effect>) {
        if self.timer != Some(timer) || self.state != ConnectionState::Error {
            trace!(target: "webshell::lifecycle", timer, "stale retry timer");
            return;
        }
        self.timer = None;
        let Some(session) = self.session.clone() else {
            return;
        };
        if self.retries.exhausted() {
            return;
        }
        let n = self.retries.bump();
        self.attempt += 1;
        self.set_state(ConnectionState::Connecting, out);
        out.push(Effect::Notify(Notice::info(format!(
            "Reconnecting ({n}/{})...",
            self.retries.max()
        ))));
        out.push(Effect::OpenChannel {
            attempt: self.attempt,
            session,
        });
    }

    fn on_teardown(&mut self, out: &mut Vec<Effect>) {
        self.finished = true;
        self.attempt += 1;
        self.timer = None;
        self.session = None;
        out.push(Effect::CancelRetry);
        out.push(Effect::AbortPending);
        out.push(Effect::CloseChannel {
            code: NORMAL_CLOSURE,
        });
        self.set_state(ConnectionState::Disconnected, out);
        out.push(Effect::DisposeSurface);
        out.push(Effect::Settle(Err(ConnectError::Cancelled)));
    }

    fn set_state(&mut self, next: ConnectionState, out: &mut Vec<Effect>) {
        if self.state == ConnectionState::Error
            && next != ConnectionState::Error
            && self.timer.take().is_some()
        {
            out.push(Effect::CancelRetry);
        }
        if self.state != next {
            trace!(target: "webshell::lifecycle", from = %self.state, to = %next, "state change");
            self.state = next;
            out.push(Effect::StateChanged(next));
        }
    }

    fn is_opening(&self, attempt: AttemptId) -> bool {
        attempt == self.attempt && self.state == ConnectionState::Connecting
    }

    fn is_live(&self, attempt: AttemptId) -> bool {
        attempt == self.attempt && self.state == ConnectionState::Connected
    }

    fn target_name(&self) -> String {
        match (&self.session, &self.config.target_label) {
            (Some(session), _) => session.display_name(),
            (None, Some(label)) => label.clone(),
            (None, None) => format!("#{}", self.config.target_host_id),
        }
    }
}
