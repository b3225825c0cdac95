use super::error::ConnectError;
use super::machine::{AttemptId, Effect, Event, Machine, MachineConfig, TimerId};
use super::state::{ConnectionState, Notice, NoticeLevel, Status};
use crate::session::{Negotiator, Session};
use crate::terminal::{InputEvent, LocalCommand, TerminalAdapter};
use crate::transport::{
    ChannelError, ChannelEvent, ChannelFactory, Consumer, DEFAULT_HANDSHAKE_TIMEOUT,
    NORMAL_CLOSURE, TransportChannel,
};
use parking_lot::Mutex;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub target_host_id: u64,
    pub target_label: Option<String>,
    pub handshake_timeout: Duration,
    pub retry_delay: Duration,
    pub max_retries: u32,
}

impl ControllerConfig {
    pub fn new(target_host_id: u64) -> Self {
        let machine = MachineConfig::new(target_host_id);
        Self {
            target_host_id,
            target_label: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            retry_delay: machine.retry_delay,
            max_retries: machine.max_retries,
        }
    }

    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.target_label = label.filter(|label| !label.trim().is_empty());
        self
    }

    fn machine(&self) -> MachineConfig {
        MachineConfig {
            target_host_id: self.target_host_id,
            target_label: self.target_label.clone(),
            retry_delay: self.retry_delay,
            max_retries: self.max_retries,
        }
    }
}

/// The collaborators a controller drives.
pub struct Wiring {
    pub negotiator: Arc<dyn Negotiator>,
    pub channels: Arc<dyn ChannelFactory>,
    pub terminal: TerminalAdapter,
    /// Login status; only ever read.
    pub login: watch::Receiver<bool>,
}

enum Command {
    Connect {
        reconnect: bool,
        reply: oneshot::Sender<Result<(), ConnectError>>,
    },
    Disconnect,
    Input(Vec<u8>),
    ClearView,
    Teardown {
        reply: oneshot::Sender<()>,
    },
}

/// Front door to a running controller. Dropping it tears the controller
/// down.
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<Status>,
    task: Option<JoinHandle<()>>,
}

pub struct Controller;

impl Controller {
    /// Starts the runtime task. Notices arrive on the returned receiver.
    pub fn spawn(
        config: ControllerConfig,
        wiring: Wiring,
    ) -> (ControllerHandle, mpsc::UnboundedReceiver<Notice>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status::default());

        let runtime = Runtime {
            machine: Machine::new(config.machine()),
            config,
            negotiator: wiring.negotiator,
            channels: wiring.channels,
            terminal: wiring.terminal,
            login: wiring.login,
            status: status_tx,
            notices: notices_tx,
            events: events_tx,
            waiters: Vec::new(),
            farewells: Vec::new(),
            channel: None,
            negotiation: None,
            retry: None,
        };
        let task = tokio::spawn(runtime.run(commands_rx, events_rx));
        (
            ControllerHandle {
                commands: commands_tx,
                status: status_rx,
                task: Some(task),
            },
            notices_rx,
        )
    }
}

impl ControllerHandle {
    /// Resolves once the attempt this call started (or joined) settles.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.request(false).await
    }

    /// From Error this counts against the retry budget and reuses the held
    /// session.
    pub async fn reconnect(&self) -> Result<(), ConnectError> {
        self.request(true).await
    }

    async fn request(&self, reconnect: bool) -> Result<(), ConnectError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { reconnect, reply })
            .map_err(|_| ConnectError::Closed)?;
        rx.await.unwrap_or(Err(ConnectError::Closed))
    }

    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    pub fn send_input(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.commands.send(Command::Input(bytes.into()));
    }

    pub fn clear_view(&self) {
        let _ = self.commands.send(Command::ClearView);
    }

    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    /// Waits until the runtime stops on its own (Quit from the keyboard).
    pub async fn closed(&mut self) {
        if let Some(task) = self.task.as_mut() {
            let _ = task.await;
            self.task = None;
        }
    }

    /// Closes the channel, cancels timers and disposes the surface. Returns
    /// once the surface is gone; a second call is a no-op.
    pub async fn teardown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Teardown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Holds a channel's events until its open result has been queued, so the
/// runtime always sees `Opened` before the first frame.
struct Relay {
    attempt: AttemptId,
    inner: Mutex<RelayInner>,
}

struct RelayInner {
    events: Option<mpsc::UnboundedSender<Event>>,
    opened: bool,
    held: Vec<ChannelEvent>,
}

impl Relay {
    fn new(attempt: AttemptId, events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            attempt,
            inner: Mutex::new(RelayInner {
                events: Some(events),
                opened: false,
                held: Vec::new(),
            }),
        }
    }

    fn deliver(&self, event: ChannelEvent) {
        let mut inner = self.inner.lock();
        if inner.opened {
            inner.forward(self.attempt, event);
        } else if inner.events.is_some() {
            inner.held.push(event);
        }
    }

    fn opened(&self) {
        let mut inner = self.inner.lock();
        inner.send(Event::Opened {
            attempt: self.attempt,
        });
        inner.opened = true;
        for event in std::mem::take(&mut inner.held) {
            inner.forward(self.attempt, event);
        }
    }

    fn open_failed(&self, error: ChannelError) {
        self.inner.lock().send(Event::OpenFailed {
            attempt: self.attempt,
            error: Arc::new(error),
        });
    }

    /// Nothing from this channel reaches the runtime any more.
    fn detach(&self) {
        let mut inner = self.inner.lock();
        inner.events = None;
        inner.held.clear();
    }
}

impl RelayInner {
    fn send(&self, event: Event) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn forward(&self, attempt: AttemptId, event: ChannelEvent) {
        self.send(match event {
            ChannelEvent::Data(text) => Event::Inbound { attempt, text },
            ChannelEvent::Closed { code, reason } => Event::Closed {
                attempt,
                code,
                reason,
            },
            ChannelEvent::Failed(error) => Event::Failed {
                attempt,
                error: Arc::new(error),
            },
        });
    }
}

struct ActiveChannel {
    channel: Arc<dyn TransportChannel>,
    relay: Arc<Relay>,
    opener: JoinHandle<()>,
}

impl ActiveChannel {
    fn shut(self, code: u16) {
        self.relay.detach();
        self.channel.close(code);
        self.opener.abort();
    }
}

enum Wake {
    Command(Option<Command>),
    Event(Event),
    Input(Option<InputEvent>),
    Retry(TimerId),
}

struct Runtime {
    machine: Machine,
    config: ControllerConfig,
    negotiator: Arc<dyn Negotiator>,
    channels: Arc<dyn ChannelFactory>,
    terminal: TerminalAdapter,
    login: watch::Receiver<bool>,
    status: watch::Sender<Status>,
    notices: mpsc::UnboundedSender<Notice>,
    events: mpsc::UnboundedSender<Event>,
    waiters: Vec<oneshot::Sender<Result<(), ConnectError>>>,
    farewells: Vec<oneshot::Sender<()>>,
    channel: Option<ActiveChannel>,
    negotiation: Option<JoinHandle<()>>,
    retry: Option<(TimerId, Instant)>,
}

impl Runtime {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        if let Err(err) = self.terminal.initialize().await {
            let fallback = match self.terminal.surface_kind() {
                Some(kind) => format!(", using {kind} output"),
                None => String::new(),
            };
            self.notify(Notice::warn(format!("{err}{fallback}")));
        }
        let mut input = self.terminal.take_input();
        self.terminal.on_state(self.machine.state());

        while !self.machine.is_finished() {
            let deadline = self.retry;
            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                Some(event) = events.recv() => Wake::Event(event),
                key = next_input(&mut input) => Wake::Input(key),
                timer = retry_due(deadline) => Wake::Retry(timer),
            };

            let event = match wake {
                Wake::Command(Some(command)) => self.command(command),
                // Every handle is gone.
                Wake::Command(None) => Some(Event::Teardown),
                Wake::Event(event) => Some(event),
                Wake::Input(Some(key)) => self.key(key),
                Wake::Input(None) => {
                    debug!(target: "webshell::lifecycle", "terminal input closed");
                    input = None;
                    None
                }
                Wake::Retry(timer) => {
                    self.retry = None;
                    Some(Event::RetryFired { timer })
                }
            };
            if let Some(event) = event {
                self.apply(event);
            }
        }

        self.terminal.dispose();
        for reply in self.farewells.drain(..) {
            let _ = reply.send(());
        }
        debug!(target: "webshell::lifecycle", "controller stopped");
    }

    fn command(&mut self, command: Command) -> Option<Event> {
        match command {
            Command::Connect { reconnect, reply } => {
                self.waiters.push(reply);
                Some(self.connect_event(reconnect))
            }
            Command::Disconnect => Some(Event::Disconnect),
            Command::Input(bytes) => Some(Event::Input(bytes)),
            Command::ClearView => Some(Event::ClearView),
            Command::Teardown { reply } => {
                self.farewells.push(reply);
                Some(Event::Teardown)
            }
        }
    }

    fn key(&mut self, key: InputEvent) -> Option<Event> {
        match key {
            InputEvent::ClearView => Some(Event::ClearView),
            InputEvent::Command(LocalCommand::Connect) => Some(self.connect_event(false)),
            InputEvent::Command(LocalCommand::Reconnect) => Some(self.connect_event(true)),
            InputEvent::Command(LocalCommand::Disconnect) => Some(Event::Disconnect),
            InputEvent::Command(LocalCommand::Quit) => Some(Event::Teardown),
            other => other.forwarded_bytes().map(Event::Input),
        }
    }

    fn connect_event(&self, reconnect: bool) -> Event {
        let authenticated = *self.login.borrow();
        if reconnect {
            Event::Reconnect { authenticated }
        } else {
            Event::Connect { authenticated }
        }
    }

    fn apply(&mut self, event: Event) {
        trace!(target: "webshell::lifecycle", ?event, "event");
        let effects = self.machine.step(event);
        // Published first so a settled caller never reads a stale snapshot.
        self.status.send_replace(self.machine.status());
        for effect in effects {
            self.execute(effect);
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::StateChanged(state) => {
                info!(target: "webshell::lifecycle", %state, retries = self.machine.retries(), "connection state");
                self.terminal.on_state(state);
            }
            Effect::Notify(notice) => self.notify(notice),
            Effect::Negotiate {
                attempt,
                target_host_id,
            } => self.negotiate(attempt, target_host_id),
            Effect::OpenChannel { attempt, session } => self.open_channel(attempt, session),
            Effect::CloseChannel { code } => {
                if let Some(active) = self.channel.take() {
                    active.shut(code);
                }
            }
            Effect::AbortPending => {
                if let Some(task) = self.negotiation.take() {
                    task.abort();
                }
            }
            Effect::ArmRetry { timer, delay } => {
                debug!(target: "webshell::lifecycle", timer, ?delay, "retry armed");
                self.retry = Some((timer, Instant::now() + delay));
            }
            Effect::CancelRetry => self.retry = None,
            Effect::ResetSurface { banner } => {
                self.terminal.clear();
                self.terminal.write(&banner);
            }
            Effect::WriteBanner(text) | Effect::WriteSurface(text) => self.terminal.write(&text),
            Effect::Send(payload) => match &self.channel {
                Some(active) => active.channel.send(payload),
                None => trace!(target: "webshell::lifecycle", "no channel for input"),
            },
            Effect::ClearSurface => self.terminal.clear(),
            Effect::DisposeSurface => self.terminal.dispose(),
            Effect::Settle(result) => {
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(result.clone());
                }
            }
        }
    }

    fn negotiate(&mut self, attempt: AttemptId, target_host_id: u64) {
        if let Some(task) = self.negotiation.take() {
            task.abort();
        }
        let negotiator = self.negotiator.clone();
        let events = self.events.clone();
        self.negotiation = Some(tokio::spawn(async move {
            let result = negotiator
                .create_session(target_host_id)
                .await
                .map_err(Arc::new);
            let _ = events.send(Event::Negotiated { attempt, result });
        }));
    }

    fn open_channel(&mut self, attempt: AttemptId, session: Session) {
        if let Some(previous) = self.channel.take() {
            previous.shut(NORMAL_CLOSURE);
        }
        let relay = Arc::new(Relay::new(attempt, self.events.clone()));
        let consumer: Consumer = {
            let relay = relay.clone();
            Arc::new(move |event| relay.deliver(event))
        };
        let channel = self.channels.create(consumer);
        let limit = self.config.handshake_timeout;
        let opener = {
            let channel = channel.clone();
            let relay = relay.clone();
            tokio::spawn(async move {
                match timeout(limit, channel.open(&session)).await {
                    Ok(Ok(())) => relay.opened(),
                    Ok(Err(err)) => relay.open_failed(err),
                    Err(_) => {
                        channel.close(NORMAL_CLOSURE);
                        relay.open_failed(ChannelError::HandshakeTimeout(limit));
                    }
                }
            })
        };
        debug!(target: "webshell::lifecycle", attempt, "channel opening");
        self.channel = Some(ActiveChannel {
            channel,
            relay,
            opener,
        });
    }

    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Error => error!(target: "webshell::lifecycle", message = %notice.message, "notice"),
            NoticeLevel::Warn => warn!(target: "webshell::lifecycle", message = %notice.message, "notice"),
            NoticeLevel::Info | NoticeLevel::Success => {
                debug!(target: "webshell::lifecycle", message = %notice.message, "notice")
            }
        }
        let _ = self.notices.send(notice);
    }
}

async fn next_input(input: &mut Option<mpsc::UnboundedReceiver<InputEvent>>) -> Option<InputEvent> {
    match input {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn retry_due(deadline: Option<(TimerId, Instant)>) -> TimerId {
    match deadline {
        Some((timer, at)) => {
            sleep_until(at).await;
            timer
        }
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::{MemorySurface, MemorySurfaceHandle, TerminalSurface};
    use crate::transport::mock::{MockNetwork, OpenBehavior};
    use crate::transport::{ChannelPhase, Payload};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    #[derive(Default)]
    struct MockNegotiator {
        calls: AtomicUsize,
        reject: Mutex<Option<String>>,
    }

    #[async_trait]
    impl Negotiator for MockNegotiator {
        async fn create_session(
            &self,
            target_host_id: u64,
        ) -> Result<Session, crate::session::NegotiationError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = self.reject.lock().clone() {
                return Err(crate::session::NegotiationError::Rejected(message));
            }
            Ok(Session {
                session_id: format!("sess-{n}-abcdef"),
                target_host_id,
                target_host_name: "edge-7".into(),
            })
        }
    }

    struct Rig {
        handle: ControllerHandle,
        notices: mpsc::UnboundedReceiver<Notice>,
        network: MockNetwork,
        negotiator: Arc<MockNegotiator>,
        screen: MemorySurfaceHandle,
        _login: watch::Sender<bool>,
    }

    fn rig_with(logged_in: bool, config: ControllerConfig) -> Rig {
        let network = MockNetwork::new();
        let negotiator = Arc::new(MockNegotiator::default());
        let (surface, screen) = MemorySurface::new();
        let mut surface = Some(surface);
        let terminal = TerminalAdapter::new(
            move || -> Result<Box<dyn TerminalSurface>, crate::terminal::InitializationError> {
                surface
                    .take()
                    .map(|s| Box::new(s) as Box<dyn TerminalSurface>)
                    .ok_or(crate::terminal::InitializationError::NotReady)
            },
        );
        let (login_tx, login) = watch::channel(logged_in);
        let (handle, notices) = Controller::spawn(
            config,
            Wiring {
                negotiator: negotiator.clone(),
                channels: Arc::new(network.clone()),
                terminal,
                login,
            },
        );
        Rig {
            handle,
            notices,
            network,
            negotiator,
            screen,
            _login: login_tx,
        }
    }

    fn rig() -> Rig {
        rig_with(true, ControllerConfig::new(7))
    }

    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    fn drain(notices: &mut mpsc::UnboundedReceiver<Notice>) -> Vec<Notice> {
        let mut out = Vec::new();
        while let Ok(notice) = notices.try_recv() {
            out.push(notice);
        }
        out
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn connect_opens_a_channel_and_relays_output() {
        let mut rig = rig();
        rig.handle.connect().await.unwrap();
        assert_eq!(rig.handle.state(), ConnectionState::Connected);
        assert_eq!(rig.negotiator.calls.load(Ordering::SeqCst), 1);

        let channel = rig.network.last().unwrap();
        assert_eq!(channel.session().unwrap().target_host_id, 7);
        assert!(rig.screen.content().contains("edge-7"));

        channel.deliver_text("hello\r\n");
        settle().await;
        assert!(rig.screen.content().ends_with("hello\r\n"));

        rig.handle.send_input(b"ls\r".to_vec());
        settle().await;
        assert_eq!(channel.sent(), vec![Payload::Text("ls\r".into())]);

        let notices = drain(&mut rig.notices);
        assert!(notices.iter().any(|n| n.level == NoticeLevel::Success && n.message.contains("edge-7")));
        assert_eq!(
            rig.screen.states(),
            vec![
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Connected
            ]
        );
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn second_connect_while_connected_is_a_no_op() {
        let rig = rig();
        rig.handle.connect().await.unwrap();
        rig.handle.connect().await.unwrap();
        assert_eq!(rig.network.created(), 1);
        assert_eq!(rig.negotiator.calls.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn connect_while_connecting_joins_the_attempt() {
        let rig = rig();
        rig.network.push(OpenBehavior::SucceedAfter(Duration::from_millis(200)));
        let (a, b) = tokio::join!(rig.handle.connect(), rig.handle.connect());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(rig.network.created(), 1);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn rapid_connect_disconnect_leaves_at_most_one_channel() {
        let rig = rig();
        rig.network
            .set_default(OpenBehavior::SucceedAfter(Duration::from_millis(50)));
        for _ in 0..5 {
            let (result, ()) = tokio::join!(rig.handle.connect(), async {
                settle().await;
                rig.handle.disconnect();
            });
            assert!(matches!(result, Err(ConnectError::Cancelled)));
        }
        sleep(Duration::from_millis(100)).await;
        assert_eq!(rig.network.open_count(), 0);
        assert_eq!(rig.handle.state(), ConnectionState::Disconnected);
        for channel in rig.network.channels() {
            assert_eq!(channel.phase(), ChannelPhase::Closed);
        }

        rig.handle.connect().await.unwrap();
        assert_eq!(rig.network.open_count(), 1);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn unauthenticated_connect_is_refused_without_network() {
        let mut rig = rig_with(false, ControllerConfig::new(7));
        let result = rig.handle.connect().await;
        assert!(matches!(result, Err(ConnectError::AuthRequired)));
        assert_eq!(rig.network.created(), 0);
        assert_eq!(rig.negotiator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(rig.handle.state(), ConnectionState::Disconnected);
        let notices = drain(&mut rig.notices);
        assert!(notices[0].message.contains("log in"));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn rejected_negotiation_reports_and_stays_in_error() {
        let mut rig = rig();
        *rig.negotiator.reject.lock() = Some("host offline".into());
        let result = rig.handle.connect().await;
        assert!(matches!(result, Err(ConnectError::Negotiation(_))));
        assert_eq!(rig.handle.state(), ConnectionState::Error);

        // No session was ever granted, so nothing is retried automatically.
        sleep(Duration::from_secs(10)).await;
        assert_eq!(rig.negotiator.calls.load(Ordering::SeqCst), 1);
        let notices = drain(&mut rig.notices);
        assert!(notices.iter().any(|n| n.message.contains("host offline")));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn abnormal_close_retries_after_the_delay_with_the_same_session() {
        let rig = rig();
        rig.handle.connect().await.unwrap();
        let first = rig.network.last().unwrap();
        first.remote_close(1011, "server restart");
        settle().await;
        assert_eq!(rig.handle.state(), ConnectionState::Error);
        assert!(rig.screen.content().contains("Connection lost"));

        sleep(Duration::from_millis(2900)).await;
        assert_eq!(rig.network.created(), 1);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(rig.network.created(), 2);
        assert_eq!(rig.handle.state(), ConnectionState::Connected);
        let second = rig.network.last().unwrap();
        assert_eq!(second.session(), first.session());
        assert_eq!(rig.negotiator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(rig.handle.status().retries, 0);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn normal_close_does_not_retry() {
        let rig = rig();
        rig.handle.connect().await.unwrap();
        rig.network.last().unwrap().remote_close(1000, "bye");
        sleep(Duration::from_secs(10)).await;
        assert_eq!(rig.handle.state(), ConnectionState::Disconnected);
        assert_eq!(rig.network.created(), 1);
        assert!(rig.handle.status().session.is_none());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn hung_handshake_times_out() {
        let mut config = ControllerConfig::new(7);
        config.handshake_timeout = Duration::from_secs(2);
        let rig = rig_with(true, config);
        rig.network.push(OpenBehavior::Hang);

        let started = tokio::time::Instant::now();
        let result = rig.handle.connect().await;
        match result {
            Err(ConnectError::Channel(error)) => {
                assert!(matches!(*error, ChannelError::HandshakeTimeout(_)))
            }
            other => panic!("expected handshake timeout, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(rig.handle.state(), ConnectionState::Error);
        settle().await;
        assert_eq!(rig.network.channels()[0].phase(), ChannelPhase::Closed);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn teardown_while_connecting_cancels_and_goes_quiet() {
        let mut rig = rig();
        rig.network.push(OpenBehavior::Hang);
        let (result, ()) = tokio::join!(rig.handle.connect(), async {
            settle().await;
            rig.handle.teardown().await;
        });
        assert!(matches!(result, Err(ConnectError::Cancelled)));
        assert_eq!(rig.screen.disposals(), 1);
        let channel = rig.network.last().unwrap();
        assert_eq!(channel.phase(), ChannelPhase::Closed);

        drain(&mut rig.notices);
        let writes = rig.screen.writes().len();
        channel.deliver_text("late output");
        sleep(Duration::from_secs(10)).await;
        assert_eq!(rig.screen.writes().len(), writes);
        assert!(rig.notices.try_recv().is_err());

        rig.handle.teardown().await;
        assert_eq!(rig.screen.disposals(), 1);
        assert!(matches!(
            rig.handle.connect().await,
            Err(ConnectError::Closed)
        ));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn keyboard_commands_drive_the_controller() {
        let mut rig = rig();
        assert!(rig
            .screen
            .type_input(InputEvent::Command(LocalCommand::Connect)));
        settle().await;
        assert_eq!(rig.handle.state(), ConnectionState::Connected);
        let channel = rig.network.last().unwrap();

        rig.screen.type_input(InputEvent::Interrupt);
        rig.screen.type_input(InputEvent::ClearView);
        settle().await;
        assert_eq!(channel.sent(), vec![Payload::Text("\u{3}".into())]);
        assert_eq!(rig.screen.content(), "");

        rig.screen
            .type_input(InputEvent::Command(LocalCommand::Disconnect));
        settle().await;
        assert_eq!(rig.handle.state(), ConnectionState::Disconnected);
        assert_eq!(channel.closed_with(), Some(NORMAL_CLOSURE));

        rig.screen.type_input(InputEvent::Command(LocalCommand::Quit));
        rig.handle.closed().await;
        assert_eq!(rig.screen.disposals(), 1);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn dropping_the_handle_tears_down() {
        let rig = rig();
        rig.handle.connect().await.unwrap();
        let channel = rig.network.last().unwrap();
        let screen = rig.screen.clone();
        drop(rig);
        settle().await;
        assert_eq!(screen.disposals(), 1);
        assert_eq!(channel.phase(), ChannelPhase::Closed);
    }
}
