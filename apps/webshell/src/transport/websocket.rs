use super::address::terminal_url;
use super::decode::Utf8Decoder;
use super::{
    ChannelError, ChannelEvent, ChannelFactory, ChannelPhase, Consumer, DEFAULT_HANDSHAKE_TIMEOUT,
    OpenGuard, Payload, TransportChannel,
};
use crate::auth::TokenSource;
use crate::session::Session;
use crate::telemetry::logging::frame_preview;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{Level, debug, trace, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a locally initiated close waits for the peer's close echo
/// before the socket is torn down regardless.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Bytes of each frame shown in trace events.
const PREVIEW_BYTES: usize = 64;

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub origin: Url,
    pub cookie_name: String,
    pub handshake_timeout: Duration,
}

impl WebSocketConfig {
    pub fn new(origin: Url, cookie_name: impl Into<String>) -> Self {
        Self {
            origin,
            cookie_name: cookie_name.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }
}

pub struct WebSocketChannelFactory {
    config: WebSocketConfig,
    tokens: Arc<dyn TokenSource>,
}

impl WebSocketChannelFactory {
    pub fn new(config: WebSocketConfig, tokens: Arc<dyn TokenSource>) -> Self {
        Self { config, tokens }
    }
}

impl ChannelFactory for WebSocketChannelFactory {
    fn create(&self, consumer: Consumer) -> Arc<dyn TransportChannel> {
        Arc::new(WebSocketChannel::new(
            self.config.clone(),
            self.tokens.clone(),
            consumer,
        ))
    }
}

enum Outbound {
    Payload(Payload),
    Close(u16),
}

#[derive(Default)]
struct Link {
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    tasks: Option<(JoinHandle<()>, JoinHandle<()>)>,
}

/// Terminal stream over `/api/v1/ws/terminal/{session_id}`.
pub struct WebSocketChannel {
    config: WebSocketConfig,
    tokens: Arc<dyn TokenSource>,
    consumer: Consumer,
    guard: Arc<OpenGuard>,
    cancel: Notify,
    link: Mutex<Link>,
}

impl WebSocketChannel {
    pub fn new(config: WebSocketConfig, tokens: Arc<dyn TokenSource>, consumer: Consumer) -> Self {
        Self {
            config,
            tokens,
            consumer,
            guard: Arc::new(OpenGuard::new()),
            cancel: Notify::new(),
            link: Mutex::new(Link::default()),
        }
    }

    fn request(
        &self,
        session: &Session,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, ChannelError> {
        let token = self.tokens.token();
        let url = terminal_url(&self.config.origin, &session.session_id, token.as_deref())?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| ChannelError::InvalidAddress(err.to_string()))?;
        if let Some(token) = token {
            let cookie = HeaderValue::from_str(&format!("{}={token}", self.config.cookie_name))
                .map_err(|err| ChannelError::InvalidAddress(err.to_string()))?;
            request.headers_mut().insert(COOKIE, cookie);
        }
        debug!(
            target: "webshell::transport",
            session = %session.short_id(),
            host = %url.host_str().unwrap_or_default(),
            "opening terminal websocket"
        );
        Ok(request)
    }

    async fn handshake(&self, session: &Session) -> Result<WsStream, ChannelError> {
        let cancelled = self.cancel.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();
        if self.guard.phase() == ChannelPhase::Closed {
            return Err(ChannelError::Cancelled);
        }

        let request = self.request(session)?;
        let limit = self.config.handshake_timeout;
        tokio::select! {
            result = timeout(limit, connect_async(request)) => match result {
                Ok(Ok((stream, response))) => {
                    trace!(target: "webshell::transport", status = %response.status(), "websocket upgraded");
                    Ok(stream)
                }
                Ok(Err(err)) => Err(ChannelError::Handshake(err.to_string())),
                Err(_) => Err(ChannelError::HandshakeTimeout(limit)),
            },
            _ = &mut cancelled => Err(ChannelError::Cancelled),
        }
    }
}

#[async_trait]
impl TransportChannel for WebSocketChannel {
    async fn open(&self, session: &Session) -> Result<(), ChannelError> {
        self.guard.begin()?;
        let stream = match self.handshake(session).await {
            Ok(stream) => stream,
            Err(err) => {
                self.guard.settle_failed();
                debug!(target: "webshell::transport", error = %err, "websocket open failed");
                return Err(err);
            }
        };

        let rejected = {
            let mut link = self.link.lock();
            if self.guard.settle_open() {
                let (sink, source) = stream.split();
                let (tx, rx) = mpsc::unbounded_channel();
                let writer = tokio::spawn(write_loop(sink, rx));
                let reader = tokio::spawn(read_loop(
                    source,
                    self.consumer.clone(),
                    self.guard.clone(),
                ));
                link.outbound = Some(tx);
                link.tasks = Some((writer, reader));
                None
            } else {
                Some(stream)
            }
        };
        if let Some(mut stream) = rejected {
            // Closed while the upgrade was in flight.
            let _ = stream.close(None).await;
            return Err(ChannelError::Cancelled);
        }
        debug!(target: "webshell::transport", session = %session.short_id(), "terminal websocket open");
        Ok(())
    }

    fn send(&self, payload: Payload) {
        if self.guard.phase() != ChannelPhase::Open {
            trace!(target: "webshell::transport", bytes = payload.len(), "dropping input, channel not open");
            return;
        }
        if tracing::enabled!(target: "webshell::transport", Level::TRACE) {
            trace!(
                target: "webshell::transport",
                bytes = payload.len(),
                preview = %frame_preview(payload.as_bytes(), PREVIEW_BYTES),
                "sending input"
            );
        }
        let link = self.link.lock();
        if let Some(tx) = link.outbound.as_ref() {
            let _ = tx.send(Outbound::Payload(payload));
        }
    }

    fn close(&self, code: u16) {
        let previous = self.guard.close();
        self.cancel.notify_waiters();
        let (outbound, tasks) = {
            let mut link = self.link.lock();
            (link.outbound.take(), link.tasks.take())
        };

        if let Some(tx) = outbound {
            let _ = tx.send(Outbound::Close(code));
        }
        if let Some((mut writer, mut reader)) = tasks {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        let drained = timeout(CLOSE_GRACE, async {
                            let _ = (&mut writer).await;
                            let _ = (&mut reader).await;
                        })
                        .await;
                        if drained.is_err() {
                            trace!(target: "webshell::transport", "close handshake timed out");
                        }
                        writer.abort();
                        reader.abort();
                    });
                }
                Err(_) => {
                    writer.abort();
                    reader.abort();
                }
            }
        }
        if previous != ChannelPhase::Closed {
            debug!(target: "webshell::transport", code, "terminal websocket closed locally");
        }
    }

    fn is_open(&self) -> bool {
        self.guard.phase() == ChannelPhase::Open
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.guard.close();
        if let Some((writer, reader)) = self.link.get_mut().tasks.take() {
            writer.abort();
            reader.abort();
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        let result = match outbound {
            Outbound::Payload(Payload::Text(text)) => sink.send(Message::Text(text)).await,
            Outbound::Payload(Payload::Binary(bytes)) => sink.send(Message::Binary(bytes)).await,
            Outbound::Close(code) => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: Cow::Borrowed(""),
                };
                if let Err(err) = sink.send(Message::Close(Some(frame))).await {
                    trace!(target: "webshell::transport", error = %err, "close frame not sent");
                }
                break;
            }
        };
        if let Err(err) = result {
            warn!(target: "webshell::transport", error = %err, "websocket write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(mut source: SplitStream<WsStream>, consumer: Consumer, guard: Arc<OpenGuard>) {
    let mut decoder = Utf8Decoder::new();
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let text = decoder.push_text(&text);
                if !text.is_empty() {
                    consumer(ChannelEvent::Data(text));
                }
            }
            Ok(Message::Binary(bytes)) => {
                if tracing::enabled!(target: "webshell::transport", Level::TRACE) {
                    trace!(
                        target: "webshell::transport",
                        bytes = bytes.len(),
                        preview = %frame_preview(&bytes, PREVIEW_BYTES),
                        "terminal output frame"
                    );
                }
                let text = decoder.decode(&bytes);
                if !text.is_empty() {
                    consumer(ChannelEvent::Data(text));
                }
            }
            Ok(Message::Close(frame)) => {
                let tail = decoder.finish();
                if !tail.is_empty() {
                    consumer(ChannelEvent::Data(tail));
                }
                guard.close();
                let (code, reason) = match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                    None => (None, String::new()),
                };
                debug!(target: "webshell::transport", ?code, %reason, "terminal websocket closed by peer");
                consumer(ChannelEvent::Closed { code, reason });
                return;
            }
            Ok(_) => {}
            Err(err) => {
                guard.close();
                debug!(target: "webshell::transport", error = %err, "terminal websocket failed");
                consumer(ChannelEvent::Failed(ChannelError::Socket(err.to_string())));
                return;
            }
        }
    }
    guard.close();
    consumer(ChannelEvent::Closed {
        code: None,
        reason: "connection dropped".into(),
    });
}
