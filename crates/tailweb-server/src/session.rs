//! One WebSocket session: file selection, relay of hub deliveries, and the
//! client's view controls.
//!
//! The session never touches the filesystem. It talks to the
//! [`TailRegistry`] for subscriptions and to the hub for the latest sequence
//! number when the client clears its view.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tailweb_core::{ErrorKind, HubEvent, SubscriberId, TailError};
use tailweb_hub::{
    CloseReason, Delivery, OverflowPolicy, Replay, Subscription, SubscriptionOptions,
};
use tailweb_tail::TailRegistry;
use tailweb_telemetry::metrics::WS_DISCONNECTIONS_TOTAL;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::{ClientConnection, ConnectionGuard};
use crate::errors::ServerError;
use crate::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::protocol::{
    ClientMessage, DropReason, FilePayload, HelloPayload, SelectedPayload, ServerMessage,
};
use crate::view::ViewState;

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client sent `close` or a close frame.
    ClientClosed,
    /// The socket failed or the peer vanished.
    TransportClosed,
    /// The subscription was evicted after sustained backpressure.
    Evicted,
    /// No pong within the heartbeat timeout.
    HeartbeatTimeout,
    /// The server is shutting down.
    Shutdown,
}

impl SessionEnd {
    /// Label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TransportClosed => "transport_closed",
            Self::Evicted => "evicted",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Shutdown => "shutdown",
        }
    }

    /// How a per-client error ends the session. `None` when the session
    /// survives it.
    pub fn for_error(err: &TailError) -> Option<Self> {
        if !err.is_fatal_for_session() {
            return None;
        }
        Some(match err {
            TailError::BackpressureEviction => Self::Evicted,
            _ => Self::TransportClosed,
        })
    }

    fn close_frame(self) -> Option<CloseFrame> {
        let (code, reason) = match self {
            Self::ClientClosed => (close_code::NORMAL, "bye"),
            Self::Evicted => (close_code::POLICY, "backpressure eviction"),
            Self::HeartbeatTimeout => (close_code::POLICY, "heartbeat timeout"),
            Self::Shutdown => (close_code::AWAY, "server shutting down"),
            Self::TransportClosed => return None,
        };
        Some(CloseFrame {
            code,
            reason: reason.into(),
        })
    }
}

/// What a session needs from the server.
#[derive(Clone)]
pub struct SessionContext {
    /// Tracked-file registry.
    pub registry: TailRegistry,
    /// Gateway configuration.
    pub config: Arc<ServerConfig>,
}

enum Flow {
    Continue,
    End(SessionEnd),
}

type WsSink = SplitSink<WebSocket, Message>;

struct Session {
    ctx: SessionContext,
    conn: Arc<ClientConnection>,
    sink: WsSink,
    view: ViewState,
    subscription: Option<Subscription>,
}

/// Drive one WebSocket connection until it ends.
pub async fn run_session(
    socket: WebSocket,
    ctx: SessionContext,
    guard: ConnectionGuard,
    cancel: CancellationToken,
) -> SessionEnd {
    let conn = Arc::clone(guard.connection());
    let (sink, mut stream) = socket.split();
    let interval = ctx.config.heartbeat_interval;
    let timeout = ctx.config.heartbeat_timeout;
    let mut session = Session {
        ctx,
        conn: Arc::clone(&conn),
        sink,
        view: ViewState::new(),
        subscription: None,
    };
    info!(connection_id = %conn.id, "client connected");

    let hello = ServerMessage::Hello {
        payload: HelloPayload {
            connection_id: conn.id.to_string(),
            files: session
                .ctx
                .registry
                .files()
                .names()
                .map(ToOwned::to_owned)
                .collect(),
        },
    };

    let greeted = match session.send(&hello).await {
        Ok(()) => Flow::Continue,
        Err(e) => session.transport_closed(&e),
    };
    let end = if let Flow::End(end) = greeted {
        end
    } else {
        let heartbeat = run_heartbeat(&conn, interval, timeout, cancel.child_token());
        tokio::pin!(heartbeat);
        let mut ping = time::interval_at(time::Instant::now() + interval, interval);

        loop {
            let flow = tokio::select! {
                biased;
                () = cancel.cancelled() => Flow::End(SessionEnd::Shutdown),
                result = &mut heartbeat => match result {
                    HeartbeatResult::TimedOut => Flow::End(SessionEnd::HeartbeatTimeout),
                    HeartbeatResult::Cancelled => Flow::End(SessionEnd::Shutdown),
                },
                frame = stream.next() => match frame {
                    Some(Ok(message)) => {
                        conn.mark_alive();
                        session.on_frame(message).await
                    }
                    Some(Err(e)) => session.transport_closed(&e),
                    None => session.transport_closed(&"stream ended"),
                },
                delivery = next_delivery(session.subscription.as_ref()) => {
                    session.on_delivery(delivery).await
                }
                _ = ping.tick() => match session.sink.send(Message::Ping(Bytes::new())).await {
                    Ok(()) => Flow::Continue,
                    Err(e) => session.transport_closed(&e),
                },
            };
            if let Flow::End(end) = flow {
                break end;
            }
        }
    };

    session.finish(end).await;
    drop(guard);
    end
}

async fn next_delivery(subscription: Option<&Subscription>) -> Result<Delivery, CloseReason> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

impl Session {
    async fn send(&mut self, message: &ServerMessage) -> Result<(), axum::Error> {
        self.sink.send(Message::Text(message.to_json().into())).await
    }

    /// Send, mapping a transport failure to the end of the session.
    async fn reply(&mut self, message: &ServerMessage) -> Flow {
        match self.send(message).await {
            Ok(()) => Flow::Continue,
            Err(e) => self.transport_closed(&e),
        }
    }

    fn transport_closed(&self, reason: &dyn std::fmt::Display) -> Flow {
        let err = TailError::TransportClosed {
            reason: reason.to_string(),
        };
        debug!(connection_id = %self.conn.id, error = %err, "websocket transport failed");
        SessionEnd::for_error(&err).map_or(Flow::Continue, Flow::End)
    }

    /// Tell the client about `err`. Session-fatal errors end the session
    /// after the frame is sent.
    async fn report(&mut self, err: TailError, file: Option<&str>) -> Flow {
        let end = SessionEnd::for_error(&err);
        let message = ServerMessage::error(
            err.kind(),
            ServerError::from(err).public_message(),
            end.is_some(),
            file,
        );
        match end {
            Some(end) => {
                let _ = self.send(&message).await;
                Flow::End(end)
            }
            None => self.reply(&message).await,
        }
    }

    fn file_payload(&self) -> FilePayload {
        FilePayload {
            file: self.view.file().map(ToOwned::to_owned),
        }
    }

    async fn on_frame(&mut self, message: Message) -> Flow {
        match message {
            Message::Text(text) => match ClientMessage::parse(text.as_str()) {
                Ok(message) => self.on_client_message(message).await,
                Err(e) => {
                    debug!(connection_id = %self.conn.id, error = %e, "unparseable client message");
                    let reply = ServerMessage::error(
                        ErrorKind::InvalidRequest,
                        format!("unrecognised message: {e}"),
                        false,
                        None,
                    );
                    self.reply(&reply).await
                }
            },
            Message::Binary(_) => {
                let reply = ServerMessage::error(
                    ErrorKind::InvalidRequest,
                    "binary frames are not supported",
                    false,
                    None,
                );
                self.reply(&reply).await
            }
            Message::Close(_) => Flow::End(SessionEnd::ClientClosed),
            Message::Ping(_) | Message::Pong(_) => Flow::Continue,
        }
    }

    async fn on_client_message(&mut self, message: ClientMessage) -> Flow {
        match message {
            ClientMessage::Select {
                file,
                after,
                lossless,
            } => self.select(&file, after, lossless).await,
            ClientMessage::Clear => {
                let latest = self
                    .view
                    .file()
                    .and_then(|file| self.ctx.registry.hub().latest_seq(file));
                let marker = self.view.clear(latest);
                if let (Some(subscription), Some(marker)) = (self.subscription.as_ref(), marker) {
                    subscription.clear_through(marker);
                }
                debug!(connection_id = %self.conn.id, ?marker, "view cleared");
                let reply = ServerMessage::Cleared {
                    seq: marker,
                    payload: self.file_payload(),
                };
                self.reply(&reply).await
            }
            ClientMessage::Pause => {
                let _ = self.view.pause();
                let reply = ServerMessage::Paused {
                    payload: self.file_payload(),
                };
                self.reply(&reply).await
            }
            ClientMessage::Resume => {
                let skipped = self.view.resume();
                let reply = ServerMessage::Resumed {
                    payload: self.file_payload(),
                };
                if let Flow::End(end) = self.reply(&reply).await {
                    return Flow::End(end);
                }
                match (skipped, self.view.file().map(ToOwned::to_owned)) {
                    (Some(skipped), Some(file)) => {
                        let notice = ServerMessage::dropped(&file, skipped, DropReason::Paused);
                        self.reply(&notice).await
                    }
                    _ => Flow::Continue,
                }
            }
            ClientMessage::Close => Flow::End(SessionEnd::ClientClosed),
            ClientMessage::Ping => self.reply(&ServerMessage::Pong).await,
        }
    }

    async fn select(&mut self, file: &str, after: Option<u64>, lossless: bool) -> Flow {
        if !self.ctx.registry.files().contains(file) {
            let err = TailError::UnknownFile {
                name: file.to_owned(),
            };
            return self.report(err, None).await;
        }

        // Release the old subscription before attaching the new one.
        self.subscription = None;
        self.view.deselect();
        self.conn.set_file(None);

        let hub = self.ctx.registry.hub();
        let latest = hub.latest_seq(file);
        // A marker beyond the newest seq belongs to an earlier incarnation
        // of the tracked file and is ignored.
        let marker = after.filter(|a| latest.is_some_and(|l| l >= *a));
        let replay = match marker {
            Some(a) => Replay::After(a),
            None => Replay::Last(self.ctx.config.backfill_lines),
        };
        let policy = if lossless {
            OverflowPolicy::Block {
                timeout: self.ctx.config.block_timeout,
            }
        } else {
            OverflowPolicy::DropOldest
        };
        let options = SubscriptionOptions {
            capacity: self.ctx.config.queue_capacity,
            policy,
            replay,
        };

        let subscription = match self
            .ctx
            .registry
            .attach(file, SubscriberId::new(), options)
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(connection_id = %self.conn.id, file, error = %e, "attach failed");
                return self.report(e, Some(file)).await;
            }
        };

        let reply = ServerMessage::Selected {
            seq: self.ctx.registry.hub().latest_seq(file),
            payload: SelectedPayload {
                file: file.to_owned(),
                subscriber_id: subscription.id().to_string(),
                after: marker,
            },
        };
        info!(
            connection_id = %self.conn.id,
            subscriber_id = %subscription.id(),
            file,
            ?marker,
            "file selected"
        );
        self.view.select(file, marker);
        self.conn.set_file(Some(file.to_owned()));
        self.subscription = Some(subscription);
        self.reply(&reply).await
    }

    async fn on_delivery(&mut self, delivery: Result<Delivery, CloseReason>) -> Flow {
        let file = self.view.file().unwrap_or_default().to_owned();
        match delivery {
            Ok(Delivery::Event(event)) => {
                if !self.view.admit(&event) {
                    return Flow::Continue;
                }
                let is_line = matches!(*event, HubEvent::Line(_));
                let flow = self.reply(&ServerMessage::from_event(&file, &event)).await;
                if is_line && matches!(flow, Flow::Continue) {
                    self.conn.record_sent();
                }
                flow
            }
            Ok(Delivery::Dropped(notice)) => match self.view.admit_drop(notice) {
                Some(notice) => {
                    self.conn.record_dropped(notice.count);
                    let message = ServerMessage::dropped(&file, notice, DropReason::Backpressure);
                    self.reply(&message).await
                }
                None => Flow::Continue,
            },
            Err(CloseReason::Evicted) => {
                warn!(connection_id = %self.conn.id, file = %file, "evicted after sustained backpressure");
                self.subscription = None;
                self.report(TailError::BackpressureEviction, Some(&file)).await
            }
            Err(CloseReason::Shutdown) => Flow::End(SessionEnd::Shutdown),
            Err(CloseReason::FileClosed) => {
                self.subscription = None;
                self.view.deselect();
                self.conn.set_file(None);
                let message = ServerMessage::error(
                    ErrorKind::Io,
                    "the file stopped being tracked, select it again",
                    false,
                    Some(&file),
                );
                self.reply(&message).await
            }
            Err(CloseReason::Unsubscribed) => {
                self.subscription = None;
                Flow::Continue
            }
        }
    }

    /// Release the subscription and say goodbye.
    async fn finish(mut self, end: SessionEnd) {
        self.subscription = None;
        if let Some(frame) = end.close_frame() {
            let _ = self.sink.send(Message::Close(Some(frame))).await;
        }
        let _ = self.sink.close().await;
        metrics::counter!(WS_DISCONNECTIONS_TOTAL, "reason" => end.as_str()).increment(1);
        info!(
            connection_id = %self.conn.id,
            reason = end.as_str(),
            connected_secs = self.conn.connected_at.elapsed().as_secs(),
            "client disconnected"
        );
    }
}
