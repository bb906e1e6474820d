//! Per-socket session workers.
//!
//! One worker owns one WebSocket: a reader task (this module's loop) and
//! a writer task fed through an unbounded queue, so flushes reach the
//! client in the order they were enqueued. The state machine is
//! single-threaded per worker; the registry's event queue is the only
//! concurrency entry.
//!
//! ```text
//! INIT ──hello──► LIVE ──(register|unregister|ping|ack|flush)*──► CLOSED
//!   │                                                                ▲
//!   └──hello-timeout / protocol-error / socket-close ────────────────┘
//! ```

use crate::handlers::AppState;
use crate::metrics;
use axum::extract::ws::{Message, WebSocket};
use beacon_core::{WorkerEvent, WorkerHandle};
use beacon_protocol::{
    ids, ChannelId, ClientMessage, DeviceId, ServerMessage, TokenError, Update, RAW_PING,
};
use beacon_store::StoreError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Run one client session to completion.
pub(crate) async fn run_session(socket: WebSocket, state: Arc<AppState>) {
    let _guard = metrics::SessionMetricsGuard::new();

    let (sink, stream) = socket.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(sink, out_rx));

    let mut session = Session::new(state, out_tx);
    session.run(stream).await;
    session.cleanup().await;

    // Dropping the session closes the outbound queue; the writer drains
    // what is left and shuts the socket.
    drop(session);
    let _ = writer.await;
}

/// Forward queued frames to the socket until the queue closes.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = out_rx.recv().await {
        if sink.send(msg).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Read frames until a text frame, handling transport control frames.
///
/// Returns `None` when the socket closes or violates the protocol.
async fn next_text(
    stream: &mut SplitStream<WebSocket>,
    out: &mpsc::UnboundedSender<Message>,
) -> Option<String> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Some(text),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                Ok(text) => return Some(text),
                Err(_) => return None,
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = out.send(Message::Pong(data));
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Err(err)) => {
                debug!(error = %err, "socket error before hello");
                return None;
            }
        }
    }
}

struct Session {
    state: Arc<AppState>,
    out: mpsc::UnboundedSender<Message>,
    events: Option<mpsc::UnboundedReceiver<WorkerEvent>>,
    handle: WorkerHandle,
    uaid: Option<DeviceId>,
    installed: bool,
    unacked: HashMap<String, u64>,
    last_ping: Option<Instant>,
    last_activity: Instant,
}

impl Session {
    fn new(state: Arc<AppState>, out: mpsc::UnboundedSender<Message>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            state,
            out,
            events: Some(event_rx),
            handle: WorkerHandle::new(event_tx),
            uaid: None,
            installed: false,
            unacked: HashMap::new(),
            last_ping: None,
            last_activity: Instant::now(),
        }
    }

    async fn run(&mut self, mut stream: SplitStream<WebSocket>) {
        let shutdown = self.state.shutdown.clone();

        // INIT: the first frame must be a hello within the deadline.
        let first = tokio::select! {
            () = shutdown.cancelled() => return,
            frame = tokio::time::timeout(
                self.state.config.hello_timeout(),
                next_text(&mut stream, &self.out),
            ) => match frame {
                Ok(Some(text)) => text,
                Ok(None) => return,
                Err(_) => {
                    debug!("client never said hello, closing");
                    return;
                }
            }
        };
        if !self.handle_hello(&first).await {
            return;
        }
        self.live_loop(stream).await;
    }

    async fn live_loop(&mut self, mut stream: SplitStream<WebSocket>) {
        let shutdown = self.state.shutdown.clone();
        let Some(mut events) = self.events.take() else {
            return;
        };

        let pong_interval = self.state.config.pong_interval();
        let mut keepalive =
            tokio::time::interval_at(tokio::time::Instant::now() + pong_interval, pong_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,

                _ = keepalive.tick() => {
                    if !self.state.config.push_long_pongs
                        && self.last_activity.elapsed() >= pong_interval
                    {
                        debug!(uaid = ?self.uaid, "closing idle session");
                        break;
                    }
                    let _ = self.out.send(Message::Ping(Vec::new()));
                }

                event = events.recv() => match event {
                    Some(WorkerEvent::Flush(update)) => {
                        self.send_notification(vec![update], Vec::new());
                    }
                    Some(WorkerEvent::Close) | None => break,
                },

                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.last_activity = Instant::now();
                        if !self.handle_frame(&text).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        self.last_activity = Instant::now();
                        let Ok(text) = String::from_utf8(data) else {
                            break;
                        };
                        if !self.handle_frame(&text).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = self.out.send(Message::Pong(data));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        self.last_activity = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(error = %err, "socket error");
                        break;
                    }
                }
            }
        }
    }

    /// Process the hello handshake. Returns `false` to close the socket.
    async fn handle_hello(&mut self, text: &str) -> bool {
        let msg = match ClientMessage::parse(text) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(error = %err, "unparseable first frame");
                return false;
            }
        };
        let ClientMessage::Hello {
            uaid,
            channel_ids,
            connect,
        } = msg
        else {
            debug!("first frame was not hello");
            return false;
        };

        // Issue a fresh device ID when the client's is absent, malformed,
        // or already owned by a live local worker.
        let resolved = match uaid.as_deref() {
            Some(presented) => match presented.parse::<DeviceId>() {
                Ok(id) if !self.state.registry.contains(&id.to_string()) => id,
                Ok(id) => {
                    debug!(uaid = %id, "device id collision, issuing fresh id");
                    DeviceId::generate()
                }
                Err(_) => DeviceId::generate(),
            },
            None => DeviceId::generate(),
        };
        let uaid_hex = resolved.to_string();

        // Malformed presented channels are dropped rather than failing
        // the handshake.
        let presented: Vec<ChannelId> = channel_ids
            .iter()
            .filter_map(|chid| chid.parse().ok())
            .collect();
        if let Err(err) = self
            .state
            .store
            .reconcile_channels(&resolved, &presented)
            .await
        {
            error!(uaid = %uaid_hex, error = %err, "channel reconciliation failed");
            metrics::record_error("store");
            self.send(&ServerMessage::Hello {
                status: 503,
                uaid: uaid_hex,
            });
            return false;
        }

        if let Err(err) = self
            .state
            .store
            .put_host(&resolved, &self.state.config.current_host)
            .await
        {
            warn!(uaid = %uaid_hex, error = %err, "failed to record host mapping");
        }
        if let Some(connect) = connect {
            if let Err(err) = self.state.store.put_ping(&resolved, &connect.to_string()).await {
                warn!(uaid = %uaid_hex, error = %err, "failed to store ping blob");
            }
        }

        self.send(&ServerMessage::Hello {
            status: 200,
            uaid: uaid_hex.clone(),
        });

        if let Some(displaced) = self.state.registry.insert(&uaid_hex, self.handle.clone()) {
            displaced.close();
        }
        self.installed = true;
        self.uaid = Some(resolved);
        debug!(uaid = %uaid_hex, "session live");

        self.flush_pending().await;
        true
    }

    /// Process one live-state frame. Returns `false` to close the socket.
    async fn handle_frame(&mut self, text: &str) -> bool {
        let msg = match ClientMessage::parse(text) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(error = %err, "unparseable frame, closing");
                return false;
            }
        };
        match msg {
            ClientMessage::Hello { .. } => {
                debug!("hello on a live session, closing");
                false
            }
            ClientMessage::Register { channel_id } => {
                self.on_register(&channel_id).await;
                true
            }
            ClientMessage::Unregister { channel_id } => {
                self.on_unregister(&channel_id).await;
                true
            }
            ClientMessage::Ping => self.on_ping(),
            ClientMessage::Ack { updates } => {
                self.on_ack(updates).await;
                true
            }
            ClientMessage::Purge => {
                self.on_purge().await;
                true
            }
        }
    }

    async fn on_register(&mut self, channel_id: &str) {
        let Some(uaid) = self.uaid.clone() else {
            return;
        };
        let reply = match channel_id.parse::<ChannelId>() {
            Err(_) => ServerMessage::Register {
                status: 401,
                channel_id: channel_id.to_string(),
                push_endpoint: None,
            },
            Ok(chid) => match self.state.store.register(&uaid, &chid, 0).await {
                Ok(()) => match self.make_endpoint(&uaid, &chid) {
                    Ok(endpoint) => ServerMessage::Register {
                        status: 200,
                        channel_id: chid.to_string(),
                        push_endpoint: Some(endpoint),
                    },
                    Err(err) => {
                        error!(uaid = %uaid, chid = %chid, error = %err, "endpoint sealing failed");
                        ServerMessage::Register {
                            status: 500,
                            channel_id: chid.to_string(),
                            push_endpoint: None,
                        }
                    }
                },
                Err(err) => {
                    error!(uaid = %uaid, chid = %chid, error = %err, "register failed");
                    metrics::record_error("store");
                    ServerMessage::Register {
                        status: 503,
                        channel_id: chid.to_string(),
                        push_endpoint: None,
                    }
                }
            },
        };
        self.send(&reply);
    }

    async fn on_unregister(&mut self, channel_id: &str) {
        let Some(uaid) = self.uaid.clone() else {
            return;
        };
        let status = match channel_id.parse::<ChannelId>() {
            Err(_) => 401,
            Ok(chid) => match self.state.store.unregister(&uaid, &chid).await {
                Ok(()) => 200,
                Err(StoreError::InvalidChannel) => 404,
                Err(err) => {
                    error!(uaid = %uaid, chid = %chid, error = %err, "unregister failed");
                    metrics::record_error("store");
                    503
                }
            },
        };
        self.send(&ServerMessage::Unregister {
            status,
            channel_id: channel_id.to_string(),
        });
    }

    /// Enforce the minimum inter-ping interval and echo the keepalive.
    fn on_ping(&mut self) -> bool {
        if let Some(last) = self.last_ping {
            if last.elapsed() < self.state.config.min_ping() {
                debug!(uaid = ?self.uaid, "ping below minimum interval, closing");
                return false;
            }
        }
        self.last_ping = Some(Instant::now());
        let _ = self.out.send(Message::Text(RAW_PING.to_string()));
        true
    }

    async fn on_ack(&mut self, updates: Vec<Update>) {
        let Some(uaid) = self.uaid.clone() else {
            return;
        };
        for update in updates {
            // Only the exact version last flushed consumes the record;
            // anything else is ignored.
            if self.unacked.get(&update.channel_id) != Some(&update.version) {
                continue;
            }
            if let Ok(chid) = update.channel_id.parse::<ChannelId>() {
                if let Err(err) = self.state.store.drop_channel(&uaid, &chid).await {
                    warn!(uaid = %uaid, chid = %chid, error = %err, "post-ack drop failed");
                }
            }
            self.unacked.remove(&update.channel_id);
            metrics::record_ack();
        }
    }

    async fn on_purge(&mut self) {
        let Some(uaid) = self.uaid.clone() else {
            return;
        };
        let status = match self.state.store.drop_all(&uaid).await {
            Ok(()) => {
                let _ = self.state.store.drop_ping(&uaid).await;
                self.unacked.clear();
                200
            }
            Err(err) => {
                error!(uaid = %uaid, error = %err, "purge failed");
                metrics::record_error("store");
                503
            }
        };
        self.send(&ServerMessage::Purge { status });
    }

    /// Flush every pending live record after the handshake. Re-flushing
    /// on reconnect is idempotent; the client acks once.
    async fn flush_pending(&mut self) {
        let Some(uaid) = self.uaid.clone() else {
            return;
        };
        match self.state.store.fetch_all(&uaid, 0).await {
            Ok((updates, expired)) => {
                if !updates.is_empty() || !expired.is_empty() {
                    self.send_notification(updates, expired);
                }
            }
            Err(err) => {
                error!(uaid = %uaid, error = %err, "initial flush failed");
                metrics::record_error("store");
            }
        }
    }

    fn send_notification(&mut self, updates: Vec<Update>, expired: Vec<String>) {
        for update in &updates {
            self.unacked
                .insert(update.channel_id.clone(), update.version);
        }
        metrics::record_notifications(updates.len());
        self.send(&ServerMessage::Notification { updates, expired });
    }

    fn make_endpoint(&self, uaid: &DeviceId, chid: &ChannelId) -> Result<String, TokenError> {
        let key = ids::ids_to_key(&uaid.to_string(), &chid.to_string())
            .ok_or(TokenError::Malformed)?;
        let token = self.state.tokens.encode(&key)?;
        Ok(format!(
            "{}/update/{}",
            self.state.config.endpoint_base(),
            token
        ))
    }

    fn send(&self, msg: &ServerMessage) {
        let _ = self.out.send(Message::Text(msg.to_json()));
    }

    /// Unwind the session: deregister from the table (only if still the
    /// installed worker) and drop the host mapping.
    async fn cleanup(&mut self) {
        let Some(uaid) = self.uaid.clone() else {
            return;
        };
        let uaid_hex = uaid.to_string();
        let removed = self.installed && self.state.registry.remove(&uaid_hex, self.handle.id());
        if removed {
            if let Err(err) = self.state.store.drop_host(&uaid).await {
                debug!(uaid = %uaid_hex, error = %err, "failed to drop host mapping");
            }
        }
        debug!(uaid = %uaid_hex, "session closed");
    }
}
