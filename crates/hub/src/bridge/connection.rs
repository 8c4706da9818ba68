//! One outbound WebSocket connection per endpoint
//!
//! The hub dials out to the endpoint and then plays the *server* side of MCP:
//! the remote consumer sends requests, the hub answers them from the catalog.
//! Every connection owns its outbound queue, drained by a single writer task,
//! so concurrently served requests never interleave partial frames.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use mcphub_shared::{ConfigStore, ConnectionStatus, Endpoint};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::routing::scope_for;
use crate::mcp::{JsonRpcMessage, JsonRpcRequest, McpMethod, McpRequestHandler, METHOD_TOOLS_LIST_CHANGED};
use crate::reconnect::{spawn_retry, Phase, ReconnectLimits, ReconnectMachine, RetryDecision};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

type EndpointStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything a connection needs from the hub
pub struct BridgeContext {
    pub store: Arc<dyn ConfigStore>,
    pub handler: Arc<McpRequestHandler>,
    pub limits: ReconnectLimits,
}

struct EndpointState {
    machine: ReconnectMachine,
    /// Cancels the socket task and retry timer of the current generation
    cancel: CancellationToken,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    url: String,
    status: ConnectionStatus,
    error: Option<String>,
}

impl EndpointState {
    /// Drop the outbound queue, asking the writer to send a close frame first
    fn close_outbound(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Message::Close(None));
        }
    }
}

/// Runtime status of one endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointStatus {
    pub id: String,
    pub name: String,
    pub url: String,
    pub status: ConnectionStatus,
    pub last_connected: Option<DateTime<Utc>>,
    pub fast_attempts: u32,
    pub infinite_attempts: u32,
    pub sleeping: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct EndpointConnection {
    id: String,
    context: Arc<BridgeContext>,
    state: Mutex<EndpointState>,
}

impl EndpointConnection {
    pub fn new(endpoint: &Endpoint, context: Arc<BridgeContext>) -> Arc<Self> {
        let machine = ReconnectMachine::new(
            format!("endpoint {}", endpoint.id),
            endpoint.reconnect.clone(),
            context.limits.clone(),
        );
        Arc::new(Self {
            id: endpoint.id.clone(),
            context,
            state: Mutex::new(EndpointState {
                machine,
                cancel: CancellationToken::new(),
                outbound: None,
                url: endpoint.web_socket_url.clone(),
                status: ConnectionStatus::Disconnected,
                error: None,
            }),
        })
    }

    /// Apply an edited record. Returns true when the connection must be redialed:
    /// the URL changed, or nothing is connected or scheduled.
    pub fn update(&self, endpoint: &Endpoint) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        state.machine.set_policy(endpoint.reconnect.clone());

        let url_changed = state.url != endpoint.web_socket_url;
        state.url = endpoint.web_socket_url.clone();
        url_changed || matches!(state.machine.phase(), Phase::Disconnected | Phase::Terminal)
    }

    /// Tear down whatever is running and dial immediately with counters reset
    pub fn connect_now(self: &Arc<Self>) {
        let generation = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.cancel.cancel();
            state.cancel = CancellationToken::new();
            state.close_outbound();
            state.machine.reset();
            state.machine.generation()
        };
        tokio::spawn(Arc::clone(self).attempt(generation));
    }

    /// Close for good (disable, delete, shutdown). Pending retries go stale.
    pub fn close(&self) {
        let was_open = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.cancel.cancel();
            state.close_outbound();
            state.machine.manual_close();
            let was_open = state.status != ConnectionStatus::Disconnected;
            state.status = ConnectionStatus::Disconnected;
            was_open
        };
        if was_open {
            tracing::info!(endpoint_id = %self.id, "Endpoint connection closed");
            self.persist(ConnectionStatus::Disconnected, None);
        }
    }

    /// Queue a frame if the connection is open
    pub fn send_frame(&self, frame: &str) -> bool {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.outbound.clone())
            .is_some_and(|outbound| outbound.send(Message::Text(frame.to_string())).is_ok())
    }

    pub fn status(&self) -> EndpointStatus {
        let record = self.context.store.get_endpoint(&self.id);
        let (name, last_connected) = record
            .map(|e| (e.name, e.last_connected))
            .unwrap_or_default();

        match self.state.lock() {
            Ok(state) => EndpointStatus {
                id: self.id.clone(),
                name,
                url: state.url.clone(),
                status: state.status,
                last_connected,
                fast_attempts: state.machine.fast_attempts(),
                infinite_attempts: state.machine.infinite_attempts(),
                sleeping: state.machine.is_sleeping(),
                error: state.error.clone(),
            },
            Err(_) => EndpointStatus {
                id: self.id.clone(),
                name,
                url: String::new(),
                status: ConnectionStatus::Disconnected,
                last_connected,
                fast_attempts: 0,
                infinite_attempts: 0,
                sleeping: false,
                error: Some("state unavailable".to_string()),
            },
        }
    }

    fn persist(&self, status: ConnectionStatus, last_connected: Option<DateTime<Utc>>) {
        if let Err(e) = self
            .context
            .store
            .save_endpoint_status(&self.id, status, last_connected)
        {
            tracing::warn!(endpoint_id = %self.id, error = %e, "Failed to save endpoint status");
        }
    }

    /// Give up on a generation without scheduling a retry (record gone or disabled)
    fn abandon(&self, generation: u64) {
        if let Ok(mut state) = self.state.lock() {
            if state.machine.is_current(generation) {
                state.machine.manual_close();
                state.status = ConnectionStatus::Disconnected;
            }
        }
    }

    /// One connection attempt. Boxed so retries can schedule further attempts.
    fn attempt(self: Arc<Self>, generation: u64) -> BoxFuture<'static, ()> {
        async move {
            let cancel = {
                let Ok(mut state) = self.state.lock() else {
                    return;
                };
                if !state.machine.is_current(generation) || state.machine.begin_connect().is_none() {
                    return;
                }
                state.status = ConnectionStatus::Connecting;
                state.cancel.clone()
            };

            let bridge_enabled = self.context.store.system_settings().endpoints.enabled;
            let endpoint = self
                .context
                .store
                .get_endpoint(&self.id)
                .filter(|e| e.enabled && bridge_enabled);
            let Some(endpoint) = endpoint else {
                self.abandon(generation);
                return;
            };

            tracing::info!(
                endpoint_id = %self.id,
                url = %endpoint.web_socket_url,
                "Connecting to endpoint"
            );
            let connected = tokio::select! {
                _ = cancel.cancelled() => return,
                result = tokio::time::timeout(
                    CONNECT_TIMEOUT,
                    connect_async(endpoint.web_socket_url.as_str()),
                ) => result,
            };

            match connected {
                Ok(Ok((stream, _))) => self.serve(stream, generation, cancel).await,
                Ok(Err(e)) => self.on_failure(generation, e.to_string()),
                Err(_) => self.on_failure(generation, "connection timed out".to_string()),
            }
        }
        .boxed()
    }

    async fn serve(self: &Arc<Self>, stream: EndpointStream, generation: u64, cancel: CancellationToken) {
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if !state.machine.is_current(generation) {
                return;
            }
            state.machine.on_connected();
            state.outbound = Some(tx.clone());
            state.status = ConnectionStatus::Connected;
            state.error = None;
        }
        self.persist(ConnectionStatus::Connected, Some(Utc::now()));
        tracing::info!(endpoint_id = %self.id, "Endpoint connected");

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        if let Some(frame) = list_changed_frame() {
            let _ = tx.send(Message::Text(frame));
        }

        let reason = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break None,
                next = source.next() => next,
            };
            match next {
                Some(Ok(Message::Text(text))) => self.dispatch(text, tx.clone()),
                Some(Ok(Message::Close(frame))) => {
                    break Some(match frame {
                        Some(frame) => format!("closed by endpoint: {} {}", u16::from(frame.code), frame.reason),
                        None => "closed by endpoint".to_string(),
                    })
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(e.to_string()),
                None => break Some("stream ended".to_string()),
            }
        };
        drop(tx);

        if let Some(reason) = reason {
            self.on_failure(generation, reason);
        }
    }

    /// Serve one inbound frame on its own task
    fn dispatch(self: &Arc<Self>, text: String, outbound: mpsc::UnboundedSender<Message>) {
        let request = match serde_json::from_str::<JsonRpcMessage>(&text) {
            Ok(JsonRpcMessage::Request(request)) => request,
            Ok(JsonRpcMessage::Response(_)) => return,
            Err(e) => {
                tracing::warn!(endpoint_id = %self.id, error = %e, "Malformed frame from endpoint");
                return;
            }
        };

        let connection = Arc::clone(self);
        tokio::spawn(async move {
            let store = &connection.context.store;
            let Some(endpoint) = store.get_endpoint(&connection.id) else {
                return;
            };
            let smart_enabled = store.system_settings().smart_routing.enabled;
            let method = McpMethod::from_name(&request.method);
            let handler = &connection.context.handler;
            let scope = scope_for(handler.router(), &endpoint, smart_enabled, method);

            tracing::debug!(endpoint_id = %connection.id, method = %request.method, "Endpoint request");
            let Some(response) = handler.handle(request, &scope).await else {
                return;
            };
            match serde_json::to_string(&response) {
                Ok(frame) => {
                    let _ = outbound.send(Message::Text(frame));
                }
                Err(e) => {
                    tracing::error!(endpoint_id = %connection.id, error = %e, "Failed to serialize response")
                }
            }
        });
    }

    fn on_failure(self: &Arc<Self>, generation: u64, error: String) {
        let scheduled = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if !state.machine.is_current(generation) {
                return;
            }
            state.outbound = None;
            state.status = ConnectionStatus::Disconnected;
            state.error = Some(error.clone());
            (state.machine.on_failure(), state.cancel.clone())
        };
        self.persist(ConnectionStatus::Disconnected, None);
        tracing::warn!(endpoint_id = %self.id, error = %error, "Endpoint connection lost");

        match scheduled {
            (RetryDecision::Retry { delay, generation }, cancel) => {
                tracing::info!(endpoint_id = %self.id, delay = ?delay, "Scheduling endpoint reconnect");
                let connection = Arc::clone(self);
                spawn_retry(delay, cancel, move || connection.attempt(generation));
            }
            (RetryDecision::Exhausted, _) => {
                tracing::error!(endpoint_id = %self.id, "Giving up on endpoint after exhausting reconnect attempts");
            }
            (RetryDecision::Stopped, _) => {}
        }
    }
}

/// `notifications/tools/list_changed` as a text frame
pub fn list_changed_frame() -> Option<String> {
    serde_json::to_string(&JsonRpcRequest::notification(METHOD_TOOLS_LIST_CHANGED, None)).ok()
}
