//! WebSocket signaling client
//!
//! Frames are JSON objects tagged by `kind`:
//! - client → server: `signal` (an [`OutboundSignal`]) or `request`
//!   (a [`CreateSessionRequest`] with a `request_id`)
//! - server → client: `signal` (an [`InboundSignal`]) or `reply`
//!   (matching a `request_id`)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::channel::{SessionDirectory, SignalingChannel, SubscriberSet, Subscription};
use super::error::SignalingError;
use super::message::{
    ConversationId, CreateSessionRequest, CreatedSession, InboundSignal, OutboundSignal,
};

/// Default time to wait for a `create_session` reply
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames sent by the client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientFrame {
    Signal {
        signal: OutboundSignal,
    },
    Request {
        request_id: Uuid,
        create_session: CreateSessionRequest,
    },
}

/// Frames sent by the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
    Signal {
        signal: InboundSignal,
    },
    Reply {
        request_id: Uuid,
        #[serde(default)]
        session: Option<CreatedSession>,
        #[serde(default)]
        error: Option<String>,
    },
}

type PendingReplies =
    Arc<Mutex<HashMap<Uuid, oneshot::Sender<Result<CreatedSession, SignalingError>>>>>;

/// Signaling client for connecting to a signaling server
pub struct SignalingClient {
    server_url: String,
    request_timeout: Duration,
}

impl SignalingClient {
    /// Create a new signaling client
    pub fn new(server_url: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override how long `create_session` waits for its reply
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Connect to the signaling server
    pub async fn connect(&self) -> Result<WsSignalingChannel, SignalingError> {
        let (ws_stream, _) = connect_async(&self.server_url)
            .await
            .map_err(|e| SignalingError::ConnectFailed(e.to_string()))?;

        debug!("Connected to signaling server: {}", self.server_url);

        Ok(WsSignalingChannel::from_stream(
            ws_stream,
            self.request_timeout,
        ))
    }
}

/// An active connection to the signaling server
pub struct WsSignalingChannel {
    outbound: mpsc::UnboundedSender<Message>,
    subscribers: SubscriberSet,
    pending: PendingReplies,
    request_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsSignalingChannel {
    /// Drive an already established WebSocket stream
    pub fn from_stream<S>(ws_stream: WebSocketStream<S>, request_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut write, read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    warn!("Signaling send failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let subscribers = SubscriberSet::new();
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_loop(read, subscribers.clone(), pending.clone()));

        Self {
            outbound,
            subscribers,
            pending,
            request_timeout,
            reader,
            writer,
        }
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Send a close frame; the reader stops when the server acknowledges
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }

    fn queue(&self, frame: &ClientFrame) -> Result<(), SignalingError> {
        let json = serde_json::to_string(frame)?;
        self.outbound
            .send(Message::Text(json))
            .map_err(|_| SignalingError::Closed)
    }
}

impl Drop for WsSignalingChannel {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_loop<S>(
    mut read: SplitStream<WebSocketStream<S>>,
    subscribers: SubscriberSet,
    pending: PendingReplies,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                Ok(ServerFrame::Signal { signal }) => {
                    let delivered = subscribers.publish(&signal);
                    trace!("Signal {} delivered to {} subscribers", signal.name(), delivered);
                }
                Ok(ServerFrame::Reply {
                    request_id,
                    session,
                    error,
                }) => {
                    let waiter = pending.lock().remove(&request_id);
                    let Some(waiter) = waiter else {
                        debug!("Reply for unknown request {}", request_id);
                        continue;
                    };
                    let result = match (session, error) {
                        (Some(session), _) => Ok(session),
                        (None, Some(error)) => Err(SignalingError::Rejected(error)),
                        (None, None) => Err(SignalingError::Rejected("empty reply".to_string())),
                    };
                    let _ = waiter.send(result);
                }
                Err(e) => {
                    warn!("Invalid signaling message: {}", e);
                }
            },
            Some(Ok(Message::Close(_))) | None => {
                break;
            }
            Some(Err(e)) => {
                warn!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    for (_, waiter) in pending.lock().drain() {
        let _ = waiter.send(Err(SignalingError::Closed));
    }
    subscribers.close_all();
    debug!("Signaling connection closed");
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    async fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError> {
        trace!("Sending {}", signal.name());
        self.queue(&ClientFrame::Signal { signal })
    }

    fn subscribe(&self, conversation_id: &ConversationId) -> Subscription {
        self.subscribers.subscribe(conversation_id)
    }
}

#[async_trait]
impl SessionDirectory for WsSignalingChannel {
    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, SignalingError> {
        let request_id = Uuid::new_v4();
        let frame = ClientFrame::Request {
            request_id,
            create_session: request,
        };
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        if let Err(e) = self.queue(&frame) {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SignalingError::Closed),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(SignalingError::Timeout)
            }
        }
    }
}
