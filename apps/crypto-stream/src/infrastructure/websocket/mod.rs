//! Subscriber WebSocket Server
//!
//! Hosts one [`SubscriptionSession`] per connection at `/ws/crypto/{symbol}`.
//! The upgrade is always accepted; an unknown symbol is answered with an
//! immediate policy-violation close frame.
//!
//! Each connection runs a single loop that forwards the session's live feed
//! and answers inbound requests. Request replies are polled alongside the
//! feed, so a slow store read never holds up live delivery. The loop ends
//! when the client goes away, the broker evicts the session, or the server
//! is cancelled; in every case the session leaves the broker.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Path, State,
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code},
    },
    response::Response,
    routing::get,
};
use futures_util::stream::{FuturesOrdered, SplitSink};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::ports::TradeStore;
use crate::application::services::{ServerMessage, SessionError, SubscriptionSession};
use crate::domain::trade::Symbol;
use crate::infrastructure::broadcast::FanoutBroker;
use crate::infrastructure::metrics;

/// Requests answered concurrently per connection. Further inbound frames
/// wait in the socket until a reply completes.
pub const MAX_PENDING_REQUESTS: usize = 8;

// =============================================================================
// State
// =============================================================================

/// Shared state for subscriber connections.
pub struct SubscriberServerState {
    broker: Arc<FanoutBroker>,
    store: Arc<dyn TradeStore>,
    cancel: CancellationToken,
}

impl SubscriberServerState {
    /// Create new subscriber server state.
    #[must_use]
    pub fn new(
        broker: Arc<FanoutBroker>,
        store: Arc<dyn TradeStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            broker,
            store,
            cancel,
        }
    }
}

// =============================================================================
// Server
// =============================================================================

/// Build the subscriber router.
pub fn router(state: Arc<SubscriberServerState>) -> Router {
    Router::new()
        .route("/ws/crypto/{symbol}", get(upgrade_handler))
        .with_state(state)
}

/// Subscriber WebSocket server.
pub struct SubscriberServer {
    port: u16,
    state: Arc<SubscriberServerState>,
}

impl SubscriberServer {
    /// Create a new subscriber server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<SubscriberServerState>) -> Self {
        Self { port, state }
    }

    /// Bind the configured port and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `SubscriberServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), SubscriberServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SubscriberServerError::BindFailed(self.port, e.to_string()))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `SubscriberServerError::ServerFailed` on a fatal server error.
    pub async fn serve(self, listener: TcpListener) -> Result<(), SubscriberServerError> {
        let cancel = self.state.cancel.clone();
        let local = listener.local_addr().ok();
        tracing::info!(addr = ?local, "Subscriber server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .map_err(|e| SubscriberServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Subscriber server stopped");
        Ok(())
    }
}

// =============================================================================
// Connection Handling
// =============================================================================

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    Path(symbol): Path<String>,
    State(state): State<Arc<SubscriberServerState>>,
) -> Response {
    let symbol = Symbol::new(symbol);
    ws.on_upgrade(move |socket| serve_connection(socket, symbol, state))
}

async fn serve_connection(mut socket: WebSocket, symbol: Symbol, state: Arc<SubscriberServerState>) {
    let opened = SubscriptionSession::open(
        symbol.clone(),
        Arc::clone(&state.broker),
        Arc::clone(&state.store),
    )
    .await;

    let (session, mut feed) = match opened {
        Ok(opened) => opened,
        Err(SessionError::UnknownSymbol(_)) => {
            let _ = socket
                .send(close(close_code::POLICY, "unknown symbol"))
                .await;
            return;
        }
        Err(e) => {
            tracing::error!(symbol = %symbol, error = %e, "Failed to open subscriber session");
            let _ = socket
                .send(close(close_code::ERROR, "session unavailable"))
                .await;
            return;
        }
    };
    metrics::set_active_subscribers(state.broker.total_subscribers());

    let (mut sink, mut stream) = socket.split();
    let session = &session;
    let mut pending = FuturesOrdered::new();

    loop {
        tokio::select! {
            biased;

            () = state.cancel.cancelled() => {
                let _ = sink.send(close(close_code::AWAY, "server shutting down")).await;
                break;
            }

            outbound = feed.recv() => {
                let Some(message) = outbound else {
                    tracing::warn!(
                        symbol = %symbol,
                        subscriber = %session.subscriber_id(),
                        "Subscriber fell behind, closing"
                    );
                    let _ = sink.send(close(close_code::AGAIN, "subscriber too slow")).await;
                    break;
                };
                if send_json(&mut sink, &message).await.is_err() {
                    break;
                }
            }

            Some(reply) = pending.next(), if !pending.is_empty() => {
                if send_json(&mut sink, &reply).await.is_err() {
                    break;
                }
            }

            inbound = stream.next(), if pending.len() < MAX_PENDING_REQUESTS => match inbound {
                Some(Ok(Message::Text(text))) => {
                    pending.push_back(async move { session.handle_request(text.as_str()).await });
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(symbol = %symbol, error = %e, "Subscriber socket error");
                    break;
                }
            },
        }
    }

    drop(pending);
    session.close();
    metrics::set_active_subscribers(state.broker.total_subscribers());
}

fn close(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    }))
}

async fn send_json(
    sink: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(message) {
        Ok(json) => sink.send(Message::Text(json.into())).await,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode subscriber message");
            Ok(())
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Subscriber server errors.
#[derive(Debug, thiserror::Error)]
pub enum SubscriberServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}
