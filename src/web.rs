// src/web.rs
use crate::config::AppConfig;
use crate::event_loop::{HttpResponse, LoopCommand};
use crate::module::{ConnectionId, HttpRequest};
use crate::registry::{client_pair, Channel, ClientEndpoint};
use anyhow::Result;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc::Sender as MpscSender, oneshot, watch::Receiver as WatchReceiver};
use tracing::{debug, info, warn};

/// Sub-protocol names that select a streaming channel.
#[derive(Debug, Clone)]
pub struct ChannelProtocols {
    pub time: String,
    pub reload: String,
}

impl Default for ChannelProtocols {
    fn default() -> Self {
        Self {
            time: "time".to_string(),
            reload: "livereload".to_string(),
        }
    }
}

impl ChannelProtocols {
    /// First protocol in a `Sec-WebSocket-Protocol` header value that names a channel.
    pub fn select(&self, offered: &str) -> Option<Channel> {
        offered.split(',').map(str::trim).find_map(|p| {
            if p == self.time {
                Some(Channel::Time)
            } else if p == self.reload {
                Some(Channel::Reload)
            } else {
                None
            }
        })
    }

    fn name(&self, channel: Channel) -> String {
        match channel {
            Channel::Time => self.time.clone(),
            Channel::Reload => self.reload.clone(),
        }
    }
}

/// Shared state of the transport layer. It holds no host state, only the way
/// to reach the event loop.
pub struct WebState {
    commands: MpscSender<LoopCommand>,
    protocols: ChannelProtocols,
    /// Offer WebSocket upgrades at all.
    streaming: bool,
    next_id: AtomicU64,
}

impl WebState {
    pub fn new(commands: MpscSender<LoopCommand>, protocols: ChannelProtocols, streaming: bool) -> Self {
        Self {
            commands,
            protocols,
            streaming,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(commands: MpscSender<LoopCommand>, config: &AppConfig) -> Self {
        Self::new(
            commands,
            ChannelProtocols {
                time: config.time_protocol.clone(),
                reload: config.reload_protocol.clone(),
            },
            !config.prod,
        )
    }

    fn next_connection(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl IntoResponse for HttpResponse {
    fn into_response(self) -> Response {
        (
            self.status,
            [(header::CONTENT_TYPE, self.content_type)],
            self.body,
        )
            .into_response()
    }
}

/// Single entry point for every request: streaming upgrades go to a channel,
/// everything else is answered by the active module through the event loop.
async fn dispatch(
    State(state): State<Arc<WebState>>,
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let id = state.next_connection();

    if let (true, Some(ws)) = (state.streaming, ws) {
        let offered = headers
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let Some(channel) = state.protocols.select(offered) else {
            warn!("WebSocket upgrade {} without a known sub-protocol: {:?}", id, offered);
            return (StatusCode::BAD_REQUEST, "unknown sub-protocol").into_response();
        };
        debug!("New {} channel connection request {}.", channel, id);
        let commands = state.commands.clone();
        return ws
            .protocols([state.protocols.name(channel)])
            .on_upgrade(move |socket| handle_socket(socket, channel, id, commands));
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    let command = LoopCommand::Http {
        request: HttpRequest::new(uri.path(), id),
        reply: reply_tx,
    };
    if state.commands.send(command).await.is_err() {
        warn!("Event loop is gone, cannot serve {}", uri.path());
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match reply_rx.await {
        Ok(response) => response.into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

/// Handles a single streaming connection.
///
/// Registers the connection with the event loop, then forwards queued
/// payloads as text frames until the client leaves or the host asks for a
/// close. A connection the registry did not track has its queue closed at
/// once and stays open, silent, until the client goes away.
async fn handle_socket(
    socket: WebSocket,
    channel: Channel,
    id: ConnectionId,
    commands: MpscSender<LoopCommand>,
) {
    let (client, endpoint): (_, ClientEndpoint) = client_pair(id);
    if commands
        .send(LoopCommand::ChannelOpened { channel, client })
        .await
        .is_err()
    {
        return;
    }

    let (mut payloads, close) = endpoint.into_parts();
    let (mut sender, mut receiver) = socket.split();
    let mut outbound_open = true;

    loop {
        tokio::select! {
            biased;
            _ = close.notified() => {
                debug!("Closing {} client {} on request.", channel, id);
                let frame = CloseFrame {
                    code: close_code::AWAY,
                    reason: "reload".into(),
                };
                if sender.send(Message::Close(Some(frame))).await.is_err() {
                    debug!("Close frame to {} client {} not delivered.", channel, id);
                }
                break;
            }
            payload = payloads.recv(), if outbound_open => match payload {
                Some(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        debug!("Failed to send to {} client {}, client disconnected?", channel, id);
                        break;
                    }
                }
                None => outbound_open = false,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => {
                    debug!("{} client {} closed the connection.", channel, id);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("{} client {} errored: {}", channel, id, e);
                    break;
                }
            },
        }
    }

    let _ = commands.send(LoopCommand::ChannelClosed { channel, id }).await;
}

/// Binds the listening socket. Done once; the listener outlives every reload.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let socket_addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(socket_addr).await?;
    info!("Server listening on http://{}", listener.local_addr()?);
    Ok(listener)
}

/// Serves requests on `listener` until the shutdown signal fires.
pub async fn start_server(
    listener: TcpListener,
    state: WebState,
    shutdown_signal: WatchReceiver<bool>,
) -> Result<()> {
    let app = Router::new().fallback(dispatch).with_state(Arc::new(state));

    let mut shutdown = shutdown_signal.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
            info!("Web server shutting down gracefully.");
        })
        .await?;

    info!("Web server stopped.");
    Ok(())
}
