//! The loop that owns the active module, both client registries and the tick
//! timer, and is the only place any of them is touched.
//!
//! Transport tasks never share that state; they send [`LoopCommand`]s and,
//! for HTTP, wait on a reply channel. The reload flag is the one piece of
//! cross-thread state, and the loop reads-and-clears it after servicing each
//! wakeup.

use crate::broadcaster::PeriodicBroadcaster;
use crate::config::AppConfig;
use crate::module::{ConnectionId, HttpRequest};
use crate::registry::{Channel, ClientHandle, ClientRegistry};
use crate::reload::{ReloadCoordinator, ReloadFlag, ReloadOutcome};
use axum::http::StatusCode;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::block_in_place;
use tracing::{debug, info};

/// Body served when no module answered.
pub const DEV_FALLBACK_BODY: &str = "<html><body><h1>No handler</h1></body></html>";
/// Fallback body in production mode.
pub const PROD_FALLBACK_BODY: &str = "error";

/// Messages from transport tasks to the loop.
#[derive(Debug)]
pub enum LoopCommand {
    Http {
        request: HttpRequest,
        reply: oneshot::Sender<HttpResponse>,
    },
    ChannelOpened {
        channel: Channel,
        client: ClientHandle,
    },
    ChannelClosed {
        channel: Channel,
        id: ConnectionId,
    },
}

/// A complete response, framed by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
}

impl HttpResponse {
    pub fn html(status: StatusCode, body: String) -> Self {
        Self {
            status,
            content_type: "text/html",
            body,
        }
    }

    pub fn text(status: StatusCode, body: String) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body,
        }
    }
}

/// Tunables for [`EventLoop`].
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub tick_interval: Duration,
    /// Upper bound on how long a reload request can wait if a wakeup is missed.
    pub poll_timeout: Duration,
    pub max_clients: usize,
    pub fallback_body: String,
    /// Serve `/time` from the push payload instead of the module's handler.
    pub time_endpoint: bool,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            tick_interval: crate::broadcaster::TICK_INTERVAL,
            poll_timeout: Duration::from_secs(1),
            max_clients: crate::registry::DEFAULT_CAPACITY,
            fallback_body: DEV_FALLBACK_BODY.to_string(),
            time_endpoint: false,
        }
    }
}

impl LoopSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            max_clients: config.max_clients,
            fallback_body: if config.prod {
                PROD_FALLBACK_BODY.to_string()
            } else {
                DEV_FALLBACK_BODY.to_string()
            },
            time_endpoint: config.prod,
        }
    }
}

pub struct EventLoop {
    coordinator: ReloadCoordinator,
    reload: ReloadFlag,
    time_clients: ClientRegistry,
    reload_clients: ClientRegistry,
    settings: LoopSettings,
}

impl EventLoop {
    /// `coordinator` should already hold the initially loaded module.
    pub fn new(coordinator: ReloadCoordinator, reload: ReloadFlag, settings: LoopSettings) -> Self {
        Self {
            coordinator,
            reload,
            time_clients: ClientRegistry::with_capacity(Channel::Time, settings.max_clients),
            reload_clients: ClientRegistry::with_capacity(Channel::Reload, settings.max_clients),
            settings,
        }
    }

    pub fn coordinator(&self) -> &ReloadCoordinator {
        &self.coordinator
    }

    pub fn registry(&self, channel: Channel) -> &ClientRegistry {
        match channel {
            Channel::Time => &self.time_clients,
            Channel::Reload => &self.reload_clients,
        }
    }

    fn registry_mut(&mut self, channel: Channel) -> &mut ClientRegistry {
        match channel {
            Channel::Time => &mut self.time_clients,
            Channel::Reload => &mut self.reload_clients,
        }
    }

    /// Runs until `shutdown` turns true or every command sender is gone, then
    /// cancels the timer and releases the active module.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<LoopCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = PeriodicBroadcaster::start(self.settings.tick_interval);
        let poll_timeout = self.settings.poll_timeout;
        info!(
            "Event loop running (tick every {:?}, generation {})",
            ticker.period(),
            self.coordinator.generation()
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Event loop shutting down.");
                        break;
                    }
                }
                _ = self.reload.notified() => {
                    debug!("Woken for reload");
                }
                _ = ticker.tick() => {
                    let sent = PeriodicBroadcaster::fire(self.coordinator.active(), &self.time_clients);
                    if sent > 0 {
                        debug!("Tick delivered to {} client(s)", sent);
                    }
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("Command channel closed. Event loop exiting.");
                        break;
                    }
                },
                _ = tokio::time::sleep(poll_timeout) => {}
            }

            self.check_reload();
        }

        drop(ticker);
        debug!("Tick timer cancelled");
        if self.coordinator.release() {
            info!("Active module released");
        }
    }

    /// Runs one reload cycle if a request is pending.
    pub fn check_reload(&mut self) -> Option<ReloadOutcome> {
        if !self.reload.take() {
            return None;
        }
        let coordinator = &mut self.coordinator;
        let outcome = run_blocking(|| coordinator.reload_cycle());
        if let ReloadOutcome::Swapped { .. } = outcome {
            let closed = self.reload_clients.force_close_all();
            info!("[livereload] closed {} client(s) to trigger refresh", closed);
        }
        Some(outcome)
    }

    pub fn handle_command(&mut self, command: LoopCommand) {
        match command {
            LoopCommand::Http { request, reply } => {
                let response = self.dispatch(&request);
                if reply.send(response).is_err() {
                    debug!("HTTP client {} went away before the reply", request.connection());
                }
            }
            LoopCommand::ChannelOpened { channel, client } => {
                let id = client.id();
                let registry = self.registry_mut(channel);
                if registry.add(client) {
                    info!("[{}] client {} connected ({} total)", channel, id, registry.len());
                } else {
                    debug!(
                        "[{}] client {} not tracked ({} of {} slots used)",
                        channel,
                        id,
                        registry.len(),
                        registry.capacity()
                    );
                }
            }
            LoopCommand::ChannelClosed { channel, id } => {
                let registry = self.registry_mut(channel);
                match registry.take(id) {
                    Some(client) => info!(
                        "[{}] client {} disconnected after {:.1?} ({} total)",
                        channel,
                        id,
                        client.connected_at().elapsed(),
                        registry.len()
                    ),
                    None => debug!("[{}] untracked client {} disconnected", channel, id),
                }
            }
        }
    }

    /// Answers a request from the active module, substituting the fallback
    /// body when there is no module or it returned nothing.
    pub fn dispatch(&self, request: &HttpRequest) -> HttpResponse {
        let module = self.coordinator.active();

        if self.settings.time_endpoint && request.path().starts_with("/time") {
            let body = module
                .and_then(|m| m.push_payload())
                .unwrap_or_else(|| self.settings.fallback_body.clone());
            return HttpResponse::text(StatusCode::OK, body);
        }

        match module {
            Some(module) => {
                let body = module
                    .handle_http(request)
                    .unwrap_or_else(|| self.settings.fallback_body.clone());
                HttpResponse::html(StatusCode::OK, body)
            }
            None => HttpResponse::html(
                StatusCode::SERVICE_UNAVAILABLE,
                self.settings.fallback_body.clone(),
            ),
        }
    }
}

/// Runs a blocking build-and-load off the worker pool's books when the
/// runtime allows it; a current-thread runtime just runs it inline.
fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => block_in_place(f),
        _ => f(),
    }
}
