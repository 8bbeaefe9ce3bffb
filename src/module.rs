//! The swappable unit of request-handling logic and the seam the host loads it through.
//!
//! The host never cares how a [`Module`] is obtained. It asks a [`ModuleSource`]
//! to build and then load one, and from then on only calls the three
//! capabilities below.

use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Opaque identity of a transport-level connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Descriptor of an inbound HTTP request handed to the active module.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    path: String,
    connection: ConnectionId,
}

impl HttpRequest {
    pub fn new(path: impl Into<String>, connection: ConnectionId) -> Self {
        Self {
            path: path.into(),
            connection,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn path_len(&self) -> usize {
        self.path.len()
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }
}

/// The capability set every loadable unit provides.
///
/// All three calls must work without any per-call setup from the host.
pub trait Module: Send + Sync {
    /// Produces the response body for a request, or `None` to let the host
    /// substitute its fallback body.
    fn handle_http(&self, request: &HttpRequest) -> Option<String>;

    /// Produces the payload pushed to time-channel clients on each tick.
    fn push_payload(&self) -> Option<String>;

    /// Called once, right after this unit became the active one.
    fn on_swap(&self);
}

/// Where modules come from: a build step that produces an artifact and a
/// loader that turns the artifact into a [`Module`].
pub trait ModuleSource: Send + Sync {
    fn build(&mut self) -> Result<(), BuildError>;

    fn load(&mut self) -> Result<Box<dyn Module>, LoadError>;
}

/// Failure of the external build step.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to spawn build command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("build command `{command}` exited with {status}")]
    Failed { command: String, status: ExitStatus },
    #[error("build failed: {0}")]
    Other(String),
}

/// Failure to turn a built artifact into a usable module.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("artifact not found: {}", .0.display())]
    ArtifactMissing(PathBuf),
    #[error("failed to stage artifact {}: {source}", .path.display())]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open library: {0}")]
    Open(String),
    #[error("entry symbol `{0}` not found")]
    MissingEntry(String),
    #[error("entry point returned a null capability table")]
    NullTable,
    #[error("capability `{0}` is missing")]
    MissingCapability(&'static str),
}
