//! Error Taxonomy
//!
//! Startup and resource failures are fatal: the toolkit has no degraded mode
//! without its globals, its shared-memory transport, or its self-pipe.
//! Loop-level I/O failures are not errors; they end the main loop with a
//! `LoopExit` (see `crate::event_loop`).

use std::io;
use std::path::PathBuf;

use crate::protocol::Capability;
use crate::window::ContextId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to connect to the display server: {0}")]
    Connect(String),

    #[error("display server does not advertise required global `{0}`")]
    MissingGlobal(Capability),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("XDG_RUNTIME_DIR is not set, shared memory is unavailable")]
    NoRuntimeDir,

    #[error("failed to create backing file in {dir:?}")]
    BackingFile {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to map {size} bytes of shared memory")]
    Map {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("invalid buffer size {width}x{height}")]
    BufferSize { width: u32, height: u32 },

    #[error("failed to set up signal delivery")]
    Signal(#[source] io::Error),

    #[error("event queue is full ({capacity} events)")]
    QueueFull { capacity: usize },

    #[error("no drawing context with id {0:?}")]
    UnknownContext(ContextId),

    #[error("a window already exists on this session")]
    WindowExists,

    #[error("no window exists on this session")]
    NoWindow,
}

impl Error {
    /// Whether the error belongs to the fatal startup/resource tier
    ///
    /// Fatal errors mean a precondition for correct operation is gone; the
    /// caller is expected to log and exit. The rest are caller mistakes.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::UnknownContext(_) | Error::WindowExists | Error::NoWindow
        )
    }
}
