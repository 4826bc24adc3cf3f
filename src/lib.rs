//! Waykit
//!
//! A minimal Wayland windowing toolkit: one connection, one top-level window,
//! shared-memory pixel buffers drawn by registered callbacks, and sub-region
//! drawing contexts with their own event queues. A single-threaded poll loop
//! multiplexes the protocol socket with a self-pipe fed by SIGINT.

pub mod config;
pub mod error;
pub mod event;
pub mod event_loop;
pub mod output;
pub mod protocol;
pub mod session;
pub mod shared;
pub mod wayland;
pub mod window;

#[cfg(test)]
mod mock;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, EventKind, EventQueue, MAX_EVENTS};
pub use event_loop::{BreakHandle, LoopEvent, LoopExit};
pub use output::{Mode, Output};
pub use protocol::{Backend, ProtocolEvent};
pub use session::Session;
pub use shared::Geometry;
pub use wayland::WaylandBackend;
pub use window::{Canvas, ContextHandler, ContextId, DrawId, Drawable, Flow, Window};

/// Re-exported so draw callbacks can name colors and paths
pub use tiny_skia;
