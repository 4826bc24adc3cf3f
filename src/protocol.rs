//! Protocol Boundary
//!
//! Everything the toolkit core needs from the display server, expressed as a
//! trait (`Backend`) for requests and an enum (`ProtocolEvent`) for the
//! notifications the server sends back. The production implementation lives
//! in `crate::wayland`; tests drive the core through a scripted backend.

use std::io;
use std::os::fd::BorrowedFd;

use crate::error::Result;

/// Pixel format code for 32-bit ARGB (`wl_shm` format 0, premultiplied, little-endian)
pub const FORMAT_ARGB8888: u32 = 0;

/// Pixel format code for 32-bit RGB with an ignored alpha byte (`wl_shm` format 1)
pub const FORMAT_XRGB8888: u32 = 1;

/// Handle of a top-level surface (surface + shell surface + toplevel)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u32);

/// Handle of a server-side buffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

/// Handle of a bound output, keyed by the registry name of its global
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct OutputId(pub u32);

/// Server globals the toolkit cannot run without
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Compositor,
    Shm,
    Seat,
    Output,
    Shell,
}

impl Capability {
    /// Every required capability, in binding order
    pub const ALL: [Capability; 5] = [
        Capability::Compositor,
        Capability::Shm,
        Capability::Seat,
        Capability::Output,
        Capability::Shell,
    ];

    /// Registry interface name advertised by the server
    pub fn interface(self) -> &'static str {
        match self {
            Capability::Compositor => "wl_compositor",
            Capability::Shm => "wl_shm",
            Capability::Seat => "wl_seat",
            Capability::Output => "wl_output",
            Capability::Shell => "xdg_wm_base",
        }
    }

    /// Minimum protocol version the toolkit binds at
    pub fn version(self) -> u32 {
        match self {
            Capability::Compositor => 3,
            Capability::Shm => 1,
            Capability::Seat => 4,
            Capability::Output => 2,
            Capability::Shell => 1,
        }
    }

    /// Look up the capability for a registry interface name
    pub fn from_interface(interface: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|cap| cap.interface() == interface)
    }

    /// Version to bind given what the server advertises
    pub fn bind_version(self, advertised: u32) -> u32 {
        self.version().min(advertised)
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.interface())
    }
}

/// Bound versions of the required globals after the registry round-trip
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Globals {
    pub compositor: Option<u32>,
    pub shm: Option<u32>,
    pub seat: Option<u32>,
    pub output: Option<u32>,
    pub shell: Option<u32>,
}

impl Globals {
    /// Record a bound capability
    pub fn set(&mut self, capability: Capability, version: u32) {
        let slot = match capability {
            Capability::Compositor => &mut self.compositor,
            Capability::Shm => &mut self.shm,
            Capability::Seat => &mut self.seat,
            Capability::Output => &mut self.output,
            Capability::Shell => &mut self.shell,
        };
        *slot = Some(version);
    }

    /// Bound version of a capability, if bound
    pub fn get(&self, capability: Capability) -> Option<u32> {
        match capability {
            Capability::Compositor => self.compositor,
            Capability::Shm => self.shm,
            Capability::Seat => self.seat,
            Capability::Output => self.output,
            Capability::Shell => self.shell,
        }
    }

    /// First required capability the server did not advertise
    pub fn first_missing(&self) -> Option<Capability> {
        Capability::ALL.into_iter().find(|cap| self.get(*cap).is_none())
    }
}

/// Notifications delivered by the display server
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// Output geometry (position, physical size, layout hints, identification)
    OutputGeometry {
        output: OutputId,
        x: i32,
        y: i32,
        physical_width: i32,
        physical_height: i32,
        subpixel: u32,
        make: String,
        model: String,
        transform: u32,
    },

    /// One mode of an output
    OutputMode {
        output: OutputId,
        width: i32,
        height: i32,
        refresh: i32,
        current: bool,
        preferred: bool,
    },

    /// All output properties have been sent
    OutputDone { output: OutputId },

    /// Output scale factor
    OutputScale { output: OutputId, factor: i32 },

    /// Shell liveness ping, must be answered with a pong carrying `serial`
    Ping { serial: u32 },

    /// Seat capability bitmask (pointer = 1, keyboard = 2, touch = 4)
    SeatCapabilities { capabilities: u32 },

    /// A pixel format the shared-memory allocator supports
    ShmFormat { format: u32 },

    /// Surface configure, must be acknowledged with `serial`
    SurfaceConfigure { surface: SurfaceId, serial: u32 },

    /// Proposed top-level geometry (zero means "client decides")
    ToplevelConfigure {
        surface: SurfaceId,
        width: i32,
        height: i32,
    },

    /// The server asks the top-level to close
    ToplevelClose { surface: SurfaceId },

    /// The server no longer reads the buffer's memory
    BufferRelease { buffer: BufferId },
}

/// Requests the toolkit core issues to the display server
///
/// Methods that create objects return handles; methods on unknown handles are
/// ignored. Outgoing requests are buffered until `flush`.
pub trait Backend {
    /// Bind every advertised required global after a registry round-trip.
    /// Events received during the round-trip are appended to `events`.
    fn bind_globals(&mut self, events: &mut Vec<ProtocolEvent>) -> Result<Globals>;

    /// Block until the server has processed every request sent so far
    fn roundtrip(&mut self, events: &mut Vec<ProtocolEvent>) -> Result<()>;

    /// Connection file descriptor for the readiness wait
    fn connection_fd(&self) -> BorrowedFd<'_>;

    /// Deliver events already read from the socket, without blocking
    fn dispatch_pending(&mut self, events: &mut Vec<ProtocolEvent>) -> Result<()>;

    /// Write buffered requests; `WouldBlock` is a transient condition
    fn flush(&mut self) -> io::Result<()>;

    /// Announce the intent to read. Returns `false` when events are already
    /// queued and must be dispatched first.
    fn prepare_read(&mut self) -> bool;

    /// Abandon a prepared read
    fn cancel_read(&mut self);

    /// Read from the socket after the readiness wait reported input
    fn read_events(&mut self) -> Result<()>;

    /// Answer a shell ping
    fn pong(&mut self, serial: u32);

    /// Create a surface wrapped in a shell top-level
    fn create_toplevel(&mut self, title: &str, app_id: &str) -> Result<SurfaceId>;

    /// Declare the visible window geometry of a top-level
    fn set_window_geometry(&mut self, surface: SurfaceId, x: i32, y: i32, width: i32, height: i32);

    /// Acknowledge a surface configure
    fn ack_configure(&mut self, surface: SurfaceId, serial: u32);

    /// Destroy a top-level and its surface
    fn destroy_toplevel(&mut self, surface: SurfaceId);

    /// Create a pool over `fd`, carve one buffer from it, and destroy the pool
    fn create_shm_buffer(
        &mut self,
        fd: BorrowedFd<'_>,
        size: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: u32,
    ) -> Result<BufferId>;

    /// Destroy a server-side buffer object
    fn destroy_buffer(&mut self, buffer: BufferId);

    /// Attach a buffer as the surface's pending content
    fn attach(&mut self, surface: SurfaceId, buffer: Option<BufferId>);

    /// Mark a surface-local rectangle as damaged
    fn damage(&mut self, surface: SurfaceId, x: i32, y: i32, width: i32, height: i32);

    /// Apply the surface's pending state
    fn commit(&mut self, surface: SurfaceId);

    /// Release bound globals in reverse dependency order, then the registry
    fn release_globals(&mut self);

    /// Close the connection
    fn disconnect(&mut self);
}
