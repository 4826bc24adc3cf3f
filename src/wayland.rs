//! Wayland Backend
//!
//! The production `Backend`: `wayland-client` for the core protocol and
//! `wayland-protocols` for xdg-shell. Listener callbacks translate server
//! events into `ProtocolEvent`s collected in an inbox; the session drains it
//! after every dispatch.

use std::collections::HashMap;
use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use wayland_client::backend::{Backend as ConnectionBackend, ReadEventsGuard, WaylandError};
use wayland_client::protocol::{
    wl_buffer::{self, WlBuffer},
    wl_compositor::WlCompositor,
    wl_output::{self, WlOutput},
    wl_registry::{self, WlRegistry},
    wl_seat::{self, WlSeat},
    wl_shm::{self, WlShm},
    wl_shm_pool::WlShmPool,
    wl_surface::WlSurface,
};
use wayland_client::{delegate_noop, Connection, Dispatch, EventQueue, QueueHandle};
use wayland_protocols::xdg::shell::client::{
    xdg_surface::{self, XdgSurface},
    xdg_toplevel::{self, XdgToplevel},
    xdg_wm_base::{self, XdgWmBase},
};

use crate::error::{Error, Result};
use crate::protocol::{
    Backend, BufferId, Capability, Globals, OutputId, ProtocolEvent, SurfaceId,
};

/// `wl_output.mode` flag bits
const MODE_CURRENT: u32 = 0x1;
const MODE_PREFERRED: u32 = 0x2;

/// One advertised registry global
#[derive(Debug, Clone)]
struct Advertised {
    name: u32,
    interface: String,
    version: u32,
}

/// Protocol objects behind one `SurfaceId`
struct Toplevel {
    surface: WlSurface,
    xdg_surface: XdgSurface,
    toplevel: XdgToplevel,
}

/// Listener state; every callback lands here
#[derive(Default)]
struct State {
    advertised: Vec<Advertised>,
    inbox: Vec<ProtocolEvent>,

    registry: Option<WlRegistry>,
    compositor: Option<WlCompositor>,
    shm: Option<WlShm>,
    seat: Option<WlSeat>,
    outputs: Vec<WlOutput>,
    wm_base: Option<XdgWmBase>,

    toplevels: HashMap<SurfaceId, Toplevel>,
    buffers: HashMap<BufferId, WlBuffer>,
    next_id: u32,
}

impl State {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

/// Connection to a Wayland compositor
pub struct WaylandBackend {
    conn: Connection,
    backend: ConnectionBackend,
    queue: EventQueue<State>,
    qh: QueueHandle<State>,
    state: State,
    guard: Option<ReadEventsGuard>,
}

impl WaylandBackend {
    /// Connect to `display` under `runtime_dir`, or to the environment's
    /// default display when `display` is `None`
    pub fn connect(display: Option<&str>, runtime_dir: Option<&Path>) -> Result<Self> {
        let conn = match display {
            Some(name) => {
                let path = socket_path(name, runtime_dir)?;
                let stream = UnixStream::connect(&path)
                    .map_err(|e| Error::Connect(format!("{}: {}", path.display(), e)))?;
                Connection::from_socket(stream).map_err(|e| Error::Connect(e.to_string()))?
            }
            None => Connection::connect_to_env().map_err(|e| Error::Connect(e.to_string()))?,
        };

        info!("Connected to Wayland display");

        let backend = conn.backend();
        let queue = conn.new_event_queue();
        let qh = queue.handle();

        Ok(Self {
            conn,
            backend,
            queue,
            qh,
            state: State::default(),
            guard: None,
        })
    }

    fn sync(&mut self, events: &mut Vec<ProtocolEvent>) -> Result<()> {
        self.queue
            .roundtrip(&mut self.state)
            .map_err(|e| Error::Protocol(e.to_string()))?;
        events.append(&mut self.state.inbox);
        Ok(())
    }

    fn toplevel(&self, surface: SurfaceId) -> Option<&Toplevel> {
        let toplevel = self.state.toplevels.get(&surface);
        if toplevel.is_none() {
            warn!("Request on unknown surface {:?}", surface);
        }
        toplevel
    }
}

/// Absolute socket names are used as is; relative ones live in the runtime dir
fn socket_path(name: &str, runtime_dir: Option<&Path>) -> Result<PathBuf> {
    let name = Path::new(name);
    if name.is_absolute() {
        return Ok(name.to_path_buf());
    }

    let dir = runtime_dir.ok_or(Error::NoRuntimeDir)?;
    Ok(dir.join(name))
}

fn protocol_err(e: impl std::fmt::Display) -> Error {
    Error::Protocol(e.to_string())
}

impl Backend for WaylandBackend {
    fn bind_globals(&mut self, events: &mut Vec<ProtocolEvent>) -> Result<Globals> {
        let registry = self.conn.display().get_registry(&self.qh, ());
        self.sync(events)?;

        let mut globals = Globals::default();
        for global in self.state.advertised.clone() {
            let Some(cap) = Capability::from_interface(&global.interface) else {
                continue;
            };

            // One of each, except outputs
            if globals.get(cap).is_some() && cap != Capability::Output {
                continue;
            }

            let version = cap.bind_version(global.version);
            let qh = &self.qh;
            match cap {
                Capability::Compositor => {
                    self.state.compositor =
                        Some(registry.bind::<WlCompositor, _, _>(global.name, version, qh, ()));
                }
                Capability::Shm => {
                    self.state.shm = Some(registry.bind::<WlShm, _, _>(global.name, version, qh, ()));
                }
                Capability::Seat => {
                    self.state.seat =
                        Some(registry.bind::<WlSeat, _, _>(global.name, version, qh, ()));
                }
                Capability::Output => {
                    let output = registry.bind::<WlOutput, _, _>(
                        global.name,
                        version,
                        qh,
                        OutputId(global.name),
                    );
                    self.state.outputs.push(output);
                }
                Capability::Shell => {
                    self.state.wm_base =
                        Some(registry.bind::<XdgWmBase, _, _>(global.name, version, qh, ()));
                }
            }

            debug!("Binding {} (name {}) at v{}", cap, global.name, version);
            globals.set(cap, version);
        }

        self.state.registry = Some(registry);

        // Events of the freshly bound objects (formats, seat, outputs)
        self.sync(events)?;
        Ok(globals)
    }

    fn roundtrip(&mut self, events: &mut Vec<ProtocolEvent>) -> Result<()> {
        self.sync(events)
    }

    fn connection_fd(&self) -> BorrowedFd<'_> {
        self.backend.poll_fd()
    }

    fn dispatch_pending(&mut self, events: &mut Vec<ProtocolEvent>) -> Result<()> {
        self.queue
            .dispatch_pending(&mut self.state)
            .map_err(protocol_err)?;
        events.append(&mut self.state.inbox);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.conn.flush() {
            Ok(()) => Ok(()),
            Err(WaylandError::Io(e)) => Err(e),
            Err(WaylandError::Protocol(e)) => Err(io::Error::other(e.to_string())),
        }
    }

    fn prepare_read(&mut self) -> bool {
        match self.queue.prepare_read() {
            Some(guard) => {
                self.guard = Some(guard);
                true
            }
            None => false,
        }
    }

    fn cancel_read(&mut self) {
        // Dropping the guard cancels the read
        self.guard = None;
    }

    fn read_events(&mut self) -> Result<()> {
        let Some(guard) = self.guard.take() else {
            return Ok(());
        };

        match guard.read() {
            Ok(_) => Ok(()),
            Err(WaylandError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(protocol_err(e)),
        }
    }

    fn pong(&mut self, serial: u32) {
        if let Some(wm_base) = &self.state.wm_base {
            wm_base.pong(serial);
        }
    }

    fn create_toplevel(&mut self, title: &str, app_id: &str) -> Result<SurfaceId> {
        let compositor = self
            .state
            .compositor
            .clone()
            .ok_or(Error::MissingGlobal(Capability::Compositor))?;
        let wm_base = self
            .state
            .wm_base
            .clone()
            .ok_or(Error::MissingGlobal(Capability::Shell))?;

        let id = SurfaceId(self.state.alloc_id());
        let surface = compositor.create_surface(&self.qh, ());
        let xdg_surface = wm_base.get_xdg_surface(&surface, &self.qh, id);
        let toplevel = xdg_surface.get_toplevel(&self.qh, id);
        toplevel.set_title(title.to_string());
        toplevel.set_app_id(app_id.to_string());

        self.state.toplevels.insert(
            id,
            Toplevel {
                surface,
                xdg_surface,
                toplevel,
            },
        );
        Ok(id)
    }

    fn set_window_geometry(&mut self, surface: SurfaceId, x: i32, y: i32, width: i32, height: i32) {
        if let Some(t) = self.toplevel(surface) {
            t.xdg_surface.set_window_geometry(x, y, width, height);
        }
    }

    fn ack_configure(&mut self, surface: SurfaceId, serial: u32) {
        if let Some(t) = self.toplevel(surface) {
            t.xdg_surface.ack_configure(serial);
        }
    }

    fn destroy_toplevel(&mut self, surface: SurfaceId) {
        if let Some(t) = self.state.toplevels.remove(&surface) {
            t.toplevel.destroy();
            t.xdg_surface.destroy();
            t.surface.destroy();
        }
    }

    fn create_shm_buffer(
        &mut self,
        fd: BorrowedFd<'_>,
        size: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: u32,
    ) -> Result<BufferId> {
        let shm = self
            .state
            .shm
            .clone()
            .ok_or(Error::MissingGlobal(Capability::Shm))?;
        let format = wl_shm::Format::try_from(format)
            .map_err(|_| Error::Protocol(format!("unknown pixel format {:#x}", format)))?;

        let id = BufferId(self.state.alloc_id());
        let pool = shm.create_pool(fd, size, &self.qh, ());
        let buffer = pool.create_buffer(0, width, height, stride, format, &self.qh, id);
        pool.destroy();

        self.state.buffers.insert(id, buffer);
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        if let Some(buffer) = self.state.buffers.remove(&buffer) {
            buffer.destroy();
        }
    }

    fn attach(&mut self, surface: SurfaceId, buffer: Option<BufferId>) {
        let buffer = buffer.and_then(|id| self.state.buffers.get(&id));
        if let Some(t) = self.state.toplevels.get(&surface) {
            t.surface.attach(buffer, 0, 0);
        }
    }

    fn damage(&mut self, surface: SurfaceId, x: i32, y: i32, width: i32, height: i32) {
        if let Some(t) = self.toplevel(surface) {
            t.surface.damage(x, y, width, height);
        }
    }

    fn commit(&mut self, surface: SurfaceId) {
        if let Some(t) = self.toplevel(surface) {
            t.surface.commit();
        }
    }

    fn release_globals(&mut self) {
        // Objects without a destructor at the bound version are dropped
        // client-side only
        if let Some(wm_base) = self.state.wm_base.take() {
            wm_base.destroy();
        }
        self.state.outputs.clear();
        self.state.seat = None;
        self.state.shm = None;
        self.state.compositor = None;
        self.state.registry = None;
        debug!("Released globals");
    }

    fn disconnect(&mut self) {
        self.guard = None;
        if let Err(e) = self.conn.flush() {
            debug!("Final flush failed: {}", e);
        }
        info!("Disconnected from Wayland display");
    }
}

impl Dispatch<WlRegistry, ()> for State {
    fn event(
        state: &mut Self,
        _: &WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => {
                debug!("Global {} {} v{}", name, interface, version);
                state.advertised.push(Advertised {
                    name,
                    interface,
                    version,
                });
            }
            wl_registry::Event::GlobalRemove { name } => {
                debug!("Global {} removed", name);
                state.advertised.retain(|g| g.name != name);
            }
            _ => {}
        }
    }
}

impl Dispatch<WlShm, ()> for State {
    fn event(
        state: &mut Self,
        _: &WlShm,
        event: wl_shm::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_shm::Event::Format { format } = event {
            state.inbox.push(ProtocolEvent::ShmFormat {
                format: u32::from(format),
            });
        }
    }
}

impl Dispatch<WlSeat, ()> for State {
    fn event(
        state: &mut Self,
        _: &WlSeat,
        event: wl_seat::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_seat::Event::Capabilities { capabilities } = event {
            state.inbox.push(ProtocolEvent::SeatCapabilities {
                capabilities: u32::from(capabilities),
            });
        }
    }
}

impl Dispatch<WlOutput, OutputId> for State {
    fn event(
        state: &mut Self,
        _: &WlOutput,
        event: wl_output::Event,
        output: &OutputId,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let output = *output;
        let event = match event {
            wl_output::Event::Geometry {
                x,
                y,
                physical_width,
                physical_height,
                subpixel,
                make,
                model,
                transform,
            } => ProtocolEvent::OutputGeometry {
                output,
                x,
                y,
                physical_width,
                physical_height,
                subpixel: u32::from(subpixel),
                make,
                model,
                transform: u32::from(transform),
            },
            wl_output::Event::Mode {
                flags,
                width,
                height,
                refresh,
            } => {
                let flags = u32::from(flags);
                ProtocolEvent::OutputMode {
                    output,
                    width,
                    height,
                    refresh,
                    current: flags & MODE_CURRENT != 0,
                    preferred: flags & MODE_PREFERRED != 0,
                }
            }
            wl_output::Event::Scale { factor } => ProtocolEvent::OutputScale { output, factor },
            wl_output::Event::Done => ProtocolEvent::OutputDone { output },
            _ => return,
        };
        state.inbox.push(event);
    }
}

impl Dispatch<XdgWmBase, ()> for State {
    fn event(
        state: &mut Self,
        _: &XdgWmBase,
        event: xdg_wm_base::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            state.inbox.push(ProtocolEvent::Ping { serial });
        }
    }
}

impl Dispatch<XdgSurface, SurfaceId> for State {
    fn event(
        state: &mut Self,
        _: &XdgSurface,
        event: xdg_surface::Event,
        surface: &SurfaceId,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            state.inbox.push(ProtocolEvent::SurfaceConfigure {
                surface: *surface,
                serial,
            });
        }
    }
}

impl Dispatch<XdgToplevel, SurfaceId> for State {
    fn event(
        state: &mut Self,
        _: &XdgToplevel,
        event: xdg_toplevel::Event,
        surface: &SurfaceId,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            xdg_toplevel::Event::Configure { width, height, .. } => {
                state.inbox.push(ProtocolEvent::ToplevelConfigure {
                    surface: *surface,
                    width,
                    height,
                });
            }
            xdg_toplevel::Event::Close => {
                state.inbox.push(ProtocolEvent::ToplevelClose { surface: *surface });
            }
            _ => {}
        }
    }
}

impl Dispatch<WlBuffer, BufferId> for State {
    fn event(
        state: &mut Self,
        _: &WlBuffer,
        event: wl_buffer::Event,
        buffer: &BufferId,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            state
                .inbox
                .push(ProtocolEvent::BufferRelease { buffer: *buffer });
        }
    }
}

delegate_noop!(State: WlCompositor);
delegate_noop!(State: WlShmPool);
delegate_noop!(State: ignore WlSurface);
