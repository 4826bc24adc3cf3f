//! Scripted display server for tests
//!
//! Stands in for a compositor: records every request, hands out ids, and
//! delivers queued `ProtocolEvent`s. A real socket pair backs the connection
//! descriptor so the loop's readiness wait sees genuine readability and
//! hangups.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;

use crate::error::{Error, Result};
use crate::protocol::{
    Backend, BufferId, Capability, Globals, OutputId, ProtocolEvent, SurfaceId, FORMAT_ARGB8888,
    FORMAT_XRGB8888,
};

/// A request the client sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Request {
    Pong(u32),
    CreateToplevel(SurfaceId),
    SetWindowGeometry {
        surface: SurfaceId,
        width: i32,
        height: i32,
    },
    AckConfigure {
        surface: SurfaceId,
        serial: u32,
    },
    DestroyToplevel(SurfaceId),
    CreateBuffer(BufferId),
    DestroyBuffer(BufferId),
    Attach {
        surface: SurfaceId,
        buffer: Option<BufferId>,
    },
    Damage {
        surface: SurfaceId,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    },
    Commit(SurfaceId),
    ReleaseGlobals,
    Disconnect,
}

/// What the server knows about a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BufferInfo {
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    pub size: i32,
    pub format: u32,
    /// Length of the backing file when the pool was created
    pub file_len: u64,
}

pub(crate) struct MockBackend {
    /// Globals advertised in the registry, with their versions
    advertised: Vec<(Capability, u32)>,

    /// Events sent while the registry round-trip is in flight
    startup: Vec<ProtocolEvent>,

    /// Events written to the socket but not yet read
    inbox: VecDeque<ProtocolEvent>,

    /// Events read but not yet dispatched
    pending: Vec<ProtocolEvent>,

    client: UnixStream,
    server: Option<UnixStream>,

    requests: Vec<Request>,
    buffers: HashMap<BufferId, BufferInfo>,
    surfaces: HashSet<SurfaceId>,
    next_id: u32,
    next_serial: u32,

    /// Send an initial configure when a top-level is created
    configure_on_create: bool,

    /// Make `flush` fail with this error kind
    flush_error: Option<io::ErrorKind>,

    reads: usize,
    prepared: bool,
    connected: bool,
}

impl MockBackend {
    /// Server advertising every required global, one output, and two formats
    pub fn new() -> Self {
        let (client, server) = UnixStream::pair().expect("socket pair");
        client.set_nonblocking(true).expect("non-blocking client");

        let output = OutputId(10);
        Self {
            advertised: vec![
                (Capability::Compositor, 6),
                (Capability::Shm, 1),
                (Capability::Seat, 9),
                (Capability::Output, 4),
                (Capability::Shell, 6),
            ],
            startup: vec![
                ProtocolEvent::ShmFormat {
                    format: FORMAT_ARGB8888,
                },
                ProtocolEvent::ShmFormat {
                    format: FORMAT_XRGB8888,
                },
                ProtocolEvent::SeatCapabilities { capabilities: 3 },
                ProtocolEvent::OutputGeometry {
                    output,
                    x: 0,
                    y: 0,
                    physical_width: 520,
                    physical_height: 290,
                    subpixel: 1,
                    make: "Mock".into(),
                    model: "Panel".into(),
                    transform: 0,
                },
                ProtocolEvent::OutputMode {
                    output,
                    width: 1920,
                    height: 1080,
                    refresh: 60000,
                    current: true,
                    preferred: true,
                },
                ProtocolEvent::OutputScale { output, factor: 1 },
                ProtocolEvent::OutputDone { output },
            ],
            inbox: VecDeque::new(),
            pending: Vec::new(),
            client,
            server: Some(server),
            requests: Vec::new(),
            buffers: HashMap::new(),
            surfaces: HashSet::new(),
            next_id: 1,
            next_serial: 1,
            configure_on_create: true,
            flush_error: None,
            reads: 0,
            prepared: false,
            connected: true,
        }
    }

    /// Stop advertising a global
    pub fn without(mut self, capability: Capability) -> Self {
        self.advertised.retain(|(cap, _)| *cap != capability);
        self
    }

    /// Do not send a configure on top-level creation
    pub fn without_initial_configure(mut self) -> Self {
        self.configure_on_create = false;
        self
    }

    /// Queue an event on the wire and make the connection readable
    pub fn send(&mut self, event: ProtocolEvent) {
        self.inbox.push_back(event);
        if let Some(server) = self.server.as_mut() {
            let _ = server.write_all(&[1]);
        }
    }

    pub fn next_serial(&mut self) -> u32 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    /// Simulate the server going away
    pub fn hang_up(&mut self) {
        self.server = None;
    }

    pub fn fail_flush(&mut self, kind: io::ErrorKind) {
        self.flush_error = Some(kind);
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn clear_requests(&mut self) {
        self.requests.clear();
    }

    pub fn count(&self, pred: impl Fn(&Request) -> bool) -> usize {
        self.requests.iter().filter(|r| pred(r)).count()
    }

    pub fn position(&self, pred: impl Fn(&Request) -> bool) -> Option<usize> {
        self.requests.iter().position(pred)
    }

    pub fn buffer_info(&self, id: BufferId) -> Option<BufferInfo> {
        self.buffers.get(&id).copied()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_surfaces(&self) -> usize {
        self.surfaces.len()
    }

    pub fn reads(&self) -> usize {
        self.reads
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // Consume the wake-up bytes and move everything on the wire to `pending`
    fn drain_wire(&mut self) -> io::Result<usize> {
        let mut buf = [0u8; 64];
        let mut total = 0;
        loop {
            match self.client.read(&mut buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "server closed the connection",
                    ))
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.pending.extend(self.inbox.drain(..));
        Ok(total)
    }
}

impl Backend for MockBackend {
    fn bind_globals(&mut self, events: &mut Vec<ProtocolEvent>) -> Result<Globals> {
        let mut globals = Globals::default();
        for (cap, advertised) in &self.advertised {
            globals.set(*cap, cap.bind_version(*advertised));
        }

        let has_output = globals.output.is_some();
        events.extend(
            self.startup
                .iter()
                .filter(|e| has_output || !is_output_event(e))
                .cloned(),
        );
        Ok(globals)
    }

    fn roundtrip(&mut self, events: &mut Vec<ProtocolEvent>) -> Result<()> {
        self.drain_wire()
            .map_err(|e| Error::Protocol(e.to_string()))?;
        events.append(&mut self.pending);
        Ok(())
    }

    fn connection_fd(&self) -> BorrowedFd<'_> {
        self.client.as_fd()
    }

    fn dispatch_pending(&mut self, events: &mut Vec<ProtocolEvent>) -> Result<()> {
        events.append(&mut self.pending);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.flush_error {
            Some(kind) => Err(io::Error::from(kind)),
            None => Ok(()),
        }
    }

    fn prepare_read(&mut self) -> bool {
        if !self.pending.is_empty() {
            return false;
        }
        self.prepared = true;
        true
    }

    fn cancel_read(&mut self) {
        self.prepared = false;
    }

    fn read_events(&mut self) -> Result<()> {
        assert!(self.prepared, "read_events without prepare_read");
        self.prepared = false;
        self.reads += 1;
        self.drain_wire()
            .map(|_| ())
            .map_err(|e| Error::Protocol(e.to_string()))
    }

    fn pong(&mut self, serial: u32) {
        self.requests.push(Request::Pong(serial));
    }

    fn create_toplevel(&mut self, _title: &str, _app_id: &str) -> Result<SurfaceId> {
        let surface = SurfaceId(self.alloc_id());
        self.surfaces.insert(surface);
        self.requests.push(Request::CreateToplevel(surface));

        if self.configure_on_create {
            let serial = self.next_serial();
            self.send(ProtocolEvent::ToplevelConfigure {
                surface,
                width: 0,
                height: 0,
            });
            self.send(ProtocolEvent::SurfaceConfigure { surface, serial });
        }
        Ok(surface)
    }

    fn set_window_geometry(&mut self, surface: SurfaceId, _x: i32, _y: i32, width: i32, height: i32) {
        self.requests.push(Request::SetWindowGeometry {
            surface,
            width,
            height,
        });
    }

    fn ack_configure(&mut self, surface: SurfaceId, serial: u32) {
        self.requests.push(Request::AckConfigure { surface, serial });
    }

    fn destroy_toplevel(&mut self, surface: SurfaceId) {
        self.surfaces.remove(&surface);
        self.requests.push(Request::DestroyToplevel(surface));
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
        let file = File::from(
            fd.try_clone_to_owned()
                .map_err(|e| Error::Protocol(e.to_string()))?,
        );
        let file_len = file
            .metadata()
            .map_err(|e| Error::Protocol(e.to_string()))?
            .len();

        let id = BufferId(self.alloc_id());
        self.buffers.insert(
            id,
            BufferInfo {
                width,
                height,
                stride,
                size,
                format,
                file_len,
            },
        );
        self.requests.push(Request::CreateBuffer(id));
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
        self.requests.push(Request::DestroyBuffer(buffer));
    }

    fn attach(&mut self, surface: SurfaceId, buffer: Option<BufferId>) {
        self.requests.push(Request::Attach { surface, buffer });
    }

    fn damage(&mut self, surface: SurfaceId, x: i32, y: i32, width: i32, height: i32) {
        self.requests.push(Request::Damage {
            surface,
            x,
            y,
            width,
            height,
        });
    }

    fn commit(&mut self, surface: SurfaceId) {
        self.requests.push(Request::Commit(surface));
    }

    fn release_globals(&mut self) {
        self.requests.push(Request::ReleaseGlobals);
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.requests.push(Request::Disconnect);
    }
}

fn is_output_event(event: &ProtocolEvent) -> bool {
    matches!(
        event,
        ProtocolEvent::OutputGeometry { .. }
            | ProtocolEvent::OutputMode { .. }
            | ProtocolEvent::OutputScale { .. }
            | ProtocolEvent::OutputDone { .. }
    )
}
