//! Session Module
//!
//! The bound connection to the display server: the capability handshake,
//! output records, seat capabilities, shell pings, and routing of server
//! events to the window.

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event_loop::{BreakHandle, SignalPipe};
use crate::output::{Mode, Output};
use crate::protocol::{Backend, Capability, Globals, OutputId, ProtocolEvent};
use crate::wayland::WaylandBackend;
use crate::window::Window;

/// One connection to the display server, with at most one window
pub struct Session<B: Backend = WaylandBackend> {
    /// Protocol implementation
    pub(crate) backend: B,

    /// Bound versions of the required globals
    pub(crate) globals: Globals,

    /// Announced outputs, in announcement order
    pub(crate) outputs: Vec<Output>,

    /// Last seat capability bitmask
    pub(crate) seat_capabilities: Option<u32>,

    /// Pixel formats announced by the server
    pub(crate) formats: Vec<u32>,

    /// The window, once created
    pub(crate) window: Option<Window>,

    /// Self-pipe for loop events
    pub(crate) signals: SignalPipe,

    pub(crate) config: Config,
}

impl Session<WaylandBackend> {
    /// Connect to the display server named by `config` and run the handshake
    pub fn connect(config: Config) -> Result<Self> {
        let backend =
            WaylandBackend::connect(config.display.as_deref(), config.runtime_dir.as_deref())?;
        Self::connect_with(backend, config)
    }
}

impl<B: Backend> Session<B> {
    /// Run the capability handshake over an existing backend
    pub fn connect_with(mut backend: B, config: Config) -> Result<Self> {
        let signals = SignalPipe::new(config.handle_interrupt)?;

        let mut events = Vec::new();
        let globals = backend.bind_globals(&mut events)?;
        if let Some(missing) = globals.first_missing() {
            error!("Required global {} is not advertised", missing);
            backend.disconnect();
            return Err(Error::MissingGlobal(missing));
        }

        for cap in Capability::ALL {
            if let Some(version) = globals.get(cap) {
                info!("Bound {} v{}", cap, version);
            }
        }

        let mut session = Self {
            backend,
            globals,
            outputs: Vec::new(),
            seat_capabilities: None,
            formats: Vec::new(),
            window: None,
            signals,
            config,
        };
        session.route(events)?;

        info!(
            "Connected: {} output(s), {} format(s)",
            session.outputs.len(),
            session.formats.len()
        );
        Ok(session)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn globals(&self) -> Globals {
        self.globals
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    /// Largest scale factor among the outputs
    pub fn scale_factor(&self) -> i32 {
        self.outputs.iter().map(|o| o.scale).max().unwrap_or(1)
    }

    pub fn seat_capabilities(&self) -> Option<u32> {
        self.seat_capabilities
    }

    pub fn formats(&self) -> &[u32] {
        &self.formats
    }

    pub fn window(&self) -> Option<&Window> {
        self.window.as_ref()
    }

    pub fn window_mut(&mut self) -> Option<&mut Window> {
        self.window.as_mut()
    }

    /// Handle that ends the main loop from any thread
    pub fn break_handle(&self) -> BreakHandle {
        self.signals.break_handle()
    }

    /// Create the window and wait for the server's first configure
    pub fn create_window(&mut self, width: u32, height: u32) -> Result<&mut Window> {
        if self.window.is_some() {
            return Err(Error::WindowExists);
        }

        let runtime_dir = self.config.runtime_dir.clone().ok_or(Error::NoRuntimeDir)?;
        let window = Window::create(
            &mut self.backend,
            runtime_dir,
            self.formats.clone(),
            &self.config.title,
            &self.config.app_id,
            width,
            height,
        )?;
        self.window = Some(window);

        let mut events = Vec::new();
        self.backend.roundtrip(&mut events)?;
        self.route(events)?;

        self.window.as_mut().ok_or(Error::NoWindow)
    }

    /// Destroy the window and everything it owns
    pub fn destroy_window(&mut self) -> Result<()> {
        let window = self.window.take().ok_or(Error::NoWindow)?;
        let teardown = window.destroy(&mut self.backend);
        debug!("Window teardown: {:?}", teardown);
        Ok(())
    }

    /// Release every global and close the connection
    pub fn disconnect(mut self) {
        self.teardown();
    }

    pub(crate) fn teardown(&mut self) {
        if let Some(window) = self.window.take() {
            window.destroy(&mut self.backend);
        }

        self.backend.release_globals();
        self.backend.disconnect();

        let outputs = self.outputs.len();
        self.outputs.clear();
        self.formats.clear();
        self.signals.close();

        info!("Disconnected ({} output records freed)", outputs);
    }

    /// Apply a batch of server events in order
    pub(crate) fn route(&mut self, events: Vec<ProtocolEvent>) -> Result<()> {
        for event in events {
            self.handle_event(event)?;
        }
        Ok(())
    }

    /// Apply one server event
    pub fn handle_event(&mut self, event: ProtocolEvent) -> Result<()> {
        match event {
            ProtocolEvent::Ping { serial } => {
                debug!("Ping {}", serial);
                self.backend.pong(serial);
            }
            ProtocolEvent::OutputGeometry {
                output,
                x,
                y,
                physical_width,
                physical_height,
                subpixel,
                make,
                model,
                transform,
            } => {
                self.output_mut(output).set_geometry(
                    x,
                    y,
                    physical_width,
                    physical_height,
                    subpixel,
                    make,
                    model,
                    transform,
                );
            }
            ProtocolEvent::OutputMode {
                output,
                width,
                height,
                refresh,
                current,
                preferred,
            } => {
                self.output_mut(output).add_mode(Mode {
                    width,
                    height,
                    refresh,
                    current,
                    preferred,
                });
            }
            ProtocolEvent::OutputScale { output, factor } => {
                self.output_mut(output).scale = factor;
            }
            ProtocolEvent::OutputDone { output } => {
                self.output_mut(output).finish();
            }
            ProtocolEvent::SeatCapabilities { capabilities } => {
                info!("Seat capabilities: {:#x}", capabilities);
                self.seat_capabilities = Some(capabilities);
            }
            ProtocolEvent::ShmFormat { format } => {
                debug!("Shm format {:#x}", format);
                if !self.formats.contains(&format) {
                    self.formats.push(format);
                }
                if let Some(window) = self.window.as_mut() {
                    window.add_format(format);
                }
            }
            ProtocolEvent::SurfaceConfigure { surface, serial } => match self.window.as_mut() {
                Some(window) if window.surface() == surface => {
                    window.handle_surface_configure(&mut self.backend, serial)?;
                }
                _ => warn!("Configure for unknown surface {:?}", surface),
            },
            ProtocolEvent::ToplevelConfigure {
                surface,
                width,
                height,
            } => match self.window.as_mut() {
                Some(window) if window.surface() == surface => {
                    window.handle_toplevel_configure(width, height);
                }
                _ => warn!("Toplevel configure for unknown surface {:?}", surface),
            },
            ProtocolEvent::ToplevelClose { surface } => match self.window.as_mut() {
                Some(window) if window.surface() == surface => window.handle_close(),
                _ => warn!("Close for unknown surface {:?}", surface),
            },
            ProtocolEvent::BufferRelease { buffer } => {
                if let Some(window) = self.window.as_mut() {
                    window.handle_release(buffer);
                }
            }
        }
        Ok(())
    }

    // Records are created on first mention and updated in place afterwards
    fn output_mut(&mut self, id: OutputId) -> &mut Output {
        let index = match self.outputs.iter().position(|o| o.id == id) {
            Some(index) => index,
            None => {
                debug!("New output {:?}", id);
                self.outputs.push(Output::new(id));
                self.outputs.len() - 1
            }
        };
        &mut self.outputs[index]
    }
}
