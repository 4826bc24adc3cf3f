//! Window Module
//!
//! One on-screen top-level surface: its geometry negotiation, its current
//! shared-memory buffer, the registered draw callbacks, and the drawing
//! contexts composited into the buffer.

pub mod buffer;
pub mod canvas;
pub mod context;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::protocol::{Backend, BufferId, SurfaceId, FORMAT_ARGB8888};
use crate::shared::Geometry;

pub use buffer::Buffer;
pub use canvas::Canvas;
pub use context::{ContextHandler, ContextId, ContextRegistry, DrawingContext, Flow};

/// Something that paints the whole window every frame
///
/// The canvas carries both the tiny-skia drawing operations and the raw
/// pixel memory (`Canvas::data_mut`).
pub trait Drawable {
    fn draw(&mut self, width: u32, height: u32, canvas: &mut Canvas<'_>);
}

impl<F> Drawable for F
where
    F: FnMut(u32, u32, &mut Canvas<'_>),
{
    fn draw(&mut self, width: u32, height: u32, canvas: &mut Canvas<'_>) {
        self(width, height, canvas)
    }
}

/// Identifies a registered draw callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrawId(pub u32);

struct DrawEntry {
    id: DrawId,
    drawable: Box<dyn Drawable>,
}

/// Geometry negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureState {
    /// Initial commit sent, no configure acknowledged yet
    Unconfigured,
    /// At least one configure acknowledged; `serial` is the latest
    Configured { serial: u32 },
}

/// What a window released when it was destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Teardown {
    pub buffers: usize,
    pub formats: usize,
    pub draws: usize,
    pub contexts: usize,
}

/// One top-level window
pub struct Window {
    /// Top-level surface on the server
    surface: SurfaceId,

    /// Negotiated logical size; the buffer may lag behind until the next ack
    width: u32,
    height: u32,

    /// Negotiation state
    configure: ConfigureState,

    /// Active pixel storage
    buffer: Buffer,

    /// Where backing files are created
    runtime_dir: PathBuf,

    /// Draw callbacks, in registration order
    draws: Vec<DrawEntry>,
    next_draw_id: u32,

    /// Pixel formats announced by the server
    formats: Vec<u32>,

    /// Sub-region drawing contexts
    contexts: ContextRegistry,

    /// Set when the server asked the window to close
    close_requested: bool,

    /// Frames committed so far
    frames: u64,
}

impl Window {
    /// Create the surface, its top-level role, and the initial buffer
    ///
    /// The surface is committed without a buffer; rendering starts once the
    /// server's first configure has been acknowledged.
    pub fn create<B: Backend + ?Sized>(
        backend: &mut B,
        runtime_dir: PathBuf,
        formats: Vec<u32>,
        title: &str,
        app_id: &str,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        if !formats.is_empty() && !formats.contains(&FORMAT_ARGB8888) {
            warn!("Server did not announce ARGB8888 among {:?}", formats);
        }

        let surface = backend.create_toplevel(title, app_id)?;
        let buffer = match Buffer::create(backend, &runtime_dir, width, height) {
            Ok(buffer) => buffer,
            Err(e) => {
                backend.destroy_toplevel(surface);
                return Err(e);
            }
        };

        backend.set_window_geometry(surface, 0, 0, width as i32, height as i32);
        backend.commit(surface);

        info!("Window {:?} created ({}x{})", surface, width, height);

        Ok(Self {
            surface,
            width,
            height,
            configure: ConfigureState::Unconfigured,
            buffer,
            runtime_dir,
            draws: Vec::new(),
            next_draw_id: 0,
            formats,
            contexts: ContextRegistry::new(),
            close_requested: false,
            frames: 0,
        })
    }

    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    /// Negotiated logical size
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn configure_state(&self) -> ConfigureState {
        self.configure
    }

    pub fn is_configured(&self) -> bool {
        matches!(self.configure, ConfigureState::Configured { .. })
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    pub fn formats(&self) -> &[u32] {
        &self.formats
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Whether the render step may run now
    pub fn can_render(&self) -> bool {
        self.is_configured() && !self.buffer.is_busy()
    }

    /// Register a draw callback; callbacks run in registration order
    pub fn register_draw<D: Drawable + 'static>(&mut self, drawable: D) -> DrawId {
        let id = DrawId(self.next_draw_id);
        self.next_draw_id += 1;
        self.draws.push(DrawEntry {
            id,
            drawable: Box::new(drawable),
        });
        id
    }

    /// Remove a draw callback; returns whether it was registered
    pub fn unregister_draw(&mut self, id: DrawId) -> bool {
        let before = self.draws.len();
        self.draws.retain(|entry| entry.id != id);
        self.draws.len() != before
    }

    pub fn draw_count(&self) -> usize {
        self.draws.len()
    }

    /// Create a drawing context over a rectangle of the buffer
    ///
    /// `layer` orders rendering (ascending). The rectangle is clipped to the
    /// buffer at draw time.
    pub fn create_context<H: ContextHandler + 'static>(
        &mut self,
        handler: H,
        layer: i32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<ContextId> {
        self.contexts
            .insert(Box::new(handler), layer, Geometry::new(x, y, width, height))
    }

    /// Remove a drawing context and deliver its `End` event
    pub fn remove_context(&mut self, id: ContextId) -> Result<()> {
        let context = self.contexts.remove(id).ok_or(Error::UnknownContext(id))?;
        context.finish();
        debug!("Removed context {:?}", id);
        Ok(())
    }

    /// Queue an application event on a context
    pub fn post_event(&mut self, id: ContextId, event: Event) -> Result<()> {
        let context = self.contexts.get_mut(id).ok_or(Error::UnknownContext(id))?;
        context.queue_mut().enqueue(event)
    }

    pub fn contexts(&self) -> &ContextRegistry {
        &self.contexts
    }

    /// Record a pixel format announced by the server
    pub fn add_format(&mut self, format: u32) {
        if !self.formats.contains(&format) {
            self.formats.push(format);
        }
    }

    /// Top-level geometry proposal
    ///
    /// Zero in either dimension leaves the size alone. The buffer follows on
    /// the next surface configure.
    pub fn handle_toplevel_configure(&mut self, width: i32, height: i32) {
        debug!("Toplevel configure: {}x{}", width, height);
        if width <= 0 || height <= 0 {
            return;
        }

        self.width = width as u32;
        self.height = height as u32;
    }

    /// Surface configure: bring the buffer to the logical size, then ack
    pub fn handle_surface_configure<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        serial: u32,
    ) -> Result<()> {
        debug!("Surface configure: serial {}", serial);

        if self.buffer.width() != self.width || self.buffer.height() != self.height {
            self.replace_buffer(backend, self.width, self.height)?;
            backend.set_window_geometry(
                self.surface,
                0,
                0,
                self.width as i32,
                self.height as i32,
            );
        }

        backend.ack_configure(self.surface, serial);
        self.configure = ConfigureState::Configured { serial };
        Ok(())
    }

    /// Top-level close request
    pub fn handle_close(&mut self) {
        info!("Window {:?}: close requested", self.surface);
        self.close_requested = true;
    }

    /// Buffer release; stale ids from replaced buffers are ignored
    pub fn handle_release(&mut self, buffer: BufferId) {
        if buffer == self.buffer.id() {
            self.buffer.release();
        } else {
            debug!("Release for retired buffer {:?}", buffer);
        }
    }

    /// Allocate a new buffer and retire the current one
    ///
    /// The new buffer exists before the old one is destroyed, and neither is
    /// attached here, so the surface never has two buffers attached.
    fn replace_buffer<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let fresh = Buffer::create(backend, &self.runtime_dir, width, height)?;
        let old = std::mem::replace(&mut self.buffer, fresh);
        old.destroy(backend);
        Ok(())
    }

    /// Replace the buffer if the server has held it longer than `timeout`
    ///
    /// Returns whether the buffer was replaced.
    pub fn reclaim_stalled<B: Backend + ?Sized>(
        &mut self,
        backend: &mut B,
        now: Instant,
        timeout: Duration,
    ) -> Result<bool> {
        match self.buffer.busy_for(now) {
            Some(held) if held >= timeout => {
                warn!(
                    "Buffer {:?} busy for {:?}, replacing it",
                    self.buffer.id(),
                    held
                );
                self.replace_buffer(backend, self.buffer.width(), self.buffer.height())?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Time left before the busy buffer counts as stalled
    pub fn stall_deadline(&self, now: Instant, timeout: Duration) -> Option<Duration> {
        self.buffer
            .busy_for(now)
            .map(|held| timeout.saturating_sub(held))
    }

    /// Run every draw callback and context, then attach, damage, and commit
    ///
    /// Returns `false` without touching anything if the window is not
    /// configured yet or its buffer is still busy.
    pub fn render<B: Backend + ?Sized>(&mut self, backend: &mut B) -> Result<bool> {
        if !self.can_render() {
            return Ok(false);
        }

        let width = self.buffer.width();
        let height = self.buffer.height();

        for entry in &mut self.draws {
            let Some(mut canvas) = Canvas::new(self.buffer.pixels_mut(), width, height) else {
                continue;
            };
            entry.drawable.draw(width, height, &mut canvas);
        }

        for context in self.contexts.render_order() {
            let region = context.geometry().clip_to(width, height);
            if region.is_empty() {
                continue;
            }

            let pixels = self.buffer.pixels_mut();
            let Some(mut canvas) = Canvas::with_region(pixels, width, height, region) else {
                continue;
            };
            context.deliver(&mut canvas)?;
        }

        backend.attach(self.surface, Some(self.buffer.id()));
        // TODO: track per-frame damage instead of the whole buffer
        backend.damage(self.surface, 0, 0, width as i32, height as i32);
        backend.commit(self.surface);

        self.buffer.mark_busy();
        self.frames += 1;
        Ok(true)
    }

    /// Release the buffer, the surface, every context, format, and callback
    pub fn destroy<B: Backend + ?Sized>(mut self, backend: &mut B) -> Teardown {
        let contexts = self.contexts.clear();
        let draws = self.draws.len();
        self.draws.clear();
        let formats = self.formats.len();
        self.formats.clear();

        self.buffer.destroy(backend);
        backend.destroy_toplevel(self.surface);

        info!("Window {:?} destroyed", self.surface);

        Teardown {
            buffers: 1,
            formats,
            draws,
            contexts,
        }
    }
}
