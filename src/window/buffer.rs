//! Shared-Memory Buffers
//!
//! Pixel storage for a window: an anonymous file in the runtime directory,
//! mapped read/write and shared, wrapped by the server as a buffer object.
//! The file name is removed right after sizing; the descriptor handed to the
//! server and the mapping keep the memory alive.

use std::fs::File;
use std::os::fd::AsFd;
use std::path::Path;
use std::time::{Duration, Instant};

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::{Backend, BufferId, FORMAT_ARGB8888};

/// Fixed pixel size of the ARGB8888 format
pub const BYTES_PER_PIXEL: u32 = 4;

const FILE_PREFIX: &str = "waykit-";

/// Byte layout of a `width` x `height` ARGB8888 buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub size: usize,
}

impl Layout {
    /// Compute stride and size, rejecting empty buffers and sizes the
    /// protocol's 32-bit fields cannot carry
    pub fn new(width: u32, height: u32) -> Result<Self> {
        let invalid = || Error::BufferSize { width, height };

        if width == 0 || height == 0 {
            return Err(invalid());
        }

        let stride = width.checked_mul(BYTES_PER_PIXEL).ok_or_else(invalid)?;
        let size = stride.checked_mul(height).ok_or_else(invalid)?;
        if size > i32::MAX as u32 {
            return Err(invalid());
        }

        Ok(Self {
            width,
            height,
            stride,
            size: size as usize,
        })
    }
}

/// One shared-memory buffer
pub struct Buffer {
    /// Server-side buffer object
    id: BufferId,

    /// Dimensions and byte layout
    layout: Layout,

    /// Set on commit, cleared by the server's release
    busy: bool,

    /// When the buffer became busy
    busy_since: Option<Instant>,

    /// Mapped pixel memory
    map: MmapMut,
}

impl Buffer {
    /// Allocate a buffer and register it with the server
    pub fn create<B: Backend + ?Sized>(
        backend: &mut B,
        runtime_dir: &Path,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let layout = Layout::new(width, height)?;

        let file = create_backing_file(runtime_dir, layout.size)?;

        // SAFETY: the file is private to this process (its name is already
        // gone); only the server, which only reads, shares the pages.
        let map = unsafe { MmapOptions::new().len(layout.size).map_mut(&file) }.map_err(
            |source| Error::Map {
                size: layout.size,
                source,
            },
        )?;

        let id = backend.create_shm_buffer(
            file.as_fd(),
            layout.size as i32,
            layout.width as i32,
            layout.height as i32,
            layout.stride as i32,
            FORMAT_ARGB8888,
        )?;

        // The server holds its own descriptor and the mapping holds ours
        drop(file);

        info!(
            "Created {}x{} buffer {:?} ({} bytes)",
            layout.width, layout.height, id, layout.size
        );

        Ok(Self {
            id,
            layout,
            busy: false,
            busy_since: None,
            map,
        })
    }

    /// Destroy the server object and unmap the memory
    pub fn destroy<B: Backend + ?Sized>(self, backend: &mut B) {
        debug!("Destroying buffer {:?}", self.id);
        backend.destroy_buffer(self.id);
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.layout.width
    }

    pub fn height(&self) -> u32 {
        self.layout.height
    }

    pub fn stride(&self) -> u32 {
        self.layout.stride
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// The server now owns the memory until it releases the buffer
    pub fn mark_busy(&mut self) {
        self.busy = true;
        self.busy_since = Some(Instant::now());
    }

    /// Release notification from the server
    pub fn release(&mut self) {
        self.busy = false;
        self.busy_since = None;
    }

    /// How long the buffer has been busy
    pub fn busy_for(&self, now: Instant) -> Option<Duration> {
        self.busy_since.map(|since| now.saturating_duration_since(since))
    }

    /// Mapped size in bytes
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn pixels(&self) -> &[u8] {
        &self.map
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

/// Create, size, and unlink the backing file
fn create_backing_file(dir: &Path, size: usize) -> Result<File> {
    let backing_err = |source| Error::BackingFile {
        dir: dir.to_path_buf(),
        source,
    };

    let named = tempfile::Builder::new()
        .prefix(FILE_PREFIX)
        .tempfile_in(dir)
        .map_err(backing_err)?;

    named.as_file().set_len(size as u64).map_err(backing_err)?;

    // Removes the name; the open descriptor stays valid
    Ok(named.into_file())
}
