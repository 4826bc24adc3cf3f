//! Output Module
//!
//! Records for the displays the server announces: one `Output` per bound
//! output global, each with the modes it reported.

use serde::Serialize;
use tracing::{debug, warn};

use crate::protocol::OutputId;

/// One resolution/refresh configuration of an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Mode {
    pub width: i32,
    pub height: i32,
    /// Refresh rate in mHz
    pub refresh: i32,
    pub current: bool,
    pub preferred: bool,
}

impl Mode {
    fn same_config(&self, other: &Mode) -> bool {
        self.width == other.width && self.height == other.height && self.refresh == other.refresh
    }
}

/// One physical display
#[derive(Debug, Clone, Serialize)]
pub struct Output {
    pub id: OutputId,

    /// Position in the global compositor space
    pub x: i32,
    pub y: i32,

    /// Physical size in millimetres
    pub physical_width: i32,
    pub physical_height: i32,

    /// `wl_output.subpixel` value
    pub subpixel: u32,

    /// `wl_output.transform` value
    pub transform: u32,

    pub scale: i32,

    pub make: String,
    pub model: String,

    /// Reported modes, in announcement order
    pub modes: Vec<Mode>,

    /// Set once the server has sent `done`
    pub done: bool,
}

impl Output {
    pub fn new(id: OutputId) -> Self {
        Self {
            id,
            x: 0,
            y: 0,
            physical_width: 0,
            physical_height: 0,
            subpixel: 0,
            transform: 0,
            scale: 1,
            make: String::new(),
            model: String::new(),
            modes: Vec::new(),
            done: false,
        }
    }

    /// Apply a geometry event; repeated events overwrite in place
    #[allow(clippy::too_many_arguments)]
    pub fn set_geometry(
        &mut self,
        x: i32,
        y: i32,
        physical_width: i32,
        physical_height: i32,
        subpixel: u32,
        make: String,
        model: String,
        transform: u32,
    ) {
        self.x = x;
        self.y = y;
        self.physical_width = physical_width;
        self.physical_height = physical_height;
        self.subpixel = subpixel;
        self.make = make;
        self.model = model;
        self.transform = transform;
    }

    /// Record a mode; a mode already reported with the same size and refresh
    /// only has its flags updated
    pub fn add_mode(&mut self, mode: Mode) {
        match self.modes.iter_mut().find(|m| m.same_config(&mode)) {
            Some(existing) => {
                existing.current = mode.current;
                existing.preferred = mode.preferred;
            }
            None => self.modes.push(mode),
        }
    }

    pub fn current_mode(&self) -> Option<&Mode> {
        self.modes.iter().find(|m| m.current)
    }

    pub fn preferred_mode(&self) -> Option<&Mode> {
        self.modes.iter().find(|m| m.preferred)
    }

    /// Number of modes flagged current; should be at most one
    pub fn current_count(&self) -> usize {
        self.modes.iter().filter(|m| m.current).count()
    }

    /// All properties received
    pub fn finish(&mut self) {
        self.done = true;

        let current = self.current_count();
        if current > 1 {
            warn!("Output {:?} reports {} current modes", self.id, current);
        }

        debug!(
            "Output {:?}: {} {} at {},{} scale {} ({} modes)",
            self.id,
            self.make,
            self.model,
            self.x,
            self.y,
            self.scale,
            self.modes.len()
        );
    }
}
