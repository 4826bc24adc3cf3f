//! Context Events
//!
//! Abstract messages queued per drawing context, and the fixed-capacity queue
//! that holds them. Events are never shared across contexts.

use std::any::Any;
use std::rc::Rc;

use crate::error::{Error, Result};

/// Capacity of every context's event queue
pub const MAX_EVENTS: usize = 500;

/// Event type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Delivered once, on the first frame after the context is created
    Begin,
    /// Delivered once, after the context has been removed from its window
    End,
    /// Application-defined event
    User(u32),
}

/// A message for one drawing context
#[derive(Clone)]
pub struct Event {
    pub kind: EventKind,

    /// How many times this event has been re-delivered after a `Flow::Recall`
    pub repeat: u32,

    /// Opaque application payload
    pub payload: Option<Rc<dyn Any>>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            repeat: 0,
            payload: None,
        }
    }

    /// Application event with a payload
    pub fn user<T: Any>(code: u32, payload: T) -> Self {
        Self {
            kind: EventKind::User(code),
            repeat: 0,
            payload: Some(Rc::new(payload)),
        }
    }

    /// Downcast the payload
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.as_deref().and_then(|p| p.downcast_ref::<T>())
    }

    /// Copy of this event for re-delivery on the next frame
    pub fn recalled(&self) -> Self {
        Self {
            kind: self.kind,
            repeat: self.repeat.saturating_add(1),
            payload: self.payload.clone(),
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("repeat", &self.repeat)
            .field("payload", &self.payload.is_some())
            .finish()
    }
}

/// Fixed-capacity FIFO of events
///
/// `tail` only grows until `reset`; enqueueing past the capacity is an error,
/// never a drop or a wraparound.
pub struct EventQueue {
    slots: Vec<Option<Event>>,
    head: usize,
    tail: usize,
    capacity: usize,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_capacity(MAX_EVENTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            head: 0,
            tail: 0,
            capacity,
        }
    }

    /// Append at the tail
    pub fn enqueue(&mut self, event: Event) -> Result<()> {
        if self.tail >= self.capacity {
            return Err(Error::QueueFull {
                capacity: self.capacity,
            });
        }

        if self.tail < self.slots.len() {
            self.slots[self.tail] = Some(event);
        } else {
            self.slots.push(Some(event));
        }
        self.tail += 1;
        Ok(())
    }

    /// Remove and return the head event; `None` leaves the queue untouched
    pub fn dequeue(&mut self) -> Option<Event> {
        if self.head >= self.tail {
            return None;
        }

        let event = self.slots[self.head].take();
        self.head += 1;
        event
    }

    /// Logically empty the queue
    ///
    /// Slots are not cleared; stale payloads are dropped when overwritten.
    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head >= self.tail
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Dequeue everything currently queued, then reset the indices
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.len());
        while let Some(event) = self.dequeue() {
            events.push(event);
        }
        self.reset();
        events
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
