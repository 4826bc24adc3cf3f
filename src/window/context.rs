//! Drawing Contexts
//!
//! A drawing context is a rectangle of its window's buffer with its own
//! handler and event queue. Contexts do not own pixels: each frame the window
//! derives a canvas over the context's rectangle of the current buffer, so a
//! context view never outlives the buffer it draws into.

use tracing::debug;

use crate::event::{Event, EventKind, EventQueue};
use crate::shared::Geometry;
use crate::window::canvas::Canvas;

/// Identifies a drawing context within its window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u32);

/// What a handler wants after processing an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Done with this event
    Finish,
    /// Deliver the event again on the next frame, with `repeat` incremented
    Recall,
}

/// Application side of a drawing context
pub trait ContextHandler {
    /// Handle one event while the window renders
    fn handle(&mut self, event: &Event, canvas: &mut Canvas<'_>) -> Flow;

    /// The context has been removed; `event` is its `End` event
    fn end(&mut self, _event: &Event) {}
}

impl<F> ContextHandler for F
where
    F: FnMut(&Event, &mut Canvas<'_>) -> Flow,
{
    fn handle(&mut self, event: &Event, canvas: &mut Canvas<'_>) -> Flow {
        self(event, canvas)
    }
}

/// One registered drawing context
pub struct DrawingContext {
    id: ContextId,

    /// Stacking order; lower layers render first
    layer: i32,

    /// Rectangle in buffer coordinates
    geometry: Geometry,

    handler: Box<dyn ContextHandler>,

    queue: EventQueue,
}

impl DrawingContext {
    pub(crate) fn new(
        id: ContextId,
        layer: i32,
        geometry: Geometry,
        handler: Box<dyn ContextHandler>,
    ) -> Self {
        Self {
            id,
            layer,
            geometry,
            handler,
            queue: EventQueue::new(),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn layer(&self) -> i32 {
        self.layer
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub(crate) fn queue_mut(&mut self) -> &mut EventQueue {
        &mut self.queue
    }

    /// Deliver every queued event to the handler
    ///
    /// The queue is drained and reset first; recalled events are queued
    /// again for the next frame.
    pub(crate) fn deliver(&mut self, canvas: &mut Canvas<'_>) -> crate::Result<()> {
        for event in self.queue.drain() {
            if self.handler.handle(&event, canvas) == Flow::Recall {
                self.queue.enqueue(event.recalled())?;
            }
        }
        Ok(())
    }

    /// Deliver `End` after the context has been unlinked
    ///
    /// Events still pending are dropped; the handler gets no canvas because
    /// the context no longer owns a region.
    pub(crate) fn finish(mut self) {
        let pending = self.queue.len();
        if pending > 0 {
            debug!("Dropping {} pending events of context {:?}", pending, self.id);
        }
        self.queue.reset();

        let end = Event::new(EventKind::End);
        self.handler.end(&end);
    }
}

/// Ordered set of drawing contexts, in creation order
#[derive(Default)]
pub struct ContextRegistry {
    contexts: Vec<DrawingContext>,
    next_id: u32,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a context at the tail and queue its `Begin` event
    pub fn insert(
        &mut self,
        handler: Box<dyn ContextHandler>,
        layer: i32,
        geometry: Geometry,
    ) -> crate::Result<ContextId> {
        let id = ContextId(self.next_id);
        self.next_id += 1;

        let mut context = DrawingContext::new(id, layer, geometry, handler);
        context.queue_mut().enqueue(Event::new(EventKind::Begin))?;
        self.contexts.push(context);

        debug!("Created context {:?} at {:?} (layer {})", id, geometry, layer);
        Ok(id)
    }

    /// Unlink a context, keeping the order of the others
    pub fn remove(&mut self, id: ContextId) -> Option<DrawingContext> {
        let index = self.contexts.iter().position(|c| c.id == id)?;
        Some(self.contexts.remove(index))
    }

    pub fn get(&self, id: ContextId) -> Option<&DrawingContext> {
        self.contexts.iter().find(|c| c.id == id)
    }

    pub fn get_mut(&mut self, id: ContextId) -> Option<&mut DrawingContext> {
        self.contexts.iter_mut().find(|c| c.id == id)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Ids in creation order
    pub fn ids(&self) -> Vec<ContextId> {
        self.contexts.iter().map(|c| c.id).collect()
    }

    /// Contexts in render order: ascending layer, creation order within a layer
    pub fn render_order(&mut self) -> Vec<&mut DrawingContext> {
        let mut ordered: Vec<&mut DrawingContext> = self.contexts.iter_mut().collect();
        ordered.sort_by_key(|c| c.layer);
        ordered
    }

    /// Remove every context, delivering `End` to each
    pub fn clear(&mut self) -> usize {
        let count = self.contexts.len();
        for context in self.contexts.drain(..) {
            context.finish();
        }
        count
    }
}
