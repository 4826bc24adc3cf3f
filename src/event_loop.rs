//! Main Loop
//!
//! Single-threaded dispatcher that waits on two sources at once: the protocol
//! connection and a self-pipe fed by the SIGINT handler and `BreakHandle`s.
//! The handler only writes one byte; everything else happens on the loop
//! thread.

use std::io::{self, Read, Write};
use std::ops::ControlFlow;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use signal_hook::consts::SIGINT;
use signal_hook::SigId;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::protocol::Backend;
use crate::session::Session;

/// Events carried over the self-pipe, one byte each
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopEvent {
    /// End the loop
    Break = 0,
}

impl LoopEvent {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(LoopEvent::Break),
            _ => None,
        }
    }
}

/// Why the main loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// A break event arrived (SIGINT or `BreakHandle`)
    Break,
    /// The server asked the window to close
    CloseRequested,
    /// The server hung up
    Disconnected,
    /// Writing requests failed
    FlushFailed,
    /// The readiness wait failed
    PollFailed,
    /// Reading from the connection failed
    ReadFailed,
    /// Dispatching or applying server events failed
    DispatchFailed,
    /// Drawing or replacing the buffer failed
    RenderFailed,
}

impl LoopExit {
    /// Whether the loop ended because something went wrong
    pub fn is_failure(self) -> bool {
        !matches!(self, LoopExit::Break | LoopExit::CloseRequested)
    }
}

/// Write end of the self-pipe, usable from any thread
#[derive(Debug, Clone)]
pub struct BreakHandle {
    writer: Arc<UnixStream>,
}

impl BreakHandle {
    /// Ask the loop to stop after its current iteration
    pub fn request_break(&self) -> io::Result<()> {
        send_event(&self.writer, LoopEvent::Break)
    }
}

// Single write(2) call, nothing else: runs inside the signal handler
fn send_event(writer: &UnixStream, event: LoopEvent) -> io::Result<()> {
    let mut writer = writer;
    match writer.write(&[event as u8]) {
        Ok(_) => Ok(()),
        // A full pipe already holds a wake-up
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(e),
    }
}

/// Number of live pipes SIGINT is currently routed to
static SIGINT_ROUTES: AtomicUsize = AtomicUsize::new(0);

/// Whether the default-disposition action has been registered
static DEFAULT_ACTION: Mutex<bool> = Mutex::new(false);

// signal-hook never uninstalls its own handler, so once no pipe takes SIGINT
// this action terminates the process the way the default disposition would.
fn install_default_action() -> Result<()> {
    let mut installed = DEFAULT_ACTION
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if *installed {
        return Ok(());
    }

    // SAFETY: the action reads one atomic and calls
    // emulate_default_handler, both async-signal-safe.
    unsafe {
        signal_hook::low_level::register(SIGINT, || {
            if SIGINT_ROUTES.load(Ordering::SeqCst) == 0 {
                let _ = signal_hook::low_level::emulate_default_handler(SIGINT);
            }
        })
    }
    .map_err(Error::Signal)?;
    *installed = true;
    Ok(())
}

/// The self-pipe and the SIGINT registration feeding it
pub(crate) struct SignalPipe {
    reader: UnixStream,
    writer: Arc<UnixStream>,
    sig_id: Option<SigId>,
}

impl SignalPipe {
    /// Create the pipe and optionally route SIGINT into it
    pub(crate) fn new(handle_interrupt: bool) -> Result<Self> {
        let (reader, writer) = UnixStream::pair().map_err(Error::Signal)?;
        reader.set_nonblocking(true).map_err(Error::Signal)?;
        writer.set_nonblocking(true).map_err(Error::Signal)?;
        let writer = Arc::new(writer);

        let sig_id = if handle_interrupt {
            install_default_action()?;

            let handler_writer = writer.clone();
            // SAFETY: the action only performs one write(2) on a
            // non-blocking socket, which is async-signal-safe.
            let id = unsafe {
                signal_hook::low_level::register(SIGINT, move || {
                    let _ = send_event(&handler_writer, LoopEvent::Break);
                })
            }
            .map_err(Error::Signal)?;
            SIGINT_ROUTES.fetch_add(1, Ordering::SeqCst);
            debug!("SIGINT routed to the main loop");
            Some(id)
        } else {
            None
        };

        Ok(Self {
            reader,
            writer,
            sig_id,
        })
    }

    pub(crate) fn break_handle(&self) -> BreakHandle {
        BreakHandle {
            writer: self.writer.clone(),
        }
    }

    /// Read exactly one event byte
    fn read_event(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop routing SIGINT here
    ///
    /// When no other pipe takes SIGINT, it terminates the process again.
    pub(crate) fn close(&mut self) {
        if let Some(id) = self.sig_id.take() {
            signal_hook::low_level::unregister(id);
            SIGINT_ROUTES.fetch_sub(1, Ordering::SeqCst);
            debug!("SIGINT handler removed");
        }
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        self.close();
    }
}

impl<B: Backend> Session<B> {
    /// Run until a break, a close request, or a loop-level failure
    ///
    /// Teardown (`destroy_window`, `disconnect`) is left to the caller.
    pub fn run(&mut self) -> LoopExit {
        info!("Entering main loop");
        let exit = loop {
            if let ControlFlow::Break(exit) = self.iterate() {
                break exit;
            }
        };

        match exit {
            LoopExit::Break | LoopExit::CloseRequested => info!("Main loop finished: {:?}", exit),
            _ => error!("Main loop failed: {:?}", exit),
        }
        exit
    }

    /// One pass: dispatch, flush, wait, read, render
    pub fn iterate(&mut self) -> ControlFlow<LoopExit> {
        // 1. Events already read from the socket
        self.dispatch_queued()?;

        // 2. Outgoing requests
        if let Err(e) = self.backend.flush() {
            if e.kind() != io::ErrorKind::WouldBlock {
                error!("Flush failed: {}", e);
                return ControlFlow::Break(LoopExit::FlushFailed);
            }
        }

        while !self.backend.prepare_read() {
            self.dispatch_queued()?;
        }

        // 3. Readiness wait, the only blocking point
        let timeout = self.poll_timeout(Instant::now());
        let polled = {
            let mut fds = [
                PollFd::new(self.backend.connection_fd(), PollFlags::POLLIN),
                PollFd::new(self.signals.reader.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, timeout) {
                Ok(_) => Ok((
                    fds[0].revents().unwrap_or(PollFlags::empty()),
                    fds[1].revents().unwrap_or(PollFlags::empty()),
                )),
                Err(e) => Err(e),
            }
        };

        let (conn, pipe) = match polled {
            Ok(revents) => revents,
            Err(Errno::EINTR) => {
                self.backend.cancel_read();
                return ControlFlow::Continue(());
            }
            Err(e) => {
                self.backend.cancel_read();
                error!("Poll failed: {}", e);
                return ControlFlow::Break(LoopExit::PollFailed);
            }
        };

        let readable = conn.contains(PollFlags::POLLIN);
        let hangup = conn.intersects(PollFlags::POLLHUP | PollFlags::POLLERR);

        // 4. Loop events yield to pending protocol input
        if pipe.contains(PollFlags::POLLIN) && !readable {
            self.backend.cancel_read();
            match self.signals.read_event() {
                Ok(Some(byte)) => match LoopEvent::from_byte(byte) {
                    Some(LoopEvent::Break) => {
                        info!("Break event received");
                        return ControlFlow::Break(LoopExit::Break);
                    }
                    None => warn!("Unknown loop event {}", byte),
                },
                Ok(None) => {}
                Err(e) => warn!("Failed to read loop event: {}", e),
            }
            return ControlFlow::Continue(());
        }

        // 5. Hangup with nothing left to read
        if hangup && !readable {
            self.backend.cancel_read();
            info!("Server closed the connection");
            return ControlFlow::Break(LoopExit::Disconnected);
        }

        // 6. Protocol input
        if readable {
            if let Err(e) = self.backend.read_events() {
                if hangup {
                    info!("Server closed the connection: {}", e);
                    return ControlFlow::Break(LoopExit::Disconnected);
                }
                error!("Reading events failed: {}", e);
                return ControlFlow::Break(LoopExit::ReadFailed);
            }
            self.dispatch_queued()?;
        } else {
            self.backend.cancel_read();
        }

        // 7. Render
        self.render_step(Instant::now())
    }

    fn dispatch_queued(&mut self) -> ControlFlow<LoopExit> {
        let mut events = Vec::new();
        if let Err(e) = self.backend.dispatch_pending(&mut events) {
            error!("Dispatch failed: {}", e);
            return ControlFlow::Break(LoopExit::DispatchFailed);
        }

        if let Err(e) = self.route(events) {
            error!("Handling server events failed: {}", e);
            return ControlFlow::Break(LoopExit::DispatchFailed);
        }

        if self.window.as_ref().is_some_and(|w| w.close_requested()) {
            return ControlFlow::Break(LoopExit::CloseRequested);
        }
        ControlFlow::Continue(())
    }

    /// Renderable windows are not waited on; a busy buffer bounds the wait by
    /// the time left before it counts as stalled
    fn poll_timeout(&self, now: Instant) -> PollTimeout {
        let Some(window) = self.window.as_ref() else {
            return PollTimeout::NONE;
        };

        if window.can_render() {
            return PollTimeout::ZERO;
        }

        match self
            .config
            .busy_timeout
            .and_then(|timeout| window.stall_deadline(now, timeout))
        {
            Some(left) => PollTimeout::from(timeout_millis(left)),
            None => PollTimeout::NONE,
        }
    }

    fn render_step(&mut self, now: Instant) -> ControlFlow<LoopExit> {
        let Some(window) = self.window.as_mut() else {
            return ControlFlow::Continue(());
        };

        if let Some(timeout) = self.config.busy_timeout {
            if let Err(e) = window.reclaim_stalled(&mut self.backend, now, timeout) {
                error!("Replacing stalled buffer failed: {}", e);
                return ControlFlow::Break(LoopExit::RenderFailed);
            }
        }

        if window.can_render() {
            if let Err(e) = window.render(&mut self.backend) {
                error!("Render failed: {}", e);
                return ControlFlow::Break(LoopExit::RenderFailed);
            }
        }
        ControlFlow::Continue(())
    }
}

// Rounded up so a wake-up never lands just before the deadline
fn timeout_millis(duration: Duration) -> u16 {
    let ms = duration.as_millis() + u128::from(duration.subsec_nanos() % 1_000_000 != 0);
    ms.min(u128::from(u16::MAX)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mock::{MockBackend, Request};
    use crate::protocol::ProtocolEvent;
    use crate::window::canvas::argb_bytes;
    use crate::window::Canvas;
    use std::thread;
    use tiny_skia::Color;

    fn session(dir: &tempfile::TempDir) -> Session<MockBackend> {
        let config = Config {
            handle_interrupt: false,
            busy_timeout: None,
            ..Config::default()
        }
        .with_runtime_dir(dir.path());
        Session::connect_with(MockBackend::new(), config).unwrap()
    }

    #[test]
    fn test_loop_event_bytes() {
        assert_eq!(LoopEvent::from_byte(0), Some(LoopEvent::Break));
        assert_eq!(LoopEvent::from_byte(7), None);
        assert!(!LoopExit::Break.is_failure());
        assert!(LoopExit::Disconnected.is_failure());
    }

    #[test]
    fn test_timeout_rounds_up() {
        assert_eq!(timeout_millis(Duration::from_millis(5)), 5);
        assert_eq!(timeout_millis(Duration::from_micros(1500)), 2);
        assert_eq!(timeout_millis(Duration::ZERO), 0);
        assert_eq!(timeout_millis(Duration::from_secs(3600)), u16::MAX);
    }

    #[test]
    fn test_solid_fill_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let color = Color::from_rgba8(0x20, 0x80, 0xc0, 0xff);

        let window = session.create_window(400, 400).unwrap();
        let surface = window.surface();
        window.register_draw(move |w: u32, h: u32, canvas: &mut Canvas<'_>| {
            assert_eq!((w, h), (400, 400));
            canvas.clear(color);
        });
        session.backend_mut().clear_requests();

        assert_eq!(session.iterate(), ControlFlow::Continue(()));

        let window = session.window().unwrap();
        let expected = argb_bytes(color);
        assert_eq!(window.buffer().len(), 400 * 400 * 4);
        assert!(window
            .buffer()
            .pixels()
            .chunks_exact(4)
            .all(|px| px == expected));

        let backend = session.backend();
        let damage = backend
            .position(|r| {
                *r == Request::Damage {
                    surface,
                    x: 0,
                    y: 0,
                    width: 400,
                    height: 400,
                }
            })
            .unwrap();
        let commit = backend.position(|r| *r == Request::Commit(surface)).unwrap();
        assert!(damage < commit);
    }

    #[test]
    fn test_release_makes_next_iteration_render() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        session.create_window(32, 32).unwrap();

        assert_eq!(session.iterate(), ControlFlow::Continue(()));
        let window = session.window().unwrap();
        assert_eq!(window.frames(), 1);
        assert!(!window.can_render());
        let buffer = window.buffer().id();

        session
            .backend_mut()
            .send(ProtocolEvent::BufferRelease { buffer });
        assert_eq!(session.iterate(), ControlFlow::Continue(()));
        assert_eq!(session.window().unwrap().frames(), 2);
        assert_eq!(session.backend().count(|r| matches!(r, Request::Commit(_))), 3);
    }

    #[test]
    fn test_resize_acks_before_next_render() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        session.create_window(400, 400).unwrap();
        session.backend_mut().clear_requests();

        let surface = session.window().unwrap().surface();
        let serial = session.backend_mut().next_serial();
        session.backend_mut().send(ProtocolEvent::ToplevelConfigure {
            surface,
            width: 800,
            height: 600,
        });
        session
            .backend_mut()
            .send(ProtocolEvent::SurfaceConfigure { surface, serial });

        assert_eq!(session.iterate(), ControlFlow::Continue(()));

        let window = session.window().unwrap();
        assert_eq!(window.size(), (800, 600));
        let buffer = window.buffer().id();

        let backend = session.backend();
        let info = backend.buffer_info(buffer).unwrap();
        assert_eq!((info.width, info.height, info.stride), (800, 600, 3200));
        assert_eq!(info.file_len, 3200 * 600);

        let ack = backend
            .position(|r| *r == Request::AckConfigure { surface, serial })
            .unwrap();
        let attach = backend
            .position(|r| {
                *r == Request::Attach {
                    surface,
                    buffer: Some(buffer),
                }
            })
            .unwrap();
        assert!(ack < attach);
        assert_eq!(backend.live_buffers(), 1);
    }

    #[test]
    fn test_ping_during_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        session.backend_mut().send(ProtocolEvent::Ping { serial: 77 });

        assert_eq!(session.iterate(), ControlFlow::Continue(()));
        assert!(session.backend().requests().contains(&Request::Pong(77)));
    }

    #[test]
    fn test_close_request_ends_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let surface = session.create_window(16, 16).unwrap().surface();

        session
            .backend_mut()
            .send(ProtocolEvent::ToplevelClose { surface });
        assert_eq!(session.run(), LoopExit::CloseRequested);
    }

    #[test]
    fn test_hangup_ends_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        session.backend_mut().hang_up();

        assert_eq!(session.run(), LoopExit::Disconnected);
    }

    #[test]
    fn test_flush_failure_ends_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        session.backend_mut().fail_flush(io::ErrorKind::BrokenPipe);
        assert_eq!(session.run(), LoopExit::FlushFailed);
    }

    #[test]
    fn test_would_block_flush_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        session.backend_mut().fail_flush(io::ErrorKind::WouldBlock);
        session.break_handle().request_break().unwrap();
        assert_eq!(session.run(), LoopExit::Break);
    }

    #[test]
    fn test_protocol_input_takes_priority_over_break() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        session.break_handle().request_break().unwrap();
        session.backend_mut().send(ProtocolEvent::Ping { serial: 5 });

        assert_eq!(session.iterate(), ControlFlow::Continue(()));
        assert!(session.backend().requests().contains(&Request::Pong(5)));
        assert_eq!(session.iterate(), ControlFlow::Break(LoopExit::Break));
    }

    #[test]
    fn test_break_from_another_thread() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let handle = session.break_handle();

        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.request_break().unwrap();
        });

        assert_eq!(session.run(), LoopExit::Break);
        sender.join().unwrap();
        assert_eq!(session.backend().reads(), 0);
    }

    #[test]
    fn test_sigint_breaks_blocked_loop() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            busy_timeout: None,
            ..Config::default()
        }
        .with_runtime_dir(dir.path());
        let mut session = Session::connect_with(MockBackend::new(), config).unwrap();
        session.create_window(8, 8).unwrap();

        // First pass renders; the busy buffer then blocks the wait
        assert_eq!(session.iterate(), ControlFlow::Continue(()));
        assert!(!session.window().unwrap().can_render());

        let signaller = thread::spawn(|| {
            thread::sleep(Duration::from_millis(50));
            nix::sys::signal::raise(nix::sys::signal::Signal::SIGINT).unwrap();
        });

        assert_eq!(session.run(), LoopExit::Break);
        signaller.join().unwrap();

        // Woken by the pipe, not by protocol traffic
        assert_eq!(session.backend().reads(), 0);
        session.disconnect();
    }

    const SIGINT_CHILD: &str = "WAYKIT_SIGINT_CHILD";

    #[test]
    fn test_sigint_terminates_after_disconnect() {
        use std::os::unix::process::ExitStatusExt;
        use std::process::Command;

        if std::env::var_os(SIGINT_CHILD).is_some() {
            let dir = tempfile::tempdir().unwrap();
            let config = Config::default().with_runtime_dir(dir.path());
            let session = Session::connect_with(MockBackend::new(), config).unwrap();
            session.disconnect();

            nix::sys::signal::raise(nix::sys::signal::Signal::SIGINT).unwrap();
            thread::sleep(Duration::from_millis(500));
            std::process::exit(0);
        }

        // Re-run this test alone in a child process
        let status = Command::new(std::env::current_exe().unwrap())
            .args([
                "--exact",
                "event_loop::tests::test_sigint_terminates_after_disconnect",
                "--nocapture",
                "--test-threads=1",
            ])
            .env(SIGINT_CHILD, "1")
            .status()
            .unwrap();
        assert_eq!(
            status.signal(),
            Some(nix::sys::signal::Signal::SIGINT as i32),
            "child exited with {:?}",
            status
        );
    }

    #[test]
    fn test_stalled_buffer_is_replaced_by_loop() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            handle_interrupt: false,
            busy_timeout: Some(Duration::from_millis(20)),
            ..Config::default()
        }
        .with_runtime_dir(dir.path());
        let mut session = Session::connect_with(MockBackend::new(), config).unwrap();
        session.create_window(8, 8).unwrap();

        assert_eq!(session.iterate(), ControlFlow::Continue(()));
        let stalled = session.window().unwrap().buffer().id();

        // Times out after ~20ms, replaces the buffer and renders again
        assert_eq!(session.iterate(), ControlFlow::Continue(()));
        let window = session.window().unwrap();
        assert_ne!(window.buffer().id(), stalled);
        assert_eq!(window.frames(), 2);
        assert!(session
            .backend()
            .requests()
            .contains(&Request::DestroyBuffer(stalled)));
    }
}
