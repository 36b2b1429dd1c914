//! Per-connection capability probing and event routing.
//!
//! Every X11 connection the driver touches gets probed once for the
//! extensions the swapchain depends on; the results live in a process-wide
//! registry keyed by connection identity. The wrapper also routes Present
//! events to the swapchain that selected them, which stands in for the
//! dedicated special-event queues of the C XCB library.

use std::os::fd::{AsFd, OwnedFd};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use rustix::event::{PollFd, PollFlags};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::errors::ReplyError;
use x11rb::protocol::dri3::{self, ConnectionExt as _};
use x11rb::protocol::present::{self, ConnectionExt as _};
use x11rb::protocol::randr::{self, ConnectionExt as _};
use x11rb::protocol::shm::{self, ConnectionExt as _};
use x11rb::protocol::sync;
use x11rb::protocol::xfixes::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{self, ConnectionExt as _};
use x11rb::protocol::{Event, ErrorKind};
use x11rb::rust_connection::RustConnection;

use crate::SurfaceError;

/// Capabilities probed from one X11 connection.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectionInfo {
    pub has_dri3: bool,
    /// DRI3 >= 1.2 and Present >= 1.2, required for explicit modifiers.
    pub has_dri3_modifiers: bool,
    pub has_present: bool,
    /// XFixes >= 2, required for damage regions.
    pub has_xfixes: bool,
    pub has_mit_shm: bool,
    /// A proprietary driver stack (ATI/NVIDIA control extensions) owns the
    /// display; DRI3 warnings are pointless there.
    pub is_proprietary_x11: bool,
    pub is_xwayland: bool,
}

impl ConnectionInfo {
    /// DRI3 gate for hardware presentation, with a hint for users running
    /// servers that simply have it disabled.
    pub(crate) fn check_for_dri3(&self) -> bool {
        if self.has_dri3 {
            return true;
        }
        if !self.is_proprietary_x11 {
            log::warn!(
                "no DRI3 support detected, presentation requires DRI3; \
                 it can usually be enabled in the X server configuration"
            );
        }
        false
    }
}

/// A Present event stripped down to what the swapchain consumes.
#[derive(Clone, Copy, Debug)]
pub(crate) enum PresentEvent {
    Configure {
        width: u16,
        height: u16,
    },
    Idle {
        pixmap: xproto::Pixmap,
    },
    Complete {
        kind: present::CompleteKind,
        mode: present::CompleteMode,
        serial: u32,
        msc: u64,
    },
}

/// Shared wrapper around one X11 connection: probe results plus the event
/// router for all swapchains on the connection.
pub(crate) struct X11Connection {
    conn: Weak<RustConnection>,
    pub info: ConnectionInfo,
    routes: Mutex<FxHashMap<u32, flume::Sender<PresentEvent>>>,
    /// Held by the one thread currently blocking on the connection socket.
    /// Everyone else parks on their event channel until the reader hands
    /// events over.
    reader: Mutex<()>,
}

impl X11Connection {
    fn upgrade(&self) -> Result<Arc<RustConnection>, SurfaceError> {
        self.conn.upgrade().ok_or(SurfaceError::Lost)
    }

    pub fn register_event_stream(&self, event_id: u32) -> flume::Receiver<PresentEvent> {
        let (tx, rx) = flume::unbounded();
        self.routes.lock().insert(event_id, tx);
        rx
    }

    pub fn unregister_event_stream(&self, event_id: u32) {
        self.routes.lock().remove(&event_id);
    }

    fn route_event(&self, event: Event) {
        let (event_id, converted) = match event {
            Event::PresentConfigureNotify(e) => (
                e.event,
                PresentEvent::Configure {
                    width: e.width,
                    height: e.height,
                },
            ),
            Event::PresentIdleNotify(e) => (e.event, PresentEvent::Idle { pixmap: e.pixmap }),
            Event::PresentCompleteNotify(e) => (
                e.event,
                PresentEvent::Complete {
                    kind: e.kind,
                    mode: e.mode,
                    serial: e.serial,
                    msc: e.msc,
                },
            ),
            Event::Error(e) => {
                log::debug!("unchecked X11 request failed: {:?}", e.error_kind);
                return;
            }
            _ => return,
        };
        if let Some(tx) = self.routes.lock().get(&event_id) {
            let _ = tx.send(converted);
        }
    }

    /// Drains whatever the server already delivered, without blocking.
    pub fn poll_special_event(
        &self,
        rx: &flume::Receiver<PresentEvent>,
    ) -> Result<Option<PresentEvent>, SurfaceError> {
        loop {
            if let Ok(event) = rx.try_recv() {
                return Ok(Some(event));
            }
            let conn = self.upgrade()?;
            match conn.poll_for_event().map_err(|_| SurfaceError::Lost)? {
                Some(event) => self.route_event(event),
                // Another thread may have routed to us in the meantime.
                None => return Ok(rx.try_recv().ok()),
            }
        }
    }

    /// Blocks until an event for this stream arrives.
    pub fn wait_special_event(
        &self,
        rx: &flume::Receiver<PresentEvent>,
    ) -> Result<PresentEvent, SurfaceError> {
        loop {
            if let Ok(event) = rx.try_recv() {
                return Ok(event);
            }
            let conn = self.upgrade()?;
            if let Some(_reader) = self.reader.try_lock() {
                match conn.poll_for_event().map_err(|_| SurfaceError::Lost)? {
                    Some(event) => {
                        self.route_event(event);
                        continue;
                    }
                    None => {}
                }
                let event = conn.wait_for_event().map_err(|_| SurfaceError::Lost)?;
                self.route_event(event);
            } else {
                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(event) => return Ok(event),
                    Err(flume::RecvTimeoutError::Timeout) => continue,
                    Err(flume::RecvTimeoutError::Disconnected) => return Err(SurfaceError::Lost),
                }
            }
        }
    }

    /// Waits for readability on the connection socket. `Ok(false)` means
    /// the timeout expired.
    pub fn poll_connection(&self, timeout: Duration) -> Result<bool, SurfaceError> {
        let conn = self.upgrade()?;
        let stream = conn.stream();
        let mut fds = [PollFd::from_borrowed_fd(stream.as_fd(), PollFlags::IN)];
        match rustix::event::poll(&mut fds, timeout.as_millis() as i32) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(_) => Err(SurfaceError::OutOfDate),
        }
    }

    pub fn flush(&self) -> Result<(), SurfaceError> {
        self.upgrade()?.flush().map_err(|_| SurfaceError::Lost)
    }

    #[cfg(test)]
    pub fn dead(info: ConnectionInfo) -> Self {
        Self {
            conn: Weak::new(),
            info,
            routes: Mutex::new(FxHashMap::default()),
            reader: Mutex::new(()),
        }
    }
}

/// Process-wide cache of probed connections, keyed by connection identity.
pub(crate) struct Registry {
    connections: Mutex<FxHashMap<usize, Arc<X11Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn get(
        &self,
        conn: &Arc<RustConnection>,
        wants_shm: bool,
    ) -> Result<Arc<X11Connection>, SurfaceError> {
        let key = Arc::as_ptr(conn) as usize;
        {
            let map = self.connections.lock();
            if let Some(entry) = map.get(&key) {
                return Ok(entry.clone());
            }
        }

        // Probing does a handful of blocking round trips; keep the lock
        // dropped while they run. A racing prober loses its result.
        let info = probe_connection(conn, wants_shm)?;
        let wrapped = Arc::new(X11Connection {
            conn: Arc::downgrade(conn),
            info,
            routes: Mutex::new(FxHashMap::default()),
            reader: Mutex::new(()),
        });

        let mut map = self.connections.lock();
        Ok(map.entry(key).or_insert(wrapped).clone())
    }
}

/// Queries every extension the swapchain cares about. All requests go out
/// before the first reply is read.
fn probe_connection(conn: &RustConnection, wants_shm: bool) -> Result<ConnectionInfo, SurfaceError> {
    // The fence plumbing needs SYNC later; warm up the extension record
    // alongside everything else.
    let _ = conn.prefetch_extension_information(sync::X11_EXTENSION_NAME);

    let dri3_cookie = conn.query_extension(dri3::X11_EXTENSION_NAME.as_bytes())?;
    let present_cookie = conn.query_extension(present::X11_EXTENSION_NAME.as_bytes())?;
    let randr_cookie = conn.query_extension(randr::X11_EXTENSION_NAME.as_bytes())?;
    let xfixes_cookie = conn.query_extension(xfixes::X11_EXTENSION_NAME.as_bytes())?;
    let xwl_cookie = conn.query_extension(b"XWAYLAND")?;
    let amd_cookie = conn.query_extension(b"ATIFGLRXDRI")?;
    let nv_cookie = conn.query_extension(b"NV-CONTROL")?;
    let shm_cookie = if wants_shm {
        Some(conn.query_extension(shm::X11_EXTENSION_NAME.as_bytes())?)
    } else {
        None
    };

    let mut info = ConnectionInfo::default();

    info.has_dri3 = dri3_cookie.reply()?.present;
    let mut has_dri3_v1_2 = false;
    if info.has_dri3 {
        if let Ok(version) = conn.dri3_query_version(1, 2)?.reply() {
            has_dri3_v1_2 = version.major_version > 1 || version.minor_version >= 2;
        }
    }

    info.has_present = present_cookie.reply()?.present;
    let mut has_present_v1_2 = false;
    if info.has_present {
        if let Ok(version) = conn.present_query_version(1, 2)?.reply() {
            has_present_v1_2 = version.major_version > 1 || version.minor_version >= 2;
        }
    }
    info.has_dri3_modifiers = has_dri3_v1_2 && has_present_v1_2;

    info.has_xfixes = xfixes_cookie.reply()?.present;
    if info.has_xfixes {
        // Negotiate the version while we are at it; regions need >= 2.
        match conn.xfixes_query_version(6, 0)?.reply() {
            Ok(version) => info.has_xfixes = version.major_version >= 2,
            Err(_) => info.has_xfixes = false,
        }
    }

    let randr_present = randr_cookie.reply()?.present;
    let xwl_present = xwl_cookie.reply()?.present;
    info.is_xwayland = detect_xwayland(conn, randr_present, xwl_present);

    info.is_proprietary_x11 = amd_cookie.reply()?.present || nv_cookie.reply()?.present;

    if let Some(shm_cookie) = shm_cookie {
        if info.has_dri3 && info.has_present && shm_cookie.reply()?.present {
            info.has_mit_shm = probe_mit_shm(conn);
        }
    }

    Ok(info)
}

/// MIT-SHM is only usable when the server shares our address space.
/// `ShmDetach` on segment zero answers that: a remote server rejects the
/// whole request, a local one reports a bad segment.
fn probe_mit_shm(conn: &RustConnection) -> bool {
    let shared_pixmaps = match conn.shm_query_version() {
        Ok(cookie) => cookie.reply().map(|r| r.shared_pixmaps).unwrap_or(false),
        Err(_) => false,
    };
    if !shared_pixmaps {
        return false;
    }
    match conn.shm_detach(0) {
        Ok(cookie) => match cookie.check() {
            Err(ReplyError::X11Error(err)) => err.error_kind != ErrorKind::Request,
            _ => false,
        },
        Err(_) => false,
    }
}

/// Newer Xwayland exposes an extension; older ones leak the word XWAYLAND
/// through RandR output names.
fn detect_xwayland(conn: &RustConnection, randr_present: bool, xwl_present: bool) -> bool {
    if xwl_present {
        return true;
    }
    if !randr_present {
        return false;
    }

    let has_randr_1_3 = match conn.randr_query_version(1, 3) {
        Ok(cookie) => cookie
            .reply()
            .map(|v| v.major_version > 1 || v.minor_version >= 3)
            .unwrap_or(false),
        Err(_) => false,
    };
    if !has_randr_1_3 {
        return false;
    }

    let Some(root) = conn.setup().roots.first().map(|screen| screen.root) else {
        return false;
    };
    let resources = match conn.randr_get_screen_resources_current(root) {
        Ok(cookie) => match cookie.reply() {
            Ok(reply) => reply,
            Err(_) => return false,
        },
        Err(_) => return false,
    };
    let Some(&output) = resources.outputs.first() else {
        return false;
    };
    match conn.randr_get_output_info(output, resources.config_timestamp) {
        Ok(cookie) => cookie
            .reply()
            .map(|reply| output_name_is_xwayland(&reply.name))
            .unwrap_or(false),
        Err(_) => false,
    }
}

pub(crate) fn output_name_is_xwayland(name: &[u8]) -> bool {
    name.starts_with(b"XWAYLAND")
}

/// Opens the DRM device the server presents with. `None` when the server
/// has no DRI3 device to hand out.
pub(crate) fn dri3_open_device(conn: &RustConnection, root: xproto::Window) -> Option<OwnedFd> {
    let reply = conn.dri3_open(root, 0).ok()?.reply().ok()?;
    // The protocol pins the fd count to one.
    if reply.nfd != 1 {
        return None;
    }
    let fd = reply.device_fd;
    let flags = rustix::io::fcntl_getfd(&fd).ok()?;
    rustix::io::fcntl_setfd(&fd, flags | rustix::io::FdFlags::CLOEXEC).ok()?;
    Some(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xwayland_output_names() {
        assert!(output_name_is_xwayland(b"XWAYLAND0"));
        assert!(output_name_is_xwayland(b"XWAYLAND12"));
        assert!(!output_name_is_xwayland(b"eDP-1"));
        assert!(!output_name_is_xwayland(b"HDMI-A-1"));
        assert!(!output_name_is_xwayland(b""));
    }

    #[test]
    fn events_route_by_event_id() {
        let conn = X11Connection::dead(ConnectionInfo::default());
        let rx = conn.register_event_stream(7);

        conn.route_event(Event::PresentIdleNotify(present::IdleNotifyEvent {
            response_type: 35,
            extension: 0,
            sequence: 0,
            length: 0,
            event_type: 2,
            event: 7,
            window: 42,
            serial: 1,
            pixmap: 99,
            idle_fence: 0,
        }));
        // A stream we never registered; must be dropped on the floor.
        conn.route_event(Event::PresentIdleNotify(present::IdleNotifyEvent {
            response_type: 35,
            extension: 0,
            sequence: 0,
            length: 0,
            event_type: 2,
            event: 9,
            window: 42,
            serial: 2,
            pixmap: 100,
            idle_fence: 0,
        }));

        match rx.try_recv().unwrap() {
            PresentEvent::Idle { pixmap } => assert_eq!(pixmap, 99),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());

        conn.unregister_event_stream(7);
        conn.route_event(Event::PresentIdleNotify(present::IdleNotifyEvent {
            response_type: 35,
            extension: 0,
            sequence: 0,
            length: 0,
            event_type: 2,
            event: 7,
            window: 42,
            serial: 3,
            pixmap: 99,
            idle_fence: 0,
        }));
        assert!(rx.try_recv().is_err());
    }
}
