//! The swapchain core: image pool, ownership state machine, Present event
//! demultiplexing, acquire/present entry points and the queue-manager
//! thread that paces FIFO and MAILBOX presentation.

use std::cell::Cell;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ash::vk;
use parking_lot::Mutex;
use x11rb::connection::Connection;
use x11rb::protocol::present::{self, CompleteKind, CompleteMode, ConnectionExt as _};
use x11rb::protocol::sync::ConnectionExt as _;
use x11rb::protocol::xfixes::ConnectionExt as _;
use x11rb::protocol::xproto::{self, ConnectionExt as _, CreateGCAux};
use x11rb::rust_connection::RustConnection;

use crate::connection::{self, PresentEvent, X11Connection};
use crate::queue::{self, Pull, SENTINEL};
use crate::shmfence::ShmFence;
use crate::transport;
use crate::{
    ChainStatus, ImageBacking, ImageFactory, ImageSpec, Options, ShmSegment, Status, Surface,
    SurfaceError, WsiImage, X11Wsi,
};

/// Parameters for swapchain creation, the subset of the Vulkan create info
/// this backend consumes.
#[derive(Clone)]
pub struct SwapchainCreateInfo {
    pub min_image_count: u32,
    pub image_format: vk::Format,
    pub image_extent: vk::Extent2D,
    pub image_usage: vk::ImageUsageFlags,
    pub present_mode: vk::PresentModeKHR,
}

/// Outcome of [`Swapchain::acquire_next_image`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    /// An image the application now owns. `suboptimal` mirrors the sticky
    /// swapchain status.
    Image { index: u32, suboptimal: bool },
    /// No image was free and the call was non-blocking.
    NotReady,
    /// The timeout expired before an image became free.
    Timeout,
}

/// One slot of the image pool.
struct ImageSlot {
    wsi: WsiImage,
    /// Server-side buffer id. Zero for software images presented through
    /// core protocol uploads.
    pixmap: xproto::Pixmap,
    /// Long-lived XFixes region used for damage.
    update_region: u32,
    /// `update_region` when the last queued present carried damage, zero
    /// for whole-pixmap updates.
    update_area: AtomicU32,
    /// True while the server owns the image or a present is in flight.
    busy: AtomicBool,
    /// True between the present request and its CompleteNotify.
    present_queued: AtomicBool,
    /// Serial of the most recent present request for this image.
    serial: AtomicU32,
    shm_fence: Option<ShmFence>,
    /// Server-side Sync fence bound to `shm_fence`. Zero when absent.
    sync_fence: u32,
    /// SysV segment id attached server side, zero when unused.
    shmseg: u32,
    shmid: i32,
    shmaddr: *mut u8,
}

// `shmaddr` is only dereferenced through the factory's CPU mapping and the
// detach call on teardown.
unsafe impl Send for ImageSlot {}
unsafe impl Sync for ImageSlot {}

impl ImageSlot {
    fn new(wsi: WsiImage, update_region: u32) -> Self {
        Self {
            wsi,
            pixmap: 0,
            update_region,
            update_area: AtomicU32::new(0),
            busy: AtomicBool::new(false),
            present_queued: AtomicBool::new(false),
            serial: AtomicU32::new(0),
            shm_fence: None,
            sync_fence: 0,
            shmseg: 0,
            shmid: -1,
            shmaddr: std::ptr::null_mut(),
        }
    }
}

/// The pool bookkeeping shared between the application thread and the
/// queue manager. Everything wire-related lives one level up in
/// [`ChainShared`], which keeps this testable in isolation.
struct ChainState {
    extent: vk::Extent2D,
    images: Vec<ImageSlot>,
    status: Mutex<ChainStatus>,
    /// Images currently held by the server.
    sent_image_count: AtomicI32,
    /// Serial counter; the low 32 bits travel on the wire.
    send_sbc: AtomicU64,
    last_present_msc: AtomicU64,
    /// Set once a flip was ever observed; from then on a copy completion
    /// reports the swapchain as suboptimal.
    copy_is_suboptimal: AtomicBool,
    /// Feeds released image indices back to FIFO acquirers.
    acquire_tx: Option<flume::Sender<u32>>,
    /// Advertised minimum image count, clamped to the pool size.
    min_image_count: u32,
}

impl ChainState {
    /// Folds an operation result into the sticky status word and returns
    /// the combined value. Fatal errors are absorbing; suboptimal sticks
    /// until an error replaces it; success never clears anything.
    fn reduce(&self, result: ChainStatus) -> ChainStatus {
        let mut status = self.status.lock();
        if status.is_err() {
            return *status;
        }
        match result {
            Err(err) => {
                log::debug!("swapchain status changed to {err:?}");
                *status = Err(err);
                Err(err)
            }
            Ok(Status::Suboptimal) => {
                if *status != Ok(Status::Suboptimal) {
                    log::debug!("swapchain status changed to suboptimal");
                }
                *status = Ok(Status::Suboptimal);
                Ok(Status::Suboptimal)
            }
            Ok(Status::Optimal) => *status,
        }
    }

    fn status(&self) -> ChainStatus {
        *self.status.lock()
    }

    fn set_status(&self, status: ChainStatus) {
        *self.status.lock() = status;
    }

    /// Images not owned by the server: acquired by the application,
    /// acquirable, or queued for the manager thread.
    fn driver_owned_images(&self) -> u32 {
        let sent = self.sent_image_count.load(Ordering::Acquire).max(0) as u32;
        self.images.len() as u32 - sent
    }

    /// Bookkeeping for a present request; returns the wire serial.
    fn begin_present(&self, image_index: u32) -> u32 {
        let image = &self.images[image_index as usize];
        if let Some(fence) = &image.shm_fence {
            fence.reset();
        }

        let sent = self.sent_image_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(sent as usize <= self.images.len());

        let serial = (self.send_sbc.fetch_add(1, Ordering::AcqRel) + 1) as u32;
        image.present_queued.store(true, Ordering::Release);
        image.serial.store(serial, Ordering::Release);
        serial
    }

    /// Applies one Present event to the pool and returns the raw result,
    /// which the caller feeds through [`ChainState::reduce`].
    fn handle_present_event(&self, event: &PresentEvent) -> ChainStatus {
        match *event {
            PresentEvent::Configure { width, height } => {
                if u32::from(width) != self.extent.width
                    || u32::from(height) != self.extent.height
                {
                    Ok(Status::Suboptimal)
                } else {
                    Ok(Status::Optimal)
                }
            }
            PresentEvent::Idle { pixmap } => {
                for (index, image) in self.images.iter().enumerate() {
                    if image.pixmap == pixmap {
                        image.busy.store(false, Ordering::Release);
                        let sent = self.sent_image_count.fetch_sub(1, Ordering::AcqRel) - 1;
                        debug_assert!(sent >= 0);
                        if let Some(tx) = &self.acquire_tx {
                            let _ = tx.send(index as u32);
                        }
                        break;
                    }
                }
                Ok(Status::Optimal)
            }
            PresentEvent::Complete {
                kind,
                mode,
                serial,
                msc,
            } => {
                if kind == CompleteKind::PIXMAP {
                    for image in &self.images {
                        if image.present_queued.load(Ordering::Acquire)
                            && image.serial.load(Ordering::Acquire) == serial
                        {
                            image.present_queued.store(false, Ordering::Release);
                        }
                    }
                    self.last_present_msc.store(msc, Ordering::Release);
                }

                if mode == CompleteMode::COPY {
                    if self.copy_is_suboptimal.load(Ordering::Acquire) {
                        Ok(Status::Suboptimal)
                    } else {
                        Ok(Status::Optimal)
                    }
                } else if mode == CompleteMode::FLIP {
                    // Once the server flipped, a later fall back to
                    // copying means a reallocation could restore flips.
                    self.copy_is_suboptimal.store(true, Ordering::Release);
                    Ok(Status::Optimal)
                } else if mode == CompleteMode::SUBOPTIMAL_COPY {
                    // The server wants to flip but our buffers do not let
                    // it; ask the application to reallocate.
                    Ok(Status::Suboptimal)
                } else {
                    Ok(Status::Optimal)
                }
            }
        }
    }
}

/// Everything the application thread and the queue manager share.
struct ChainShared {
    state: ChainState,
    conn: Weak<RustConnection>,
    xconn: Arc<X11Connection>,
    /// The Present event stream selected for this swapchain only.
    events: flume::Receiver<PresentEvent>,
    window: xproto::Window,
    gc: xproto::Gcontext,
    event_id: u32,
    present_mode: vk::PresentModeKHR,
    software: bool,
    has_mit_shm: bool,
    has_dri3_modifiers: bool,
    is_xwayland: bool,
    /// The queue manager waits for render fences before presenting.
    needs_wait_for_fences: bool,
    has_acquire_queue: bool,
    factory: Arc<dyn ImageFactory>,
}

/// A swapchain bound to one window. Dropping it tears down the worker
/// thread and every server-side resource.
pub struct Swapchain {
    shared: Arc<ChainShared>,
    present_tx: Option<flume::Sender<u32>>,
    acquire_rx: Option<flume::Receiver<u32>>,
    worker: Option<JoinHandle<()>>,
}

/// Whether buffers must be fully rendered before they reach the server.
///
/// Mailbox replaces the pending buffer at any time, so a not-yet-finished
/// frame could be picked up and miss vsync. Immediate mode has the same
/// shape under Xwayland, where every present rides the compositor's
/// mailbox path.
fn needs_wait_for_fences(
    options: &Options,
    is_xwayland: bool,
    present_mode: vk::PresentModeKHR,
) -> bool {
    if is_xwayland && !options.xwayland_wait_ready {
        return false;
    }
    if present_mode == vk::PresentModeKHR::MAILBOX {
        true
    } else if present_mode == vk::PresentModeKHR::IMMEDIATE {
        is_xwayland
    } else {
        false
    }
}

/// The image count actually allocated for a request.
fn chain_image_count(options: &Options, needs_fence_wait: bool, requested: u32) -> u32 {
    if options.strict_image_count {
        requested
    } else if needs_fence_wait {
        // Pre-present fence waits serialize more of the frame; five images
        // keep the pipeline fed.
        requested.max(5)
    } else if options.ensure_min_image_count {
        requested.max(options.min_image_count())
    } else {
        requested
    }
}

impl X11Wsi {
    /// Creates a swapchain for `surface`. The window must outlive the
    /// swapchain or every subsequent operation reports a lost surface.
    pub fn create_swapchain(
        &self,
        surface: &Surface,
        info: &SwapchainCreateInfo,
    ) -> Result<Swapchain, SurfaceError> {
        let conn = &surface.conn;
        let window = surface.window;
        let xconn = self.connections.get(conn, self.wants_shm())?;
        let cinfo = xconn.info;

        let fence_wait = needs_wait_for_fences(&self.options, cinfo.is_xwayland, info.present_mode);
        let image_count = chain_image_count(&self.options, fence_wait, info.min_image_count);

        // The swapchain adopts the window's depth; its extent decides
        // whether the server can flip.
        let geometry = conn
            .get_geometry(window)?
            .reply()
            .map_err(|_| SurfaceError::Lost)?;
        let depth = geometry.depth;

        let mut tranches = Vec::new();
        if !self.caps.software && self.caps.supports_modifiers && cinfo.has_dri3_modifiers {
            tranches = transport::query_modifier_tranches(conn, window, depth, 32);
        }

        // The device the server scans out from; a mismatch with the
        // render device forces the cross-GPU blit path. No fd at all means
        // we assume they match.
        let display_fd = if self.caps.software {
            None
        } else {
            let root = conn
                .setup()
                .roots
                .first()
                .map(|screen| screen.root)
                .ok_or(SurfaceError::Lost)?;
            connection::dri3_open_device(conn, root)
        };
        let same_gpu = match &display_fd {
            Some(fd) => self.factory.matches_drm_device(fd.as_fd()),
            None => true,
        };

        // Select Configure (resizes), Complete (presented) and Idle
        // (reusable) notifications on a stream private to this swapchain.
        let event_id = conn.generate_id()?;
        conn.present_select_input(
            event_id,
            window,
            present::EventMask::CONFIGURE_NOTIFY
                | present::EventMask::COMPLETE_NOTIFY
                | present::EventMask::IDLE_NOTIFY,
        )?;
        let events = xconn.register_event_stream(event_id);

        let gc = conn.generate_id()?;
        conn.create_gc(gc, window, &CreateGCAux::new().graphics_exposures(0u32))?;

        let has_present_queue = !self.caps.software
            && (info.present_mode == vk::PresentModeKHR::FIFO
                || info.present_mode == vk::PresentModeKHR::FIFO_RELAXED
                || fence_wait);
        let has_acquire_queue = has_present_queue
            && (info.present_mode == vk::PresentModeKHR::FIFO
                || info.present_mode == vk::PresentModeKHR::FIFO_RELAXED);

        let (present_tx, present_rx) = if has_present_queue {
            let (tx, rx) = queue::image_queue(image_count);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (acquire_tx, acquire_rx) = if has_acquire_queue {
            let (tx, rx) = queue::image_queue(image_count);
            // Every image starts out acquirable.
            for index in 0..image_count {
                let _ = tx.send(index);
            }
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let mut images = Vec::with_capacity(image_count as usize);
        for _ in 0..image_count {
            match self.init_image(conn, &cinfo, window, depth, info, &tranches, &display_fd, same_gpu)
            {
                Ok(slot) => images.push(slot),
                Err(err) => {
                    for slot in &images {
                        finish_image(Some(conn), &*self.factory, slot);
                    }
                    xconn.unregister_event_stream(event_id);
                    let _ = conn.flush();
                    return Err(err);
                }
            }
        }
        drop(display_fd);

        // Presenting images that do not fit the window still works, but
        // only by copy; let the application know right away.
        let initial_status = if info.image_extent.width != u32::from(geometry.width)
            || info.image_extent.height != u32::from(geometry.height)
        {
            Ok(Status::Suboptimal)
        } else {
            Ok(Status::Optimal)
        };

        let shared = Arc::new(ChainShared {
            state: ChainState {
                extent: info.image_extent,
                images,
                status: Mutex::new(initial_status),
                sent_image_count: AtomicI32::new(0),
                send_sbc: AtomicU64::new(0),
                last_present_msc: AtomicU64::new(0),
                copy_is_suboptimal: AtomicBool::new(false),
                acquire_tx,
                min_image_count: self.options.min_image_count().min(image_count),
            },
            conn: Arc::downgrade(conn),
            xconn: xconn.clone(),
            events,
            window,
            gc,
            event_id,
            present_mode: info.present_mode,
            software: self.caps.software,
            has_mit_shm: cinfo.has_mit_shm,
            has_dri3_modifiers: cinfo.has_dri3_modifiers,
            is_xwayland: cinfo.is_xwayland,
            needs_wait_for_fences: fence_wait,
            has_acquire_queue,
            factory: self.factory.clone(),
        });

        let worker = if let Some(present_rx) = present_rx {
            let worker_shared = shared.clone();
            match std::thread::Builder::new()
                .name("wsi swapchain queue".into())
                .spawn(move || queue_manager(worker_shared, present_rx))
            {
                Ok(handle) => Some(handle),
                Err(_) => {
                    for slot in &shared.state.images {
                        finish_image(Some(conn), &*shared.factory, slot);
                    }
                    xconn.unregister_event_stream(event_id);
                    let _ = conn.flush();
                    return Err(SurfaceError::Initialization);
                }
            }
        } else {
            None
        };

        // One swapchain per window, and creating it makes the
        // association, so the property has a single writer.
        transport::set_adaptive_sync_property(conn, window, self.caps.enable_adaptive_sync);
        let _ = conn.flush();

        Ok(Swapchain {
            shared,
            present_tx,
            acquire_rx,
            worker,
        })
    }

    fn init_image(
        &self,
        conn: &Arc<RustConnection>,
        cinfo: &connection::ConnectionInfo,
        window: xproto::Window,
        depth: u8,
        info: &SwapchainCreateInfo,
        tranches: &[Vec<u64>],
        display_fd: &Option<std::os::fd::OwnedFd>,
        same_gpu: bool,
    ) -> Result<ImageSlot, SurfaceError> {
        let software = self.caps.software;
        let has_mit_shm = cinfo.has_mit_shm;

        // The factory allocates first; the pixmap import needs the
        // resulting DMA-buf or CPU mapping.
        let segment = Cell::new(None::<ShmSegment>);
        let shm_alloc = |size: usize| {
            let seg = transport::alloc_sysv_segment(size)?;
            segment.set(Some(seg));
            Some(seg)
        };
        let backing = if software {
            ImageBacking::Cpu {
                shm_alloc: has_mit_shm
                    .then_some(&shm_alloc as &dyn Fn(usize) -> Option<ShmSegment>),
            }
        } else {
            ImageBacking::Drm {
                same_gpu,
                modifier_lists: tranches,
                display_fd: display_fd.as_ref().map(|fd| fd.as_fd()),
            }
        };
        let wsi = self.factory.create_image(&ImageSpec {
            width: info.image_extent.width,
            height: info.image_extent.height,
            format: info.image_format,
            usage: info.image_usage,
            backing,
        })?;

        let update_region = conn.generate_id()?;
        conn.xfixes_create_region(update_region, &[])?;

        let mut slot = ImageSlot::new(wsi, update_region);

        if software && !has_mit_shm {
            // Core-protocol uploads; no pixmap and no release events.
            return Ok(slot);
        }

        if software {
            let Some(seg) = segment.take() else {
                finish_image(Some(conn), &*self.factory, &slot);
                return Err(SurfaceError::Initialization);
            };
            slot.shmid = seg.shmid;
            slot.shmaddr = seg.addr;
            match transport::create_shm_pixmap(
                conn,
                window,
                depth,
                (slot.wsi.row_pitches[0] / 4) as u16,
                info.image_extent.height as u16,
                seg.shmid,
            ) {
                Ok((pixmap, shmseg)) => {
                    slot.pixmap = pixmap;
                    slot.shmseg = shmseg;
                }
                Err(err) => {
                    finish_image(Some(conn), &*self.factory, &slot);
                    return Err(err);
                }
            }
        } else {
            match transport::create_dmabuf_pixmap(
                conn,
                window,
                depth,
                info.image_extent,
                &slot.wsi,
                cinfo.has_dri3_modifiers,
            ) {
                Ok(pixmap) => slot.pixmap = pixmap,
                Err(err) => {
                    finish_image(Some(conn), &*self.factory, &slot);
                    return Err(err);
                }
            }
        }

        let fence = match ShmFence::alloc() {
            Ok(fence) => fence,
            Err(_) => {
                finish_image(Some(conn), &*self.factory, &slot);
                return Err(SurfaceError::Initialization);
            }
        };
        match transport::create_sync_fence(conn, slot.pixmap, &fence) {
            Ok(sync_fence) => slot.sync_fence = sync_fence,
            Err(_) => {
                finish_image(Some(conn), &*self.factory, &slot);
                return Err(SurfaceError::Initialization);
            }
        }
        // Images start driver owned.
        fence.trigger();
        slot.shm_fence = Some(fence);

        Ok(slot)
    }
}

/// Frees one slot: server-side ids when the connection is still there,
/// then the GPU image and the SysV mapping.
fn finish_image(conn: Option<&RustConnection>, factory: &dyn ImageFactory, image: &ImageSlot) {
    if let Some(conn) = conn {
        if image.sync_fence != 0 {
            let _ = conn.sync_destroy_fence(image.sync_fence);
        }
        if image.pixmap != 0 {
            let _ = conn.free_pixmap(image.pixmap);
        }
        if image.update_region != 0 {
            let _ = conn.xfixes_destroy_region(image.update_region);
        }
    }
    factory.destroy_image(&image.wsi);
    if !image.shmaddr.is_null() {
        unsafe { transport::detach_sysv_segment(image.shmaddr) };
    }
}

impl Swapchain {
    pub fn image_count(&self) -> u32 {
        self.shared.state.images.len() as u32
    }

    pub fn image(&self, index: u32) -> Option<&WsiImage> {
        self.shared
            .state
            .images
            .get(index as usize)
            .map(|slot| &slot.wsi)
    }

    /// The sticky swapchain status.
    pub fn status(&self) -> ChainStatus {
        self.shared.state.status()
    }

    /// Hands the application an image it may render to.
    ///
    /// `timeout_ns` of zero polls, `u64::MAX` blocks forever, anything in
    /// between is an absolute budget for the whole call.
    pub fn acquire_next_image(&self, timeout_ns: u64) -> Result<Acquire, SurfaceError> {
        self.shared.state.status()?;

        if self.shared.software && !self.shared.has_mit_shm {
            return self.acquire_software();
        }
        if let Some(acquire_rx) = &self.acquire_rx {
            self.acquire_from_queue(acquire_rx, timeout_ns)
        } else {
            self.acquire_poll(timeout_ns)
        }
    }

    /// Software images without SHM have no release events; any non-busy
    /// image is fair game immediately.
    fn acquire_software(&self) -> Result<Acquire, SurfaceError> {
        let shared = &self.shared;
        let state = &shared.state;
        for (index, image) in state.images.iter().enumerate() {
            if !image.busy.load(Ordering::Acquire) {
                image.busy.store(true, Ordering::Release);

                let conn = shared.conn.upgrade().ok_or(SurfaceError::Lost)?;
                let geometry = conn
                    .get_geometry(shared.window)
                    .map_err(|_| SurfaceError::Lost)?
                    .reply()
                    .map_err(|_| SurfaceError::Lost)?;
                let suboptimal = u32::from(geometry.width) != state.extent.width
                    || u32::from(geometry.height) != state.extent.height;
                return Ok(Acquire::Image {
                    index: index as u32,
                    suboptimal,
                });
            }
        }
        Ok(Acquire::NotReady)
    }

    /// FIFO path: released images come back through the acquire queue.
    fn acquire_from_queue(
        &self,
        acquire_rx: &flume::Receiver<u32>,
        timeout_ns: u64,
    ) -> Result<Acquire, SurfaceError> {
        let state = &self.shared.state;
        let index = match queue::pull(acquire_rx, timeout_ns) {
            Pull::Index(index) => index,
            Pull::NotReady => return Ok(Acquire::NotReady),
            Pull::Timeout => return Ok(Acquire::Timeout),
            Pull::Disconnected => {
                return Err(state.status().err().unwrap_or(SurfaceError::OutOfDate))
            }
        };
        if index == SENTINEL {
            // The queue manager latched an error and exited.
            return Err(state.status().err().unwrap_or(SurfaceError::OutOfDate));
        }
        state.status()?;

        let image = &state.images[index as usize];
        if let Some(fence) = &image.shm_fence {
            fence.wait();
        }
        let suboptimal = matches!(state.status(), Ok(Status::Suboptimal));
        Ok(Acquire::Image { index, suboptimal })
    }

    /// Non-queued path: scan for an idle image, otherwise drain the event
    /// stream until one shows up or the timeout runs out.
    fn acquire_poll(&self, timeout_ns: u64) -> Result<Acquire, SurfaceError> {
        let shared = &self.shared;
        let state = &shared.state;
        let deadline = (timeout_ns != 0 && timeout_ns != u64::MAX)
            .then(|| Instant::now() + Duration::from_nanos(timeout_ns));

        loop {
            for (index, image) in state.images.iter().enumerate() {
                if !image.busy.load(Ordering::Acquire) {
                    if let Some(fence) = &image.shm_fence {
                        fence.wait();
                    }
                    image.busy.store(true, Ordering::Release);
                    let suboptimal = match state.reduce(Ok(Status::Optimal)) {
                        Ok(status) => status == Status::Suboptimal,
                        Err(err) => return Err(err),
                    };
                    return Ok(Acquire::Image {
                        index: index as u32,
                        suboptimal,
                    });
                }
            }

            shared.xconn.flush()?;

            let event = if timeout_ns == u64::MAX {
                match shared.xconn.wait_special_event(&shared.events) {
                    Ok(event) => event,
                    Err(err) => return Err(self.latch(err)),
                }
            } else {
                match shared.xconn.poll_special_event(&shared.events) {
                    Ok(Some(event)) => event,
                    Ok(None) => {
                        if timeout_ns == 0 {
                            return Ok(Acquire::NotReady);
                        }
                        // Foreign traffic wakes the poll too; recompute
                        // the budget from the absolute deadline each time.
                        let Some(deadline) = deadline else {
                            return Ok(Acquire::Timeout);
                        };
                        let now = Instant::now();
                        if now >= deadline {
                            return Ok(Acquire::Timeout);
                        }
                        match shared.xconn.poll_connection(deadline - now) {
                            Ok(true) => continue,
                            Ok(false) => return Ok(Acquire::Timeout),
                            Err(err) => return Err(self.latch(err)),
                        }
                    }
                    Err(err) => return Err(self.latch(err)),
                }
            };

            let result = state.reduce(state.handle_present_event(&event));
            if let Err(err) = result {
                return Err(err);
            }
        }
    }

    fn latch(&self, err: SurfaceError) -> SurfaceError {
        match self.shared.state.reduce(Err(err)) {
            Err(latched) => latched,
            Ok(_) => err,
        }
    }

    /// Queues an acquired image for presentation. In IMMEDIATE mode
    /// without a queue manager this presents on the spot.
    pub fn queue_present(
        &self,
        image_index: u32,
        damage: &[vk::RectLayerKHR],
    ) -> Result<Status, SurfaceError> {
        let shared = &self.shared;
        let state = &shared.state;
        state.status()?;

        let image = &state.images[image_index as usize];
        let mut update_area = 0;
        if !damage.is_empty() && damage.len() <= transport::MAX_DAMAGE_RECTS {
            let conn = shared.conn.upgrade().ok_or(SurfaceError::Lost)?;
            transport::set_damage_region(&conn, image.update_region, damage)?;
            update_area = image.update_region;
        }
        image.update_area.store(update_area, Ordering::Release);
        image.busy.store(true, Ordering::Release);

        if let Some(present_tx) = &self.present_tx {
            if present_tx.send(image_index).is_err() {
                return Err(state.status().err().unwrap_or(SurfaceError::OutOfDate));
            }
            state.status()
        } else {
            present_to_x11(shared, image_index, 0)
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        let shared = &self.shared;
        let state = &shared.state;

        if let Some(worker) = self.worker.take() {
            state.set_status(Err(SurfaceError::OutOfDate));
            if let Some(present_tx) = &self.present_tx {
                let _ = present_tx.send(SENTINEL);
            }
            let _ = worker.join();
        }

        let conn = shared.conn.upgrade();
        for image in &state.images {
            finish_image(conn.as_deref(), &*shared.factory, image);
        }
        shared.xconn.unregister_event_stream(shared.event_id);
        if let Some(conn) = conn {
            let _ = conn.present_select_input(
                shared.event_id,
                shared.window,
                present::EventMask::NO_EVENT,
            );
            let _ = conn.free_gc(shared.gc);
            let _ = conn.flush();
        }
    }
}

/// Sends one image to the server for presentation at `target_msc`.
fn present_to_x11(shared: &ChainShared, image_index: u32, target_msc: u64) -> ChainStatus {
    if shared.software && !shared.has_mit_shm {
        present_software(shared, image_index)
    } else {
        present_dri3(shared, image_index, target_msc)
    }
}

fn present_dri3(shared: &ChainShared, image_index: u32, target_msc: u64) -> ChainStatus {
    let state = &shared.state;
    let Some(conn) = shared.conn.upgrade() else {
        return state.reduce(Err(SurfaceError::Lost));
    };

    // Catch pending notifications first; a resize may already have made
    // this swapchain suboptimal or worse.
    loop {
        match shared.xconn.poll_special_event(&shared.events) {
            Ok(Some(event)) => {
                let result = state.reduce(state.handle_present_event(&event));
                if result.is_err() {
                    return result;
                }
            }
            Ok(None) => break,
            Err(err) => return state.reduce(Err(err)),
        }
    }

    let image = &state.images[image_index as usize];
    let serial = state.begin_present(image_index);
    let options =
        transport::present_options(shared.present_mode, shared.is_xwayland, shared.has_dri3_modifiers);

    profiling::scope!("present_pixmap");
    match transport::present_pixmap(
        &conn,
        shared.window,
        image.pixmap,
        serial,
        image.update_area.load(Ordering::Acquire),
        image.sync_fence,
        options,
        target_msc,
    ) {
        Ok(()) => state.reduce(Ok(Status::Optimal)),
        Err(err) => state.reduce(Err(err)),
    }
}

fn present_software(shared: &ChainShared, image_index: u32) -> ChainStatus {
    let state = &shared.state;
    let Some(conn) = shared.conn.upgrade() else {
        return state.reduce(Err(SurfaceError::Lost));
    };
    let image = &state.images[image_index as usize];
    if let Err(err) = transport::put_image(&conn, shared.window, shared.gc, &image.wsi, state.extent)
    {
        return state.reduce(Err(err));
    }
    // No release event exists on this path; the image is reusable as soon
    // as the requests are on the wire.
    image.busy.store(false, Ordering::Release);
    let _ = conn.flush();
    state.reduce(Ok(Status::Optimal))
}

/// The queue-manager loop.
///
/// Mailbox only pulls and presents. FIFO additionally paces: after each
/// present it drains events until the frame completed and enough images
/// are driver owned for the application to keep acquiring.
fn queue_manager(shared: Arc<ChainShared>, present_rx: flume::Receiver<u32>) {
    match run_queue_manager(&shared, &present_rx) {
        Ok(()) => {}
        Err(err) => {
            log::warn!("presentation queue manager failed: {err}");
            let _ = shared.state.reduce(Err(err));
            if let Some(acquire_tx) = &shared.state.acquire_tx {
                let _ = acquire_tx.send(SENTINEL);
            }
        }
    }
}

fn run_queue_manager(
    shared: &ChainShared,
    present_rx: &flume::Receiver<u32>,
) -> Result<(), SurfaceError> {
    let state = &shared.state;

    while state.status().is_ok() {
        let image_index = match present_rx.recv() {
            Ok(index) => index,
            Err(_) => return Err(SurfaceError::OutOfDate),
        };
        if image_index == SENTINEL || state.status().is_err() {
            // Shutdown; the destroying thread owns the cleanup.
            return Ok(());
        }

        if shared.needs_wait_for_fences {
            profiling::scope!("wait for render fence");
            if shared
                .factory
                .wait_for_image_fence(image_index, u64::MAX)
                .is_err()
            {
                return Err(SurfaceError::OutOfDate);
            }
        }

        // FIFO schedules the next refresh cycle; everything else goes out
        // as soon as possible.
        let target_msc = if shared.has_acquire_queue {
            state.last_present_msc.load(Ordering::Acquire) + 1
        } else {
            0
        };

        if let Err(err) = present_to_x11(shared, image_index, target_msc) {
            return Err(err);
        }

        if shared.has_acquire_queue {
            profiling::scope!("wait for present completion");
            // The application may acquire up to N - minImageCount + 1
            // images with an unbounded timeout; never pull the next frame
            // before that many are driver owned again.
            let guaranteed_images = state.images.len() as u32 - state.min_image_count + 1;

            loop {
                let image = &state.images[image_index as usize];
                if !image.present_queued.load(Ordering::Acquire)
                    && state.driver_owned_images() >= guaranteed_images
                {
                    break;
                }
                let event = shared.xconn.wait_special_event(&shared.events)?;
                let result = state.reduce(state.handle_present_event(&event));
                if let Err(err) = result {
                    return Err(err);
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionInfo;
    use crate::DeviceCaps;
    use drm_fourcc::DrmModifier;

    struct NullFactory;

    impl ImageFactory for NullFactory {
        fn device_caps(&self) -> DeviceCaps {
            DeviceCaps::default()
        }
        fn create_image(&self, _spec: &ImageSpec<'_>) -> Result<WsiImage, SurfaceError> {
            Err(SurfaceError::Initialization)
        }
        fn destroy_image(&self, _image: &WsiImage) {}
        fn wait_for_image_fence(
            &self,
            _image_index: u32,
            _timeout_ns: u64,
        ) -> Result<(), SurfaceError> {
            Ok(())
        }
        fn matches_drm_device(&self, _fd: std::os::fd::BorrowedFd<'_>) -> bool {
            true
        }
    }

    fn test_image(pixmap: xproto::Pixmap) -> ImageSlot {
        ImageSlot::new(
            WsiImage {
                image: vk::Image::default(),
                dma_buf_fd: None,
                num_planes: 1,
                row_pitches: [0; 4],
                offsets: [0; 4],
                sizes: [0; 4],
                modifier: u64::from(DrmModifier::Invalid),
                cpu_map: None,
            },
            0,
        )
        .with_pixmap(pixmap)
    }

    impl ImageSlot {
        fn with_pixmap(mut self, pixmap: xproto::Pixmap) -> Self {
            self.pixmap = pixmap;
            self
        }
    }

    fn test_state(
        image_count: u32,
        extent: vk::Extent2D,
        with_queue: bool,
    ) -> (ChainState, Option<flume::Receiver<u32>>) {
        let (acquire_tx, acquire_rx) = if with_queue {
            let (tx, rx) = queue::image_queue(image_count);
            // Match creation: every image starts out acquirable.
            for index in 0..image_count {
                tx.send(index).unwrap();
            }
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let state = ChainState {
            extent,
            images: (0..image_count).map(|i| test_image(100 + i)).collect(),
            status: Mutex::new(Ok(Status::Optimal)),
            sent_image_count: AtomicI32::new(0),
            send_sbc: AtomicU64::new(0),
            last_present_msc: AtomicU64::new(0),
            copy_is_suboptimal: AtomicBool::new(false),
            acquire_tx,
            min_image_count: 3.min(image_count),
        };
        (state, acquire_rx)
    }

    fn complete(serial: u32, mode: CompleteMode, msc: u64) -> PresentEvent {
        PresentEvent::Complete {
            kind: CompleteKind::PIXMAP,
            mode,
            serial,
            msc,
        }
    }

    fn dead_shared(state: ChainState) -> Arc<ChainShared> {
        let (_tx, events) = flume::unbounded();
        Arc::new(ChainShared {
            state,
            conn: Weak::new(),
            xconn: Arc::new(X11Connection::dead(ConnectionInfo::default())),
            events,
            window: 0,
            gc: 0,
            event_id: 0,
            present_mode: vk::PresentModeKHR::FIFO,
            software: false,
            has_mit_shm: false,
            has_dri3_modifiers: false,
            is_xwayland: false,
            needs_wait_for_fences: false,
            has_acquire_queue: true,
            factory: Arc::new(NullFactory),
        })
    }

    #[test]
    fn status_is_monotonically_pessimistic() {
        let (state, _) = test_state(2, vk::Extent2D { width: 640, height: 480 }, false);

        assert_eq!(state.reduce(Ok(Status::Optimal)), Ok(Status::Optimal));
        assert_eq!(state.reduce(Ok(Status::Suboptimal)), Ok(Status::Suboptimal));
        // Success never clears a latched status.
        assert_eq!(state.reduce(Ok(Status::Optimal)), Ok(Status::Suboptimal));
        assert_eq!(
            state.reduce(Err(SurfaceError::OutOfDate)),
            Err(SurfaceError::OutOfDate)
        );
        // Errors absorb everything, including other errors.
        assert_eq!(
            state.reduce(Err(SurfaceError::Lost)),
            Err(SurfaceError::OutOfDate)
        );
        assert_eq!(
            state.reduce(Ok(Status::Suboptimal)),
            Err(SurfaceError::OutOfDate)
        );
    }

    #[test]
    fn resize_latches_suboptimal() {
        let (state, _) = test_state(3, vk::Extent2D { width: 640, height: 480 }, false);

        let event = PresentEvent::Configure {
            width: 800,
            height: 600,
        };
        assert_eq!(
            state.reduce(state.handle_present_event(&event)),
            Ok(Status::Suboptimal)
        );

        // A configure back to the original size does not un-latch.
        let back = PresentEvent::Configure {
            width: 640,
            height: 480,
        };
        assert_eq!(
            state.reduce(state.handle_present_event(&back)),
            Ok(Status::Suboptimal)
        );
    }

    #[test]
    fn copy_after_flip_is_suboptimal() {
        let (state, _) = test_state(2, vk::Extent2D { width: 640, height: 480 }, false);

        let first = state.begin_present(0);
        assert_eq!(
            state.reduce(state.handle_present_event(&complete(first, CompleteMode::FLIP, 10))),
            Ok(Status::Optimal)
        );

        let second = state.begin_present(1);
        assert_eq!(
            state.reduce(state.handle_present_event(&complete(second, CompleteMode::COPY, 11))),
            Ok(Status::Suboptimal)
        );
    }

    #[test]
    fn copy_without_flip_is_fine() {
        let (state, _) = test_state(2, vk::Extent2D { width: 640, height: 480 }, false);
        let serial = state.begin_present(0);
        assert_eq!(
            state.reduce(state.handle_present_event(&complete(serial, CompleteMode::COPY, 1))),
            Ok(Status::Optimal)
        );
    }

    #[test]
    fn suboptimal_copy_reports_immediately() {
        let (state, _) = test_state(2, vk::Extent2D { width: 640, height: 480 }, false);
        let serial = state.begin_present(0);
        assert_eq!(
            state.reduce(state.handle_present_event(&complete(
                serial,
                CompleteMode::SUBOPTIMAL_COPY,
                1
            ))),
            Ok(Status::Suboptimal)
        );
    }

    #[test]
    fn complete_clears_only_the_matching_serial() {
        let (state, _) = test_state(3, vk::Extent2D { width: 640, height: 480 }, false);

        let first = state.begin_present(0);
        let second = state.begin_present(1);
        assert_ne!(first, second);

        let _ = state.handle_present_event(&complete(first, CompleteMode::FLIP, 42));
        assert!(!state.images[0].present_queued.load(Ordering::Acquire));
        assert!(state.images[1].present_queued.load(Ordering::Acquire));
        assert_eq!(state.last_present_msc.load(Ordering::Acquire), 42);

        let _ = state.handle_present_event(&complete(second, CompleteMode::FLIP, 43));
        assert!(!state.images[1].present_queued.load(Ordering::Acquire));
        assert_eq!(state.last_present_msc.load(Ordering::Acquire), 43);
    }

    #[test]
    fn idle_returns_the_image_exactly_once() {
        let (state, acquire_rx) = test_state(3, vk::Extent2D { width: 640, height: 480 }, true);
        let acquire_rx = acquire_rx.unwrap();
        // Drop the primed indices; this test only watches idle pushes.
        while acquire_rx.try_recv().is_ok() {}

        let _ = state.begin_present(1);
        state.images[1].busy.store(true, Ordering::Release);

        let event = PresentEvent::Idle { pixmap: 101 };
        let _ = state.handle_present_event(&event);

        assert!(!state.images[1].busy.load(Ordering::Acquire));
        assert_eq!(state.sent_image_count.load(Ordering::Acquire), 0);
        assert_eq!(acquire_rx.try_recv(), Ok(1));
        assert!(acquire_rx.try_recv().is_err());

        // An idle for an unknown pixmap changes nothing.
        let stray = PresentEvent::Idle { pixmap: 999 };
        let _ = state.handle_present_event(&stray);
        assert!(acquire_rx.try_recv().is_err());
    }

    #[test]
    fn image_conservation_over_a_frame_cycle() {
        let (state, _) = test_state(3, vk::Extent2D { width: 640, height: 480 }, false);
        assert_eq!(state.driver_owned_images(), 3);

        let serial_a = state.begin_present(0);
        let serial_b = state.begin_present(1);
        assert_eq!(state.driver_owned_images(), 1);

        let _ = state.handle_present_event(&complete(serial_a, CompleteMode::FLIP, 1));
        let _ = state.handle_present_event(&PresentEvent::Idle { pixmap: 100 });
        assert_eq!(state.driver_owned_images(), 2);

        let _ = state.handle_present_event(&complete(serial_b, CompleteMode::FLIP, 2));
        let _ = state.handle_present_event(&PresentEvent::Idle { pixmap: 101 });
        assert_eq!(state.driver_owned_images(), 3);
        assert_eq!(state.sent_image_count.load(Ordering::Acquire), 0);
    }

    #[test]
    fn fence_wait_policy() {
        let defaults = Options::default();
        assert!(needs_wait_for_fences(
            &defaults,
            false,
            vk::PresentModeKHR::MAILBOX
        ));
        assert!(needs_wait_for_fences(
            &defaults,
            true,
            vk::PresentModeKHR::MAILBOX
        ));
        assert!(!needs_wait_for_fences(
            &defaults,
            false,
            vk::PresentModeKHR::IMMEDIATE
        ));
        assert!(needs_wait_for_fences(
            &defaults,
            true,
            vk::PresentModeKHR::IMMEDIATE
        ));
        assert!(!needs_wait_for_fences(
            &defaults,
            true,
            vk::PresentModeKHR::FIFO
        ));

        let opt_out = Options {
            xwayland_wait_ready: false,
            ..Options::default()
        };
        assert!(!needs_wait_for_fences(
            &opt_out,
            true,
            vk::PresentModeKHR::IMMEDIATE
        ));
        // The opt-out only applies under Xwayland.
        assert!(needs_wait_for_fences(
            &opt_out,
            false,
            vk::PresentModeKHR::MAILBOX
        ));
    }

    #[test]
    fn image_count_selection() {
        let defaults = Options::default();
        assert_eq!(chain_image_count(&defaults, false, 2), 2);
        assert_eq!(chain_image_count(&defaults, true, 2), 5);
        assert_eq!(chain_image_count(&defaults, true, 7), 7);

        let strict = Options {
            strict_image_count: true,
            ..Options::default()
        };
        assert_eq!(chain_image_count(&strict, true, 2), 2);

        let ensure = Options {
            ensure_min_image_count: true,
            ..Options::default()
        };
        assert_eq!(chain_image_count(&ensure, false, 2), 3);
        assert_eq!(chain_image_count(&ensure, false, 4), 4);
    }

    #[test]
    fn fifo_acquire_drains_then_reports_not_ready() {
        let (state, acquire_rx) = test_state(3, vk::Extent2D { width: 640, height: 480 }, true);
        let shared = dead_shared(state);
        let chain = Swapchain {
            shared,
            present_tx: None,
            acquire_rx,
            worker: None,
        };

        for expected in 0..3 {
            match chain.acquire_next_image(0).unwrap() {
                Acquire::Image { index, suboptimal } => {
                    assert_eq!(index, expected);
                    assert!(!suboptimal);
                }
                other => panic!("unexpected acquire result {other:?}"),
            }
        }
        assert_eq!(chain.acquire_next_image(0).unwrap(), Acquire::NotReady);
        assert_eq!(
            chain.acquire_next_image(2_000_000).unwrap(),
            Acquire::Timeout
        );
    }

    #[test]
    fn worker_failure_latches_and_wakes_acquirer() {
        let (state, acquire_rx) = test_state(2, vk::Extent2D { width: 640, height: 480 }, true);
        let acquire_rx = acquire_rx.unwrap();
        while acquire_rx.try_recv().is_ok() {}

        let shared = dead_shared(state);
        let (present_tx, present_rx) = queue::image_queue(2);
        let worker = std::thread::spawn({
            let shared = shared.clone();
            move || queue_manager(shared, present_rx)
        });

        // The connection is gone, so the first present must fail.
        present_tx.send(0).unwrap();
        worker.join().unwrap();

        assert_eq!(shared.state.status(), Err(SurfaceError::Lost));
        assert_eq!(acquire_rx.recv().unwrap(), SENTINEL);
    }

    #[test]
    fn sentinel_shuts_the_worker_down_cleanly() {
        let (state, _) = test_state(2, vk::Extent2D { width: 640, height: 480 }, true);
        let shared = dead_shared(state);
        let (present_tx, present_rx) = queue::image_queue(2);
        let worker = std::thread::spawn({
            let shared = shared.clone();
            move || queue_manager(shared, present_rx)
        });

        present_tx.send(SENTINEL).unwrap();
        worker.join().unwrap();
        // A clean shutdown leaves the status untouched.
        assert_eq!(shared.state.status(), Ok(Status::Optimal));
    }

    #[test]
    fn drop_joins_the_worker() {
        let (state, acquire_rx) = test_state(3, vk::Extent2D { width: 640, height: 480 }, true);
        let shared = dead_shared(state);
        let (present_tx, present_rx) = queue::image_queue(3);
        let worker = std::thread::Builder::new()
            .name("wsi swapchain queue".into())
            .spawn({
                let shared = shared.clone();
                move || queue_manager(shared, present_rx)
            })
            .unwrap();

        let chain = Swapchain {
            shared,
            present_tx: Some(present_tx),
            acquire_rx,
            worker: Some(worker),
        };
        // The worker is parked on an empty present queue; drop must wake
        // it, join it and come back.
        drop(chain);
    }
}
