/*!
# X11 window system integration for Vulkan swapchains.

This crate implements the client side of the Vulkan swapchain contract on
top of the X11 DRI3, Present, XFixes and (optionally) MIT-SHM extensions.
GPU image allocation stays behind the [`ImageFactory`] trait; everything
that talks to the display server lives here.

## Ownership model

A swapchain owns a fixed pool of images. At any instant an image is either
driver owned (the application may acquire it, render to it and queue it for
presentation) or server owned (the X server may still read from its
pixmap). Ownership moves to the server with a `PresentPixmap` request and
back to the driver with an `IdleNotify` event; the `busy` flag on each slot
tracks exactly this.

## Threads

Up to three threads cooperate per swapchain: the application thread calling
acquire/present, an optional queue-manager thread that paces FIFO and
MAILBOX presentation, and whichever of the two currently reads the X
connection. Image indices travel between the first two over bounded
channels; a `u32::MAX` sentinel wakes the peer on shutdown.

## Fences

Read/write ordering against the server uses one shared-memory futex fence
per image, imported server side as an X Sync fence. The driver resets the
fence before a present request and waits on it before handing the image
back to the application; the server triggers it once it has finished
reading from the pixmap.
!*/

#![allow(clippy::too_many_arguments)]

mod config;
mod connection;
mod queue;
mod shmfence;
mod surface;
mod swapchain;
mod transport;

use std::os::fd::{BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;

pub use crate::config::{Options, WsiDebug};
pub use crate::connection::ConnectionInfo;
pub use crate::surface::Surface;
pub use crate::swapchain::{Acquire, Swapchain, SwapchainCreateInfo};

/// The DRI3 wire format allows at most four planes per buffer.
pub const MAX_PLANES: usize = 4;

/// Non-fatal swapchain condition reported alongside successful operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Optimal,
    /// Presentation still works but the swapchain no longer matches the
    /// surface well; the application should recreate it.
    Suboptimal,
}

/// Fatal swapchain errors. Once one of these is observed on a swapchain it
/// sticks until the swapchain is destroyed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SurfaceError {
    #[error("the surface or its window is gone")]
    Lost,
    #[error("the swapchain no longer matches the surface")]
    OutOfDate,
    #[error("out of host memory")]
    OutOfMemory,
    #[error("swapchain initialization failed")]
    Initialization,
}

/// The sticky status word carried by every swapchain.
pub type ChainStatus = Result<Status, SurfaceError>;

impl From<x11rb::errors::ConnectionError> for SurfaceError {
    fn from(_: x11rb::errors::ConnectionError) -> Self {
        Self::Lost
    }
}

impl From<x11rb::errors::ReplyError> for SurfaceError {
    fn from(_: x11rb::errors::ReplyError) -> Self {
        Self::Lost
    }
}

impl From<x11rb::errors::ReplyOrIdError> for SurfaceError {
    fn from(err: x11rb::errors::ReplyOrIdError) -> Self {
        match err {
            x11rb::errors::ReplyOrIdError::IdsExhausted => Self::OutOfMemory,
            _ => Self::Lost,
        }
    }
}

/// A swapchain image as provided by the image factory.
pub struct WsiImage {
    /// The Vulkan image the application renders to.
    pub image: vk::Image,
    /// Exported DMA-buf, present when the image lives in GPU memory.
    pub dma_buf_fd: Option<OwnedFd>,
    pub num_planes: u32,
    pub row_pitches: [u32; MAX_PLANES],
    pub offsets: [u32; MAX_PLANES],
    /// Per-plane byte sizes; the first entry is used for the legacy
    /// single-fd pixmap import.
    pub sizes: [u32; MAX_PLANES],
    /// DRM format modifier, `DrmModifier::Invalid` when none was
    /// negotiated.
    pub modifier: u64,
    /// CPU mapping of the image contents, for software presentation.
    pub cpu_map: Option<NonNull<u8>>,
}

// The CPU mapping is only dereferenced by the thread that currently owns
// the image slot, which the acquire/present handoff serializes.
unsafe impl Send for WsiImage {}
unsafe impl Sync for WsiImage {}

/// SysV shared memory backing one software image.
#[derive(Clone, Copy, Debug)]
pub struct ShmSegment {
    pub shmid: i32,
    pub addr: *mut u8,
}

/// How the factory should back a swapchain image.
pub enum ImageBacking<'a> {
    /// GPU memory exported as a DMA-buf.
    Drm {
        /// False when the window belongs to a different GPU than the
        /// rendering device; forces the cross-device blit path and
        /// disables scanout layouts.
        same_gpu: bool,
        /// Modifier tranches the server advertised for the target window,
        /// most preferred first. Empty when modifiers are unavailable.
        modifier_lists: &'a [Vec<u64>],
        /// Device fd of the GPU the server scans out from.
        display_fd: Option<BorrowedFd<'a>>,
    },
    /// Host memory. When `shm_alloc` is present the factory must obtain
    /// the backing store through it so the SHM segment itself is the image
    /// storage.
    Cpu {
        shm_alloc: Option<&'a dyn Fn(usize) -> Option<ShmSegment>>,
    },
}

/// Allocation request handed to the image factory, one per swapchain slot.
pub struct ImageSpec<'a> {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub backing: ImageBacking<'a>,
}

/// Device properties the swapchain logic keys off.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceCaps {
    /// The device rasterizes on the CPU; presentation goes through SHM or
    /// core protocol image uploads instead of DMA-buf.
    pub software: bool,
    /// The device can allocate images with explicit format modifiers.
    pub supports_modifiers: bool,
    /// The device can import host allocations as image memory, which the
    /// SHM path requires.
    pub has_import_memory_host: bool,
    /// List `B8G8R8A8_UNORM` ahead of the sRGB format in surface format
    /// queries.
    pub force_bgra8_unorm_first: bool,
    /// Ask the server for variable refresh on presented windows.
    pub enable_adaptive_sync: bool,
}

/// GPU-side collaborator that allocates swapchain images and tracks their
/// submission fences. Implemented by the driver core.
pub trait ImageFactory: Send + Sync {
    fn device_caps(&self) -> DeviceCaps;

    fn create_image(&self, spec: &ImageSpec<'_>) -> Result<WsiImage, SurfaceError>;

    /// Releases the GPU resources of `image`. The caller still owns the
    /// file descriptors and mappings inside the struct.
    fn destroy_image(&self, image: &WsiImage);

    /// Blocks until the Vulkan fence of the image's most recent submission
    /// has signaled.
    fn wait_for_image_fence(&self, image_index: u32, timeout_ns: u64) -> Result<(), SurfaceError>;

    /// Whether the DRM device behind `fd` is the device this factory
    /// allocates from.
    fn matches_drm_device(&self, fd: BorrowedFd<'_>) -> bool;
}

/// Entry point of the X11 presentation backend. Owns the per-connection
/// capability cache and hands out surfaces and swapchains.
pub struct X11Wsi {
    pub(crate) connections: connection::Registry,
    pub(crate) options: Options,
    pub(crate) caps: DeviceCaps,
    pub(crate) factory: Arc<dyn ImageFactory>,
}

impl X11Wsi {
    pub fn new(options: Options, factory: Arc<dyn ImageFactory>) -> Self {
        let caps = factory.device_caps();
        Self {
            connections: connection::Registry::new(),
            options,
            caps,
            factory,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Whether the software SHM path is usable on this device at all.
    /// Individual connections still need a working MIT-SHM extension.
    pub(crate) fn wants_shm(&self) -> bool {
        self.caps.software
            && self.caps.has_import_memory_host
            && !config::wsi_debug().contains(WsiDebug::NOSHM)
    }
}
