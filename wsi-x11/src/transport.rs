//! Wire-level presentation.
//!
//! Pixmap creation over DMA-buf or SHM, Sync fence import, damage
//! regions, the Present request itself and the software put-image
//! fallback with its request-size chunking.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use arrayvec::ArrayVec;
use ash::vk;
use drm_fourcc::DrmModifier;
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::dri3::ConnectionExt as _;
use x11rb::protocol::present::{self, ConnectionExt as _};
use x11rb::protocol::shm::ConnectionExt as _;
use x11rb::protocol::xfixes::ConnectionExt as _;
use x11rb::protocol::xproto::{
    self, AtomEnum, ConnectionExt as _, ImageFormat, PropMode, Rectangle, Window,
};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;

use crate::shmfence::ShmFence;
use crate::{ShmSegment, SurfaceError, WsiImage, MAX_PLANES};

/// Damage lists longer than this fall back to full-pixmap updates.
pub(crate) const MAX_DAMAGE_RECTS: usize = 64;

const BITS_PER_PIXEL: u8 = 32;

/// Size of a PutImage request header on the wire.
const PUT_IMAGE_HEADER: usize = 24;

/// Duplicates an fd for a request. The protocol layer takes ownership of
/// every transferred descriptor, so the source stays with the caller.
fn dup_for_transfer(fd: BorrowedFd<'_>) -> Result<OwnedFd, SurfaceError> {
    // Floor of 3 keeps the dup clear of the stdio descriptors.
    rustix::io::fcntl_dupfd_cloexec(fd, 3).map_err(|_| SurfaceError::OutOfMemory)
}

/// Imports a DMA-buf backed image as a server-side pixmap.
pub(crate) fn create_dmabuf_pixmap(
    conn: &RustConnection,
    window: Window,
    depth: u8,
    extent: vk::Extent2D,
    image: &WsiImage,
    has_dri3_modifiers: bool,
) -> Result<xproto::Pixmap, SurfaceError> {
    let dma_buf = image
        .dma_buf_fd
        .as_ref()
        .ok_or(SurfaceError::Initialization)?;
    let pixmap = conn.generate_id()?;

    if image.modifier != u64::from(DrmModifier::Invalid) {
        // An image with an explicit modifier implies DRI3 1.2.
        debug_assert!(has_dri3_modifiers);
        if image.num_planes as usize > MAX_PLANES {
            return Err(SurfaceError::Initialization);
        }

        // The wire wants one fd per plane even though ours all alias the
        // same buffer.
        let mut fds = Vec::with_capacity(image.num_planes as usize);
        for _ in 0..image.num_planes {
            fds.push(dup_for_transfer(dma_buf.as_fd())?);
        }

        conn.dri3_pixmap_from_buffers(
            pixmap,
            window,
            extent.width as u16,
            extent.height as u16,
            image.row_pitches[0],
            image.offsets[0],
            image.row_pitches[1],
            image.offsets[1],
            image.row_pitches[2],
            image.offsets[2],
            image.row_pitches[3],
            image.offsets[3],
            depth,
            BITS_PER_PIXEL,
            image.modifier,
            fds,
        )?;
    } else {
        // Without modifiers multi-plane RGB images cannot be expressed.
        debug_assert_eq!(image.num_planes, 1);
        let fd = dup_for_transfer(dma_buf.as_fd())?;
        conn.dri3_pixmap_from_buffer(
            pixmap,
            window,
            image.sizes[0],
            extent.width as u16,
            extent.height as u16,
            image.row_pitches[0] as u16,
            depth,
            BITS_PER_PIXEL,
            fd,
        )?;
    }

    Ok(pixmap)
}

/// Allocates a SysV segment for one software image. The segment is marked
/// for removal right after attach so it cannot outlive the process.
pub(crate) fn alloc_sysv_segment(size: usize) -> Option<ShmSegment> {
    unsafe {
        let shmid = libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o600);
        if shmid < 0 {
            return None;
        }
        let addr = libc::shmat(shmid, std::ptr::null(), 0);
        libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut());
        if addr == usize::MAX as *mut libc::c_void {
            return None;
        }
        Some(ShmSegment {
            shmid,
            addr: addr.cast(),
        })
    }
}

pub(crate) unsafe fn detach_sysv_segment(addr: *mut u8) {
    libc::shmdt(addr.cast());
}

/// Attaches a SysV segment server side and wraps it in a pixmap.
pub(crate) fn create_shm_pixmap(
    conn: &RustConnection,
    window: Window,
    depth: u8,
    width: u16,
    height: u16,
    shmid: i32,
) -> Result<(xproto::Pixmap, u32), SurfaceError> {
    let shmseg = conn.generate_id()?;
    conn.shm_attach(shmseg, shmid as u32, false)?;
    let pixmap = conn.generate_id()?;
    conn.shm_create_pixmap(pixmap, window, width, height, depth, shmseg, 0)?;
    Ok((pixmap, shmseg))
}

/// Imports an [`ShmFence`] as a server-side Sync fence bound to `pixmap`.
pub(crate) fn create_sync_fence(
    conn: &RustConnection,
    pixmap: xproto::Pixmap,
    fence: &ShmFence,
) -> Result<u32, SurfaceError> {
    let sync_fence = conn.generate_id()?;
    let fd = dup_for_transfer(fence.fd())?;
    conn.dri3_fence_from_fd(pixmap, sync_fence, false, fd)?;
    Ok(sync_fence)
}

/// Writes the client's damage rectangles into an XFixes region.
pub(crate) fn set_damage_region(
    conn: &RustConnection,
    region: u32,
    damage: &[vk::RectLayerKHR],
) -> Result<(), SurfaceError> {
    let mut rects = ArrayVec::<Rectangle, MAX_DAMAGE_RECTS>::new();
    for rect in damage {
        debug_assert_eq!(rect.layer, 0);
        rects.push(Rectangle {
            x: rect.offset.x as i16,
            y: rect.offset.y as i16,
            width: rect.extent.width as u16,
            height: rect.extent.height as u16,
        });
    }
    conn.xfixes_set_region(region, &rects)?;
    Ok(())
}

/// Present request options for a mode on a given connection.
pub(crate) fn present_options(
    present_mode: vk::PresentModeKHR,
    is_xwayland: bool,
    has_dri3_modifiers: bool,
) -> u32 {
    let mut options = u32::from(present::Option::NONE);

    // Xwayland mailboxes every buffer through the compositor, so MAILBOX
    // behaves like IMMEDIATE there.
    if present_mode == vk::PresentModeKHR::IMMEDIATE
        || (present_mode == vk::PresentModeKHR::MAILBOX && is_xwayland)
        || present_mode == vk::PresentModeKHR::FIFO_RELAXED
    {
        options |= u32::from(present::Option::ASYNC);
    }
    if has_dri3_modifiers {
        // Opt into SUBOPTIMAL_COPY completion notifications.
        options |= u32::from(present::Option::SUBOPTIMAL);
    }
    options
}

/// Fires the Present request for one image. Checked, because a failure
/// here means the window is gone.
pub(crate) fn present_pixmap(
    conn: &RustConnection,
    window: Window,
    pixmap: xproto::Pixmap,
    serial: u32,
    update: u32,
    sync_fence: u32,
    options: u32,
    target_msc: u64,
) -> Result<(), SurfaceError> {
    conn.present_pixmap(
        window,
        pixmap,
        serial,
        0, // valid: whole pixmap readable
        update,
        0, // x_off
        0, // y_off
        0, // target_crtc: let the server pick
        0, // wait_fence
        sync_fence,
        options,
        target_msc,
        0, // divisor
        0, // remainder
        &[],
    )?
    .check()
    .map_err(|_| SurfaceError::Lost)?;
    Ok(())
}

/// Scanline chunks for a PutImage upload that has to respect the server's
/// maximum request size. Yields `(y, lines)` pairs tiling `[0, height)`.
pub(crate) fn row_chunks(
    max_request_bytes: usize,
    row_pitch: usize,
    height: u16,
) -> impl Iterator<Item = (u16, u16)> {
    let lines_per_chunk = ((max_request_bytes - PUT_IMAGE_HEADER) / row_pitch).max(1) as u16;
    let mut y = 0u16;
    std::iter::from_fn(move || {
        if y >= height {
            return None;
        }
        let lines = lines_per_chunk.min(height - y);
        let chunk = (y, lines);
        y += lines;
        Some(chunk)
    })
}

/// Uploads a CPU image straight into the window, used by software devices
/// without a usable MIT-SHM.
pub(crate) fn put_image(
    conn: &RustConnection,
    window: Window,
    gc: xproto::Gcontext,
    image: &WsiImage,
    extent: vk::Extent2D,
) -> Result<(), SurfaceError> {
    let cpu_map = image.cpu_map.ok_or(SurfaceError::Initialization)?;
    let row_pitch = image.row_pitches[0] as usize;
    let height = extent.height as u16;
    // The pitch may include padding pixels; the server wants them counted.
    let width = (image.row_pitches[0] / 4) as u16;
    let data =
        unsafe { std::slice::from_raw_parts(cpu_map.as_ptr(), row_pitch * extent.height as usize) };

    let max_request_bytes = conn.maximum_request_bytes();
    if PUT_IMAGE_HEADER + data.len() < max_request_bytes {
        conn.put_image(
            ImageFormat::Z_PIXMAP,
            window,
            gc,
            width,
            height,
            0,
            0,
            0,
            24,
            data,
        )?;
    } else {
        for (y, lines) in row_chunks(max_request_bytes, row_pitch, height) {
            let start = y as usize * row_pitch;
            let end = start + lines as usize * row_pitch;
            conn.put_image(
                ImageFormat::Z_PIXMAP,
                window,
                gc,
                width,
                lines,
                0,
                y as i16,
                0,
                24,
                &data[start..end],
            )?;
        }
    }
    Ok(())
}

/// Queries the modifier tranches the server accepts for a window. The
/// window tranche is preferred over the screen tranche.
pub(crate) fn query_modifier_tranches(
    conn: &RustConnection,
    window: Window,
    depth: u8,
    bpp: u8,
) -> Vec<Vec<u64>> {
    let reply = match conn.dri3_get_supported_modifiers(window, depth, bpp) {
        Ok(cookie) => match cookie.reply() {
            Ok(reply) => reply,
            Err(_) => return Vec::new(),
        },
        Err(_) => return Vec::new(),
    };
    let mut tranches = Vec::new();
    if !reply.window_modifiers.is_empty() {
        tranches.push(reply.window_modifiers);
    }
    if !reply.screen_modifiers.is_empty() {
        tranches.push(reply.screen_modifiers);
    }
    tranches
}

/// Sets or clears the variable-refresh hint on the window. Best effort;
/// swapchain creation owns the window, so there is a single writer.
pub(crate) fn set_adaptive_sync_property(conn: &RustConnection, window: Window, enabled: bool) {
    let Ok(cookie) = conn.intern_atom(false, b"_VARIABLE_REFRESH") else {
        return;
    };
    let Ok(reply) = cookie.reply() else {
        return;
    };
    let result = if enabled {
        conn.change_property32(PropMode::REPLACE, window, reply.atom, AtomEnum::CARDINAL, &[1])
            .map(|_| ())
    } else {
        conn.delete_property(window, reply.atom).map(|_| ())
    };
    let _ = result;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_tile_the_image() {
        // 4096x4096 at 4 bytes per pixel against a 256 KiB request limit.
        let row_pitch = 4096usize * 4;
        let max_request = 256 * 1024;
        let chunks: Vec<_> = row_chunks(max_request, row_pitch, 4096).collect();

        let lines_per_chunk = (max_request - PUT_IMAGE_HEADER) / row_pitch;
        assert_eq!(lines_per_chunk, 15);
        assert_eq!(chunks.len(), 4096usize.div_ceil(lines_per_chunk));

        // Consecutive, non-overlapping, covering [0, height).
        let mut expected_y = 0u16;
        for &(y, lines) in &chunks {
            assert_eq!(y, expected_y);
            assert!(lines as usize <= lines_per_chunk);
            expected_y += lines;
        }
        assert_eq!(expected_y, 4096);
    }

    #[test]
    fn single_chunk_when_it_fits() {
        let chunks: Vec<_> = row_chunks(1 << 20, 640 * 4, 480).collect();
        assert_eq!(chunks, [(0, 409), (409, 71)]);
    }

    #[test]
    fn degenerate_pitch_still_advances() {
        // A pitch larger than the request budget must still make progress
        // one line at a time.
        let chunks: Vec<_> = row_chunks(1024, 4096, 3).collect();
        assert_eq!(chunks, [(0, 1), (1, 1), (2, 1)]);
    }

    #[test]
    fn async_option_per_mode() {
        let async_bit = u32::from(present::Option::ASYNC);
        assert_ne!(
            present_options(vk::PresentModeKHR::IMMEDIATE, false, false) & async_bit,
            0
        );
        assert_ne!(
            present_options(vk::PresentModeKHR::FIFO_RELAXED, false, false) & async_bit,
            0
        );
        assert_eq!(
            present_options(vk::PresentModeKHR::FIFO, false, false) & async_bit,
            0
        );
        // Mailbox is synchronous on bare X11 but async under Xwayland.
        assert_eq!(
            present_options(vk::PresentModeKHR::MAILBOX, false, false) & async_bit,
            0
        );
        assert_ne!(
            present_options(vk::PresentModeKHR::MAILBOX, true, false) & async_bit,
            0
        );
    }

    #[test]
    fn suboptimal_option_tracks_modifier_support() {
        let suboptimal_bit = u32::from(present::Option::SUBOPTIMAL);
        assert_ne!(
            present_options(vk::PresentModeKHR::FIFO, false, true) & suboptimal_bit,
            0
        );
        assert_eq!(
            present_options(vk::PresentModeKHR::FIFO, false, false) & suboptimal_bit,
            0
        );
    }
}
