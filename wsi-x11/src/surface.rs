//! Surface objects and the capability, format and present-mode queries.

use std::sync::Arc;

use arrayvec::ArrayVec;
use ash::vk;
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{ConnectionExt as _, Screen, VisualClass, Visualtype, Window};
use x11rb::rust_connection::RustConnection;

use crate::{SurfaceError, X11Wsi};

/// A presentable window on some X11 connection.
pub struct Surface {
    pub(crate) conn: Arc<RustConnection>,
    pub(crate) window: Window,
}

impl Surface {
    pub fn new(conn: Arc<RustConnection>, window: Window) -> Self {
        Self { conn, window }
    }

    pub fn window(&self) -> Window {
        self.window
    }
}

struct SurfaceFormat {
    format: vk::Format,
    bits_per_rgb: u32,
}

const FORMATS: [SurfaceFormat; 3] = [
    SurfaceFormat {
        format: vk::Format::B8G8R8A8_SRGB,
        bits_per_rgb: 8,
    },
    SurfaceFormat {
        format: vk::Format::B8G8R8A8_UNORM,
        bits_per_rgb: 8,
    },
    SurfaceFormat {
        format: vk::Format::A2R10G10B10_UNORM_PACK32,
        bits_per_rgb: 10,
    },
];

const PRESENT_MODES: [vk::PresentModeKHR; 4] = [
    vk::PresentModeKHR::IMMEDIATE,
    vk::PresentModeKHR::MAILBOX,
    vk::PresentModeKHR::FIFO,
    vk::PresentModeKHR::FIFO_RELAXED,
];

const SUPPORTED_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::TRANSFER_SRC.as_raw()
        | vk::ImageUsageFlags::SAMPLED.as_raw()
        | vk::ImageUsageFlags::TRANSFER_DST.as_raw()
        | vk::ImageUsageFlags::STORAGE.as_raw()
        | vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw()
        | vk::ImageUsageFlags::INPUT_ATTACHMENT.as_raw(),
);

fn screen_visualtype(screen: &Screen, visual_id: u32) -> Option<(Visualtype, u8)> {
    for depth in &screen.allowed_depths {
        for visual in &depth.visuals {
            if visual.visual_id == visual_id {
                return Some((*visual, depth.depth));
            }
        }
    }
    None
}

fn connection_visualtype(conn: &RustConnection, visual_id: u32) -> Option<Visualtype> {
    // There is probably only one screen, but walk them all.
    conn.setup()
        .roots
        .iter()
        .find_map(|screen| screen_visualtype(screen, visual_id).map(|(visual, _)| visual))
}

/// Resolves the visual a window was created with. A dead window makes the
/// queries fail, which the callers report as a lost surface.
fn window_visualtype(
    conn: &RustConnection,
    window: Window,
) -> Result<(Visualtype, u8), SurfaceError> {
    let tree_cookie = conn.query_tree(window)?;
    let attrs_cookie = conn.get_window_attributes(window)?;

    let tree = tree_cookie.reply().map_err(|_| SurfaceError::Lost)?;
    let attrs = attrs_cookie.reply().map_err(|_| SurfaceError::Lost)?;

    let screen = conn
        .setup()
        .roots
        .iter()
        .find(|screen| screen.root == tree.root)
        .ok_or(SurfaceError::Lost)?;
    screen_visualtype(screen, attrs.visual).ok_or(SurfaceError::Lost)
}

fn visual_has_alpha(visual: &Visualtype, depth: u8) -> bool {
    let rgb_mask = visual.red_mask | visual.green_mask | visual.blue_mask;
    let all_mask = 0xffff_ffffu32 >> (32 - u32::from(depth));
    // Bits left over after RGB carry alpha.
    (all_mask & !rgb_mask) != 0
}

fn visual_supported(visual: &Visualtype) -> bool {
    visual.class == VisualClass::TRUE_COLOR || visual.class == VisualClass::DIRECT_COLOR
}

/// Filters the static format table down to what the visual can show.
fn sorted_formats(visual: &Visualtype, force_bgra8_unorm_first: bool) -> ArrayVec<vk::Format, 3> {
    let mut formats = ArrayVec::new();
    for entry in &FORMATS {
        if entry.bits_per_rgb == visual.red_mask.count_ones()
            && entry.bits_per_rgb == visual.green_mask.count_ones()
            && entry.bits_per_rgb == visual.blue_mask.count_ones()
        {
            formats.push(entry.format);
        }
    }
    if force_bgra8_unorm_first {
        if let Some(pos) = formats
            .iter()
            .position(|format| *format == vk::Format::B8G8R8A8_UNORM)
        {
            formats.swap(0, pos);
        }
    }
    formats
}

impl X11Wsi {
    pub fn create_surface(&self, conn: Arc<RustConnection>, window: Window) -> Surface {
        Surface::new(conn, window)
    }

    /// Whether a queue family of the device can present to windows using
    /// `visual_id` on this connection.
    pub fn presentation_support(
        &self,
        conn: &Arc<RustConnection>,
        _queue_family_index: u32,
        visual_id: u32,
    ) -> Result<bool, SurfaceError> {
        let xconn = self.connections.get(conn, self.wants_shm())?;
        if !self.caps.software && !xconn.info.check_for_dri3() {
            return Ok(false);
        }
        Ok(connection_visualtype(conn, visual_id)
            .map(|visual| visual_supported(&visual))
            .unwrap_or(false))
    }

    pub fn surface_support(&self, surface: &Surface) -> Result<bool, SurfaceError> {
        let xconn = self.connections.get(&surface.conn, self.wants_shm())?;
        if !self.caps.software && !xconn.info.check_for_dri3() {
            return Ok(false);
        }
        match window_visualtype(&surface.conn, surface.window) {
            Ok((visual, _)) => Ok(visual_supported(&visual)),
            Err(_) => Ok(false),
        }
    }

    pub fn surface_capabilities(
        &self,
        surface: &Surface,
    ) -> Result<vk::SurfaceCapabilitiesKHR, SurfaceError> {
        let conn = &surface.conn;
        // Issue the geometry request first; the visual lookup round-trips
        // anyway, so the reply is ready by the time we read it.
        let geometry_cookie = conn.get_geometry(surface.window)?;
        let (visual, visual_depth) = window_visualtype(conn, surface.window)?;
        let geometry = geometry_cookie.reply().map_err(|_| SurfaceError::Lost)?;

        let extent = vk::Extent2D {
            width: u32::from(geometry.width),
            height: u32::from(geometry.height),
        };
        let supported_composite_alpha = if visual_has_alpha(&visual, visual_depth) {
            vk::CompositeAlphaFlagsKHR::INHERIT | vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED
        } else {
            vk::CompositeAlphaFlagsKHR::INHERIT | vk::CompositeAlphaFlagsKHR::OPAQUE
        };

        Ok(vk::SurfaceCapabilitiesKHR {
            min_image_count: self.options.min_image_count(),
            // There is no real maximum.
            max_image_count: 0,
            current_extent: extent,
            min_image_extent: extent,
            max_image_extent: extent,
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha,
            supported_usage_flags: SUPPORTED_USAGE,
        })
    }

    pub fn surface_formats(
        &self,
        surface: &Surface,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, SurfaceError> {
        let (visual, _) = window_visualtype(&surface.conn, surface.window)?;
        Ok(sorted_formats(&visual, self.caps.force_bgra8_unorm_first)
            .into_iter()
            .map(|format| vk::SurfaceFormatKHR {
                format,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            })
            .collect())
    }

    pub fn surface_present_modes(&self) -> &'static [vk::PresentModeKHR] {
        &PRESENT_MODES
    }

    pub fn surface_present_rectangles(
        &self,
        surface: &Surface,
    ) -> Result<Vec<vk::Rect2D>, SurfaceError> {
        let geometry = surface
            .conn
            .get_geometry(surface.window)?
            .reply()
            .map_err(|_| SurfaceError::Lost)?;
        Ok(vec![vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: u32::from(geometry.width),
                height: u32::from(geometry.height),
            },
        }])
    }
}
