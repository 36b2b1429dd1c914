//! Tunables and debug switches.
//!
//! Options come from a key/value source so the same knob spells the same
//! everywhere in the driver stack; [`Options::from_env`] is the common
//! loader. `WSI_DEBUG` is a comma separated flag list parsed once per
//! process.

use bitflags::bitflags;
use once_cell::sync::Lazy;

pub const OPT_OVERRIDE_MIN_IMAGE_COUNT: &str = "vk_x11_override_min_image_count";
pub const OPT_STRICT_IMAGE_COUNT: &str = "vk_x11_strict_image_count";
pub const OPT_ENSURE_MIN_IMAGE_COUNT: &str = "vk_x11_ensure_min_image_count";
pub const OPT_XWAYLAND_WAIT_READY: &str = "vk_xwayland_wait_ready";

/// Swapchain tunables.
#[derive(Clone, Debug)]
pub struct Options {
    /// Overrides the minimum image count reported in the surface
    /// capabilities. Zero means no override.
    pub override_min_image_count: u32,
    /// Create swapchains with exactly the image count the application
    /// requested.
    pub strict_image_count: bool,
    /// Never create a swapchain with fewer images than the advertised
    /// minimum.
    pub ensure_min_image_count: bool,
    /// Wait for render fences before submitting buffers under Xwayland.
    pub xwayland_wait_ready: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            override_min_image_count: 0,
            strict_image_count: false,
            ensure_min_image_count: false,
            xwayland_wait_ready: true,
        }
    }
}

impl Options {
    /// Loads options through `lookup`, keeping the default for keys the
    /// source does not carry or cannot parse.
    pub fn load(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut opts = Self::default();
        if let Some(count) = lookup(OPT_OVERRIDE_MIN_IMAGE_COUNT).and_then(|v| v.parse().ok()) {
            opts.override_min_image_count = count;
        }
        if let Some(strict) = lookup(OPT_STRICT_IMAGE_COUNT).as_deref().and_then(parse_bool) {
            opts.strict_image_count = strict;
        }
        if let Some(ensure) = lookup(OPT_ENSURE_MIN_IMAGE_COUNT)
            .as_deref()
            .and_then(parse_bool)
        {
            opts.ensure_min_image_count = ensure;
        }
        if let Some(wait) = lookup(OPT_XWAYLAND_WAIT_READY).as_deref().and_then(parse_bool) {
            opts.xwayland_wait_ready = wait;
        }
        opts
    }

    /// Loads options from the process environment.
    pub fn from_env() -> Self {
        Self::load(|key| std::env::var(key).ok())
    }

    /// The minimum image count advertised in the surface capabilities.
    ///
    /// Pipelined applications need an image for CPU work, one for GPU work
    /// and one on the output to run at full speed, so the default is 3
    /// even though an ideal implementation could make do with fewer.
    pub(crate) fn min_image_count(&self) -> u32 {
        if self.override_min_image_count != 0 {
            self.override_min_image_count
        } else {
            3
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

bitflags! {
    /// Flags parsed from the `WSI_DEBUG` environment variable.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct WsiDebug: u32 {
        /// Disable the MIT-SHM software presentation path.
        const NOSHM = 1 << 0;
    }
}

impl WsiDebug {
    fn from_list(list: &str) -> Self {
        let mut flags = WsiDebug::empty();
        for name in list.split(',') {
            match name.trim() {
                "noshm" => flags |= WsiDebug::NOSHM,
                "" => {}
                other => log::warn!("unknown WSI_DEBUG flag {other:?}"),
            }
        }
        flags
    }
}

static WSI_DEBUG: Lazy<WsiDebug> = Lazy::new(|| {
    std::env::var("WSI_DEBUG")
        .map(|list| WsiDebug::from_list(&list))
        .unwrap_or_else(|_| WsiDebug::empty())
});

pub(crate) fn wsi_debug() -> WsiDebug {
    *WSI_DEBUG
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn defaults() {
        let opts = Options::load(|_| None);
        assert_eq!(opts.override_min_image_count, 0);
        assert!(!opts.strict_image_count);
        assert!(!opts.ensure_min_image_count);
        assert!(opts.xwayland_wait_ready);
        assert_eq!(opts.min_image_count(), 3);
    }

    #[test]
    fn all_keys_parse() {
        let opts = Options::load(lookup(&[
            (OPT_OVERRIDE_MIN_IMAGE_COUNT, "2"),
            (OPT_STRICT_IMAGE_COUNT, "true"),
            (OPT_ENSURE_MIN_IMAGE_COUNT, "1"),
            (OPT_XWAYLAND_WAIT_READY, "false"),
        ]));
        assert_eq!(opts.override_min_image_count, 2);
        assert!(opts.strict_image_count);
        assert!(opts.ensure_min_image_count);
        assert!(!opts.xwayland_wait_ready);
        assert_eq!(opts.min_image_count(), 2);
    }

    #[test]
    fn garbage_values_keep_defaults() {
        let opts = Options::load(lookup(&[
            (OPT_OVERRIDE_MIN_IMAGE_COUNT, "lots"),
            (OPT_XWAYLAND_WAIT_READY, "maybe"),
        ]));
        assert_eq!(opts.override_min_image_count, 0);
        assert!(opts.xwayland_wait_ready);
    }

    #[test]
    fn debug_flag_list() {
        assert_eq!(WsiDebug::from_list("noshm"), WsiDebug::NOSHM);
        assert_eq!(WsiDebug::from_list(" noshm , bogus "), WsiDebug::NOSHM);
        assert_eq!(WsiDebug::from_list(""), WsiDebug::empty());
    }
}
