//! Framebuffer discovery.
//!
//! The kernel gets whatever mode the firmware left the screen in; mode
//! switching is a job for the kernel's own driver. With several GPUs
//! present, the first one wins.

use log::{debug, warn};

use uefi::boot::{find_handles, open_protocol_exclusive};
use uefi::proto::console::gop::{GraphicsOutput, PixelFormat};

use mboot_core::info::Framebuffer;

/// Describe the current graphics mode, if there is a linear one.
pub(super) fn framebuffer(kernel_wants_video: bool) -> Option<Framebuffer> {
    let result = current_mode();
    if result.is_none() && kernel_wants_video {
        warn!("the kernel asked for a video mode, but there is no usable framebuffer");
    }
    result
}

fn current_mode() -> Option<Framebuffer> {
    let handles = find_handles::<GraphicsOutput>().ok()?;
    let handle = handles.first().or_else(|| {
        warn!("no graphics output found, continuing without a framebuffer");
        None
    })?;
    let mut output = open_protocol_exclusive::<GraphicsOutput>(*handle).ok()?;
    let info = output.current_mode_info();
    let (width, height) = info.resolution();
    let (red, green, blue) = match info.pixel_format() {
        // byte order R G B X is red-first in a little-endian word
        PixelFormat::Rgb => ((0, 8), (8, 8), (16, 8)),
        PixelFormat::Bgr => ((16, 8), (8, 8), (0, 8)),
        PixelFormat::Bitmask => {
            let mask = info.pixel_bitmask()?;
            (field(mask.red), field(mask.green), field(mask.blue))
        }
        PixelFormat::BltOnly => {
            debug!("the current mode has no linear framebuffer");
            return None;
        }
    };
    let fb = Framebuffer {
        addr: output.frame_buffer().as_mut_ptr() as u64,
        // the stride is in pixels of 4 bytes each
        pitch: (info.stride() * 4) as u32,
        width: width as u32,
        height: height as u32,
        bpp: 32,
        red,
        green,
        blue,
    };
    debug!("framebuffer: {}x{} at {:#x}", fb.width, fb.height, fb.addr);
    Some(fb)
}

/// A channel mask as (field position, mask size).
fn field(mask: u32) -> (u8, u8) {
    (mask.trailing_zeros() as u8, mask.count_ones() as u8)
}
