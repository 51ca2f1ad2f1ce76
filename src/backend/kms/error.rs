// SPDX-License-Identifier: GPL-3.0-only

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to allocate graphics memory")]
    Allocation(#[source] io::Error),
    #[error("Failed to map buffer object")]
    Map(#[source] io::Error),
    #[error("Kernel rejected the mode-set")]
    ModeApply(#[source] io::Error),
    #[error("Failed to register framebuffer")]
    FramebufferRegistration(#[source] io::Error),
    #[error("Failed to set up the shadow buffer")]
    ShadowAllocation,
    #[error("Failed to close handle {handle}")]
    HandleClose {
        handle: u32,
        #[source]
        source: io::Error,
    },
    #[error("Failed to read display topology")]
    Discovery(#[source] io::Error),
    #[error("Connector {0} exposes {1} encoders, expected exactly one")]
    UnexpectedEncoders(u32, usize),
    #[error("Unsupported pixel format: {0} bpp at depth {1}")]
    PixelFormat(u32, u32),
    #[error("Requested size {0}x{1} is outside the supported range")]
    SizeOutOfRange(u32, u32),
    #[error("No usable mode for crtc {0}")]
    NoMode(u32),
}

pub type Result<T> = std::result::Result<T, Error>;
