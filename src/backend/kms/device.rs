// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io,
    os::fd::{AsFd, OwnedFd},
    path::Path,
    ptr::NonNull,
};

use rustix::{
    fs::{Mode, OFlags},
    mm::{MapFlags, ProtFlags},
};

use super::ioctl::{self, ModeInfo};

/// Result of a successful GEM allocation.
#[derive(Clone, Copy, Debug)]
pub struct GemBuffer {
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

#[derive(Clone, Debug, Default)]
pub struct CardResources {
    pub crtcs: Vec<u32>,
    pub connectors: Vec<u32>,
    pub encoders: Vec<u32>,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct CrtcInfo {
    pub gamma_size: u32,
}

#[derive(Clone, Debug)]
pub struct ConnectorInfo {
    pub connector_id: u32,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connection: u32,
    pub mm_width: u32,
    pub mm_height: u32,
    pub subpixel: u32,
    /// Encoder currently driving the connector, 0 if none.
    pub encoder_id: u32,
    pub encoders: Vec<u32>,
    pub modes: Vec<ModeInfo>,
}

#[derive(Clone, Copy, Debug)]
pub struct EncoderInfo {
    pub encoder_id: u32,
    pub encoder_type: u32,
    pub crtc_id: u32,
    pub possible_crtcs: u32,
    pub possible_clones: u32,
}

/// The kernel side of the core: GEM allocation and mode-setting of one
/// card node.
///
/// Every call blocks on the calling thread; there is no cancellation.
/// [`CardDevice`] is the real implementation, tests script a fake.
pub trait KernelDisplay {
    fn gem_create(&self, width: u32, height: u32, bpp: u32) -> io::Result<GemBuffer>;
    fn gem_map_offset(&self, handle: u32) -> io::Result<u64>;
    fn gem_close(&self, handle: u32) -> io::Result<()>;

    fn map(&self, offset: u64, len: usize) -> io::Result<NonNull<u8>>;
    fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()>;

    fn set_crtc(
        &self,
        crtc_id: u32,
        fb_id: u32,
        x: u32,
        y: u32,
        connectors: &[u32],
        mode: Option<&ModeInfo>,
    ) -> io::Result<()>;
    fn add_framebuffer(
        &self,
        width: u32,
        height: u32,
        depth: u32,
        bpp: u32,
        pitch: u32,
        handle: u32,
    ) -> io::Result<u32>;
    fn remove_framebuffer(&self, fb_id: u32) -> io::Result<()>;
    fn set_gamma(&self, crtc_id: u32, red: &[u16], green: &[u16], blue: &[u16]) -> io::Result<()>;
    fn set_cursor(&self, crtc_id: u32, handle: u32, width: u32, height: u32) -> io::Result<()>;
    fn move_cursor(&self, crtc_id: u32, x: i32, y: i32) -> io::Result<()>;

    fn resources(&self) -> io::Result<CardResources>;
    fn crtc_state(&self, crtc_id: u32) -> io::Result<CrtcInfo>;
    fn connector(&self, connector_id: u32) -> io::Result<ConnectorInfo>;
    fn encoder(&self, encoder_id: u32) -> io::Result<EncoderInfo>;
}

/// An opened xengfx card node.
#[derive(Debug)]
pub struct CardDevice {
    fd: OwnedFd,
}

impl CardDevice {
    pub fn open(path: &Path) -> io::Result<CardDevice> {
        let fd = rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::CLOEXEC | OFlags::NOCTTY | OFlags::NONBLOCK,
            Mode::empty(),
        )?;
        Ok(CardDevice { fd })
    }
}

impl KernelDisplay for CardDevice {
    fn gem_create(&self, width: u32, height: u32, bpp: u32) -> io::Result<GemBuffer> {
        let mut arg = ioctl::GemCreate::zeroed();
        arg.width = width;
        arg.height = height;
        arg.bpp = bpp;
        unsafe {
            ioctl::card_ioctl(self.fd.as_fd(), ioctl::DRM_IOCTL_XENGFX_GEM_CREATE, &mut arg)?;
        }
        Ok(GemBuffer {
            handle: arg.handle,
            pitch: arg.pitch,
            size: arg.size,
        })
    }

    fn gem_map_offset(&self, handle: u32) -> io::Result<u64> {
        let mut arg = ioctl::GemMap::zeroed();
        arg.handle = handle;
        unsafe {
            ioctl::card_ioctl(self.fd.as_fd(), ioctl::DRM_IOCTL_XENGFX_GEM_MAP, &mut arg)?;
        }
        Ok(arg.offset)
    }

    fn gem_close(&self, handle: u32) -> io::Result<()> {
        let mut arg = ioctl::GemClose::zeroed();
        arg.handle = handle;
        unsafe { ioctl::card_ioctl(self.fd.as_fd(), ioctl::DRM_IOCTL_GEM_CLOSE, &mut arg) }
    }

    fn map(&self, offset: u64, len: usize) -> io::Result<NonNull<u8>> {
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &self.fd,
                offset,
            )?
        };
        NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned a null mapping"))
    }

    fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        unsafe { rustix::mm::munmap(ptr.as_ptr() as *mut _, len)? };
        Ok(())
    }

    fn set_crtc(
        &self,
        crtc_id: u32,
        fb_id: u32,
        x: u32,
        y: u32,
        connectors: &[u32],
        mode: Option<&ModeInfo>,
    ) -> io::Result<()> {
        let mut arg = ioctl::ModeCrtc::zeroed();
        arg.crtc_id = crtc_id;
        arg.fb_id = fb_id;
        arg.x = x;
        arg.y = y;
        arg.set_connectors_ptr = connectors.as_ptr() as u64;
        arg.count_connectors = connectors.len() as u32;
        if let Some(mode) = mode {
            arg.mode = *mode;
            arg.mode_valid = 1;
        }
        unsafe { ioctl::card_ioctl(self.fd.as_fd(), ioctl::DRM_IOCTL_MODE_SETCRTC, &mut arg) }
    }

    fn add_framebuffer(
        &self,
        width: u32,
        height: u32,
        depth: u32,
        bpp: u32,
        pitch: u32,
        handle: u32,
    ) -> io::Result<u32> {
        let mut arg = ioctl::FbCmd::zeroed();
        arg.width = width;
        arg.height = height;
        arg.depth = depth;
        arg.bpp = bpp;
        arg.pitch = pitch;
        arg.handle = handle;
        unsafe {
            ioctl::card_ioctl(self.fd.as_fd(), ioctl::DRM_IOCTL_MODE_ADDFB, &mut arg)?;
        }
        Ok(arg.fb_id)
    }

    fn remove_framebuffer(&self, fb_id: u32) -> io::Result<()> {
        let mut arg = fb_id;
        unsafe { ioctl::card_ioctl(self.fd.as_fd(), ioctl::DRM_IOCTL_MODE_RMFB, &mut arg) }
    }

    fn set_gamma(&self, crtc_id: u32, red: &[u16], green: &[u16], blue: &[u16]) -> io::Result<()> {
        debug_assert_eq!(red.len(), green.len());
        debug_assert_eq!(red.len(), blue.len());
        let mut arg = ioctl::CrtcLut::zeroed();
        arg.crtc_id = crtc_id;
        arg.gamma_size = red.len() as u32;
        arg.red = red.as_ptr() as u64;
        arg.green = green.as_ptr() as u64;
        arg.blue = blue.as_ptr() as u64;
        unsafe { ioctl::card_ioctl(self.fd.as_fd(), ioctl::DRM_IOCTL_MODE_SETGAMMA, &mut arg) }
    }

    fn set_cursor(&self, crtc_id: u32, handle: u32, width: u32, height: u32) -> io::Result<()> {
        let mut arg = ioctl::ModeCursor::zeroed();
        arg.flags = ioctl::MODE_CURSOR_BO;
        arg.crtc_id = crtc_id;
        arg.handle = handle;
        arg.width = width;
        arg.height = height;
        unsafe { ioctl::card_ioctl(self.fd.as_fd(), ioctl::DRM_IOCTL_MODE_CURSOR, &mut arg) }
    }

    fn move_cursor(&self, crtc_id: u32, x: i32, y: i32) -> io::Result<()> {
        let mut arg = ioctl::ModeCursor::zeroed();
        arg.flags = ioctl::MODE_CURSOR_MOVE;
        arg.crtc_id = crtc_id;
        arg.x = x;
        arg.y = y;
        unsafe { ioctl::card_ioctl(self.fd.as_fd(), ioctl::DRM_IOCTL_MODE_CURSOR, &mut arg) }
    }

    fn resources(&self) -> io::Result<CardResources> {
        // Two-phase readout: ask for counts, size the buffers, read
        // again. Start over if a hotplug grew the counts in between.
        loop {
            let mut arg = ioctl::CardRes::zeroed();
            unsafe {
                ioctl::card_ioctl(self.fd.as_fd(), ioctl::DRM_IOCTL_MODE_GETRESOURCES, &mut arg)?;
            }

            let mut crtcs = vec![0u32; arg.count_crtcs as usize];
            let mut connectors = vec![0u32; arg.count_connectors as usize];
            let mut encoders = vec![0u32; arg.count_encoders as usize];

            let counts = (arg.count_crtcs, arg.count_connectors, arg.count_encoders);
            let mut arg = ioctl::CardRes::zeroed();
            arg.count_crtcs = counts.0;
            arg.count_connectors = counts.1;
            arg.count_encoders = counts.2;
            arg.crtc_id_ptr = crtcs.as_mut_ptr() as u64;
            arg.connector_id_ptr = connectors.as_mut_ptr() as u64;
            arg.encoder_id_ptr = encoders.as_mut_ptr() as u64;
            unsafe {
                ioctl::card_ioctl(self.fd.as_fd(), ioctl::DRM_IOCTL_MODE_GETRESOURCES, &mut arg)?;
            }

            if (arg.count_crtcs, arg.count_connectors, arg.count_encoders) != counts {
                continue;
            }

            return Ok(CardResources {
                crtcs,
                connectors,
                encoders,
                min_width: arg.min_width,
                max_width: arg.max_width,
                min_height: arg.min_height,
                max_height: arg.max_height,
            });
        }
    }

    fn crtc_state(&self, crtc_id: u32) -> io::Result<CrtcInfo> {
        let mut arg = ioctl::ModeCrtc::zeroed();
        arg.crtc_id = crtc_id;
        unsafe {
            ioctl::card_ioctl(self.fd.as_fd(), ioctl::DRM_IOCTL_MODE_GETCRTC, &mut arg)?;
        }
        Ok(CrtcInfo {
            gamma_size: arg.gamma_size,
        })
    }

    fn connector(&self, connector_id: u32) -> io::Result<ConnectorInfo> {
        loop {
            let mut arg = ioctl::GetConnector::zeroed();
            arg.connector_id = connector_id;
            unsafe {
                ioctl::card_ioctl(self.fd.as_fd(), ioctl::DRM_IOCTL_MODE_GETCONNECTOR, &mut arg)?;
            }

            let mut encoders = vec![0u32; arg.count_encoders as usize];
            let mut modes = vec![ModeInfo::zeroed(); arg.count_modes as usize];

            let counts = (arg.count_modes, arg.count_encoders);
            let mut arg = ioctl::GetConnector::zeroed();
            arg.connector_id = connector_id;
            arg.count_modes = counts.0;
            arg.count_encoders = counts.1;
            arg.modes_ptr = modes.as_mut_ptr() as u64;
            arg.encoders_ptr = encoders.as_mut_ptr() as u64;
            // Properties are negotiated outside this core; no buffers.
            unsafe {
                ioctl::card_ioctl(self.fd.as_fd(), ioctl::DRM_IOCTL_MODE_GETCONNECTOR, &mut arg)?;
            }

            if (arg.count_modes, arg.count_encoders) != counts {
                continue;
            }

            return Ok(ConnectorInfo {
                connector_id: arg.connector_id,
                connector_type: arg.connector_type,
                connector_type_id: arg.connector_type_id,
                connection: arg.connection,
                mm_width: arg.mm_width,
                mm_height: arg.mm_height,
                subpixel: arg.subpixel,
                encoder_id: arg.encoder_id,
                encoders,
                modes,
            });
        }
    }

    fn encoder(&self, encoder_id: u32) -> io::Result<EncoderInfo> {
        let mut arg = ioctl::GetEncoder::zeroed();
        arg.encoder_id = encoder_id;
        unsafe {
            ioctl::card_ioctl(self.fd.as_fd(), ioctl::DRM_IOCTL_MODE_GETENCODER, &mut arg)?;
        }
        Ok(EncoderInfo {
            encoder_id: arg.encoder_id,
            encoder_type: arg.encoder_type,
            crtc_id: arg.crtc_id,
            possible_crtcs: arg.possible_crtcs,
            possible_clones: arg.possible_clones,
        })
    }
}
