// SPDX-License-Identifier: GPL-3.0-only

//! Raw ioctl plumbing for the card node.
//!
//! Layouts mirror the kernel uapi headers bit for bit; the two vendor
//! calls live in the command range above `DRM_COMMAND_BASE`.

use std::{
    io,
    os::fd::{AsRawFd, BorrowedFd},
};

use libc::{c_ulong, c_void};

pub const DISPLAY_MODE_LEN: usize = 32;

const IOC_WRITE: c_ulong = 1;
const IOC_READ: c_ulong = 2;

const IOC_NRSHIFT: c_ulong = 0;
const IOC_TYPESHIFT: c_ulong = 8;
const IOC_SIZESHIFT: c_ulong = 16;
const IOC_DIRSHIFT: c_ulong = 30;

const DRM_IOCTL_BASE: c_ulong = b'd' as c_ulong;
const DRM_COMMAND_BASE: c_ulong = 0x40;

const fn ioc(dir: c_ulong, nr: c_ulong, size: usize) -> c_ulong {
    (dir << IOC_DIRSHIFT)
        | (DRM_IOCTL_BASE << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
        | ((size as c_ulong) << IOC_SIZESHIFT)
}

const fn iow<T>(nr: c_ulong) -> c_ulong {
    ioc(IOC_WRITE, nr, std::mem::size_of::<T>())
}

const fn iowr<T>(nr: c_ulong) -> c_ulong {
    ioc(IOC_READ | IOC_WRITE, nr, std::mem::size_of::<T>())
}

macro_rules! impl_zeroed {
    ($t:ty) => {
        impl $t {
            pub fn zeroed() -> Self {
                // All fields are plain integers; all-zeroes is valid.
                unsafe { std::mem::zeroed() }
            }
        }
        impl Default for $t {
            fn default() -> Self {
                Self::zeroed()
            }
        }
    };
}

/// Vendor GEM allocation request.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct GemCreate {
    pub height: u32,
    pub width: u32,
    pub bpp: u32,
    pub flags: u32,
    // Filled in by the kernel.
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}
impl_zeroed!(GemCreate);

/// Vendor GEM map-offset request.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct GemMap {
    pub handle: u32,
    pub pad: u32,
    /// Fake mmap offset to map the object through the card node.
    pub offset: u64,
}
impl_zeroed!(GemMap);

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct GemClose {
    pub handle: u32,
    pub pad: u32,
}
impl_zeroed!(GemClose);

#[derive(Clone, Copy)]
#[repr(C)]
pub struct ModeInfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub typ: u32,
    pub name: [u8; DISPLAY_MODE_LEN],
}
impl_zeroed!(ModeInfo);

impl std::fmt::Debug for ModeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.name.iter().position(|b| *b == 0).unwrap_or(DISPLAY_MODE_LEN);
        f.debug_struct("ModeInfo")
            .field("name", &String::from_utf8_lossy(&self.name[..len]))
            .field("clock", &self.clock)
            .field("hdisplay", &self.hdisplay)
            .field("vdisplay", &self.vdisplay)
            .field("vrefresh", &self.vrefresh)
            .field("flags", &self.flags)
            .field("typ", &self.typ)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct ModeCrtc {
    pub set_connectors_ptr: u64,
    pub count_connectors: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub gamma_size: u32,
    pub mode_valid: u32,
    pub mode: ModeInfo,
}
impl_zeroed!(ModeCrtc);

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct FbCmd {
    pub fb_id: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u32,
    pub depth: u32,
    pub handle: u32,
}
impl_zeroed!(FbCmd);

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct CrtcLut {
    pub crtc_id: u32,
    pub gamma_size: u32,
    pub red: u64,
    pub green: u64,
    pub blue: u64,
}
impl_zeroed!(CrtcLut);

pub const MODE_CURSOR_BO: u32 = 1 << 0;
pub const MODE_CURSOR_MOVE: u32 = 1 << 1;

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct ModeCursor {
    pub flags: u32,
    pub crtc_id: u32,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub handle: u32,
}
impl_zeroed!(ModeCursor);

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct CardRes {
    pub fb_id_ptr: u64,
    pub crtc_id_ptr: u64,
    pub connector_id_ptr: u64,
    pub encoder_id_ptr: u64,
    pub count_fbs: u32,
    pub count_crtcs: u32,
    pub count_connectors: u32,
    pub count_encoders: u32,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}
impl_zeroed!(CardRes);

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct GetConnector {
    pub encoders_ptr: u64,
    pub modes_ptr: u64,
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub count_modes: u32,
    pub count_props: u32,
    pub count_encoders: u32,
    pub encoder_id: u32,
    pub connector_id: u32,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connection: u32,
    pub mm_width: u32,
    pub mm_height: u32,
    pub subpixel: u32,
    pub pad: u32,
}
impl_zeroed!(GetConnector);

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct GetEncoder {
    pub encoder_id: u32,
    pub encoder_type: u32,
    pub crtc_id: u32,
    pub possible_crtcs: u32,
    pub possible_clones: u32,
}
impl_zeroed!(GetEncoder);

pub const DRM_IOCTL_GEM_CLOSE: c_ulong = iow::<GemClose>(0x09);
pub const DRM_IOCTL_MODE_GETRESOURCES: c_ulong = iowr::<CardRes>(0xa0);
pub const DRM_IOCTL_MODE_GETCRTC: c_ulong = iowr::<ModeCrtc>(0xa1);
pub const DRM_IOCTL_MODE_SETCRTC: c_ulong = iowr::<ModeCrtc>(0xa2);
pub const DRM_IOCTL_MODE_CURSOR: c_ulong = iowr::<ModeCursor>(0xa3);
pub const DRM_IOCTL_MODE_SETGAMMA: c_ulong = iowr::<CrtcLut>(0xa5);
pub const DRM_IOCTL_MODE_GETENCODER: c_ulong = iowr::<GetEncoder>(0xa6);
pub const DRM_IOCTL_MODE_GETCONNECTOR: c_ulong = iowr::<GetConnector>(0xa7);
pub const DRM_IOCTL_MODE_ADDFB: c_ulong = iowr::<FbCmd>(0xae);
pub const DRM_IOCTL_MODE_RMFB: c_ulong = iowr::<u32>(0xaf);

pub const DRM_IOCTL_XENGFX_GEM_CREATE: c_ulong = iowr::<GemCreate>(DRM_COMMAND_BASE);
pub const DRM_IOCTL_XENGFX_GEM_MAP: c_ulong = iowr::<GemMap>(DRM_COMMAND_BASE + 1);

/// Issues `request` on the card node, retrying on `EINTR`/`EAGAIN`.
///
/// # Safety
/// `request` must be an ioctl the kernel decodes as reading/writing a
/// `T`, and `arg` must satisfy whatever pointer fields `T` carries.
pub unsafe fn card_ioctl<T>(fd: BorrowedFd, request: c_ulong, arg: &mut T) -> io::Result<()> {
    loop {
        let ret = libc::ioctl(fd.as_raw_fd(), request, arg as *mut T as *mut c_void);
        if ret != -1 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
            _ => return Err(err),
        }
    }
}
