// SPDX-License-Identifier: GPL-3.0-only

//! GEM buffer objects.
//!
//! A [`Bo`] is the only owner of its kernel handle: it can only be
//! produced by [`create_bo`] and only released by [`Bo::destroy`].
//! Mapping is reference counted purely to avoid redundant map requests
//! for repeated front-buffer queries; `destroy` unmaps unconditionally
//! regardless of the count.

use std::ptr::NonNull;

use tracing::warn;

use super::{
    device::KernelDisplay,
    error::{Error, Result},
};

/// An owned kernel graphics-memory object.
#[derive(Debug)]
pub struct Bo {
    handle: u32,
    size: u64,
    pitch: u32,
    ptr: Option<NonNull<u8>>,
    map_count: u32,
}

/// Allocates a buffer object sized for `width`x`height` at
/// `bpp` bits per pixel. The returned object is unmapped.
pub fn create_bo(dev: &impl KernelDisplay, width: u32, height: u32, bpp: u32) -> Result<Bo> {
    let buffer = dev
        .gem_create(width, height, bpp)
        .map_err(Error::Allocation)?;

    Ok(Bo {
        handle: buffer.handle,
        size: buffer.size,
        pitch: buffer.pitch,
        ptr: None,
        map_count: 0,
    })
}

impl Bo {
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    pub fn mapped(&self) -> Option<NonNull<u8>> {
        self.ptr
    }

    pub fn map_count(&self) -> u32 {
        self.map_count
    }

    /// Maps the object into the process address space.
    ///
    /// Idempotent: an already-mapped object only has its reference
    /// count bumped, no kernel call is made. On failure the object
    /// stays unmapped.
    pub fn map(&mut self, dev: &impl KernelDisplay) -> Result<NonNull<u8>> {
        if let Some(ptr) = self.ptr {
            self.map_count += 1;
            return Ok(ptr);
        }

        let offset = dev.gem_map_offset(self.handle).map_err(Error::Map)?;
        let ptr = dev.map(offset, self.size as usize).map_err(Error::Map)?;

        self.ptr = Some(ptr);
        self.map_count = 1;
        Ok(ptr)
    }

    /// Releases the object: unmaps it if mapped (a hard release, not a
    /// matching unmap) and closes the kernel handle.
    ///
    /// A failed close is reported, but the object is gone either way;
    /// the leaked kernel handle must never come back as a live `Bo`.
    pub fn destroy(mut self, dev: &impl KernelDisplay) -> Result<()> {
        if let Some(ptr) = self.ptr.take() {
            if let Err(err) = dev.unmap(ptr, self.size as usize) {
                warn!(?err, handle = self.handle, "Failed to unmap buffer object");
            }
            self.map_count = 0;
        }

        dev.gem_close(self.handle).map_err(|source| Error::HandleClose {
            handle: self.handle,
            source,
        })
    }
}
