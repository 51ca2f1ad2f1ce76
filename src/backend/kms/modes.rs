// SPDX-License-Identifier: GPL-3.0-only

use bitflags::bitflags;

use super::ioctl::{ModeInfo, DISPLAY_MODE_LEN};

bitflags! {
    /// Timing flags, bit-compatible with the kernel mode struct.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ModeFlags: u32 {
        const PHSYNC = 1 << 0;
        const NHSYNC = 1 << 1;
        const PVSYNC = 1 << 2;
        const NVSYNC = 1 << 3;
        const INTERLACE = 1 << 4;
        const DBLSCAN = 1 << 5;
        const CSYNC = 1 << 6;
        const PCSYNC = 1 << 7;
        const NCSYNC = 1 << 8;
        const HSKEW = 1 << 9;
    }
}

bitflags! {
    /// Mode classification bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ModeType: u32 {
        const BUILTIN = 1 << 0;
        const PREFERRED = 1 << 3;
        const DEFAULT = 1 << 4;
        const USERDEF = 1 << 5;
        const DRIVER = 1 << 6;
    }
}

/// A display timing. Immutable value type; conversion to and from the
/// kernel representation is lossless except that the name truncates at
/// 31 bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModeTiming {
    pub name: String,
    /// Pixel clock in kHz.
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
    pub flags: ModeFlags,
    pub typ: ModeType,
}

impl ModeTiming {
    pub fn size(&self) -> (u32, u32) {
        (self.hdisplay as u32, self.vdisplay as u32)
    }

    /// Refresh rate in millihertz, derived from the raw timings.
    pub fn refresh_millihertz(&self) -> u32 {
        if self.htotal == 0 || self.vtotal == 0 {
            return 0;
        }
        let htotal = self.htotal as u64;
        let vtotal = self.vtotal as u64;
        let mut refresh = (self.clock as u64 * 1_000_000 / htotal + vtotal / 2) / vtotal;

        if self.flags.contains(ModeFlags::INTERLACE) {
            refresh *= 2;
        }
        if self.flags.contains(ModeFlags::DBLSCAN) {
            refresh /= 2;
        }
        if self.vscan > 1 {
            refresh /= self.vscan as u64;
        }

        refresh as u32
    }

    /// Converts into the kernel wire representation. Zero-fills the
    /// target, copies every timing field verbatim and bounds the name.
    pub fn to_kernel(&self) -> ModeInfo {
        let mut kmode = ModeInfo::zeroed();

        kmode.clock = self.clock;

        kmode.hdisplay = self.hdisplay;
        kmode.hsync_start = self.hsync_start;
        kmode.hsync_end = self.hsync_end;
        kmode.htotal = self.htotal;
        kmode.hskew = self.hskew;

        kmode.vdisplay = self.vdisplay;
        kmode.vsync_start = self.vsync_start;
        kmode.vsync_end = self.vsync_end;
        kmode.vtotal = self.vtotal;
        kmode.vscan = self.vscan;

        kmode.vrefresh = self.vrefresh;
        kmode.flags = self.flags.bits();
        kmode.typ = self.typ.bits();

        let name = self.name.as_bytes();
        let len = name.len().min(DISPLAY_MODE_LEN - 1);
        kmode.name[..len].copy_from_slice(&name[..len]);

        kmode
    }

    /// Builds a timing from the kernel representation, deriving the
    /// driver/preferred classification and filling in parameters the
    /// kernel did not supply.
    pub fn from_kernel(kmode: &ModeInfo) -> ModeTiming {
        let len = kmode
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(DISPLAY_MODE_LEN - 1);
        let mut name = String::from_utf8_lossy(&kmode.name[..len]).into_owned();
        if name.is_empty() {
            name = format!("{}x{}", kmode.hdisplay, kmode.vdisplay);
        }

        let ktype = ModeType::from_bits_truncate(kmode.typ);
        let mut typ = ModeType::DRIVER;
        if ktype.contains(ModeType::PREFERRED) {
            typ |= ModeType::PREFERRED;
        }

        let mut mode = ModeTiming {
            name,
            clock: kmode.clock,
            hdisplay: kmode.hdisplay,
            hsync_start: kmode.hsync_start,
            hsync_end: kmode.hsync_end,
            htotal: kmode.htotal,
            hskew: kmode.hskew,
            vdisplay: kmode.vdisplay,
            vsync_start: kmode.vsync_start,
            vsync_end: kmode.vsync_end,
            vtotal: kmode.vtotal,
            vscan: kmode.vscan,
            vrefresh: kmode.vrefresh,
            flags: ModeFlags::from_bits_truncate(kmode.flags),
            typ,
        };
        if mode.vrefresh == 0 {
            mode.vrefresh = (mode.refresh_millihertz() + 500) / 1000;
        }

        mode
    }
}

/// Picks the preferred mode, falling back to the first candidate.
pub fn preferred_mode(modes: &[ModeTiming]) -> Option<&ModeTiming> {
    modes
        .iter()
        .find(|m| m.typ.contains(ModeType::PREFERRED))
        .or_else(|| modes.first())
}

/// Finds the candidate closest to the requested size: an exact match
/// (preferred bit wins, then highest refresh), otherwise the smallest
/// geometric distance.
pub fn closest_mode(modes: &[ModeTiming], width: u32, height: u32) -> Option<&ModeTiming> {
    let mut exact = modes
        .iter()
        .filter(|m| m.hdisplay as u32 == width && m.vdisplay as u32 == height);
    if let Some(m) = exact
        .clone()
        .find(|m| m.typ.contains(ModeType::PREFERRED))
    {
        return Some(m);
    }
    if let Some(m) = exact.next() {
        return Some(m);
    }

    modes.iter().min_by_key(|m| {
        let dw = m.hdisplay as i64 - width as i64;
        let dh = m.vdisplay as i64 - height as i64;
        dw * dw + dh * dh
    })
}
