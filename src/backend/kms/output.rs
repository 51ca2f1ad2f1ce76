// SPDX-License-Identifier: GPL-3.0-only

use tracing::{debug, warn};

use super::{
    device::KernelDisplay,
    error::{Error, Result},
    modes::ModeTiming,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Unknown,
}

impl ConnectionState {
    fn from_kernel(raw: u32) -> ConnectionState {
        match raw {
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnected,
            _ => ConnectionState::Unknown,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subpixel {
    Unknown,
    HorizontalRgb,
    HorizontalBgr,
    VerticalRgb,
    VerticalBgr,
    None,
}

impl Subpixel {
    fn from_kernel(raw: u32) -> Subpixel {
        match raw {
            2 => Subpixel::HorizontalRgb,
            3 => Subpixel::HorizontalBgr,
            4 => Subpixel::VerticalRgb,
            5 => Subpixel::VerticalBgr,
            6 => Subpixel::None,
            _ => Subpixel::Unknown,
        }
    }
}

/// One kernel connector plus its single encoder.
///
/// The virtual adapter routes every connector through exactly one
/// encoder, so the two are folded into one object here. `crtc` is the
/// pipeline assignment made by [`assign_crtcs`](super::KmsState::assign_crtcs),
/// not the kernel's current routing; that lives in `current_crtc`.
#[derive(Clone, Debug)]
pub struct Output {
    pub name: String,
    pub connector_id: u32,
    pub encoder_id: u32,
    /// CRTC the kernel had routed at discovery time, 0 for none.
    pub current_crtc: u32,
    /// Bitmask over the CRTC list, by index.
    pub possible_crtcs: u32,
    pub crtc: Option<u32>,
    pub modes: Vec<ModeTiming>,
    pub connection: ConnectionState,
    pub mm_width: u32,
    pub mm_height: u32,
    pub subpixel: Subpixel,
}

impl Output {
    pub fn new(dev: &impl KernelDisplay, connector_id: u32) -> Result<Output> {
        let conn = dev.connector(connector_id).map_err(Error::Discovery)?;

        if conn.encoders.len() != 1 {
            return Err(Error::UnexpectedEncoders(connector_id, conn.encoders.len()));
        }
        let encoder = dev.encoder(conn.encoders[0]).map_err(Error::Discovery)?;

        let name = format!("LVDS-{}", conn.connector_type_id);
        let modes: Vec<ModeTiming> = conn.modes.iter().map(ModeTiming::from_kernel).collect();
        debug!(
            output = %name,
            connector = connector_id,
            modes = modes.len(),
            "Discovered output"
        );

        Ok(Output {
            name,
            connector_id,
            encoder_id: encoder.encoder_id,
            current_crtc: encoder.crtc_id,
            possible_crtcs: encoder.possible_crtcs,
            crtc: None,
            modes,
            connection: ConnectionState::from_kernel(conn.connection),
            mm_width: conn.mm_width,
            mm_height: conn.mm_height,
            subpixel: Subpixel::from_kernel(conn.subpixel),
        })
    }

    /// Re-probes the connector, refreshing the mode list and the
    /// connection state.
    pub fn detect(&mut self, dev: &impl KernelDisplay) -> Result<ConnectionState> {
        let conn = dev.connector(self.connector_id).map_err(Error::Discovery)?;

        self.connection = ConnectionState::from_kernel(conn.connection);
        self.modes = conn.modes.iter().map(ModeTiming::from_kernel).collect();
        self.mm_width = conn.mm_width;
        self.mm_height = conn.mm_height;

        if self.modes.is_empty() && self.connection == ConnectionState::Connected {
            warn!(output = %self.name, "Connected output without any modes");
        }
        Ok(self.connection)
    }

    /// The virtual adapter scans out of system memory; every timing the
    /// kernel reports is usable.
    pub fn mode_valid(&self, _mode: &ModeTiming) -> bool {
        true
    }

    /// Power management is not wired up for the virtual adapter.
    pub fn dpms(&self, _level: i32) {}
}
