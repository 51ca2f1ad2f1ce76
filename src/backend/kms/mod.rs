// SPDX-License-Identifier: GPL-3.0-only

//! Mode-setting and buffer lifecycle for the xengfx virtual adapter.
//!
//! [`KmsState`] ties the pieces together: one shared front buffer in
//! [`ScreenState`], one [`Crtc`] per hardware pipeline and one
//! [`Output`] per usable connector. Everything reaches the kernel
//! through the [`KernelDisplay`] trait so tests can script a fake card.

use std::ptr::NonNull;

use tracing::{debug, info, warn};

pub mod bo;
pub mod crtc;
pub mod device;
pub mod error;
pub(crate) mod ioctl;
pub mod modes;
pub mod output;
#[cfg(test)]
pub(crate) mod test_support;

use bo::{create_bo, Bo};
pub use crtc::{Crtc, DesiredConfig, Rotation};
pub use device::{CardDevice, KernelDisplay};
pub use error::{Error, Result};
pub use output::{ConnectionState, Output};

pub const MIN_SCREEN_WIDTH: u32 = 320;
pub const MIN_SCREEN_HEIGHT: u32 = 200;

/// The shared scan-out surface. All enabled CRTCs scan out of this one
/// buffer; it is owned here and only borrowed during an apply.
#[derive(Debug)]
pub struct ScreenState {
    pub front_bo: Bo,
    /// Framebuffer id of `front_bo`, 0 until the first apply.
    pub fb_id: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub bits_per_pixel: u32,
    /// Front buffer width in pixels as implied by its pitch.
    pub display_width: u32,
}

impl ScreenState {
    pub fn cpp(&self) -> u32 {
        (self.bits_per_pixel + 7) / 8
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SizeRange {
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
}

impl SizeRange {
    fn contains(&self, width: u32, height: u32) -> bool {
        (self.min_width..=self.max_width).contains(&width)
            && (self.min_height..=self.max_height).contains(&height)
    }
}

/// Pixel format and virtual-size parameters for start-of-day.
#[derive(Clone, Copy, Debug)]
pub struct ScreenSetup {
    pub virtual_size: Option<(u32, u32)>,
    pub depth: u32,
    pub bits_per_pixel: u32,
}

impl Default for ScreenSetup {
    fn default() -> ScreenSetup {
        ScreenSetup {
            virtual_size: None,
            depth: 24,
            bits_per_pixel: 32,
        }
    }
}

#[derive(Debug)]
pub struct KmsState<D: KernelDisplay> {
    pub dev: D,
    pub screen: ScreenState,
    pub crtcs: Vec<Crtc>,
    pub outputs: Vec<Output>,
    pub size_range: SizeRange,
}

impl<D: KernelDisplay> KmsState<D> {
    /// Discovers the display topology and allocates the initial front
    /// buffer and per-CRTC cursor buffers.
    ///
    /// Connectors that fail discovery are skipped with a warning; a
    /// card without usable CRTCs is still an error further up when
    /// modes get applied, not here.
    pub fn new(dev: D, setup: ScreenSetup) -> Result<KmsState<D>> {
        if !matches!(setup.bits_per_pixel, 8 | 16 | 24 | 32)
            || setup.depth == 0
            || setup.depth > setup.bits_per_pixel
        {
            return Err(Error::PixelFormat(setup.bits_per_pixel, setup.depth));
        }

        let res = dev.resources().map_err(Error::Discovery)?;

        let size_range = SizeRange {
            min_width: MIN_SCREEN_WIDTH,
            min_height: MIN_SCREEN_HEIGHT,
            max_width: res.max_width,
            max_height: res.max_height,
        };

        let mut crtcs: Vec<Crtc> = res.crtcs.iter().map(|id| Crtc::new(&dev, *id)).collect();

        let mut outputs = Vec::new();
        for connector_id in res.connectors.iter().copied() {
            match Output::new(&dev, connector_id) {
                Ok(output) => outputs.push(output),
                Err(err) => {
                    warn!(?err, connector = connector_id, "Skipping connector");
                }
            }
        }

        let (width, height) = setup
            .virtual_size
            .unwrap_or_else(|| natural_size(&outputs));
        if !size_range.contains(width, height) {
            return Err(Error::SizeOutOfRange(width, height));
        }

        let front_bo = create_bo(&dev, width, height, setup.bits_per_pixel)?;
        let cpp = (setup.bits_per_pixel + 7) / 8;
        let screen = ScreenState {
            display_width: front_bo.pitch() / cpp,
            front_bo,
            fb_id: 0,
            width,
            height,
            depth: setup.depth,
            bits_per_pixel: setup.bits_per_pixel,
        };

        for crtc in &mut crtcs {
            match create_bo(&dev, crtc::CURSOR_SIZE, crtc::CURSOR_SIZE, 32) {
                Ok(bo) => crtc.attach_cursor(bo),
                Err(err) => warn!(?err, crtc = crtc.id, "No cursor buffer for crtc"),
            }
        }

        info!(
            width,
            height,
            crtcs = crtcs.len(),
            outputs = outputs.len(),
            "Initialized mode-setting"
        );

        Ok(KmsState {
            dev,
            screen,
            crtcs,
            outputs,
            size_range,
        })
    }

    pub fn crtc_mut(&mut self, id: u32) -> Option<&mut Crtc> {
        self.crtcs.iter_mut().find(|crtc| crtc.id == id)
    }

    /// Routes connected outputs onto CRTCs.
    ///
    /// Mappings the previous drm master left behind are kept when
    /// possible to avoid a visible flicker; remaining outputs take the
    /// first free CRTC their encoder can drive.
    pub fn assign_crtcs(&mut self) {
        let mut taken: Vec<u32> = Vec::new();

        for output in &mut self.outputs {
            output.crtc = None;
            if output.connection != ConnectionState::Connected {
                continue;
            }
            if output.current_crtc != 0
                && !taken.contains(&output.current_crtc)
                && self.crtcs.iter().any(|crtc| crtc.id == output.current_crtc)
            {
                output.crtc = Some(output.current_crtc);
                taken.push(output.current_crtc);
            }
        }

        for output in &mut self.outputs {
            if output.crtc.is_some() || output.connection != ConnectionState::Connected {
                continue;
            }
            let free = self.crtcs.iter().enumerate().find(|(i, crtc)| {
                output.possible_crtcs & (1 << i) != 0 && !taken.contains(&crtc.id)
            });
            if let Some((_, crtc)) = free {
                debug!(output = %output.name, crtc = crtc.id, "Assigned crtc");
                output.crtc = Some(crtc.id);
                taken.push(crtc.id);
            } else {
                warn!(output = %output.name, "No free crtc for connected output");
            }
        }

        self.sync_enabled();
    }

    /// Recomputes the per-CRTC enable flag from the output routing.
    pub fn sync_enabled(&mut self) {
        for crtc in &mut self.crtcs {
            crtc.enabled = self
                .outputs
                .iter()
                .any(|output| output.crtc == Some(crtc.id));
        }
    }

    /// Brings the hardware in line with the assignments: disabled
    /// pipelines get a null commit, enabled ones get their desired
    /// configuration or the closest fit to the screen size.
    pub fn set_desired_modes(&mut self) -> Result<()> {
        let KmsState {
            dev,
            screen,
            crtcs,
            outputs,
            ..
        } = self;

        for crtc in crtcs.iter_mut() {
            if !crtc.enabled {
                if let Err(err) = dev.set_crtc(crtc.id, 0, 0, 0, &[], None) {
                    warn!(?err, crtc = crtc.id, "Failed to disable crtc");
                }
                continue;
            }

            let Some(output) = outputs.iter().find(|output| output.crtc == Some(crtc.id)) else {
                continue;
            };

            let desired = match crtc.desired.clone() {
                Some(desired) => desired,
                None => DesiredConfig {
                    mode: modes::closest_mode(&output.modes, screen.width, screen.height)
                        .ok_or(Error::NoMode(crtc.id))?
                        .clone(),
                    rotation: Rotation::ROTATE_0,
                    x: 0,
                    y: 0,
                },
            };

            // Force a fresh commit even if the timing matches.
            crtc.mode = None;
            let DesiredConfig {
                mode,
                rotation,
                x,
                y,
            } = desired;
            crtc.apply_mode(dev, screen, outputs, &mode, rotation, x, y)?;
        }

        Ok(())
    }

    /// Replaces the front buffer with one of `width` x `height` and
    /// re-applies every enabled CRTC onto it.
    ///
    /// Until the new framebuffer is registered and mapped any failure
    /// rolls the screen back untouched. After that point per-CRTC
    /// re-applies are best effort: a pipeline that refuses the commit
    /// is logged and left for a follow-up mode-set, the resize itself
    /// stands. The old buffer is released only after every CRTC has
    /// been processed.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if self.screen.width == width && self.screen.height == height {
            return Ok(());
        }
        if !self.size_range.contains(width, height) {
            return Err(Error::SizeOutOfRange(width, height));
        }

        let KmsState {
            dev,
            screen,
            crtcs,
            outputs,
            ..
        } = self;

        let old_width = screen.width;
        let old_height = screen.height;
        let old_display_width = screen.display_width;
        let old_fb_id = screen.fb_id;

        let new_front = create_bo(dev, width, height, screen.bits_per_pixel)?;
        let pitch = new_front.pitch();

        screen.width = width;
        screen.height = height;
        screen.display_width = pitch / screen.cpp();
        let old_front = std::mem::replace(&mut screen.front_bo, new_front);

        let new_fb_id = match dev.add_framebuffer(
            width,
            height,
            screen.depth,
            screen.bits_per_pixel,
            pitch,
            screen.front_bo.handle(),
        ) {
            Ok(fb_id) => fb_id,
            Err(err) => {
                let fresh = std::mem::replace(&mut screen.front_bo, old_front);
                if let Err(err) = fresh.destroy(dev) {
                    warn!(?err, "Failed to release new front buffer during rollback");
                }
                screen.width = old_width;
                screen.height = old_height;
                screen.display_width = old_display_width;
                return Err(Error::FramebufferRegistration(err));
            }
        };
        screen.fb_id = new_fb_id;

        if let Err(map_err) = screen.front_bo.map(dev) {
            if let Err(err) = dev.remove_framebuffer(new_fb_id) {
                warn!(?err, "Failed to drop new framebuffer during rollback");
            }
            let fresh = std::mem::replace(&mut screen.front_bo, old_front);
            if let Err(err) = fresh.destroy(dev) {
                warn!(?err, "Failed to release new front buffer during rollback");
            }
            screen.width = old_width;
            screen.height = old_height;
            screen.display_width = old_display_width;
            screen.fb_id = old_fb_id;
            return Err(map_err);
        }

        for crtc in crtcs.iter_mut() {
            if !crtc.enabled {
                continue;
            }
            let Some(mode) = crtc.mode.clone() else {
                continue;
            };
            let (rotation, x, y) = (crtc.rotation, crtc.x, crtc.y);
            if let Err(err) = crtc.apply_mode(dev, screen, outputs, &mode, rotation, x, y) {
                warn!(
                    ?err,
                    crtc = crtc.id,
                    "Mode re-apply failed after resize, follow-up mode-set required"
                );
            }
        }

        if old_fb_id != 0 {
            if let Err(err) = dev.remove_framebuffer(old_fb_id) {
                warn!(?err, fb_id = old_fb_id, "Failed to remove old framebuffer");
            }
        }
        if let Err(err) = old_front.destroy(dev) {
            warn!(?err, "Failed to destroy old front buffer");
        }

        info!(width, height, "Resized screen");
        Ok(())
    }

    /// Maps the front buffer, returning the existing mapping if one is
    /// already live.
    pub fn map_front(&mut self) -> Result<NonNull<u8>> {
        if let Some(ptr) = self.screen.front_bo.mapped() {
            return Ok(ptr);
        }
        self.screen.front_bo.map(&self.dev)
    }

    /// Releases all kernel resources. Failures are logged; teardown
    /// always proceeds to the end.
    pub fn teardown(self) {
        let KmsState {
            dev,
            screen,
            mut crtcs,
            ..
        } = self;

        for crtc in &mut crtcs {
            crtc.destroy(&dev);
        }

        if screen.fb_id != 0 {
            if let Err(err) = dev.remove_framebuffer(screen.fb_id) {
                warn!(?err, "Failed to remove front framebuffer");
            }
        }
        if let Err(err) = screen.front_bo.destroy(&dev) {
            warn!(?err, "Failed to destroy front buffer");
        }
    }
}

/// Bounding box over the connected outputs' preferred modes, with a
/// 1024x768 fallback when nothing is connected yet.
fn natural_size(outputs: &[Output]) -> (u32, u32) {
    let mut width = 0;
    let mut height = 0;
    for output in outputs {
        if output.connection != ConnectionState::Connected {
            continue;
        }
        if let Some(mode) = modes::preferred_mode(&output.modes) {
            let (w, h) = mode.size();
            width = width.max(w);
            height = height.max(h);
        }
    }
    if width == 0 || height == 0 {
        (1024, 768)
    } else {
        (width, height)
    }
}
