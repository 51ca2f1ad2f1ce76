// SPDX-License-Identifier: GPL-3.0-only

use bitflags::bitflags;
use smallvec::SmallVec;
use tracing::{debug, warn};

use super::{
    bo::{create_bo, Bo},
    device::KernelDisplay,
    error::{Error, Result},
    ioctl::ModeInfo,
    modes::ModeTiming,
    output::Output,
    ScreenState,
};

pub const CURSOR_SIZE: u32 = 64;

bitflags! {
    /// Scan-out rotation and reflection, RandR bit layout.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Rotation: u32 {
        const ROTATE_0 = 1 << 0;
        const ROTATE_90 = 1 << 1;
        const ROTATE_180 = 1 << 2;
        const ROTATE_270 = 1 << 3;
        const REFLECT_X = 1 << 4;
        const REFLECT_Y = 1 << 5;
    }
}

impl Default for Rotation {
    fn default() -> Rotation {
        Rotation::ROTATE_0
    }
}

impl Rotation {
    /// Whether scan-out needs an intermediate shadow buffer for the
    /// external rasterizer to draw into.
    pub fn needs_shadow(self) -> bool {
        self != Rotation::ROTATE_0
    }

    /// 90 and 270 degree rotations swap width and height.
    pub fn swaps_axes(self) -> bool {
        self.intersects(Rotation::ROTATE_90 | Rotation::ROTATE_270)
    }
}

/// Desired configuration for a CRTC, applied by `set_desired_modes`.
#[derive(Clone, Debug)]
pub struct DesiredConfig {
    pub mode: ModeTiming,
    pub rotation: Rotation,
    pub x: u32,
    pub y: u32,
}

/// CPU-side descriptor of a shadow buffer, handed to the external
/// rasterizer to draw the rotated screen into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShadowSurface {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub depth: u32,
    pub bits_per_pixel: u32,
}

#[derive(Debug)]
struct Shadow {
    bo: Bo,
    fb_id: u32,
    pitch: u32,
}

/// One hardware display pipeline.
///
/// Created once per kernel-reported CRTC at start-of-day and mutated in
/// place afterwards. The shared front buffer is not owned here; it is
/// borrowed from [`ScreenState`] for the duration of an apply.
#[derive(Debug)]
pub struct Crtc {
    pub id: u32,
    pub enabled: bool,
    /// Currently applied mode; `None` before the first successful apply.
    pub mode: Option<ModeTiming>,
    pub rotation: Rotation,
    pub x: u32,
    pub y: u32,
    pub desired: Option<DesiredConfig>,

    kmode: ModeInfo,
    cursor: Option<Bo>,
    shadow: Option<Shadow>,

    gamma_red: Vec<u16>,
    gamma_green: Vec<u16>,
    gamma_blue: Vec<u16>,
}

fn identity_ramp(size: usize) -> Vec<u16> {
    match size {
        0 | 1 => vec![0; size],
        _ => (0..size)
            .map(|i| (i * 0xffff / (size - 1)) as u16)
            .collect(),
    }
}

impl Crtc {
    pub fn new(dev: &impl KernelDisplay, id: u32) -> Crtc {
        let gamma_size = match dev.crtc_state(id) {
            Ok(info) => info.gamma_size as usize,
            Err(err) => {
                warn!(?err, crtc = id, "Failed to read crtc state, assuming 256 gamma entries");
                256
            }
        };

        Crtc {
            id,
            enabled: false,
            mode: None,
            rotation: Rotation::ROTATE_0,
            x: 0,
            y: 0,
            desired: None,
            kmode: ModeInfo::zeroed(),
            cursor: None,
            shadow: None,
            gamma_red: identity_ramp(gamma_size),
            gamma_green: identity_ramp(gamma_size),
            gamma_blue: identity_ramp(gamma_size),
        }
    }

    /// Applies `mode` at `rotation` and position `(x, y)`.
    ///
    /// The first successful apply registers the shared front
    /// framebuffer; later calls reuse the existing id. On any failure
    /// the observable `{mode, rotation, x, y}` state is restored to its
    /// pre-call value.
    pub fn apply_mode(
        &mut self,
        dev: &impl KernelDisplay,
        screen: &mut ScreenState,
        outputs: &[Output],
        mode: &ModeTiming,
        rotation: Rotation,
        x: u32,
        y: u32,
    ) -> Result<()> {
        if screen.fb_id == 0 {
            screen.fb_id = dev
                .add_framebuffer(
                    screen.width,
                    screen.height,
                    screen.depth,
                    screen.bits_per_pixel,
                    screen.front_bo.pitch(),
                    screen.front_bo.handle(),
                )
                .map_err(Error::FramebufferRegistration)?;
            debug!(fb_id = screen.fb_id, "Registered front framebuffer");
        }

        let saved_mode = self.mode.take();
        let saved_rotation = self.rotation;
        let saved_x = self.x;
        let saved_y = self.y;

        self.mode = Some(mode.clone());
        self.rotation = rotation;
        self.x = x;
        self.y = y;
        self.kmode = mode.to_kernel();

        if let Err(err) = self.apply(dev, screen, outputs) {
            self.mode = saved_mode;
            self.rotation = saved_rotation;
            self.x = saved_x;
            self.y = saved_y;
            return Err(err);
        }

        Ok(())
    }

    fn apply(
        &mut self,
        dev: &impl KernelDisplay,
        screen: &ScreenState,
        outputs: &[Output],
    ) -> Result<()> {
        let connectors: SmallVec<[u32; 4]> = outputs
            .iter()
            .filter(|output| output.crtc == Some(self.id))
            .map(|output| output.connector_id)
            .collect();

        self.prepare_rotation(dev, screen)?;

        // Gamma is pushed on every apply; a failure only costs color
        // correction, not the mode-set.
        if let Err(err) = dev.set_gamma(self.id, &self.gamma_red, &self.gamma_green, &self.gamma_blue)
        {
            warn!(?err, crtc = self.id, "Failed to apply gamma tables");
        }

        dev.set_crtc(
            self.id,
            screen.fb_id,
            self.x,
            self.y,
            &connectors,
            Some(&self.kmode),
        )
        .map_err(Error::ModeApply)
    }

    /// Makes sure a shadow buffer exists when the committed rotation
    /// requires one. Scan-out stays on the front framebuffer either
    /// way; the shadow is only a drawing target.
    fn prepare_rotation(&mut self, dev: &impl KernelDisplay, screen: &ScreenState) -> Result<()> {
        if !self.rotation.needs_shadow() || self.shadow.is_some() {
            return Ok(());
        }

        let mode = self.mode.as_ref().ok_or(Error::ShadowAllocation)?;
        let (mut width, mut height) = mode.size();
        if self.rotation.swaps_axes() {
            std::mem::swap(&mut width, &mut height);
        }
        self.allocate_shadow(dev, screen, width, height)
    }

    /// Allocates the rotate buffer and registers a framebuffer for it.
    pub fn allocate_shadow(
        &mut self,
        dev: &impl KernelDisplay,
        screen: &ScreenState,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let bo = create_bo(dev, width, height, screen.bits_per_pixel).map_err(|err| {
            warn!(?err, crtc = self.id, "Couldn't allocate shadow memory for rotated crtc");
            Error::ShadowAllocation
        })?;

        let fb_id = match dev.add_framebuffer(
            width,
            height,
            screen.depth,
            screen.bits_per_pixel,
            bo.pitch(),
            bo.handle(),
        ) {
            Ok(fb_id) => fb_id,
            Err(err) => {
                warn!(?err, crtc = self.id, "Failed to register shadow framebuffer");
                if let Err(err) = bo.destroy(dev) {
                    warn!(?err, "Failed to release shadow buffer");
                }
                return Err(Error::ShadowAllocation);
            }
        };

        let pitch = bo.pitch();
        self.shadow = Some(Shadow { bo, fb_id, pitch });
        Ok(())
    }

    /// Hands out a surface descriptor for the external rasterizer.
    ///
    /// Allocates backing memory first unless the caller supplied some;
    /// either way a shadow buffer must exist by the time the surface is
    /// created.
    pub fn create_shadow_surface(
        &mut self,
        dev: &impl KernelDisplay,
        screen: &ScreenState,
        width: u32,
        height: u32,
        have_backing: bool,
    ) -> Result<ShadowSurface> {
        if !have_backing {
            self.allocate_shadow(dev, screen, width, height)?;
        }

        let shadow = self.shadow.as_ref().ok_or(Error::ShadowAllocation)?;
        Ok(ShadowSurface {
            width,
            height,
            pitch: shadow.pitch,
            depth: screen.depth,
            bits_per_pixel: screen.bits_per_pixel,
        })
    }

    /// Releases a shadow surface; with `release_backing` the rotate
    /// buffer and its framebuffer registration go away too.
    pub fn destroy_shadow_surface(
        &mut self,
        dev: &impl KernelDisplay,
        surface: Option<ShadowSurface>,
        release_backing: bool,
    ) {
        drop(surface);

        if release_backing {
            if let Some(shadow) = self.shadow.take() {
                if let Err(err) = dev.remove_framebuffer(shadow.fb_id) {
                    warn!(?err, crtc = self.id, "Failed to remove shadow framebuffer");
                }
                if let Err(err) = shadow.bo.destroy(dev) {
                    warn!(?err, crtc = self.id, "Failed to release shadow buffer");
                }
            }
        }
    }

    pub fn has_shadow(&self) -> bool {
        self.shadow.is_some()
    }

    pub fn shadow_pitch(&self) -> Option<u32> {
        self.shadow.as_ref().map(|shadow| shadow.pitch)
    }

    pub fn attach_cursor(&mut self, bo: Bo) {
        self.cursor = Some(bo);
    }

    pub fn show_cursor(&self, dev: &impl KernelDisplay) {
        if let Some(cursor) = &self.cursor {
            if let Err(err) = dev.set_cursor(self.id, cursor.handle(), CURSOR_SIZE, CURSOR_SIZE) {
                warn!(?err, crtc = self.id, "Failed to show cursor");
            }
        }
    }

    pub fn hide_cursor(&self, dev: &impl KernelDisplay) {
        if let Err(err) = dev.set_cursor(self.id, 0, CURSOR_SIZE, CURSOR_SIZE) {
            warn!(?err, crtc = self.id, "Failed to hide cursor");
        }
    }

    pub fn set_cursor_position(&self, dev: &impl KernelDisplay, x: i32, y: i32) {
        if let Err(err) = dev.move_cursor(self.id, x, y) {
            warn!(?err, crtc = self.id, "Failed to move cursor");
        }
    }

    /// Legacy palette cursors are not supported by this hardware class.
    pub fn set_cursor_colors(&self, _bg: u32, _fg: u32) {}

    /// Cursor images are composited in software by the host; the cursor
    /// buffer stays unpopulated on purpose.
    pub fn load_cursor_image(&self, _image: &[u32]) {}

    /// Power management is not wired up for the virtual adapter.
    pub fn dpms(&self, _level: i32) {}

    pub fn set_gamma(&mut self, dev: &impl KernelDisplay, red: &[u16], green: &[u16], blue: &[u16]) {
        self.gamma_red = red.to_vec();
        self.gamma_green = green.to_vec();
        self.gamma_blue = blue.to_vec();
        if let Err(err) = dev.set_gamma(self.id, &self.gamma_red, &self.gamma_green, &self.gamma_blue)
        {
            warn!(?err, crtc = self.id, "Failed to apply gamma tables");
        }
    }

    /// Tears down per-CRTC resources. The shared front buffer is not
    /// owned here and stays alive.
    pub fn destroy(&mut self, dev: &impl KernelDisplay) {
        self.hide_cursor(dev);
        if let Some(cursor) = self.cursor.take() {
            if let Err(err) = cursor.destroy(dev) {
                warn!(?err, crtc = self.id, "Failed to release cursor buffer");
            }
        }
        self.destroy_shadow_surface(dev, None, true);
    }
}

#[cfg(test)]
mod test {
    use super::super::test_support::{test_mode, test_screen, FakeDevice};
    use super::super::Error;
    use super::*;

    fn test_output(connector_id: u32, crtc: Option<u32>) -> Output {
        Output {
            name: format!("LVDS-{}", connector_id),
            connector_id,
            encoder_id: 100 + connector_id,
            current_crtc: 0,
            possible_crtcs: 0x1,
            crtc,
            modes: vec![test_mode(1024, 768, true)],
            connection: super::super::output::ConnectionState::Connected,
            mm_width: 0,
            mm_height: 0,
            subpixel: super::super::output::Subpixel::Unknown,
        }
    }

    #[test]
    fn first_apply_registers_the_front_framebuffer_once() {
        let dev = FakeDevice::new();
        let mut screen = test_screen(&dev, 1024, 768);
        let mut crtc = Crtc::new(&dev, 1);
        let outputs = [test_output(10, Some(1))];
        let mode = test_mode(1024, 768, true);

        crtc.apply_mode(&dev, &mut screen, &outputs, &mode, Rotation::ROTATE_0, 0, 0)
            .unwrap();
        let fb_id = screen.fb_id;
        assert_ne!(fb_id, 0);

        crtc.apply_mode(&dev, &mut screen, &outputs, &mode, Rotation::ROTATE_0, 0, 0)
            .unwrap();
        assert_eq!(screen.fb_id, fb_id);
        assert_eq!(dev.counters().add_fb, 1);
        assert_eq!(dev.counters().set_crtc, 2);
    }

    #[test]
    fn apply_passes_the_assigned_connectors() {
        let dev = FakeDevice::new();
        let mut screen = test_screen(&dev, 1024, 768);
        let mut crtc = Crtc::new(&dev, 1);
        let outputs = [
            test_output(10, Some(1)),
            test_output(11, None),
            test_output(12, Some(1)),
        ];
        let mode = test_mode(1024, 768, true);

        crtc.apply_mode(&dev, &mut screen, &outputs, &mode, Rotation::ROTATE_0, 0, 0)
            .unwrap();

        assert_eq!(dev.last_set_crtc().unwrap().connectors, vec![10, 12]);
    }

    #[test]
    fn failed_apply_rolls_back_the_observable_state() {
        let dev = FakeDevice::new();
        let mut screen = test_screen(&dev, 1024, 768);
        let mut crtc = Crtc::new(&dev, 1);
        let outputs = [test_output(10, Some(1))];

        let first = test_mode(1024, 768, true);
        crtc.apply_mode(&dev, &mut screen, &outputs, &first, Rotation::ROTATE_0, 0, 0)
            .unwrap();

        let before = (crtc.mode.clone(), crtc.rotation, crtc.x, crtc.y);
        dev.fail_next_set_crtc();
        let second = test_mode(800, 600, false);
        let err = crtc
            .apply_mode(&dev, &mut screen, &outputs, &second, Rotation::ROTATE_180, 8, 8)
            .unwrap_err();

        assert!(matches!(err, Error::ModeApply(_)));
        assert_eq!((crtc.mode.clone(), crtc.rotation, crtc.x, crtc.y), before);
    }

    #[test]
    fn rotated_apply_allocates_a_shadow_buffer() {
        let dev = FakeDevice::new();
        let mut screen = test_screen(&dev, 1024, 768);
        let mut crtc = Crtc::new(&dev, 1);
        let outputs = [test_output(10, Some(1))];
        let mode = test_mode(1024, 768, true);

        crtc.apply_mode(&dev, &mut screen, &outputs, &mode, Rotation::ROTATE_90, 0, 0)
            .unwrap();

        assert!(crtc.has_shadow());
        // 90 degrees swaps the axes of the allocation.
        assert_eq!(dev.last_gem_create().unwrap().0, 768);
        // Scan-out still comes from the front framebuffer.
        assert_eq!(dev.last_set_crtc().unwrap().fb_id, screen.fb_id);
    }

    #[test]
    fn shadow_registration_failure_releases_the_fresh_buffer() {
        let dev = FakeDevice::new();
        let screen = test_screen(&dev, 1024, 768);
        let mut crtc = Crtc::new(&dev, 1);

        dev.fail_next_add_fb();
        let closes_before = dev.counters().gem_close;
        let err = crtc.allocate_shadow(&dev, &screen, 768, 1024).unwrap_err();

        assert!(matches!(err, Error::ShadowAllocation));
        assert!(!crtc.has_shadow());
        assert_eq!(dev.counters().gem_close, closes_before + 1);
    }

    #[test]
    fn shadow_surface_requires_backing_memory() {
        let dev = FakeDevice::new();
        let screen = test_screen(&dev, 1024, 768);
        let mut crtc = Crtc::new(&dev, 1);

        // Claiming existing backing without any shadow buffer fails.
        assert!(matches!(
            crtc.create_shadow_surface(&dev, &screen, 768, 1024, true),
            Err(Error::ShadowAllocation)
        ));

        let surface = crtc
            .create_shadow_surface(&dev, &screen, 768, 1024, false)
            .unwrap();
        assert_eq!(surface.width, 768);
        assert_eq!(surface.pitch, crtc.shadow_pitch().unwrap());

        crtc.destroy_shadow_surface(&dev, Some(surface), true);
        assert!(!crtc.has_shadow());
        assert_eq!(dev.counters().rm_fb, 1);
    }

    #[test]
    fn destroy_hides_the_cursor_and_releases_buffers() {
        let dev = FakeDevice::new();
        let screen = test_screen(&dev, 1024, 768);
        let mut crtc = Crtc::new(&dev, 1);
        crtc.attach_cursor(create_bo(&dev, CURSOR_SIZE, CURSOR_SIZE, 32).unwrap());
        crtc.allocate_shadow(&dev, &screen, 768, 1024).unwrap();

        crtc.destroy(&dev);

        assert_eq!(dev.last_cursor().unwrap().handle, 0);
        // Cursor and shadow buffers are both gone.
        assert_eq!(dev.counters().gem_close, 2);
        assert_eq!(dev.counters().rm_fb, 1);

        // The front buffer is untouched.
        drop(screen);
    }
}
