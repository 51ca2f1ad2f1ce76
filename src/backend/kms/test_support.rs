// SPDX-License-Identifier: GPL-3.0-only

//! A scripted in-memory card for unit tests.

use std::{cell::RefCell, collections::HashMap, io, ptr::NonNull, rc::Rc};

use super::{
    bo::create_bo,
    device::{
        CardResources, ConnectorInfo, CrtcInfo, EncoderInfo, GemBuffer, KernelDisplay,
    },
    ioctl::ModeInfo,
    modes::{ModeFlags, ModeTiming, ModeType},
    ScreenState,
};

pub fn test_mode(width: u32, height: u32, preferred: bool) -> ModeTiming {
    let w = width as u16;
    let h = height as u16;
    ModeTiming {
        name: format!("{}x{}", width, height),
        clock: 65_000,
        hdisplay: w,
        hsync_start: w + 24,
        hsync_end: w + 160,
        htotal: w + 320,
        vdisplay: h,
        vsync_start: h + 3,
        vsync_end: h + 9,
        vtotal: h + 38,
        flags: ModeFlags::NHSYNC | ModeFlags::NVSYNC,
        typ: if preferred {
            ModeType::DRIVER | ModeType::PREFERRED
        } else {
            ModeType::DRIVER
        },
        ..Default::default()
    }
}

pub fn test_screen(dev: &FakeDevice, width: u32, height: u32) -> ScreenState {
    let front_bo = create_bo(dev, width, height, 32).unwrap();
    ScreenState {
        display_width: front_bo.pitch() / 4,
        front_bo,
        fb_id: 0,
        width,
        height,
        depth: 24,
        bits_per_pixel: 32,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    pub gem_create: u32,
    pub gem_map: u32,
    pub mmap: u32,
    pub munmap: u32,
    pub gem_close: u32,
    pub set_crtc: u32,
    pub add_fb: u32,
    pub rm_fb: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Call {
    GemCreate(u32),
    GemClose(u32),
    AddFb(u32),
    RmFb(u32),
    SetCrtc(u32),
}

#[derive(Clone, Debug)]
pub struct SetCrtcCall {
    pub crtc_id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub connectors: Vec<u32>,
    pub mode: Option<ModeInfo>,
}

#[derive(Clone, Copy, Debug)]
pub struct CursorCall {
    pub crtc_id: u32,
    pub handle: u32,
}

struct FakeConnector {
    connector_type_id: u32,
    connection: u32,
    encoders: Vec<u32>,
    modes: Vec<ModeInfo>,
}

struct FakeEncoder {
    crtc_id: u32,
    possible_crtcs: u32,
}

#[derive(Default)]
struct FailNext {
    create: bool,
    map: bool,
    close: bool,
    set_crtc: bool,
    add_fb: bool,
}

#[derive(Default)]
struct Inner {
    counters: Counters,
    fail: FailNext,

    next_handle: u32,
    next_fb: u32,
    buffers: HashMap<u32, u64>,
    fbs: HashMap<u32, u32>,
    mappings: HashMap<usize, Box<[u8]>>,

    crtcs: Vec<u32>,
    connector_order: Vec<u32>,
    connectors: HashMap<u32, FakeConnector>,
    encoders: HashMap<u32, FakeEncoder>,

    call_log: Vec<Call>,
    create_log: Vec<(u32, u32, u32)>,
    set_crtc_log: Vec<SetCrtcCall>,
    cursor_log: Vec<CursorCall>,
}

#[derive(Clone)]
pub struct FakeDevice {
    inner: Rc<RefCell<Inner>>,
}

impl FakeDevice {
    pub fn new() -> FakeDevice {
        let inner = Inner {
            next_handle: 1,
            next_fb: 1,
            crtcs: vec![1, 2],
            ..Default::default()
        };
        FakeDevice {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    pub fn counters(&self) -> Counters {
        self.inner.borrow().counters
    }

    pub fn fail_next_create(&self) {
        self.inner.borrow_mut().fail.create = true;
    }

    pub fn fail_next_map(&self) {
        self.inner.borrow_mut().fail.map = true;
    }

    pub fn fail_next_close(&self) {
        self.inner.borrow_mut().fail.close = true;
    }

    pub fn fail_next_set_crtc(&self) {
        self.inner.borrow_mut().fail.set_crtc = true;
    }

    pub fn fail_next_add_fb(&self) {
        self.inner.borrow_mut().fail.add_fb = true;
    }

    /// Registers a connected connector with one encoder that can drive
    /// any CRTC.
    pub fn add_connector(&self, id: u32, type_id: u32, modes: &[(u32, u32, bool)]) {
        let mut inner = self.inner.borrow_mut();
        let encoder_id = 100 + id;
        inner.encoders.insert(
            encoder_id,
            FakeEncoder {
                crtc_id: 0,
                possible_crtcs: !0,
            },
        );
        inner.connector_order.push(id);
        inner.connectors.insert(
            id,
            FakeConnector {
                connector_type_id: type_id,
                connection: 1,
                encoders: vec![encoder_id],
                modes: modes
                    .iter()
                    .map(|(w, h, p)| test_mode(*w, *h, *p).to_kernel())
                    .collect(),
            },
        );
    }

    pub fn set_connector_encoders(&self, id: u32, encoders: &[u32]) {
        let mut inner = self.inner.borrow_mut();
        for encoder_id in encoders {
            inner.encoders.entry(*encoder_id).or_insert(FakeEncoder {
                crtc_id: 0,
                possible_crtcs: !0,
            });
        }
        if let Some(conn) = inner.connectors.get_mut(&id) {
            conn.encoders = encoders.to_vec();
        }
    }

    pub fn set_connector_modes(&self, id: u32, modes: &[(u32, u32, bool)]) {
        if let Some(conn) = self.inner.borrow_mut().connectors.get_mut(&id) {
            conn.modes = modes
                .iter()
                .map(|(w, h, p)| test_mode(*w, *h, *p).to_kernel())
                .collect();
        }
    }

    pub fn set_connector_connection(&self, id: u32, connection: u32) {
        if let Some(conn) = self.inner.borrow_mut().connectors.get_mut(&id) {
            conn.connection = connection;
        }
    }

    /// Marks the connector's encoder as currently routed to `crtc_id`.
    pub fn set_encoder_crtc(&self, connector_id: u32, crtc_id: u32) {
        let mut inner = self.inner.borrow_mut();
        let Some(encoder_id) = inner
            .connectors
            .get(&connector_id)
            .and_then(|conn| conn.encoders.first().copied())
        else {
            return;
        };
        if let Some(encoder) = inner.encoders.get_mut(&encoder_id) {
            encoder.crtc_id = crtc_id;
        }
    }

    pub fn call_log(&self) -> Vec<Call> {
        self.inner.borrow().call_log.clone()
    }

    pub fn clear_call_log(&self) {
        self.inner.borrow_mut().call_log.clear();
    }

    pub fn last_gem_create(&self) -> Option<(u32, u32, u32)> {
        self.inner.borrow().create_log.last().copied()
    }

    pub fn set_crtc_calls(&self) -> Vec<SetCrtcCall> {
        self.inner.borrow().set_crtc_log.clone()
    }

    pub fn last_set_crtc(&self) -> Option<SetCrtcCall> {
        self.inner.borrow().set_crtc_log.last().cloned()
    }

    pub fn last_cursor(&self) -> Option<CursorCall> {
        self.inner.borrow().cursor_log.last().copied()
    }
}

fn fail(kind: io::ErrorKind) -> io::Error {
    io::Error::new(kind, "scripted failure")
}

impl KernelDisplay for FakeDevice {
    fn gem_create(&self, width: u32, height: u32, bpp: u32) -> io::Result<GemBuffer> {
        let mut inner = self.inner.borrow_mut();
        if std::mem::take(&mut inner.fail.create) {
            return Err(fail(io::ErrorKind::OutOfMemory));
        }
        inner.counters.gem_create += 1;
        inner.create_log.push((width, height, bpp));

        let pitch = (width * ((bpp + 7) / 8) + 63) & !63;
        let size = pitch as u64 * height as u64;
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.buffers.insert(handle, size);
        inner.call_log.push(Call::GemCreate(handle));

        Ok(GemBuffer { handle, pitch, size })
    }

    fn gem_map_offset(&self, handle: u32) -> io::Result<u64> {
        let mut inner = self.inner.borrow_mut();
        if std::mem::take(&mut inner.fail.map) {
            return Err(fail(io::ErrorKind::Other));
        }
        if !inner.buffers.contains_key(&handle) {
            return Err(fail(io::ErrorKind::InvalidInput));
        }
        inner.counters.gem_map += 1;
        Ok(handle as u64 * 0x10000)
    }

    fn gem_close(&self, handle: u32) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if std::mem::take(&mut inner.fail.close) {
            return Err(fail(io::ErrorKind::Other));
        }
        if inner.buffers.remove(&handle).is_none() {
            return Err(fail(io::ErrorKind::InvalidInput));
        }
        inner.counters.gem_close += 1;
        inner.call_log.push(Call::GemClose(handle));
        Ok(())
    }

    fn map(&self, _offset: u64, len: usize) -> io::Result<NonNull<u8>> {
        let mut inner = self.inner.borrow_mut();
        inner.counters.mmap += 1;

        let mut backing = vec![0u8; len.max(1)].into_boxed_slice();
        let ptr = NonNull::new(backing.as_mut_ptr()).ok_or_else(|| fail(io::ErrorKind::Other))?;
        inner.mappings.insert(ptr.as_ptr() as usize, backing);
        Ok(ptr)
    }

    fn unmap(&self, ptr: NonNull<u8>, _len: usize) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.mappings.remove(&(ptr.as_ptr() as usize)).is_none() {
            return Err(fail(io::ErrorKind::InvalidInput));
        }
        inner.counters.munmap += 1;
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
        let mut inner = self.inner.borrow_mut();
        if std::mem::take(&mut inner.fail.set_crtc) {
            return Err(fail(io::ErrorKind::InvalidInput));
        }
        inner.counters.set_crtc += 1;
        inner.call_log.push(Call::SetCrtc(crtc_id));
        inner.set_crtc_log.push(SetCrtcCall {
            crtc_id,
            fb_id,
            x,
            y,
            connectors: connectors.to_vec(),
            mode: mode.copied(),
        });
        Ok(())
    }

    fn add_framebuffer(
        &self,
        _width: u32,
        _height: u32,
        _depth: u32,
        _bpp: u32,
        _pitch: u32,
        handle: u32,
    ) -> io::Result<u32> {
        let mut inner = self.inner.borrow_mut();
        if std::mem::take(&mut inner.fail.add_fb) {
            return Err(fail(io::ErrorKind::InvalidInput));
        }
        inner.counters.add_fb += 1;
        let fb_id = inner.next_fb;
        inner.next_fb += 1;
        inner.fbs.insert(fb_id, handle);
        inner.call_log.push(Call::AddFb(fb_id));
        Ok(fb_id)
    }

    fn remove_framebuffer(&self, fb_id: u32) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.fbs.remove(&fb_id).is_none() {
            return Err(fail(io::ErrorKind::InvalidInput));
        }
        inner.counters.rm_fb += 1;
        inner.call_log.push(Call::RmFb(fb_id));
        Ok(())
    }

    fn set_gamma(&self, _crtc_id: u32, _red: &[u16], _green: &[u16], _blue: &[u16]) -> io::Result<()> {
        Ok(())
    }

    fn set_cursor(&self, crtc_id: u32, handle: u32, _width: u32, _height: u32) -> io::Result<()> {
        self.inner
            .borrow_mut()
            .cursor_log
            .push(CursorCall { crtc_id, handle });
        Ok(())
    }

    fn move_cursor(&self, _crtc_id: u32, _x: i32, _y: i32) -> io::Result<()> {
        Ok(())
    }

    fn resources(&self) -> io::Result<CardResources> {
        let inner = self.inner.borrow();
        Ok(CardResources {
            crtcs: inner.crtcs.clone(),
            connectors: inner.connector_order.clone(),
            encoders: inner.encoders.keys().copied().collect(),
            min_width: 0,
            max_width: 8192,
            min_height: 0,
            max_height: 8192,
        })
    }

    fn crtc_state(&self, _crtc_id: u32) -> io::Result<CrtcInfo> {
        Ok(CrtcInfo { gamma_size: 256 })
    }

    fn connector(&self, connector_id: u32) -> io::Result<ConnectorInfo> {
        let inner = self.inner.borrow();
        let conn = inner
            .connectors
            .get(&connector_id)
            .ok_or_else(|| fail(io::ErrorKind::NotFound))?;
        Ok(ConnectorInfo {
            connector_id,
            connector_type: 7,
            connector_type_id: conn.connector_type_id,
            connection: conn.connection,
            mm_width: 0,
            mm_height: 0,
            subpixel: 0,
            encoder_id: conn.encoders.first().copied().unwrap_or(0),
            encoders: conn.encoders.clone(),
            modes: conn.modes.clone(),
        })
    }

    fn encoder(&self, encoder_id: u32) -> io::Result<EncoderInfo> {
        let inner = self.inner.borrow();
        let encoder = inner
            .encoders
            .get(&encoder_id)
            .ok_or_else(|| fail(io::ErrorKind::NotFound))?;
        Ok(EncoderInfo {
            encoder_id,
            encoder_type: 3,
            crtc_id: encoder.crtc_id,
            possible_crtcs: encoder.possible_crtcs,
            possible_clones: 0,
        })
    }
}
