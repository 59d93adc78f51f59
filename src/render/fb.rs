use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use super::dma::{DmaImportTable, DmaImporter};
use super::{DisplayFactory, VideoRender};
use crate::core::{MppError, Rect, Result, Size, VideoBuf, VideoFrame};

/// Layer configuration pushed with each update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerConfig {
    pub layer_id: u32,
    pub enable: bool,
    pub buf: VideoBuf,
    pub dis_rect: Rect,
}

/// Framebuffer-style display device (ioctl-shaped operations).
pub trait FbDevice: DmaImporter + Send {
    fn update_layer(&mut self, layer: &LayerConfig) -> Result<()>;

    fn wait_vsync(&mut self) -> Result<()>;

    fn screen_size(&self) -> Result<Size>;
}

/// `VideoRender` over a framebuffer device with DMA import tracking.
pub struct FbVideoRender<D: FbDevice> {
    device: D,
    imports: DmaImportTable,
    layer_id: u32,
    dev_id: u32,
    dis_rect: Rect,
    enabled: bool,
    last_buf: Option<VideoBuf>,
    initialized: bool,
}

impl<D: FbDevice> FbVideoRender<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            imports: DmaImportTable::new(),
            layer_id: 0,
            dev_id: 0,
            dis_rect: Rect::default(),
            enabled: false,
            last_buf: None,
            initialized: false,
        }
    }

    pub fn imports(&self) -> &DmaImportTable {
        &self.imports
    }

    fn layer(&self, buf: VideoBuf, enable: bool) -> LayerConfig {
        LayerConfig {
            layer_id: self.layer_id,
            enable,
            buf,
            dis_rect: self.dis_rect,
        }
    }
}

impl<D: FbDevice> VideoRender for FbVideoRender<D> {
    fn init(&mut self, layer_id: u32, dev_id: u32) -> Result<()> {
        let screen = self.device.screen_size()?;
        self.layer_id = layer_id;
        self.dev_id = dev_id;
        if self.dis_rect.width == 0 || self.dis_rect.height == 0 {
            self.dis_rect = Rect::new(0, 0, screen.width, screen.height);
        }
        self.initialized = true;
        info!(
            "fb render init: layer {}, dev {}, screen {}x{}",
            layer_id, dev_id, screen.width, screen.height
        );
        Ok(())
    }

    fn rend(&mut self, frame: &VideoFrame) -> Result<()> {
        if !self.initialized {
            return Err(MppError::Render("fb render not initialised".into()));
        }
        self.imports.ensure(frame.id, &frame.buf, &mut self.device)?;
        let layer = self.layer(frame.buf, true);
        self.device.update_layer(&layer)?;
        self.device.wait_vsync()?;
        self.enabled = true;
        self.last_buf = Some(frame.buf);
        Ok(())
    }

    fn screen_size(&self) -> Result<Size> {
        self.device.screen_size()
    }

    fn set_dis_rect(&mut self, rect: Rect) -> Result<()> {
        if rect.width == 0 || rect.height == 0 {
            return Err(MppError::Render(format!("empty display rect {:?}", rect)));
        }
        debug!("fb render dis rect {:?}", rect);
        self.dis_rect = rect;
        Ok(())
    }

    fn dis_rect(&self) -> Result<Rect> {
        Ok(self.dis_rect)
    }

    fn set_on_off(&mut self, enable: bool) -> Result<()> {
        if let Some(buf) = self.last_buf {
            let layer = self.layer(buf, enable);
            self.device.update_layer(&layer)?;
        }
        self.enabled = enable;
        Ok(())
    }

    fn on_off(&self) -> bool {
        self.enabled
    }
}

impl<D: FbDevice> Drop for FbVideoRender<D> {
    fn drop(&mut self) {
        debug!("fb render release {} imports", self.imports.len());
        self.imports.clear(&mut self.device);
    }
}

/// Calls observed by a [`MemoryFbDevice`].
#[derive(Debug, Default, Clone)]
pub struct FbStats {
    pub adds: Vec<i32>,
    pub removes: Vec<i32>,
    pub imported: HashSet<i32>,
    pub layer_updates: u64,
    pub vsyncs: u64,
    pub last_layer: Option<LayerConfig>,
}

/// In-process framebuffer that records every call. Importing an fd twice
/// or removing an unknown fd fails, as a real driver would.
pub struct MemoryFbDevice {
    screen: Size,
    stats: Arc<Mutex<FbStats>>,
}

impl MemoryFbDevice {
    pub fn new(screen: Size) -> Self {
        Self::with_stats(screen, Arc::new(Mutex::new(FbStats::default())))
    }

    pub fn with_stats(screen: Size, stats: Arc<Mutex<FbStats>>) -> Self {
        Self { screen, stats }
    }

    pub fn stats(&self) -> Arc<Mutex<FbStats>> {
        Arc::clone(&self.stats)
    }
}

impl DmaImporter for MemoryFbDevice {
    fn add_dmabuf(&mut self, fd: i32) -> Result<()> {
        let mut stats = self.stats.lock();
        if !stats.imported.insert(fd) {
            return Err(MppError::Render(format!("dmabuf {} already imported", fd)));
        }
        stats.adds.push(fd);
        Ok(())
    }

    fn rm_dmabuf(&mut self, fd: i32) -> Result<()> {
        let mut stats = self.stats.lock();
        if !stats.imported.remove(&fd) {
            return Err(MppError::Render(format!("dmabuf {} not imported", fd)));
        }
        stats.removes.push(fd);
        Ok(())
    }
}

impl FbDevice for MemoryFbDevice {
    fn update_layer(&mut self, layer: &LayerConfig) -> Result<()> {
        let mut stats = self.stats.lock();
        stats.layer_updates += 1;
        stats.last_layer = Some(*layer);
        Ok(())
    }

    fn wait_vsync(&mut self) -> Result<()> {
        self.stats.lock().vsyncs += 1;
        Ok(())
    }

    fn screen_size(&self) -> Result<Size> {
        Ok(self.screen)
    }
}

/// Builds `FbVideoRender<MemoryFbDevice>` displays sharing one stats sink.
#[derive(Clone)]
pub struct MemoryDisplayFactory {
    screen: Size,
    stats: Arc<Mutex<FbStats>>,
}

impl MemoryDisplayFactory {
    pub fn new(screen: Size) -> Self {
        Self {
            screen,
            stats: Arc::new(Mutex::new(FbStats::default())),
        }
    }

    pub fn stats(&self) -> Arc<Mutex<FbStats>> {
        Arc::clone(&self.stats)
    }
}

impl DisplayFactory for MemoryDisplayFactory {
    fn create(&self) -> Result<Box<dyn VideoRender>> {
        let device = MemoryFbDevice::with_stats(self.screen, Arc::clone(&self.stats));
        Ok(Box::new(FbVideoRender::new(device)))
    }
}
