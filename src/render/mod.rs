// Display and graphics-engine contracts used by the video renderer.

pub mod capture;
pub mod dma;
pub mod fb;
pub mod rotation;

use crate::core::{Rect, Result, Rotation, Size, VideoBuf, VideoFrame};

pub use dma::{BufferKey, DmaImportTable, DmaImporter};
pub use fb::{FbDevice, FbStats, FbVideoRender, LayerConfig, MemoryDisplayFactory, MemoryFbDevice};
pub use rotation::{MemoryGraphics, RotationEngine};

/// A display backend. Destroy is `Drop`.
pub trait VideoRender: Send {
    fn init(&mut self, layer_id: u32, dev_id: u32) -> Result<()>;

    /// Shows `frame`; returns once the display has latched it.
    fn rend(&mut self, frame: &VideoFrame) -> Result<()>;

    fn screen_size(&self) -> Result<Size>;

    fn set_dis_rect(&mut self, rect: Rect) -> Result<()>;

    fn dis_rect(&self) -> Result<Rect>;

    fn set_on_off(&mut self, enable: bool) -> Result<()>;

    fn on_off(&self) -> bool;
}

/// Creates display backends on demand (render-init or first frame).
pub trait DisplayFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn VideoRender>>;
}

/// 2D engine used for rotation and capture scaling.
pub trait GraphicsEngine: DmaImporter + Send {
    /// Queues a scaled/rotated copy of `src` into `dst`.
    fn bitblt(&mut self, src: &VideoBuf, dst: &VideoBuf, rotation: Rotation) -> Result<()>;

    fn emit(&mut self) -> Result<()>;

    /// Waits for queued operations.
    fn sync(&mut self) -> Result<()>;
}

/// A DMA heap allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBuffer {
    pub fd: i32,
    pub len: usize,
}

pub trait DmaAllocator: Send {
    fn alloc(&mut self, len: usize) -> Result<DmaBuffer>;

    fn free(&mut self, buf: DmaBuffer);

    /// Copies the buffer contents out (mmap + read on real hardware).
    fn read(&self, buf: &DmaBuffer) -> Result<Vec<u8>>;
}

/// Opens engine and allocator handles.
pub trait GraphicsFactory: Send + Sync {
    fn open_engine(&self) -> Result<Box<dyn GraphicsEngine>>;

    fn open_allocator(&self) -> Result<Box<dyn DmaAllocator>>;
}
