use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::dma::{DmaImportTable, DmaImporter};
use super::{DmaAllocator, DmaBuffer, GraphicsEngine, GraphicsFactory};
use crate::core::{BufferFlags, MppError, Rect, Result, Rotation, Size, VideoBuf, VideoFrame};

/// Ids of rotated frames live above every decoder-assigned id.
const ROTATED_ID_BASE: u32 = 0x4000_0000;

struct RotatedFrame {
    frame: VideoFrame,
    buffers: Vec<DmaBuffer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    buf: VideoBuf,
    rotation: Rotation,
}

/// Rotates decoded frames into a ping-pong pair of engine-owned buffers.
pub struct RotationEngine {
    engine: Box<dyn GraphicsEngine>,
    allocator: Box<dyn DmaAllocator>,
    imports: DmaImportTable,
    frames: Vec<RotatedFrame>,
    geometry: Option<Geometry>,
    next: usize,
    generation: u32,
}

impl RotationEngine {
    pub fn open(factory: &dyn GraphicsFactory) -> Result<Self> {
        let engine = factory.open_engine()?;
        let allocator = factory.open_allocator()?;
        info!("rotation engine opened");
        Ok(Self {
            engine,
            allocator,
            imports: DmaImportTable::new(),
            frames: Vec::with_capacity(2),
            geometry: None,
            next: 0,
            generation: 0,
        })
    }

    /// Blits `src` rotated by `rotation` into the buffer not used last call
    /// and returns a frame describing it.
    pub fn rotate(&mut self, src: &VideoFrame, rotation: Rotation) -> Result<VideoFrame> {
        let geometry = Geometry {
            buf: VideoBuf {
                fd: [-1; 3],
                crop: None,
                ..src.buf
            },
            rotation,
        };
        if self.geometry != Some(geometry) {
            self.reallocate(&src.buf, rotation)?;
            self.geometry = Some(geometry);
        }

        let index = self.next;
        self.next ^= 1;
        let dst = &self.frames[index].frame;

        self.imports.ensure(src.id, &src.buf, self.engine.as_mut())?;
        self.imports.ensure(dst.id, &dst.buf, self.engine.as_mut())?;
        self.engine.bitblt(&src.buf, &dst.buf, rotation)?;
        self.engine.emit()?;
        self.engine.sync()?;

        let mut out = *dst;
        out.pts = src.pts;
        out.flags = src.flags;
        out.buf.crop = src.buf.crop.map(|crop| rotate_crop(crop, src.buf.size, rotation));
        Ok(out)
    }

    pub fn import_count(&self) -> usize {
        self.imports.len()
    }

    fn reallocate(&mut self, src: &VideoBuf, rotation: Rotation) -> Result<()> {
        self.release_frames();
        let (layout, sizes) = rotated_layout(src, rotation);
        self.generation = self.generation.wrapping_add(1);
        for slot in 0..2u32 {
            let mut buf = layout;
            let mut buffers = Vec::with_capacity(3);
            for (plane, &len) in sizes.iter().enumerate().take(buf.format.plane_count()) {
                match self.allocator.alloc(len) {
                    Ok(dma) => {
                        buf.fd[plane] = dma.fd;
                        buffers.push(dma);
                    }
                    Err(e) => {
                        for dma in buffers {
                            self.allocator.free(dma);
                        }
                        self.release_frames();
                        return Err(e);
                    }
                }
            }
            let id = ROTATED_ID_BASE + self.generation.wrapping_mul(2) + slot;
            self.frames.push(RotatedFrame {
                frame: VideoFrame {
                    id,
                    pts: 0,
                    flags: BufferFlags::NONE,
                    buf,
                },
                buffers,
            });
        }
        self.next = 0;
        info!(
            "rotation buffers {}x{} {:?} for {} degrees",
            layout.size.width,
            layout.size.height,
            layout.format,
            rotation.degrees()
        );
        Ok(())
    }

    fn release_frames(&mut self) {
        // Engine imports reference the freed fds; drop them first.
        self.imports.clear(self.engine.as_mut());
        for rotated in self.frames.drain(..) {
            for dma in rotated.buffers {
                self.allocator.free(dma);
            }
        }
        self.geometry = None;
    }
}

impl Drop for RotationEngine {
    fn drop(&mut self) {
        debug!("rotation engine release");
        self.release_frames();
    }
}

/// Geometry of the rotated copy of `src`: axes swapped for 90/270, the
/// format's allocation strides, and the byte size of each plane.
pub fn rotated_layout(src: &VideoBuf, rotation: Rotation) -> (VideoBuf, [usize; 3]) {
    let size = if rotation.swaps_axes() {
        Size::new(src.size.height, src.size.width)
    } else {
        src.size
    };
    let (stride, sizes) = src.format.plane_layout(size.width, size.height);
    let mut buf = VideoBuf::new(src.format, size);
    buf.stride = stride;
    (buf, sizes)
}

/// Maps a crop rectangle of a `size` picture into the rotated picture.
pub fn rotate_crop(crop: Rect, size: Size, rotation: Rotation) -> Rect {
    let (w, h) = (size.width as i32, size.height as i32);
    let (cw, ch) = (crop.width as i32, crop.height as i32);
    match rotation {
        Rotation::Deg0 => crop,
        Rotation::Deg90 => Rect::new(h - ch, 0, crop.height, crop.width),
        Rotation::Deg180 => Rect::new(w - cw, h - ch, crop.width, crop.height),
        Rotation::Deg270 => Rect::new(0, w - cw, crop.height, crop.width),
    }
}

#[derive(Debug, Default, Clone)]
pub struct GraphicsStats {
    pub adds: Vec<i32>,
    pub removes: Vec<i32>,
    pub imported: HashSet<i32>,
    pub blits: Vec<(VideoBuf, VideoBuf, Rotation)>,
    pub emits: u64,
    pub syncs: u64,
    pub allocated: HashMap<i32, usize>,
    pub freed: Vec<i32>,
}

/// In-process graphics engine and DMA heap. Blits record their arguments
/// and fill the destination with mid-grey; no pixel math is done.
#[derive(Clone, Default)]
pub struct MemoryGraphics {
    stats: Arc<Mutex<GraphicsStats>>,
    heap: Arc<Mutex<HashMap<i32, Vec<u8>>>>,
    next_fd: Arc<Mutex<i32>>,
}

impl MemoryGraphics {
    pub fn new() -> Self {
        Self {
            next_fd: Arc::new(Mutex::new(1000)),
            ..Self::default()
        }
    }

    pub fn stats(&self) -> Arc<Mutex<GraphicsStats>> {
        Arc::clone(&self.stats)
    }
}

impl DmaImporter for MemoryGraphics {
    fn add_dmabuf(&mut self, fd: i32) -> Result<()> {
        let mut stats = self.stats.lock();
        if !stats.imported.insert(fd) {
            return Err(MppError::Engine(format!("dmabuf {} already imported", fd)));
        }
        stats.adds.push(fd);
        Ok(())
    }

    fn rm_dmabuf(&mut self, fd: i32) -> Result<()> {
        let mut stats = self.stats.lock();
        if !stats.imported.remove(&fd) {
            return Err(MppError::Engine(format!("dmabuf {} not imported", fd)));
        }
        stats.removes.push(fd);
        Ok(())
    }
}

impl GraphicsEngine for MemoryGraphics {
    fn bitblt(&mut self, src: &VideoBuf, dst: &VideoBuf, rotation: Rotation) -> Result<()> {
        {
            let stats = self.stats.lock();
            for fd in src.plane_fds().iter().chain(dst.plane_fds()) {
                if !stats.imported.contains(fd) {
                    return Err(MppError::Engine(format!("blit with unimported fd {}", fd)));
                }
            }
        }
        let mut heap = self.heap.lock();
        for fd in dst.plane_fds() {
            if let Some(bytes) = heap.get_mut(fd) {
                bytes.fill(0x80);
            }
        }
        self.stats.lock().blits.push((*src, *dst, rotation));
        Ok(())
    }

    fn emit(&mut self) -> Result<()> {
        self.stats.lock().emits += 1;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.stats.lock().syncs += 1;
        Ok(())
    }
}

impl DmaAllocator for MemoryGraphics {
    fn alloc(&mut self, len: usize) -> Result<DmaBuffer> {
        let fd = {
            let mut next = self.next_fd.lock();
            *next += 1;
            *next
        };
        self.heap.lock().insert(fd, vec![0; len]);
        self.stats.lock().allocated.insert(fd, len);
        Ok(DmaBuffer { fd, len })
    }

    fn free(&mut self, buf: DmaBuffer) {
        if self.heap.lock().remove(&buf.fd).is_none() {
            warn!("free of unknown dma fd {}", buf.fd);
        }
        let mut stats = self.stats.lock();
        stats.allocated.remove(&buf.fd);
        stats.freed.push(buf.fd);
    }

    fn read(&self, buf: &DmaBuffer) -> Result<Vec<u8>> {
        self.heap
            .lock()
            .get(&buf.fd)
            .cloned()
            .ok_or_else(|| MppError::Engine(format!("read of unknown dma fd {}", buf.fd)))
    }
}

impl GraphicsFactory for MemoryGraphics {
    fn open_engine(&self) -> Result<Box<dyn GraphicsEngine>> {
        Ok(Box::new(self.clone()))
    }

    fn open_allocator(&self) -> Result<Box<dyn DmaAllocator>> {
        Ok(Box::new(self.clone()))
    }
}
