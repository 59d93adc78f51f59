use image::codecs::jpeg::JpegEncoder;
use image::ColorType;
use log::info;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use super::dma::DmaImportTable;
use super::{GraphicsEngine, GraphicsFactory};
use crate::core::{MppError, PixelFormat, Result, Rotation, Size, VideoBuf, VideoFrame};

/// Default JPEG quality when the request leaves it at 0.
const DEFAULT_QUALITY: u8 = 90;

/// Scales `frame` to `width` x `height` RGB888 through the graphics engine
/// and writes it to `path` as JPEG.
pub fn capture_frame(
    graphics: &dyn GraphicsFactory,
    frame: &VideoFrame,
    width: u32,
    height: u32,
    quality: u8,
    path: &Path,
) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(MppError::Render(format!(
            "capture size {}x{} is empty",
            width, height
        )));
    }
    let mut engine = graphics.open_engine()?;
    let mut allocator = graphics.open_allocator()?;

    let (stride, sizes) = PixelFormat::Rgb888.plane_layout(width, height);
    let dma = allocator.alloc(sizes[0])?;
    let mut dst = VideoBuf::new(PixelFormat::Rgb888, Size::new(width, height));
    dst.stride = stride;
    dst.fd[0] = dma.fd;

    let mut imports = DmaImportTable::new();
    let scaled = scale_into(engine.as_mut(), &mut imports, frame, &dst)
        .and_then(|()| allocator.read(&dma));
    imports.clear(engine.as_mut());
    allocator.free(dma);
    let pixels = scaled?;

    let quality = if quality == 0 { DEFAULT_QUALITY } else { quality.min(100) };
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, quality).encode(
        &pixels,
        width,
        height,
        ColorType::Rgb8,
    )?;
    info!(
        "captured frame pts {} to {} ({}x{}, q{})",
        frame.pts,
        path.display(),
        width,
        height,
        quality
    );
    Ok(())
}

fn scale_into(
    engine: &mut dyn GraphicsEngine,
    imports: &mut DmaImportTable,
    frame: &VideoFrame,
    dst: &VideoBuf,
) -> Result<()> {
    imports.ensure(frame.id, &frame.buf, &mut *engine)?;
    imports.ensure(0, dst, &mut *engine)?;
    engine.bitblt(&frame.buf, dst, Rotation::Deg0)?;
    engine.emit()?;
    engine.sync()
}
