use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;

/// Sentinel for "timestamp unknown".
pub const PTS_NONE: i64 = i64::MIN;

/// Media source parsed from a content URI.
#[derive(Debug, Clone)]
pub enum MediaSource {
    /// Local file path
    LocalFile(PathBuf),

    /// Network stream URL
    NetworkStream {
        url: String,
        protocol: StreamProtocol,
    },
}

impl MediaSource {
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("rtsp://") {
            MediaSource::NetworkStream {
                url: url.to_string(),
                protocol: StreamProtocol::Rtsp,
            }
        } else if url.starts_with("rtmp://") {
            MediaSource::NetworkStream {
                url: url.to_string(),
                protocol: StreamProtocol::Rtmp,
            }
        } else if url.starts_with("http://") || url.starts_with("https://") {
            MediaSource::NetworkStream {
                url: url.to_string(),
                protocol: StreamProtocol::Http,
            }
        } else {
            MediaSource::LocalFile(PathBuf::from(url.strip_prefix("file://").unwrap_or(url)))
        }
    }

    pub fn is_network_stream(&self) -> bool {
        matches!(self, MediaSource::NetworkStream { .. })
    }

    /// Live RTSP sources carry codec config in-band, so no EXTRA_DATA tagging.
    pub fn is_rtsp(&self) -> bool {
        matches!(
            self,
            MediaSource::NetworkStream {
                protocol: StreamProtocol::Rtsp,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProtocol {
    Rtsp,
    Rtmp,
    Http,
}

impl StreamProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamProtocol::Rtsp => "RTSP",
            StreamProtocol::Rtmp => "RTMP",
            StreamProtocol::Http => "HTTP",
        }
    }
}

/// Flag bits carried by packets and frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: BufferFlags = BufferFlags(0);
    pub const EOS: BufferFlags = BufferFlags(0x01);
    pub const EXTRA_DATA: BufferFlags = BufferFlags(0x02);
    pub const KEY_FRAME: BufferFlags = BufferFlags(0x04);

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        BufferFlags(bits)
    }

    pub const fn contains(&self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: BufferFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: BufferFlags) {
        self.0 &= !other.0;
    }

    pub const fn is_eos(&self) -> bool {
        self.contains(BufferFlags::EOS)
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for BufferFlags {
    type Output = BufferFlags;

    fn bitor(self, rhs: BufferFlags) -> BufferFlags {
        BufferFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: BufferFlags) {
        self.0 |= rhs.0;
    }
}

/// Elementary stream type of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
    Other,
}

/// Track selector used by skip-track and active-stream parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Result of a non-consuming parser lookahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub media_type: MediaType,
    pub size: usize,
    pub pts: i64,
    pub flags: BufferFlags,
}

/// Compressed elementary-stream unit. `data` is the pool slot's buffer;
/// its length is the valid payload size.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Vec<u8>,
    pub pts: i64,
    pub flags: BufferFlags,
    pub media_type: MediaType,
    /// Pool slot index, stable for the lifetime of the pool.
    pub slot: usize,
}

impl Packet {
    pub fn new(slot: usize, capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            pts: PTS_NONE,
            flags: BufferFlags::NONE,
            media_type: MediaType::Other,
            slot,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Clears payload and metadata, keeping the allocation.
    pub fn reset(&mut self) {
        self.data.clear();
        self.pts = PTS_NONE;
        self.flags = BufferFlags::NONE;
        self.media_type = MediaType::Other;
    }
}

/// Pixel formats understood by the display and graphics engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Argb8888,
    Rgba8888,
    Rgb888,
    Yuv420p,
    Nv12,
    Nv21,
    Yuv444p,
    Yuv422p,
    Yuv400,
}

impl PixelFormat {
    /// Number of DMA planes (one fd per plane).
    pub fn plane_count(&self) -> usize {
        match self {
            PixelFormat::Argb8888
            | PixelFormat::Rgba8888
            | PixelFormat::Rgb888
            | PixelFormat::Yuv400 => 1,
            PixelFormat::Nv12 | PixelFormat::Nv21 => 2,
            PixelFormat::Yuv420p | PixelFormat::Yuv444p | PixelFormat::Yuv422p => 3,
        }
    }

    /// Per-plane strides (bytes) and byte sizes of a `width` x `height`
    /// buffer as the graphics engine allocates it. Rows are 16-pixel
    /// aligned except for packed RGB888, and every plane holds
    /// `stride * rows` bytes. Chroma strides are counted per component.
    pub fn plane_layout(&self, width: u32, height: u32) -> ([u32; 3], [usize; 3]) {
        let aligned = align16(width);
        let rows = height as usize;
        let chroma_rows = (height as usize + 1) / 2;
        let luma = aligned as usize * rows;
        let half = (aligned / 2) as usize;
        match self {
            PixelFormat::Yuv420p => (
                [aligned, aligned / 2, aligned / 2],
                [luma, half * chroma_rows, half * chroma_rows],
            ),
            PixelFormat::Yuv422p => ([aligned, aligned / 2, aligned / 2], [luma, half * rows, half * rows]),
            PixelFormat::Yuv444p => ([aligned; 3], [luma; 3]),
            // Interleaved CbCr: half-width pairs, so each chroma row spans
            // a full luma row of bytes.
            PixelFormat::Nv12 | PixelFormat::Nv21 => {
                ([aligned, aligned / 2, 0], [luma, aligned as usize * chroma_rows, 0])
            }
            PixelFormat::Yuv400 => ([aligned, 0, 0], [luma, 0, 0]),
            PixelFormat::Argb8888 | PixelFormat::Rgba8888 => {
                ([aligned * 4, 0, 0], [luma * 4, 0, 0])
            }
            PixelFormat::Rgb888 => ([width * 3, 0, 0], [width as usize * 3 * rows, 0, 0]),
        }
    }
}

pub const fn align16(value: u32) -> u32 {
    (value + 15) & !15
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// DMA-backed picture descriptor. Unused planes carry fd -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoBuf {
    pub format: PixelFormat,
    pub size: Size,
    pub stride: [u32; 3],
    pub fd: [i32; 3],
    pub crop: Option<Rect>,
}

impl VideoBuf {
    pub fn new(format: PixelFormat, size: Size) -> Self {
        Self {
            format,
            size,
            stride: [0; 3],
            fd: [-1; 3],
            crop: None,
        }
    }

    /// The fds of the planes this format actually uses.
    pub fn plane_fds(&self) -> &[i32] {
        &self.fd[..self.format.plane_count()]
    }

    pub fn visible_rect(&self) -> Rect {
        self.crop
            .unwrap_or_else(|| Rect::new(0, 0, self.size.width, self.size.height))
    }
}

/// Decoded picture. `id` changes only when the decoder reallocates the
/// underlying DMA buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFrame {
    pub id: u32,
    pub pts: i64,
    pub flags: BufferFlags,
    pub buf: VideoBuf,
}

/// Decoded PCM block, 16-bit interleaved.
#[derive(Debug, Clone, Default)]
pub struct AudioFrame {
    pub id: u32,
    pub pts: i64,
    pub flags: BufferFlags,
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
    Mjpeg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Mp3,
    Pcm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoStreamInfo {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    /// Codec configuration (SPS/PPS); empty when carried in-band.
    #[serde(default)]
    pub extra_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioStreamInfo {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Codec configuration (e.g. AudioSpecificConfig).
    #[serde(default)]
    pub extra_data: Vec<u8>,
}

/// Stream description reported by a parser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration_us: i64,
    pub seekable: bool,
    pub video: Option<VideoStreamInfo>,
    pub audio: Option<AudioStreamInfo>,
    pub video_stream_num: u32,
    pub audio_stream_num: u32,
}

impl MediaInfo {
    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }
}
