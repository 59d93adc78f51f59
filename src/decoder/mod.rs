// Decoder adapters: packet-in / frame-out polling contract over external codecs.

pub mod aac;
pub mod mp3;
pub mod passthrough;
pub mod pool;

use std::fmt;
use std::sync::Arc;

use crate::core::{AudioFrame, DecoderConfig, MediaType, Result, VideoFrame};
use pool::{FramePool, PacketPool};

pub use aac::{AacCodec, AacDecoder};
pub use mp3::{Mp3Codec, Mp3Decoder};
pub use passthrough::PassthroughVideoDecoder;

/// Outcome of one `decode()` step. Only `Ok` means a unit of work was done;
/// the two `No*` values are back-pressure, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    Ok,
    NoReadyPacket,
    NoEmptyFrame,
    NoRenderFrame,
    NotSupported,
    NullPointer,
}

impl fmt::Display for DecodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DecodeStatus::Ok => "DEC_OK",
            DecodeStatus::NoReadyPacket => "DEC_NO_READY_PACKET",
            DecodeStatus::NoEmptyFrame => "DEC_NO_EMPTY_FRAME",
            DecodeStatus::NoRenderFrame => "DEC_NO_RENDER_FRAME",
            DecodeStatus::NotSupported => "DEC_ERR_NOT_SUPPORT",
            DecodeStatus::NullPointer => "DEC_ERR_NULL_PTR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderControl {
    /// Drop codec-internal state carried between packets.
    Flush,
    /// No more input will arrive; drain what is buffered.
    EndOfStream,
}

/// Frame types a decoder can emit, and which component port they surface on.
pub trait FrameKind: Send + Sized + 'static {
    const MEDIA: MediaType;

    fn video_pool(pool: &Arc<FramePool<Self>>) -> Option<Arc<FramePool<VideoFrame>>>;

    fn audio_pool(pool: &Arc<FramePool<Self>>) -> Option<Arc<FramePool<AudioFrame>>>;
}

impl FrameKind for VideoFrame {
    const MEDIA: MediaType = MediaType::Video;

    fn video_pool(pool: &Arc<FramePool<Self>>) -> Option<Arc<FramePool<VideoFrame>>> {
        Some(Arc::clone(pool))
    }

    fn audio_pool(_pool: &Arc<FramePool<Self>>) -> Option<Arc<FramePool<AudioFrame>>> {
        None
    }
}

impl FrameKind for AudioFrame {
    const MEDIA: MediaType = MediaType::Audio;

    fn video_pool(_pool: &Arc<FramePool<Self>>) -> Option<Arc<FramePool<VideoFrame>>> {
        None
    }

    fn audio_pool(pool: &Arc<FramePool<Self>>) -> Option<Arc<FramePool<AudioFrame>>> {
        Some(Arc::clone(pool))
    }
}

/// Callback an adapter with its own worker uses to wake the owning component.
pub type Waker = Arc<dyn Fn() + Send + Sync>;

/// Uniform adapter contract. `decode` never blocks; destroy is `Drop`.
pub trait Decoder: Send + 'static {
    type Frame: FrameKind;

    fn name(&self) -> &'static str;

    fn init(&mut self, config: &DecoderConfig) -> Result<()>;

    fn decode(&mut self) -> DecodeStatus;

    fn control(&mut self, cmd: DecoderControl) -> Result<()>;

    fn reset(&mut self);

    fn packet_pool(&self) -> Option<Arc<PacketPool>>;

    fn frame_pool(&self) -> Option<Arc<FramePool<Self::Frame>>>;

    /// Only adapters that decode off the caller's thread need this.
    fn set_waker(&mut self, _waker: Waker) {}
}
