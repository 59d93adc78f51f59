// Container parser contract consumed by the demuxer.

pub mod raw;

use log::info;
use std::path::Path;

use crate::core::{MediaInfo, MediaSource, MppError, Packet, PacketInfo, Result, TrackKind, VideoCodec};

pub use raw::RawParser;

/// Outcome of a non-consuming lookahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeekResult {
    Packet(PacketInfo),
    Eos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserControl {
    SkipTrack(TrackKind),
}

/// A container/elementary-stream reader. Destroy is `Drop`.
pub trait Parser: Send {
    fn init(&mut self) -> Result<()>;

    fn media_info(&self) -> Result<MediaInfo>;

    /// Describes the next packet without consuming it. Repeated peeks
    /// without a `read` return the same packet.
    fn peek(&mut self) -> Result<PeekResult>;

    /// Consumes the peeked packet into `packet`, whose buffer is reused.
    fn read(&mut self, packet: &mut Packet) -> Result<()>;

    fn seek(&mut self, pts_us: i64) -> Result<()>;

    fn control(&mut self, control: ParserControl) -> Result<()>;
}

/// Opens a parser for a content URI.
pub trait ParserFactory: Send + Sync {
    fn create(&self, uri: &str) -> Result<Box<dyn Parser>>;
}

/// Picks a parser by file extension. Only raw H.264/H.265 elementary
/// streams are understood.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultParserFactory;

impl ParserFactory for DefaultParserFactory {
    fn create(&self, uri: &str) -> Result<Box<dyn Parser>> {
        let path = match MediaSource::from_url(uri) {
            MediaSource::LocalFile(path) => path,
            MediaSource::NetworkStream { protocol, .. } => {
                return Err(MppError::Parser(format!(
                    "no parser for {} streams",
                    protocol.as_str()
                )));
            }
        };
        let codec = codec_for(&path)
            .ok_or_else(|| MppError::Parser(format!("unknown format: {}", path.display())))?;
        info!("raw {:?} parser for {}", codec, path.display());
        Ok(Box::new(RawParser::new(path, codec)))
    }
}

fn codec_for(path: &Path) -> Option<VideoCodec> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "h264" | "264" => Some(VideoCodec::H264),
        "h265" | "265" => Some(VideoCodec::H265),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorCode;

    #[test]
    fn test_factory_picks_by_extension() {
        assert_eq!(codec_for(Path::new("a/b.h264")), Some(VideoCodec::H264));
        assert_eq!(codec_for(Path::new("clip.265")), Some(VideoCodec::H265));
        assert_eq!(codec_for(Path::new("clip.H265")), Some(VideoCodec::H265));
        assert_eq!(codec_for(Path::new("movie.mp4")), None);
        assert_eq!(codec_for(Path::new("noext")), None);
    }

    #[test]
    fn test_factory_rejects_unknown_sources() {
        let factory = DefaultParserFactory;
        let err = factory.create("movie.mkv").err().unwrap();
        assert_eq!(err.code(), ErrorCode::FormatNotDetected);
        let err = factory.create("rtsp://camera/stream").err().unwrap();
        assert_eq!(err.code(), ErrorCode::FormatNotDetected);
        assert!(factory.create("file:///tmp/x.h264").is_ok());
    }
}
