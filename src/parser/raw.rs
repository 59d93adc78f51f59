use log::{debug, info};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use super::{Parser, ParserControl, PeekResult};
use crate::core::{
    BufferFlags, MediaInfo, MediaType, MppError, Packet, PacketInfo, Result, VideoCodec,
    VideoStreamInfo,
};

/// Read-ahead window. A NAL unit larger than this is cut at the window edge.
const WINDOW_SIZE: usize = 512 * 1024;
/// Nominal frame duration used to synthesise timestamps (~30 fps).
const FRAME_DURATION_US: i64 = 33_000;

/// Annex-B elementary-stream reader: one packet per start-code delimited
/// NAL unit, start code included.
pub struct RawParser {
    path: PathBuf,
    codec: VideoCodec,
    file: Option<File>,
    window: Vec<u8>,
    pos: usize,
    file_eof: bool,
    peeked: Option<PacketInfo>,
    index: i64,
    finished: bool,
}

impl RawParser {
    pub fn new(path: impl Into<PathBuf>, codec: VideoCodec) -> Self {
        Self {
            path: path.into(),
            codec,
            file: None,
            window: Vec::new(),
            pos: 0,
            file_eof: false,
            peeked: None,
            index: 0,
            finished: false,
        }
    }

    /// Compacts the window and tops it up from the file.
    fn fill(&mut self) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| MppError::Parser("parser not initialised".into()))?;
        if self.pos > 0 {
            self.window.drain(..self.pos);
            self.pos = 0;
        }
        while self.window.len() < WINDOW_SIZE && !self.file_eof {
            let start = self.window.len();
            self.window.resize(WINDOW_SIZE, 0);
            let n = file.read(&mut self.window[start..])?;
            self.window.truncate(start + n);
            if n == 0 {
                self.file_eof = true;
            }
        }
        Ok(())
    }

    /// Length of the unit starting at `pos`, or `None` at end of file.
    fn next_unit_len(&mut self) -> Result<Option<usize>> {
        loop {
            let avail = &self.window[self.pos..];
            if avail.is_empty() {
                if self.file_eof {
                    return Ok(None);
                }
                self.fill()?;
                continue;
            }
            if let Some(end) = find_start_code(avail, 3) {
                return Ok(Some(end));
            }
            if self.file_eof || (self.pos == 0 && self.window.len() >= WINDOW_SIZE) {
                return Ok(Some(avail.len()));
            }
            self.fill()?;
        }
    }
}

/// Offset of the first start code at or after `from`; a 4-byte start code
/// is reported at its leading zero.
fn find_start_code(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < 3 {
        return None;
    }
    (from..buf.len() - 2)
        .find(|&i| buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 1)
        .map(|i| if i > from && buf[i - 1] == 0 { i - 1 } else { i })
}

impl Parser for RawParser {
    fn init(&mut self) -> Result<()> {
        let file = File::open(&self.path)
            .map_err(|e| MppError::Parser(format!("open {}: {}", self.path.display(), e)))?;
        self.file = Some(file);
        self.window = Vec::with_capacity(WINDOW_SIZE);
        self.pos = 0;
        self.file_eof = false;
        self.peeked = None;
        self.index = 0;
        self.finished = false;
        info!("raw parser opened {}", self.path.display());
        Ok(())
    }

    fn media_info(&self) -> Result<MediaInfo> {
        if self.file.is_none() {
            return Err(MppError::Parser("parser not initialised".into()));
        }
        Ok(MediaInfo {
            duration_us: 0,
            seekable: false,
            video: Some(VideoStreamInfo {
                codec: self.codec,
                width: 0,
                height: 0,
                extra_data: Vec::new(),
            }),
            audio: None,
            video_stream_num: 1,
            audio_stream_num: 0,
        })
    }

    fn peek(&mut self) -> Result<PeekResult> {
        if self.finished {
            return Ok(PeekResult::Eos);
        }
        if let Some(info) = self.peeked {
            return Ok(PeekResult::Packet(info));
        }
        let Some(len) = self.next_unit_len()? else {
            self.finished = true;
            return Ok(PeekResult::Eos);
        };
        let last = self.file_eof && self.pos + len == self.window.len();
        let info = PacketInfo {
            media_type: MediaType::Video,
            size: len,
            pts: self.index * FRAME_DURATION_US,
            flags: if last { BufferFlags::EOS } else { BufferFlags::NONE },
        };
        self.peeked = Some(info);
        Ok(PeekResult::Packet(info))
    }

    fn read(&mut self, packet: &mut Packet) -> Result<()> {
        let info = match self.peek()? {
            PeekResult::Packet(info) => info,
            PeekResult::Eos => return Err(MppError::Parser("read past end of stream".into())),
        };
        let end = self.pos + info.size;
        packet.data.clear();
        packet.data.extend_from_slice(&self.window[self.pos..end]);
        packet.pts = info.pts;
        packet.flags = info.flags;
        packet.media_type = info.media_type;

        self.pos = end;
        self.index += 1;
        self.peeked = None;
        if info.flags.is_eos() {
            debug!("raw parser reached end after {} packets", self.index);
            self.finished = true;
        }
        Ok(())
    }

    fn seek(&mut self, pts_us: i64) -> Result<()> {
        Err(MppError::Parser(format!(
            "raw stream is not seekable (target {} us)",
            pts_us
        )))
    }

    fn control(&mut self, control: ParserControl) -> Result<()> {
        debug!("raw parser control {:?}", control);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn stream_file(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    fn read_all(parser: &mut RawParser) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let PeekResult::Packet(info) = parser.peek().unwrap() {
            let mut packet = Packet::new(packets.len(), info.size);
            parser.read(&mut packet).unwrap();
            packets.push(packet);
        }
        packets
    }

    #[test]
    fn test_find_start_code() {
        assert_eq!(find_start_code(&[0, 0, 1, 9, 0, 0, 1, 8], 3), Some(4));
        assert_eq!(find_start_code(&[0, 0, 0, 1, 9, 0, 0, 0, 1], 3), Some(5));
        assert_eq!(find_start_code(&[0, 0, 1, 9, 9], 3), None);
        assert_eq!(find_start_code(&[0, 0], 0), None);
    }

    #[test]
    fn test_splits_on_start_codes_with_synthetic_pts() {
        let file = stream_file(&[
            0, 0, 0, 1, 0x67, 1, 2, //
            0, 0, 1, 0x68, 3, //
            0, 0, 0, 1, 0x65, 4, 5, 6,
        ]);
        let mut parser = RawParser::new(file.path(), VideoCodec::H264);
        parser.init().unwrap();

        let packets = read_all(&mut parser);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].data, vec![0, 0, 0, 1, 0x67, 1, 2]);
        assert_eq!(packets[1].data, vec![0, 0, 1, 0x68, 3]);
        assert_eq!(packets[2].data, vec![0, 0, 0, 1, 0x65, 4, 5, 6]);
        assert_eq!(packets[1].pts, 33_000);
        assert_eq!(packets[2].pts, 66_000);
        assert!(!packets[1].flags.is_eos());
        assert!(packets[2].flags.is_eos());
        assert_eq!(parser.peek().unwrap(), PeekResult::Eos);
        assert_eq!(parser.peek().unwrap(), PeekResult::Eos);
    }

    #[test]
    fn test_peek_is_idempotent() {
        let file = stream_file(&[0, 0, 1, 0x65, 1, 0, 0, 1, 0x65, 2]);
        let mut parser = RawParser::new(file.path(), VideoCodec::H264);
        parser.init().unwrap();
        let first = parser.peek().unwrap();
        assert_eq!(parser.peek().unwrap(), first);
        match first {
            PeekResult::Packet(info) => assert_eq!(info.size, 5),
            PeekResult::Eos => panic!("unexpected eos"),
        }
    }

    #[test]
    fn test_units_spanning_window_refills() {
        let mut bytes = vec![0, 0, 1, 0x65];
        bytes.extend(std::iter::repeat(7u8).take(WINDOW_SIZE - 100));
        bytes.extend_from_slice(&[0, 0, 1, 0x41]);
        bytes.extend(std::iter::repeat(9u8).take(400));
        let file = stream_file(&bytes);
        let mut parser = RawParser::new(file.path(), VideoCodec::H265);
        parser.init().unwrap();

        let packets = read_all(&mut parser);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].size(), WINDOW_SIZE - 96);
        assert_eq!(packets[1].size(), 404);
        assert!(packets[1].flags.is_eos());
    }

    #[test]
    fn test_empty_file_is_immediate_eos() {
        let file = stream_file(&[]);
        let mut parser = RawParser::new(file.path(), VideoCodec::H264);
        parser.init().unwrap();
        assert_eq!(parser.peek().unwrap(), PeekResult::Eos);
    }

    #[test]
    fn test_media_info_and_seek() {
        let file = stream_file(&[0, 0, 1, 0x65]);
        let mut parser = RawParser::new(file.path(), VideoCodec::H264);
        assert!(parser.media_info().is_err());
        parser.init().unwrap();
        let info = parser.media_info().unwrap();
        assert!(info.has_video());
        assert!(!info.has_audio());
        assert_eq!(info.video.unwrap().codec, VideoCodec::H264);
        assert!(parser.seek(1_000_000).is_err());
    }

    #[test]
    fn test_missing_file_fails_init() {
        let mut parser = RawParser::new("/nonexistent/clip.h264", VideoCodec::H264);
        assert!(parser.init().is_err());
    }
}
