use log::{debug, info};
use std::sync::Arc;

use super::pool::{FramePool, PacketPool};
use super::{DecodeStatus, Decoder, DecoderControl};
use crate::core::{
    BufferFlags, DecoderConfig, Result, Size, VideoBuf, VideoFrame, VideoOutputConfig,
};

/// First fake DMA fd handed out; each slot owns three consecutive fds.
const FAKE_FD_BASE: i32 = 100;

/// Video adapter that "decodes" every bitstream packet into the next free
/// output slot, carrying pts and EOS across. Slots keep their id and fds
/// for their whole life so downstream import caching sees stable buffers.
pub struct PassthroughVideoDecoder {
    output: VideoOutputConfig,
    packets: Option<Arc<PacketPool>>,
    frames: Option<Arc<FramePool<VideoFrame>>>,
    decoded: u64,
}

impl PassthroughVideoDecoder {
    pub fn new(output: VideoOutputConfig) -> Self {
        Self {
            output,
            packets: None,
            frames: None,
            decoded: 0,
        }
    }

    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    fn slot(&self, index: usize) -> VideoFrame {
        let mut buf = VideoBuf::new(
            self.output.format,
            Size::new(self.output.width, self.output.height),
        );
        let (stride, _) = self
            .output
            .format
            .plane_layout(self.output.width, self.output.height);
        buf.stride = stride;
        for plane in 0..self.output.format.plane_count() {
            buf.fd[plane] = FAKE_FD_BASE + (index * 3 + plane) as i32;
        }
        VideoFrame {
            id: index as u32,
            pts: 0,
            flags: BufferFlags::NONE,
            buf,
        }
    }
}

impl Decoder for PassthroughVideoDecoder {
    type Frame = VideoFrame;

    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn init(&mut self, config: &DecoderConfig) -> Result<()> {
        self.packets = Some(Arc::new(PacketPool::new(
            config.packet_count,
            config.packet_buffer_size,
        )));
        let slots = (0..self.output.frame_slots).map(|i| self.slot(i)).collect();
        self.frames = Some(Arc::new(FramePool::new(slots)));
        info!(
            "passthrough decoder init: {}x{} {:?}, {} slots",
            self.output.width, self.output.height, self.output.format, self.output.frame_slots
        );
        Ok(())
    }

    fn decode(&mut self) -> DecodeStatus {
        let (Some(packets), Some(frames)) = (self.packets.as_ref(), self.frames.as_ref()) else {
            return DecodeStatus::NullPointer;
        };
        if packets.ready_num() == 0 {
            return DecodeStatus::NoReadyPacket;
        }
        if frames.empty_frame_num() == 0 {
            return DecodeStatus::NoEmptyFrame;
        }
        let Some(packet) = packets.dequeue_ready_packet() else {
            return DecodeStatus::NoReadyPacket;
        };

        if packet.flags.contains(BufferFlags::EXTRA_DATA) {
            debug!("passthrough consumed {} bytes of extra data", packet.size());
            packets.enqueue_empty_packet(packet);
            return DecodeStatus::Ok;
        }

        let pts = packet.pts;
        let eos = packet.flags.is_eos();
        packets.enqueue_empty_packet(packet);

        let Some(mut frame) = frames.decoder_get_frame() else {
            return DecodeStatus::NoEmptyFrame;
        };
        frame.pts = pts;
        frame.flags = if eos { BufferFlags::EOS } else { BufferFlags::NONE };
        frames.decoder_put_frame(frame);
        self.decoded += 1;
        DecodeStatus::Ok
    }

    fn control(&mut self, _cmd: DecoderControl) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) {
        if let Some(packets) = &self.packets {
            packets.reset();
        }
        if let Some(frames) = &self.frames {
            frames.reset();
        }
    }

    fn packet_pool(&self) -> Option<Arc<PacketPool>> {
        self.packets.clone()
    }

    fn frame_pool(&self) -> Option<Arc<FramePool<VideoFrame>>> {
        self.frames.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MediaType, PixelFormat};

    fn push(pool: &PacketPool, pts: i64, flags: BufferFlags) {
        let mut packet = pool.dequeue_empty_packet(4).unwrap();
        packet.data.extend_from_slice(&[0, 0, 0, 1]);
        packet.pts = pts;
        packet.flags = flags;
        packet.media_type = MediaType::Video;
        pool.enqueue_ready_packet(packet);
    }

    fn decoder(slots: usize) -> PassthroughVideoDecoder {
        let mut dec = PassthroughVideoDecoder::new(VideoOutputConfig {
            width: 64,
            height: 32,
            format: PixelFormat::Nv12,
            frame_slots: slots,
        });
        dec.init(&DecoderConfig::default()).unwrap();
        dec
    }

    #[test]
    fn test_extra_data_produces_no_frame() {
        let mut dec = decoder(2);
        let packets = dec.packet_pool().unwrap();
        push(&packets, 0, BufferFlags::EXTRA_DATA);
        assert_eq!(dec.decode(), DecodeStatus::Ok);
        assert_eq!(dec.frame_pool().unwrap().ready_frame_num(), 0);
        assert_eq!(dec.decoded(), 0);
    }

    #[test]
    fn test_frames_carry_pts_and_eos() {
        let mut dec = decoder(2);
        let packets = dec.packet_pool().unwrap();
        let frames = dec.frame_pool().unwrap();
        push(&packets, 0, BufferFlags::NONE);
        push(&packets, 33_000, BufferFlags::EOS);
        assert_eq!(dec.decode(), DecodeStatus::Ok);
        assert_eq!(dec.decode(), DecodeStatus::Ok);
        assert_eq!(dec.decode(), DecodeStatus::NoReadyPacket);

        let first = frames.render_get_frame().unwrap();
        let last = frames.render_get_frame().unwrap();
        assert_eq!(first.pts, 0);
        assert!(!first.flags.is_eos());
        assert_eq!(last.pts, 33_000);
        assert!(last.flags.is_eos());
        assert_ne!(first.id, last.id);
    }

    #[test]
    fn test_slots_keep_identity() {
        let mut dec = decoder(1);
        let packets = dec.packet_pool().unwrap();
        let frames = dec.frame_pool().unwrap();
        push(&packets, 0, BufferFlags::NONE);
        push(&packets, 1, BufferFlags::NONE);

        assert_eq!(dec.decode(), DecodeStatus::Ok);
        assert_eq!(dec.decode(), DecodeStatus::NoEmptyFrame);
        let a = frames.render_get_frame().unwrap();
        frames.render_put_frame(a);
        assert_eq!(dec.decode(), DecodeStatus::Ok);
        let b = frames.render_get_frame().unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.buf.fd, b.buf.fd);
        assert_eq!(b.buf.plane_fds().len(), 2);
        assert_eq!(b.buf.stride[0], 64);
    }
}
