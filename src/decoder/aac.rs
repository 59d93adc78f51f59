use log::{debug, error, info};
use std::sync::Arc;

use super::pool::{FramePool, PacketPool};
use super::{DecodeStatus, Decoder, DecoderControl};
use crate::core::{AudioFrame, BufferFlags, DecoderConfig, Result};

/// Stream parameters learned from the configuration packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub sample_rate: u32,
    pub channels: u16,
}

/// One decoded block, 16-bit little-endian interleaved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcmBlock {
    /// Total samples across all channels.
    pub samples: usize,
    pub channels: u16,
    pub sample_rate: u32,
    pub data: Vec<u8>,
}

/// Wrapped AAC library (one-shot init, then packet-at-a-time decode).
pub trait AacCodec: Send + 'static {
    fn init(&mut self, config: &[u8]) -> Result<StreamParams>;

    fn decode(&mut self, packet: &[u8]) -> Result<PcmBlock>;

    /// Drops overlap state carried from the previous packet. The stream
    /// configuration stays valid.
    fn flush(&mut self) {}
}

const BITS_PER_SAMPLE: u16 = 16;

/// AAC adapter. The first packet only initialises the library.
pub struct AacDecoder<C: AacCodec> {
    codec: C,
    packets: Option<Arc<PacketPool>>,
    frames: Option<Arc<FramePool<AudioFrame>>>,
    initialized: bool,
    params: Option<StreamParams>,
    frame_id: u32,
}

impl<C: AacCodec> AacDecoder<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            packets: None,
            frames: None,
            initialized: false,
            params: None,
            frame_id: 0,
        }
    }

    pub fn stream_params(&self) -> Option<StreamParams> {
        self.params
    }
}

impl<C: AacCodec> Decoder for AacDecoder<C> {
    type Frame = AudioFrame;

    fn name(&self) -> &'static str {
        "aac"
    }

    fn init(&mut self, config: &DecoderConfig) -> Result<()> {
        self.packets = Some(Arc::new(PacketPool::new(
            config.packet_count,
            config.packet_buffer_size,
        )));
        let frames = (0..config.frame_count).map(|_| AudioFrame::default()).collect();
        self.frames = Some(Arc::new(FramePool::new(frames)));
        info!(
            "aac decoder init: {} packets, {} frames",
            config.packet_count, config.frame_count
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

        if !self.initialized {
            let result = self.codec.init(&packet.data);
            packets.enqueue_empty_packet(packet);
            return match result {
                Ok(params) => {
                    info!(
                        "aac stream: {} Hz, {} channels",
                        params.sample_rate, params.channels
                    );
                    self.params = Some(params);
                    self.initialized = true;
                    DecodeStatus::Ok
                }
                Err(e) => {
                    error!("aac init failed: {}", e);
                    DecodeStatus::NotSupported
                }
            };
        }

        let pts = packet.pts;
        let eos = packet.flags.is_eos();
        let result = self.codec.decode(&packet.data);
        let size = packet.size();
        packets.enqueue_empty_packet(packet);

        let block = match result {
            Ok(block) => block,
            Err(e) => {
                error!("aac decode failed: {}", e);
                return DecodeStatus::NotSupported;
            }
        };

        if block.samples == 0 {
            debug!("aac packet yielded no samples, size:{}, pts:{}", size, pts);
            return DecodeStatus::Ok;
        }

        let Some(mut frame) = frames.decoder_get_frame() else {
            return DecodeStatus::NoEmptyFrame;
        };
        let pcm_size = block.samples * (BITS_PER_SAMPLE as usize / 8);
        if frame.data.capacity() < pcm_size {
            debug!("aac frame buffer grows to {} bytes", pcm_size);
        }
        frame.data.clear();
        frame.data
            .extend_from_slice(&block.data[..pcm_size.min(block.data.len())]);
        frame.channels = block.channels;
        frame.sample_rate = block.sample_rate;
        frame.bits_per_sample = BITS_PER_SAMPLE;
        frame.pts = pts;
        frame.id = self.frame_id;
        self.frame_id = self.frame_id.wrapping_add(1);
        frame.flags = if eos { BufferFlags::EOS } else { BufferFlags::NONE };
        if eos {
            debug!("aac last packet, pts:{}", pts);
        }
        frames.decoder_put_frame(frame);
        DecodeStatus::Ok
    }

    fn control(&mut self, cmd: DecoderControl) -> Result<()> {
        debug!("aac control {:?}", cmd);
        match cmd {
            // The config packet is not resent after a seek, so `initialized`
            // and `params` survive a flush.
            DecoderControl::Flush => {
                if self.initialized {
                    self.codec.flush();
                }
            }
            // Each packet is decoded whole; nothing is buffered to drain.
            DecoderControl::EndOfStream => {}
        }
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

    fn frame_pool(&self) -> Option<Arc<FramePool<AudioFrame>>> {
        self.frames.clone()
    }
}
