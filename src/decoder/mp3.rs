use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::aac::PcmBlock;
use super::pool::{FramePool, PacketPool};
use super::{DecodeStatus, Decoder, DecoderControl, Waker};
use crate::core::{AudioFrame, BufferFlags, DecoderConfig, MppError, Result};

/// Staging buffer the library decodes from; leftovers carry over.
const MP3_BUFFER_LEN: usize = 4 * 1024;
/// Zero padding appended so the library can finish the last frame.
const MP3_BUFFER_GUARD: usize = 8;
/// Samples per channel of a MPEG-1 layer III frame, used for the silent
/// EOS frame when the tail cannot be decoded.
const MP3_FRAME_SAMPLES: usize = 1152;

/// Result of one library decode step over the staging buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mp3Output {
    Frame { consumed: usize, pcm: PcmBlock },
    /// The buffer holds less than one frame.
    NeedMoreData,
    /// Undecodable bytes to skip.
    Corrupt { consumed: usize },
}

/// Wrapped push-style MP3 library.
pub trait Mp3Codec: Send + 'static {
    fn decode_frame(&mut self, input: &[u8]) -> Mp3Output;

    fn reset(&mut self);
}

struct Mp3Shared {
    packets: Arc<PacketPool>,
    frames: Arc<FramePool<AudioFrame>>,
    stop: AtomicBool,
    busy: AtomicBool,
    produced: AtomicU64,
    /// Packets dropped for not fitting the staging buffer.
    rejected: AtomicU64,
    reset_epoch: AtomicU64,
    waker: Mutex<Option<Waker>>,
}

impl Mp3Shared {
    fn wake(&self) {
        let waker = self.waker.lock().clone();
        if let Some(waker) = waker {
            waker();
        }
    }
}

/// MP3 adapter. Decoding runs on a dedicated thread fed from the packet
/// pool; `decode` only reports progress and never blocks.
pub struct Mp3Decoder<C: Mp3Codec> {
    codec: Option<C>,
    shared: Option<Arc<Mp3Shared>>,
    thread: Option<JoinHandle<()>>,
    reported: u64,
    rejected_reported: u64,
}

impl<C: Mp3Codec> Mp3Decoder<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec: Some(codec),
            shared: None,
            thread: None,
            reported: 0,
            rejected_reported: 0,
        }
    }

    fn stop_thread(&mut self) {
        if let Some(shared) = &self.shared {
            shared.stop.store(true, Ordering::SeqCst);
            shared.packets.close();
            shared.frames.close();
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("mp3 decode thread panicked");
            }
        }
    }
}

struct DecodeLoop<C: Mp3Codec> {
    codec: C,
    shared: Arc<Mp3Shared>,
    staging: Vec<u8>,
    frame_id: u32,
    epoch: u64,
    last_frame_size: usize,
    last_channels: u16,
    last_sample_rate: u32,
}

impl<C: Mp3Codec> DecodeLoop<C> {
    fn run(mut self) {
        info!("mp3 decode thread start");
        while !self.shared.stop.load(Ordering::SeqCst) {
            if !self.shared.packets.wait_ready(None) {
                continue;
            }
            self.shared.busy.store(true, Ordering::SeqCst);
            self.check_reset();
            if let Some(packet) = self.shared.packets.dequeue_ready_packet() {
                let pts = packet.pts;
                let flags = packet.flags;
                let fits = packet.size() <= MP3_BUFFER_LEN - self.staging.len();
                if fits {
                    self.staging.extend_from_slice(&packet.data);
                } else {
                    error!(
                        "mp3 packet too large: size:{}, buffer:{}, leftover:{}",
                        packet.size(),
                        MP3_BUFFER_LEN,
                        self.staging.len()
                    );
                    self.shared.rejected.fetch_add(1, Ordering::SeqCst);
                }
                self.shared.packets.enqueue_empty_packet(packet);

                if fits && !self.drain_frames(pts) {
                    break;
                }
                if flags.is_eos() && !self.finish_stream(pts) {
                    break;
                }
            }
            self.shared.busy.store(false, Ordering::SeqCst);
            self.shared.wake();
        }
        self.shared.busy.store(false, Ordering::SeqCst);
        info!("mp3 decode thread exit, frames:{}", self.frame_id);
    }

    fn check_reset(&mut self) {
        let epoch = self.shared.reset_epoch.load(Ordering::SeqCst);
        if epoch != self.epoch {
            self.epoch = epoch;
            self.staging.clear();
            self.codec.reset();
        }
    }

    /// Decodes every complete frame in the staging buffer.
    /// Returns false when the thread must exit.
    fn drain_frames(&mut self, pts: i64) -> bool {
        loop {
            match self.codec.decode_frame(&self.staging) {
                Mp3Output::Frame { consumed, pcm } => {
                    self.staging.drain(..consumed.min(self.staging.len()));
                    if !self.emit(pcm, pts, BufferFlags::NONE) {
                        return false;
                    }
                }
                Mp3Output::Corrupt { consumed } => {
                    debug!("mp3 skipping {} corrupt bytes", consumed);
                    if consumed == 0 {
                        self.staging.clear();
                        return true;
                    }
                    self.staging.drain(..consumed.min(self.staging.len()));
                }
                Mp3Output::NeedMoreData => return true,
            }
        }
    }

    /// Flushes the tail after an EOS packet. Exactly one EOS frame is
    /// published: decoded from the padded leftover, or silence.
    fn finish_stream(&mut self, pts: i64) -> bool {
        let mut tail = std::mem::take(&mut self.staging);
        let pcm = if tail.is_empty() {
            None
        } else {
            tail.resize(tail.len() + MP3_BUFFER_GUARD, 0);
            match self.codec.decode_frame(&tail) {
                Mp3Output::Frame { pcm, .. } => Some(pcm),
                other => {
                    warn!("mp3 final frame undecodable ({:?}), using silence", other);
                    None
                }
            }
        };
        let pcm = pcm.unwrap_or_else(|| {
            let size = if self.last_frame_size > 0 {
                self.last_frame_size
            } else {
                MP3_FRAME_SAMPLES * 2 * 2
            };
            PcmBlock {
                samples: size / 2,
                channels: self.last_channels.max(1),
                sample_rate: self.last_sample_rate,
                data: vec![0; size],
            }
        });
        self.emit(pcm, pts, BufferFlags::EOS)
    }

    fn emit(&mut self, pcm: PcmBlock, pts: i64, flags: BufferFlags) -> bool {
        let frame = loop {
            if self.shared.stop.load(Ordering::SeqCst) {
                return false;
            }
            if let Some(frame) = self.shared.frames.decoder_get_frame() {
                break frame;
            }
            // Announce the stall, then block until the renderer returns a slot.
            self.shared.wake();
            if !self.shared.frames.wait_empty(None) {
                return false;
            }
        };
        let mut frame = frame;
        frame.data.clear();
        frame.data.extend_from_slice(&pcm.data);
        frame.channels = pcm.channels;
        frame.sample_rate = pcm.sample_rate;
        frame.bits_per_sample = 16;
        frame.pts = pts;
        frame.flags = flags;
        frame.id = self.frame_id;
        self.frame_id = self.frame_id.wrapping_add(1);
        self.last_frame_size = pcm.data.len();
        self.last_channels = pcm.channels;
        self.last_sample_rate = pcm.sample_rate;
        self.shared.frames.decoder_put_frame(frame);
        self.shared.produced.fetch_add(1, Ordering::SeqCst);
        true
    }
}

impl<C: Mp3Codec> Decoder for Mp3Decoder<C> {
    type Frame = AudioFrame;

    fn name(&self) -> &'static str {
        "mp3"
    }

    fn init(&mut self, config: &DecoderConfig) -> Result<()> {
        let codec = self
            .codec
            .take()
            .ok_or_else(|| MppError::Decode("mp3 decoder already initialised".into()))?;
        let frames = (0..config.frame_count).map(|_| AudioFrame::default()).collect();
        let shared = Arc::new(Mp3Shared {
            packets: Arc::new(PacketPool::new(
                config.packet_count,
                config.packet_buffer_size,
            )),
            frames: Arc::new(FramePool::new(frames)),
            stop: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            produced: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            reset_epoch: AtomicU64::new(0),
            waker: Mutex::new(None),
        });

        let decode_loop = DecodeLoop {
            codec,
            shared: Arc::clone(&shared),
            staging: Vec::with_capacity(MP3_BUFFER_LEN + MP3_BUFFER_GUARD),
            frame_id: 0,
            epoch: 0,
            last_frame_size: 0,
            last_channels: 0,
            last_sample_rate: 0,
        };
        let handle = thread::Builder::new()
            .name("mp3_decode".into())
            .spawn(move || decode_loop.run())
            .map_err(|e| MppError::Thread(format!("spawn mp3 decode thread: {}", e)))?;

        self.shared = Some(shared);
        self.thread = Some(handle);
        Ok(())
    }

    fn decode(&mut self) -> DecodeStatus {
        let Some(shared) = &self.shared else {
            return DecodeStatus::NullPointer;
        };
        // Read order matters: a packet dequeued by the thread is only
        // invisible here once `busy` is already set.
        let ready = shared.packets.ready_num();
        let busy = shared.busy.load(Ordering::SeqCst);
        let produced = shared.produced.load(Ordering::SeqCst);

        let rejected = shared.rejected.load(Ordering::SeqCst);
        if rejected != self.rejected_reported {
            self.rejected_reported += 1;
            return DecodeStatus::NotSupported;
        }
        if produced != self.reported {
            self.reported = produced;
            return DecodeStatus::Ok;
        }
        if ready > 0 || busy {
            if shared.frames.empty_frame_num() == 0 {
                return DecodeStatus::NoEmptyFrame;
            }
            return DecodeStatus::NoRenderFrame;
        }
        DecodeStatus::NoReadyPacket
    }

    fn control(&mut self, cmd: DecoderControl) -> Result<()> {
        debug!("mp3 control {:?}", cmd);
        if cmd == DecoderControl::Flush {
            self.reset();
        }
        Ok(())
    }

    fn reset(&mut self) {
        if let Some(shared) = &self.shared {
            shared.reset_epoch.fetch_add(1, Ordering::SeqCst);
            shared.packets.reset();
            shared.frames.reset();
            self.reported = shared.produced.load(Ordering::SeqCst);
            self.rejected_reported = shared.rejected.load(Ordering::SeqCst);
        }
    }

    fn packet_pool(&self) -> Option<Arc<PacketPool>> {
        self.shared.as_ref().map(|s| Arc::clone(&s.packets))
    }

    fn frame_pool(&self) -> Option<Arc<FramePool<AudioFrame>>> {
        self.shared.as_ref().map(|s| Arc::clone(&s.frames))
    }

    fn set_waker(&mut self, waker: Waker) {
        if let Some(shared) = &self.shared {
            *shared.waker.lock() = Some(waker);
        }
    }
}

impl<C: Mp3Codec> Drop for Mp3Decoder<C> {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::aac::tests::feed;
    use std::time::{Duration, Instant};

    /// Frames are 4 bytes starting with 0xFF; each decodes to 4 PCM bytes.
    /// 0x00 bytes are garbage to skip.
    struct FakeMp3;

    impl Mp3Codec for FakeMp3 {
        fn decode_frame(&mut self, input: &[u8]) -> Mp3Output {
            match input.first() {
                None => Mp3Output::NeedMoreData,
                Some(0xFF) if input.len() >= 4 => Mp3Output::Frame {
                    consumed: 4,
                    pcm: PcmBlock {
                        samples: 2,
                        channels: 1,
                        sample_rate: 48_000,
                        data: input[..4].to_vec(),
                    },
                },
                Some(0xFF) => Mp3Output::NeedMoreData,
                Some(_) => Mp3Output::Corrupt { consumed: 1 },
            }
        }

        fn reset(&mut self) {}
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn decoder() -> Mp3Decoder<FakeMp3> {
        let mut dec = Mp3Decoder::new(FakeMp3);
        dec.init(&DecoderConfig::default()).unwrap();
        dec
    }

    #[test]
    fn test_idle_reports_no_ready_packet() {
        let mut dec = decoder();
        assert_eq!(dec.decode(), DecodeStatus::NoReadyPacket);
    }

    #[test]
    fn test_frames_split_across_packets() {
        let mut dec = decoder();
        let packets = dec.packet_pool().unwrap();
        let frames = dec.frame_pool().unwrap();
        feed(&packets, &[0xFF, 1, 2], 0, BufferFlags::NONE);
        feed(&packets, &[3, 0xFF, 4, 5, 6], 26_000, BufferFlags::NONE);

        assert!(wait_until(|| frames.ready_frame_num() == 2));
        assert_eq!(dec.decode(), DecodeStatus::Ok);
        let first = frames.render_get_frame().unwrap();
        assert_eq!(first.data, vec![0xFF, 1, 2, 3]);
        assert_eq!(first.pts, 26_000);
        let second = frames.render_get_frame().unwrap();
        assert_eq!(second.data, vec![0xFF, 4, 5, 6]);
        assert_eq!(second.id, 1);
        assert!(wait_until(|| dec.decode() == DecodeStatus::NoReadyPacket));
    }

    #[test]
    fn test_eos_packet_yields_single_eos_frame() {
        let mut dec = decoder();
        let packets = dec.packet_pool().unwrap();
        let frames = dec.frame_pool().unwrap();
        feed(&packets, &[0xFF, 1, 2, 3], 0, BufferFlags::NONE);
        feed(&packets, &[0xFF, 9], 1000, BufferFlags::EOS);

        assert!(wait_until(|| frames.ready_frame_num() == 2));
        let mut decoded = Vec::new();
        while let Some(frame) = frames.render_get_frame() {
            decoded.push(frame);
        }
        let eos: Vec<_> = decoded.iter().filter(|f| f.flags.is_eos()).collect();
        assert_eq!(eos.len(), 1);
        assert_eq!(eos[0].pts, 1000);
        // Padded tail decodes into the final frame.
        assert_eq!(eos[0].data, vec![0xFF, 9, 0, 0]);
    }

    #[test]
    fn test_undecodable_tail_becomes_silence() {
        let mut dec = decoder();
        let packets = dec.packet_pool().unwrap();
        let frames = dec.frame_pool().unwrap();
        feed(&packets, &[0xFF, 1, 2, 3, 0x00], 0, BufferFlags::EOS);

        assert!(wait_until(|| frames.ready_frame_num() == 2));
        frames.render_get_frame().unwrap();
        let last = frames.render_get_frame().unwrap();
        assert!(last.flags.is_eos());
        assert_eq!(last.data, vec![0; 4]);
    }

    #[test]
    fn test_oversized_packet_reported_as_failure() {
        let mut dec = decoder();
        let packets = dec.packet_pool().unwrap();
        let frames = dec.frame_pool().unwrap();
        feed(&packets, &vec![0xFF; MP3_BUFFER_LEN + 1], 0, BufferFlags::NONE);
        feed(&packets, &[0xFF, 1, 2, 3], 26_000, BufferFlags::NONE);

        assert!(wait_until(|| frames.ready_frame_num() == 1));
        assert!(wait_until(|| packets.ready_num() == 0));
        assert_eq!(dec.decode(), DecodeStatus::NotSupported);
        assert!(wait_until(|| dec.decode() == DecodeStatus::Ok));
        assert!(wait_until(|| dec.decode() == DecodeStatus::NoReadyPacket));
        let frame = frames.render_get_frame().unwrap();
        assert_eq!(frame.data, vec![0xFF, 1, 2, 3]);
        assert_eq!(packets.outstanding(), 0);
    }

    #[test]
    fn test_waker_called_after_work() {
        let mut dec = decoder();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        dec.set_waker(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let packets = dec.packet_pool().unwrap();
        feed(&packets, &[0xFF, 1, 2, 3], 0, BufferFlags::NONE);
        assert!(wait_until(|| hits.load(Ordering::SeqCst) >= 1));
    }

    #[test]
    fn test_drop_joins_blocked_thread() {
        let mut dec = Mp3Decoder::new(FakeMp3);
        dec.init(&DecoderConfig {
            frame_count: 1,
            ..DecoderConfig::default()
        })
        .unwrap();
        let packets = dec.packet_pool().unwrap();
        // Second frame blocks on the exhausted frame pool.
        feed(&packets, &[0xFF, 1, 2, 3, 0xFF, 4, 5, 6], 0, BufferFlags::NONE);
        let frames = dec.frame_pool().unwrap();
        assert!(wait_until(|| frames.ready_frame_num() == 1));
        assert!(wait_until(|| dec.decode() == DecodeStatus::Ok));
        drop(dec);
        assert!(packets.is_closed());
    }
}
