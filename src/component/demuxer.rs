use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::state::{check_bind, handle_state_set, log_ctx, ComponentCore, Worker};
use super::{
    BindInfo, Command, Component, Config, ConfigIndex, Event, EventHandler, Param, ParamIndex,
    PortDefinition, PortDirection, PortDomain, State,
};
use crate::core::{
    BufferFlags, ErrorCode, MediaInfo, MediaSource, MediaType, MppError, Packet, PacketInfo,
    Result, TrackKind,
};
use crate::decoder::pool::PacketPool;
use crate::parser::{Parser, ParserControl, ParserFactory, PeekResult};

pub const DEMUX_PORT_AUDIO: u32 = 0;
pub const DEMUX_PORT_VIDEO: u32 = 1;
pub const DEMUX_PORT_CLOCK: u32 = 2;

/// Retry interval after a failed peek or read.
const PARSER_RETRY_US: u64 = 10_000;
const LOG_FIRST_PACKETS: u64 = 5;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DemuxCounters {
    pub video_packets: u64,
    pub audio_packets: u64,
    pub get_ok: u64,
    pub put_ok: u64,
    pub put_fail: u64,
}

/// Outcome of one pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Ok,
    /// No empty packet in the decoder's pool; sleep until woken.
    EmptyData,
    ReadFailed,
    /// Nothing to do until a command arrives.
    Idle,
    Retry,
}

#[derive(Default)]
struct TrackState {
    bind: BindInfo,
    skip: bool,
    active: u32,
    extra_data: Option<Vec<u8>>,
}

struct DemuxInner {
    parser: Option<Box<dyn Parser>>,
    media_info: Option<MediaInfo>,
    rtsp: bool,
    audio: TrackState,
    video: TrackState,
    clock: BindInfo,
    peeked: Option<PacketInfo>,
    eos: bool,
    buffer_flag_sent: bool,
    scratch: Packet,
    counters: DemuxCounters,
}

impl DemuxInner {
    fn new() -> Self {
        Self {
            parser: None,
            media_info: None,
            rtsp: false,
            audio: TrackState::default(),
            video: TrackState::default(),
            clock: BindInfo::default(),
            peeked: None,
            eos: false,
            buffer_flag_sent: false,
            scratch: Packet::new(0, 0),
            counters: DemuxCounters::default(),
        }
    }

    fn track(&mut self, kind: TrackKind) -> &mut TrackState {
        match kind {
            TrackKind::Audio => &mut self.audio,
            TrackKind::Video => &mut self.video,
        }
    }

    fn release_parser(&mut self) {
        self.parser = None;
        self.media_info = None;
        self.peeked = None;
        self.audio.extra_data = None;
        self.video.extra_data = None;
    }

    fn media_info(&self) -> Result<&MediaInfo> {
        self.media_info
            .as_ref()
            .ok_or(MppError::Component(ErrorCode::BadParameter))
    }
}

/// Owns the parser and pushes packets into the bound decoders' pools.
pub struct DemuxerComponent {
    core: Arc<ComponentCore>,
    inner: Arc<Mutex<DemuxInner>>,
    factory: Arc<dyn ParserFactory>,
    waiting_empty: Arc<AtomicBool>,
    worker: Worker,
}

impl DemuxerComponent {
    pub fn new(factory: Arc<dyn ParserFactory>) -> Result<Arc<Self>> {
        let core = Arc::new(ComponentCore::new("demuxer"));
        let inner = Arc::new(Mutex::new(DemuxInner::new()));
        let waiting_empty = Arc::new(AtomicBool::new(false));

        let mut thread = DemuxThread {
            core: Arc::clone(&core),
            inner: Arc::clone(&inner),
            waiting_empty: Arc::clone(&waiting_empty),
            events: Vec::new(),
        };
        let worker = Worker::spawn("mpp_demuxer", move || thread.run())?;

        Ok(Arc::new(Self {
            core,
            inner,
            factory,
            waiting_empty,
            worker,
        }))
    }

    /// Stops the worker. Only legal in LOADED.
    pub fn deinit(&self) -> Result<()> {
        self.worker.deinit(&self.core)
    }

    pub fn counters(&self) -> DemuxCounters {
        self.inner.lock().counters
    }

    fn set_content_uri(&self, uri: &str) -> Result<()> {
        let state = self.core.state();
        if !matches!(state, State::Loaded | State::Idle) {
            return Err(MppError::Component(ErrorCode::InvalidState));
        }

        let opened = self.open_parser(uri);
        let mut inner = self.inner.lock();
        inner.release_parser();
        match opened {
            Ok((parser, info)) => {
                inner.rtsp = MediaSource::from_url(uri).is_rtsp();
                inner.video.extra_data = info
                    .video
                    .as_ref()
                    .map(|v| v.extra_data.clone())
                    .filter(|d| !d.is_empty());
                inner.audio.extra_data = info
                    .audio
                    .as_ref()
                    .map(|a| a.extra_data.clone())
                    .filter(|d| !d.is_empty());
                info!(
                    "{} 🎬 demuxer opened {}: video:{} audio:{} duration:{}us",
                    log_ctx(),
                    uri,
                    info.has_video(),
                    info.has_audio(),
                    info.duration_us
                );
                inner.parser = Some(parser);
                inner.media_info = Some(info);
                inner.eos = false;
                inner.buffer_flag_sent = false;
                drop(inner);
                self.core.notify(Event::PortFormatDetected);
                Ok(())
            }
            Err(e) => {
                drop(inner);
                error!("{} ❌ demuxer cannot open {}: {}", log_ctx(), uri, e);
                self.core.notify(Event::Error(ErrorCode::FormatNotDetected));
                Err(MppError::Component(ErrorCode::FormatNotDetected))
            }
        }
    }

    fn open_parser(&self, uri: &str) -> Result<(Box<dyn Parser>, MediaInfo)> {
        let mut parser = self.factory.create(uri)?;
        parser.init()?;
        let info = parser.media_info()?;
        Ok((parser, info))
    }

    fn port_definition(&self, port: u32) -> Result<PortDefinition> {
        let (direction, domain) = match port {
            DEMUX_PORT_AUDIO => (PortDirection::Output, PortDomain::Audio),
            DEMUX_PORT_VIDEO => (PortDirection::Output, PortDomain::Video),
            DEMUX_PORT_CLOCK => (PortDirection::Input, PortDomain::Clock),
            _ => return Err(MppError::Component(ErrorCode::BadParameter)),
        };
        let inner = self.inner.lock();
        let enabled = match port {
            DEMUX_PORT_AUDIO => inner.media_info.as_ref().is_some_and(|i| i.has_audio()),
            DEMUX_PORT_VIDEO => inner.media_info.as_ref().is_some_and(|i| i.has_video()),
            _ => inner.clock.is_bound(),
        };
        Ok(PortDefinition {
            index: port,
            direction,
            domain,
            enabled,
        })
    }
}

impl Component for DemuxerComponent {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn send_command(&self, command: Command) -> Result<()> {
        if !self.worker.is_running() {
            return Err(MppError::Component(ErrorCode::InvalidState));
        }
        if command == Command::Wakeup {
            // Only worth a message while the worker waits for an empty packet.
            if self.waiting_empty.swap(false, Ordering::AcqRel) {
                self.core.post(command);
            }
            return Ok(());
        }
        self.core.post(command);
        Ok(())
    }

    fn get_state(&self) -> State {
        self.core.state()
    }

    fn get_parameter(&self, index: ParamIndex) -> Result<Param> {
        if let ParamIndex::PortDefinition(port) = index {
            return self.port_definition(port).map(Param::PortDefinition);
        }
        let inner = self.inner.lock();
        let info = inner.media_info()?;
        match index {
            ParamIndex::StreamCounts => Ok(Param::StreamCounts {
                audio: info.audio_stream_num,
                video: info.video_stream_num,
            }),
            ParamIndex::ActiveStream(kind) => {
                let index = match kind {
                    TrackKind::Audio => inner.audio.active,
                    TrackKind::Video => inner.video.active,
                };
                Ok(Param::ActiveStream { kind, index })
            }
            ParamIndex::AudioPortFormat => info
                .audio
                .clone()
                .map(Param::AudioPortFormat)
                .ok_or(MppError::Component(ErrorCode::BadParameter)),
            ParamIndex::VideoPortFormat => info
                .video
                .clone()
                .map(Param::VideoPortFormat)
                .ok_or(MppError::Component(ErrorCode::BadParameter)),
            _ => Err(MppError::Component(ErrorCode::Unsupported)),
        }
    }

    fn set_parameter(&self, param: Param) -> Result<()> {
        match param {
            Param::ContentUri(uri) => self.set_content_uri(&uri),
            Param::SkipTrack(kind) => {
                let mut inner = self.inner.lock();
                inner.track(kind).skip = true;
                if let Some(parser) = inner.parser.as_mut() {
                    parser.control(ParserControl::SkipTrack(kind))?;
                }
                info!("{} demuxer skips {:?} track", log_ctx(), kind);
                Ok(())
            }
            Param::ActiveStream { kind, index } => {
                let mut inner = self.inner.lock();
                let streams = inner.media_info().map(|info| match kind {
                    TrackKind::Audio => info.audio_stream_num,
                    TrackKind::Video => info.video_stream_num,
                })?;
                if index >= streams {
                    return Err(MppError::Component(ErrorCode::BadParameter));
                }
                inner.track(kind).active = index;
                Ok(())
            }
            _ => Err(MppError::Component(ErrorCode::Unsupported)),
        }
    }

    fn get_config(&self, _index: ConfigIndex) -> Result<Config> {
        Err(MppError::Component(ErrorCode::Unsupported))
    }

    fn set_config(&self, config: Config) -> Result<()> {
        match config {
            Config::TimePosition(pts) => {
                let mut inner = self.inner.lock();
                let parser = inner
                    .parser
                    .as_mut()
                    .ok_or(MppError::Component(ErrorCode::InvalidState))?;
                parser.seek(pts)?;
                inner.peeked = None;
                info!("{} demuxer seek to {}us", log_ctx(), pts);
                Ok(())
            }
            Config::ClearBuffer => {
                let mut inner = self.inner.lock();
                inner.eos = false;
                inner.buffer_flag_sent = false;
                drop(inner);
                self.core.post(Command::Nops);
                Ok(())
            }
            _ => Err(MppError::Component(ErrorCode::Unsupported)),
        }
    }

    fn bind_request(
        &self,
        port: u32,
        peer: Option<Arc<dyn Component>>,
        peer_port: u32,
    ) -> Result<()> {
        check_bind(
            &self.core,
            &[State::Loaded, State::Idle],
            self.port_direction(port),
            peer.as_ref(),
            peer_port,
        )?;
        let bind = peer
            .as_ref()
            .map(|p| BindInfo::new(p, peer_port))
            .unwrap_or_default();
        debug!("{} demuxer port {} -> {:?}", log_ctx(), port, bind);
        let mut inner = self.inner.lock();
        match port {
            DEMUX_PORT_AUDIO => inner.audio.bind = bind,
            DEMUX_PORT_VIDEO => inner.video.bind = bind,
            _ => inner.clock = bind,
        }
        Ok(())
    }

    fn set_callback(&self, handler: Arc<dyn EventHandler>) {
        self.core.set_callback(handler);
    }

    fn port_direction(&self, port: u32) -> Option<PortDirection> {
        match port {
            DEMUX_PORT_AUDIO | DEMUX_PORT_VIDEO => Some(PortDirection::Output),
            DEMUX_PORT_CLOCK => Some(PortDirection::Input),
            _ => None,
        }
    }
}

impl Drop for DemuxerComponent {
    fn drop(&mut self) {
        self.worker.stop_on_drop(&self.core);
    }
}

struct DemuxThread {
    core: Arc<ComponentCore>,
    inner: Arc<Mutex<DemuxInner>>,
    waiting_empty: Arc<AtomicBool>,
    /// Events raised under the lock, delivered after it is released.
    events: Vec<Event>,
}

impl DemuxThread {
    fn run(&mut self) {
        info!("{} demuxer thread start", log_ctx());
        loop {
            while let Some(msg) = self.core.messages().get() {
                match msg.command {
                    Command::StateSet(target) => self.state_set(target),
                    Command::Stop => {
                        let counters = self.inner.lock().counters;
                        info!(
                            "{} ⏹ demuxer thread exit: video:{} audio:{} get_ok:{} put_ok:{} put_fail:{}",
                            log_ctx(),
                            counters.video_packets,
                            counters.audio_packets,
                            counters.get_ok,
                            counters.put_ok,
                            counters.put_fail
                        );
                        return;
                    }
                    other => debug!("{} demuxer ignores {:?}", log_ctx(), other),
                }
            }

            if self.core.state() != State::Executing {
                self.core.messages().wait_new_msg(0);
                continue;
            }

            let shared = Arc::clone(&self.inner);
            let step = {
                let mut inner = shared.lock();
                self.step(&mut inner)
            };
            for event in self.events.drain(..) {
                self.core.notify(event);
            }
            match step {
                Step::Ok => {}
                Step::EmptyData | Step::Idle => {
                    self.core.messages().wait_new_msg(0);
                }
                Step::ReadFailed | Step::Retry => {
                    self.core.messages().wait_new_msg(PARSER_RETRY_US);
                }
            }
        }
    }

    fn state_set(&mut self, target: State) {
        let inner = Arc::clone(&self.inner);
        handle_state_set(&self.core, target, |from, to| {
            let mut inner = inner.lock();
            match to {
                State::Idle if from == State::Loaded && inner.parser.is_none() => {
                    warn!("{} demuxer has no parser, content uri not set", log_ctx());
                    Err(ErrorCode::InsufficientResources)
                }
                State::Executing if from == State::Idle && inner.parser.is_none() => {
                    Err(ErrorCode::InsufficientResources)
                }
                State::Loaded => {
                    inner.eos = false;
                    inner.buffer_flag_sent = false;
                    inner.audio.skip = false;
                    inner.video.skip = false;
                    inner.release_parser();
                    Ok(())
                }
                _ => Ok(()),
            }
        });
    }

    fn step(&mut self, inner: &mut DemuxInner) -> Step {
        if inner.eos {
            if !inner.buffer_flag_sent {
                inner.buffer_flag_sent = true;
                self.events.push(Event::BufferFlag);
            }
            return Step::Idle;
        }

        let info = match inner.peeked {
            Some(info) => info,
            None => match self.peek(inner) {
                Some(info) => info,
                None if inner.eos => return Step::Ok,
                None => return Step::Retry,
            },
        };

        let kind = match info.media_type {
            MediaType::Video => TrackKind::Video,
            MediaType::Audio => TrackKind::Audio,
            MediaType::Other => {
                discard(inner);
                return Step::Ok;
            }
        };
        if inner.track(kind).skip {
            discard(inner);
            return Step::Ok;
        }
        self.process_packet(inner, kind, info)
    }

    /// Peeks the next packet. `None` on end of stream or parser error.
    fn peek(&mut self, inner: &mut DemuxInner) -> Option<PacketInfo> {
        let parser = inner.parser.as_mut()?;
        match parser.peek() {
            Ok(PeekResult::Packet(info)) => {
                match info.media_type {
                    MediaType::Video => inner.counters.video_packets += 1,
                    MediaType::Audio => inner.counters.audio_packets += 1,
                    MediaType::Other => {}
                }
                inner.peeked = Some(info);
                Some(info)
            }
            Ok(PeekResult::Eos) => {
                info!("{} demuxer reached end of stream", log_ctx());
                inner.eos = true;
                for track in [&inner.audio, &inner.video] {
                    if track.skip {
                        continue;
                    }
                    if let Some(peer) = track.bind.peer() {
                        if let Err(e) = peer.send_command(Command::Eos) {
                            warn!("{} EOS to {} failed: {}", log_ctx(), peer.name(), e);
                        }
                    }
                }
                None
            }
            Err(e) => {
                warn!("{} ⚠ demuxer peek failed: {}", log_ctx(), e);
                None
            }
        }
    }

    fn process_packet(&mut self, inner: &mut DemuxInner, kind: TrackKind, info: PacketInfo) -> Step {
        let rtsp = inner.rtsp;
        let bind = inner.track(kind).bind.clone();
        let Some(peer) = bind.peer() else {
            // Nobody consumes this track.
            discard(inner);
            return Step::Ok;
        };
        let Some(pool) = peer.packet_pool(bind.peer_port()) else {
            discard(inner);
            return Step::Ok;
        };

        if let Some(extra) = inner.track(kind).extra_data.take() {
            return match self.dequeue_empty(&pool, extra.len()) {
                Some(mut packet) => {
                    packet.data.extend_from_slice(&extra);
                    packet.media_type = info.media_type;
                    packet.pts = 0;
                    packet.flags = if rtsp {
                        BufferFlags::NONE
                    } else {
                        BufferFlags::EXTRA_DATA
                    };
                    pool.enqueue_ready_packet(packet);
                    debug!("{} demuxer sent {:?} extra data ({} bytes)", log_ctx(), kind, extra.len());
                    wake(&*peer);
                    Step::Ok
                }
                None => {
                    inner.track(kind).extra_data = Some(extra);
                    Step::EmptyData
                }
            };
        }

        let Some(mut packet) = self.dequeue_empty(&pool, info.size) else {
            return Step::EmptyData;
        };
        inner.counters.get_ok += 1;

        let Some(parser) = inner.parser.as_mut() else {
            pool.enqueue_empty_packet(packet);
            return Step::Idle;
        };
        if let Err(e) = parser.read(&mut packet) {
            error!("{} ❌ demuxer read failed: {}", log_ctx(), e);
            pool.enqueue_empty_packet(packet);
            inner.counters.put_fail += 1;
            return Step::ReadFailed;
        }
        packet.media_type = info.media_type;
        inner.peeked = None;

        let n = inner.counters.put_ok;
        if n < LOG_FIRST_PACKETS || n % 100 == 0 {
            debug!(
                "{} demuxer packet #{} {:?} size:{} pts:{} flags:{:#x}",
                log_ctx(),
                n,
                kind,
                packet.size(),
                packet.pts,
                packet.flags.bits()
            );
        }
        pool.enqueue_ready_packet(packet);
        inner.counters.put_ok += 1;
        wake(&*peer);
        Step::Ok
    }

    /// Arms the wake flag before trying the pool so a decoder's WKUP sent
    /// between the failed dequeue and the sleep is never lost.
    fn dequeue_empty(&self, pool: &PacketPool, size: usize) -> Option<Packet> {
        self.waiting_empty.store(true, Ordering::Release);
        let packet = pool.dequeue_empty_packet(size);
        if packet.is_some() {
            self.waiting_empty.store(false, Ordering::Release);
        }
        packet
    }
}

fn wake(peer: &dyn Component) {
    if let Err(e) = peer.send_command(Command::Wakeup) {
        debug!("{} wake {} failed: {}", log_ctx(), peer.name(), e);
    }
}

/// Consumes the peeked packet without delivering it.
fn discard(inner: &mut DemuxInner) {
    if let Some(parser) = inner.parser.as_mut() {
        if let Err(e) = parser.read(&mut inner.scratch) {
            warn!("{} demuxer discard read failed: {}", log_ctx(), e);
        }
    }
    inner.scratch.reset();
    inner.peeked = None;
}
