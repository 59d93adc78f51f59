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
    AudioFrame, DecoderConfig, ErrorCode, MediaType, MppError, Result, VideoFrame,
};
use crate::decoder::pool::{FramePool, PacketPool};
use crate::decoder::{DecodeStatus, Decoder, DecoderControl, FrameKind};

pub const DEC_PORT_IN: u32 = 0;
pub const DEC_PORT_OUT: u32 = 1;

const LOG_FIRST_FRAMES: u64 = 5;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecoderCounters {
    pub decode_ok: u64,
    pub decode_fail: u64,
}

#[derive(Default)]
struct Binds {
    input: BindInfo,
    output: BindInfo,
}

/// Wraps a [`Decoder`] adapter in a component with an input packet port and
/// an output frame port.
pub struct DecoderComponent<D: Decoder> {
    core: Arc<ComponentCore>,
    binds: Arc<Mutex<Binds>>,
    counters: Arc<Mutex<DecoderCounters>>,
    packets: Arc<PacketPool>,
    frames: Arc<FramePool<D::Frame>>,
    waiting: Arc<AtomicBool>,
    worker: Worker,
}

impl<D: Decoder> DecoderComponent<D> {
    pub fn new(name: impl Into<String>, mut decoder: D, config: &DecoderConfig) -> Result<Arc<Self>> {
        decoder.init(config)?;
        let packets = decoder
            .packet_pool()
            .ok_or(MppError::Component(ErrorCode::NullPointer))?;
        let frames = decoder
            .frame_pool()
            .ok_or(MppError::Component(ErrorCode::NullPointer))?;

        let core = Arc::new(ComponentCore::new(name));
        let waker_core = Arc::clone(&core);
        decoder.set_waker(Arc::new(move || waker_core.post(Command::Wakeup)));

        let binds = Arc::new(Mutex::new(Binds::default()));
        let counters = Arc::new(Mutex::new(DecoderCounters::default()));
        let waiting = Arc::new(AtomicBool::new(false));

        let mut thread = DecodeThread {
            core: Arc::clone(&core),
            decoder,
            binds: Arc::clone(&binds),
            counters: Arc::clone(&counters),
            packets: Arc::clone(&packets),
            waiting: Arc::clone(&waiting),
            eos_received: false,
            eos_forwarded: false,
        };
        let thread_name = format!("mpp_{}", core.name());
        let worker = Worker::spawn(&thread_name, move || thread.run())?;

        Ok(Arc::new(Self {
            core,
            binds,
            counters,
            packets,
            frames,
            waiting,
            worker,
        }))
    }

    pub fn deinit(&self) -> Result<()> {
        self.worker.deinit(&self.core)
    }

    pub fn counters(&self) -> DecoderCounters {
        *self.counters.lock()
    }

    fn port_definition(&self, port: u32) -> Result<PortDefinition> {
        let direction = self
            .port_direction(port)
            .ok_or(MppError::Component(ErrorCode::BadParameter))?;
        let domain = match <D::Frame as FrameKind>::MEDIA {
            MediaType::Audio => PortDomain::Audio,
            _ => PortDomain::Video,
        };
        let binds = self.binds.lock();
        let enabled = match port {
            DEC_PORT_IN => binds.input.is_bound(),
            _ => binds.output.is_bound(),
        };
        Ok(PortDefinition {
            index: port,
            direction,
            domain,
            enabled,
        })
    }
}

impl<D: Decoder> Component for DecoderComponent<D> {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn send_command(&self, command: Command) -> Result<()> {
        if !self.worker.is_running() {
            return Err(MppError::Component(ErrorCode::InvalidState));
        }
        if command == Command::Wakeup {
            if self.waiting.swap(false, Ordering::AcqRel) {
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
        match index {
            ParamIndex::PortDefinition(port) => self.port_definition(port).map(Param::PortDefinition),
            _ => Err(MppError::Component(ErrorCode::Unsupported)),
        }
    }

    fn set_parameter(&self, _param: Param) -> Result<()> {
        Err(MppError::Component(ErrorCode::Unsupported))
    }

    fn get_config(&self, _index: ConfigIndex) -> Result<Config> {
        Err(MppError::Component(ErrorCode::Unsupported))
    }

    fn set_config(&self, config: Config) -> Result<()> {
        match config {
            // Seek: drop everything queued on both ports.
            Config::TimePosition(_) | Config::ClearBuffer => self.send_command(Command::Flush),
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
            &[State::Loaded],
            self.port_direction(port),
            peer.as_ref(),
            peer_port,
        )?;
        let bind = peer
            .as_ref()
            .map(|p| BindInfo::new(p, peer_port))
            .unwrap_or_default();
        debug!("{} {} port {} -> {:?}", log_ctx(), self.core.name(), port, bind);
        let mut binds = self.binds.lock();
        match port {
            DEC_PORT_IN => binds.input = bind,
            _ => binds.output = bind,
        }
        Ok(())
    }

    fn set_callback(&self, handler: Arc<dyn EventHandler>) {
        self.core.set_callback(handler);
    }

    fn port_direction(&self, port: u32) -> Option<PortDirection> {
        match port {
            DEC_PORT_IN => Some(PortDirection::Input),
            DEC_PORT_OUT => Some(PortDirection::Output),
            _ => None,
        }
    }

    fn packet_pool(&self, port: u32) -> Option<Arc<PacketPool>> {
        (port == DEC_PORT_IN).then(|| Arc::clone(&self.packets))
    }

    fn video_frame_pool(&self, port: u32) -> Option<Arc<FramePool<VideoFrame>>> {
        if port != DEC_PORT_OUT {
            return None;
        }
        <D::Frame as FrameKind>::video_pool(&self.frames)
    }

    fn audio_frame_pool(&self, port: u32) -> Option<Arc<FramePool<AudioFrame>>> {
        if port != DEC_PORT_OUT {
            return None;
        }
        <D::Frame as FrameKind>::audio_pool(&self.frames)
    }
}

impl<D: Decoder> Drop for DecoderComponent<D> {
    fn drop(&mut self) {
        self.worker.stop_on_drop(&self.core);
    }
}

struct DecodeThread<D: Decoder> {
    core: Arc<ComponentCore>,
    decoder: D,
    binds: Arc<Mutex<Binds>>,
    counters: Arc<Mutex<DecoderCounters>>,
    packets: Arc<PacketPool>,
    waiting: Arc<AtomicBool>,
    eos_received: bool,
    /// EOS already pushed downstream in this epoch.
    eos_forwarded: bool,
}

impl<D: Decoder> DecodeThread<D> {
    fn run(&mut self) {
        info!("{} {} thread start ({})", log_ctx(), self.core.name(), self.decoder.name());
        loop {
            while let Some(msg) = self.core.messages().get() {
                match msg.command {
                    Command::StateSet(target) => self.state_set(target),
                    Command::Flush => self.flush(),
                    Command::Eos => {
                        debug!("{} {} got EOS", log_ctx(), self.core.name());
                        self.eos_received = true;
                    }
                    Command::Stop => {
                        let counters = *self.counters.lock();
                        info!(
                            "{} ⏹ {} thread exit: decode_ok:{} decode_fail:{}",
                            log_ctx(),
                            self.core.name(),
                            counters.decode_ok,
                            counters.decode_fail
                        );
                        return;
                    }
                    Command::Nops | Command::Wakeup => {}
                }
            }

            if self.core.state() != State::Executing {
                self.core.messages().wait_new_msg(0);
                continue;
            }

            // Armed before decoding so a WKUP racing the result is kept.
            self.waiting.store(true, Ordering::Release);
            // Sampled before decoding: an EOS packet queued after this point
            // must be decoded before the stream can end.
            let ended = self.stream_end();
            let status = self.decoder.decode();
            match status {
                DecodeStatus::Ok => {
                    self.waiting.store(false, Ordering::Release);
                    let n = {
                        let mut counters = self.counters.lock();
                        counters.decode_ok += 1;
                        counters.decode_ok
                    };
                    if n <= LOG_FIRST_FRAMES || n % 100 == 0 {
                        debug!("{} {} decoded #{}", log_ctx(), self.core.name(), n);
                    }
                    self.wake_peers();
                }
                DecodeStatus::NoReadyPacket => {
                    self.wake(|b| &b.input);
                    if ended && self.packets.ready_num() == 0 {
                        self.finish_stream();
                    }
                    self.core.messages().wait_new_msg(0);
                }
                DecodeStatus::NoEmptyFrame | DecodeStatus::NoRenderFrame => {
                    self.core.messages().wait_new_msg(0);
                }
                DecodeStatus::NotSupported => {
                    self.waiting.store(false, Ordering::Release);
                    self.counters.lock().decode_fail += 1;
                    warn!("{} ⚠ {} dropped an undecodable packet", log_ctx(), self.core.name());
                    self.wake(|b| &b.input);
                }
                DecodeStatus::NullPointer => {
                    error!("{} ❌ {} decoder not initialised", log_ctx(), self.core.name());
                    self.core.notify(Event::Error(ErrorCode::NullPointer));
                    self.core.messages().wait_new_msg(0);
                }
            }
        }
    }

    fn stream_end(&self) -> bool {
        self.eos_received || self.packets.is_stream_end()
    }

    fn finish_stream(&mut self) {
        if self.eos_forwarded {
            return;
        }
        self.eos_forwarded = true;
        if let Err(e) = self.decoder.control(DecoderControl::EndOfStream) {
            warn!("{} {} end of stream control failed: {}", log_ctx(), self.core.name(), e);
        }
        let output = self.binds.lock().output.peer();
        if let Some(peer) = output {
            if let Err(e) = peer.send_command(Command::Eos) {
                warn!("{} EOS to {} failed: {}", log_ctx(), peer.name(), e);
            }
        }
        info!("{} {} end of stream", log_ctx(), self.core.name());
        self.core.notify(Event::BufferFlag);
    }

    fn flush(&mut self) {
        if let Err(e) = self.decoder.control(DecoderControl::Flush) {
            warn!("{} {} flush control failed: {}", log_ctx(), self.core.name(), e);
        }
        self.decoder.reset();
        self.eos_received = false;
        self.eos_forwarded = false;
        debug!("{} {} flushed", log_ctx(), self.core.name());
        self.core.notify(Event::CmdComplete(Command::Flush));
        // Freed packet slots may unblock the demuxer.
        self.wake(|b| &b.input);
    }

    fn state_set(&mut self, target: State) {
        let decoder = &mut self.decoder;
        let mut reset_epoch = false;
        handle_state_set(&self.core, target, |from, to| {
            if to == State::Loaded && from == State::Idle {
                decoder.reset();
                reset_epoch = true;
            }
            Ok(())
        });
        if reset_epoch {
            self.eos_received = false;
            self.eos_forwarded = false;
        }
    }

    fn wake_peers(&self) {
        self.wake(|b| &b.output);
        self.wake(|b| &b.input);
    }

    fn wake(&self, pick: impl Fn(&Binds) -> &BindInfo) {
        let peer = pick(&self.binds.lock()).peer();
        if let Some(peer) = peer {
            if let Err(e) = peer.send_command(Command::Wakeup) {
                debug!("{} wake {} failed: {}", log_ctx(), peer.name(), e);
            }
        }
    }
}
