use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::state::{check_bind, handle_state_set, log_ctx, ComponentCore, Worker};
use super::sync::{classify, delay_wait, frame_delay, SyncAction};
use super::{
    BindInfo, CaptureRequest, ClockState, Command, Component, Config, ConfigIndex, Event,
    EventHandler, Param, ParamIndex, PortDefinition, PortDirection, PortDomain, State,
};
use crate::core::{
    ErrorCode, MediaClock, MppError, RenderConfig, Result, Rotation, VideoFrame,
};
use crate::decoder::pool::FramePool;
use crate::render::capture::capture_frame;
use crate::render::{DisplayFactory, GraphicsFactory, RotationEngine, VideoRender};

pub const RENDER_PORT_VIDEO: u32 = 0;
pub const RENDER_PORT_CLOCK: u32 = 1;

/// Longest single wait for a decoded frame.
const WAIT_FRAME_INTERVAL_US: u64 = 10_000_000;
/// Starved this long without EOS, the stream is considered finished.
const WAIT_FRAME_MAX: Duration = Duration::from_secs(8);
/// Retry interval while the clock has not started.
const CLOCK_RETRY_US: u64 = 10_000;
/// Retry interval while the display device cannot be opened.
const DEVICE_RETRY_US: u64 = 100_000;
const LOG_FIRST_FRAMES: u64 = 5;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RenderCounters {
    pub receive: u64,
    pub show_ok: u64,
    pub show_fail: u64,
    pub giveback_ok: u64,
    pub giveback_fail: u64,
    pub drop: u64,
    pub disp_frame_num: u64,
}

enum Step {
    Ok,
    /// Sleep on the queue; 0 waits for the next command.
    Wait(u64),
}

/// Frame fetched from the decoder but not yet displayed.
struct Held {
    frame: VideoFrame,
    show_at: Option<Instant>,
}

struct RenderInner {
    config: RenderConfig,
    display: Arc<dyn DisplayFactory>,
    graphics: Option<Arc<dyn GraphicsFactory>>,
    device: Option<Box<dyn VideoRender>>,
    rotator: Option<RotationEngine>,
    angle_change: bool,
    video: BindInfo,
    clock: BindInfo,
    clock_state: ClockState,
    media_clock: MediaClock,
    first_shown: bool,
    cur: Option<Held>,
    /// Frame currently on screen; returned once its successor is fetched.
    last: Option<VideoFrame>,
    frame_end: bool,
    all_sent: bool,
    buffer_flag_sent: bool,
    wait_start: Option<Instant>,
    /// Device open failed and the error has been reported.
    device_failed: bool,
    counters: RenderCounters,
}

impl RenderInner {
    fn video_pool(&self) -> Option<Arc<FramePool<VideoFrame>>> {
        let peer = self.video.peer()?;
        peer.video_frame_pool(self.video.peer_port())
    }

    fn ensure_device(&mut self) -> Result<()> {
        if self.device.is_some() {
            return Ok(());
        }
        let mut device = self.display.create()?;
        device.init(self.config.layer_id, self.config.dev_id)?;
        if let Some(rect) = self.config.display_rect {
            device.set_dis_rect(rect)?;
        }
        info!(
            "{} 🎬 render device ready: layer {}, dev {}",
            log_ctx(),
            self.config.layer_id,
            self.config.dev_id
        );
        self.device = Some(device);
        Ok(())
    }

    fn give_back(&mut self, frame: VideoFrame) {
        let Some(pool) = self.video_pool() else {
            self.counters.giveback_fail += 1;
            warn!("{} ⚠ frame {} has no pool to return to", log_ctx(), frame.id);
            return;
        };
        pool.render_put_frame(frame);
        self.counters.giveback_ok += 1;
        if let Some(peer) = self.video.peer() {
            if let Err(e) = peer.send_command(Command::Wakeup) {
                debug!("{} wake {} failed: {}", log_ctx(), peer.name(), e);
            }
        }
    }

    fn give_back_all(&mut self) {
        if let Some(held) = self.cur.take() {
            self.give_back(held.frame);
        }
        if let Some(frame) = self.last.take() {
            self.give_back(frame);
        }
    }

    /// Back to "nothing shown yet" for a new stream epoch.
    fn reset_playback(&mut self) {
        self.give_back_all();
        self.first_shown = false;
        self.frame_end = false;
        self.all_sent = false;
        self.buffer_flag_sent = false;
        self.wait_start = None;
    }

    /// External clock time when it is valid, else the self-timed curve.
    fn media_time(&self, now: Instant) -> i64 {
        if let Some(peer) = self.clock.peer() {
            if let Ok(Config::CurrentTime(time)) = peer.get_config(ConfigIndex::CurrentTime) {
                if time >= 0 {
                    return time;
                }
            }
        }
        self.media_clock.media_time(now)
    }

    fn render(&mut self, frame: &VideoFrame) -> Result<()> {
        let rotation = self.config.rotation;
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| MppError::Render("no render device".into()))?;
        if rotation == Rotation::Deg0 {
            return device.rend(frame);
        }

        if self.angle_change {
            self.rotator = None;
            self.angle_change = false;
        }
        if self.rotator.is_none() {
            let graphics = self
                .graphics
                .as_ref()
                .ok_or_else(|| MppError::Render("rotation needs a graphics engine".into()))?;
            self.rotator = Some(RotationEngine::open(graphics.as_ref())?);
        }
        let rotator = self
            .rotator
            .as_mut()
            .ok_or_else(|| MppError::Render("rotation engine unavailable".into()))?;
        let rotated = rotator.rotate(frame, rotation)?;
        device.rend(&rotated)
    }

    fn capture(&self, request: &CaptureRequest) -> Result<()> {
        let graphics = self
            .graphics
            .as_ref()
            .ok_or_else(|| MppError::Render("capture needs a graphics engine".into()))?;
        let frame = self
            .last
            .as_ref()
            .or(self.cur.as_ref().map(|h| &h.frame))
            .ok_or_else(|| MppError::Render("no frame to capture".into()))?;
        capture_frame(
            graphics.as_ref(),
            frame,
            request.width,
            request.height,
            request.quality,
            &request.path,
        )
    }
}

/// Pulls frames from a bound video decoder, syncs them against a clock
/// and shows them on a display device.
pub struct VideoRenderComponent {
    core: Arc<ComponentCore>,
    inner: Arc<Mutex<RenderInner>>,
    wait_ready_frame: Arc<AtomicBool>,
    worker: Worker,
}

impl VideoRenderComponent {
    pub fn new(
        display: Arc<dyn DisplayFactory>,
        graphics: Option<Arc<dyn GraphicsFactory>>,
        config: RenderConfig,
    ) -> Result<Arc<Self>> {
        let core = Arc::new(ComponentCore::new("video_render"));
        let inner = Arc::new(Mutex::new(RenderInner {
            config,
            display,
            graphics,
            device: None,
            rotator: None,
            angle_change: false,
            video: BindInfo::default(),
            clock: BindInfo::default(),
            clock_state: ClockState::Stopped,
            media_clock: MediaClock::new(),
            first_shown: false,
            cur: None,
            last: None,
            frame_end: false,
            all_sent: false,
            device_failed: false,
            buffer_flag_sent: false,
            wait_start: None,
            counters: RenderCounters::default(),
        }));
        let wait_ready_frame = Arc::new(AtomicBool::new(false));

        let mut thread = RenderThread {
            core: Arc::clone(&core),
            inner: Arc::clone(&inner),
            wait_ready_frame: Arc::clone(&wait_ready_frame),
            events: Vec::new(),
        };
        let worker = Worker::spawn("mpp_video_render", move || thread.run())?;

        Ok(Arc::new(Self {
            core,
            inner,
            wait_ready_frame,
            worker,
        }))
    }

    pub fn deinit(&self) -> Result<()> {
        self.worker.deinit(&self.core)
    }

    pub fn counters(&self) -> RenderCounters {
        self.inner.lock().counters
    }

    fn port_definition(&self, port: u32) -> Result<PortDefinition> {
        let direction = self
            .port_direction(port)
            .ok_or(MppError::Component(ErrorCode::BadParameter))?;
        let inner = self.inner.lock();
        let (domain, enabled) = match port {
            RENDER_PORT_VIDEO => (PortDomain::Video, inner.video.is_bound()),
            _ => (PortDomain::Clock, inner.clock.is_bound()),
        };
        Ok(PortDefinition {
            index: port,
            direction,
            domain,
            enabled,
        })
    }
}

impl Component for VideoRenderComponent {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn send_command(&self, command: Command) -> Result<()> {
        if !self.worker.is_running() {
            return Err(MppError::Component(ErrorCode::InvalidState));
        }
        if command == Command::Wakeup {
            if self.wait_ready_frame.swap(false, Ordering::AcqRel) {
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
        let undefined = MppError::Component(ErrorCode::Undefined);
        match index {
            ParamIndex::CropRect => inner
                .last
                .as_ref()
                .map(|f| Param::CropRect(f.buf.visible_rect()))
                .ok_or(undefined),
            ParamIndex::ScreenSize => {
                let device = inner.device.as_ref().ok_or(undefined)?;
                device
                    .screen_size()
                    .map(Param::ScreenSize)
                    .map_err(|_| MppError::Component(ErrorCode::Undefined))
            }
            ParamIndex::DisplayRect => match inner.device.as_ref() {
                Some(device) => device.dis_rect().map(Param::DisplayRect),
                None => inner
                    .config
                    .display_rect
                    .map(Param::DisplayRect)
                    .ok_or(undefined),
            },
            _ => Err(MppError::Component(ErrorCode::Unsupported)),
        }
    }

    fn set_parameter(&self, param: Param) -> Result<()> {
        match param {
            Param::DisplayRect(rect) => {
                let mut inner = self.inner.lock();
                if let Some(device) = inner.device.as_mut() {
                    device
                        .set_dis_rect(rect)
                        .map_err(|_| MppError::Component(ErrorCode::BadParameter))?;
                }
                inner.config.display_rect = Some(rect);
                debug!("{} display rect {:?}", log_ctx(), rect);
                Ok(())
            }
            _ => Err(MppError::Component(ErrorCode::Unsupported)),
        }
    }

    fn get_config(&self, index: ConfigIndex) -> Result<Config> {
        let inner = self.inner.lock();
        match index {
            ConfigIndex::Rotation => Ok(Config::Rotation(inner.config.rotation)),
            ConfigIndex::ClockState => Ok(Config::ClockState(inner.clock_state)),
            ConfigIndex::CurrentTime => {
                let time = if inner.first_shown {
                    inner.media_clock.media_time(Instant::now())
                } else {
                    -1
                };
                Ok(Config::CurrentTime(time))
            }
        }
    }

    fn set_config(&self, config: Config) -> Result<()> {
        match config {
            Config::TimePosition(pts) => {
                self.inner.lock().reset_playback();
                info!("{} render reset for seek to {}us", log_ctx(), pts);
                self.core.post(Command::Nops);
                Ok(())
            }
            Config::ClockState(state) => {
                self.inner.lock().clock_state = state;
                debug!("{} clock state {:?}", log_ctx(), state);
                self.core.post(Command::Nops);
                Ok(())
            }
            Config::RenderInit => self.inner.lock().ensure_device().map_err(|e| {
                error!("{} ❌ render init failed: {}", log_ctx(), e);
                MppError::Component(ErrorCode::InsufficientResources)
            }),
            Config::Capture(request) => {
                if self.core.state() != State::Pause {
                    return Err(MppError::Component(ErrorCode::InvalidState));
                }
                self.inner.lock().capture(&request).map_err(|e| {
                    error!("{} ❌ capture failed: {}", log_ctx(), e);
                    MppError::Component(ErrorCode::Undefined)
                })
            }
            Config::Rotation(rotation) => {
                let mut inner = self.inner.lock();
                if inner.config.rotation != rotation {
                    info!("{} rotation {} -> {}", log_ctx(), inner.config.rotation.degrees(), rotation.degrees());
                    inner.config.rotation = rotation;
                    inner.angle_change = true;
                }
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
            &[State::Loaded],
            self.port_direction(port),
            peer.as_ref(),
            peer_port,
        )?;
        let bind = peer
            .as_ref()
            .map(|p| BindInfo::new(p, peer_port))
            .unwrap_or_default();
        debug!("{} video_render port {} -> {:?}", log_ctx(), port, bind);
        let mut inner = self.inner.lock();
        match port {
            RENDER_PORT_VIDEO => inner.video = bind,
            _ => inner.clock = bind,
        }
        Ok(())
    }

    fn set_callback(&self, handler: Arc<dyn EventHandler>) {
        self.core.set_callback(handler);
    }

    fn port_direction(&self, port: u32) -> Option<PortDirection> {
        match port {
            RENDER_PORT_VIDEO | RENDER_PORT_CLOCK => Some(PortDirection::Input),
            _ => None,
        }
    }
}

impl Drop for VideoRenderComponent {
    fn drop(&mut self) {
        self.worker.stop_on_drop(&self.core);
    }
}

struct RenderThread {
    core: Arc<ComponentCore>,
    inner: Arc<Mutex<RenderInner>>,
    wait_ready_frame: Arc<AtomicBool>,
    events: Vec<Event>,
}

impl RenderThread {
    fn run(&mut self) {
        info!("{} video render thread start", log_ctx());
        loop {
            while let Some(msg) = self.core.messages().get() {
                match msg.command {
                    Command::StateSet(target) => self.state_set(target),
                    Command::Flush => {
                        self.inner.lock().reset_playback();
                        self.core.notify(Event::CmdComplete(Command::Flush));
                    }
                    Command::Eos => {
                        debug!("{} video render got EOS", log_ctx());
                        self.inner.lock().frame_end = true;
                    }
                    Command::Stop => {
                        let c = self.inner.lock().counters;
                        info!(
                            "{} ⏹ video render exit: receive:{} show_ok:{} show_fail:{} drop:{} giveback_ok:{} giveback_fail:{}",
                            log_ctx(),
                            c.receive,
                            c.show_ok,
                            c.show_fail,
                            c.drop,
                            c.giveback_ok,
                            c.giveback_fail
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

            let shared = Arc::clone(&self.inner);
            let step = {
                let mut inner = shared.lock();
                self.step(&mut inner)
            };
            for event in self.events.drain(..) {
                self.core.notify(event);
            }
            if let Step::Wait(us) = step {
                self.core.messages().wait_new_msg(us);
            }
        }
    }

    fn state_set(&mut self, target: State) {
        let inner = Arc::clone(&self.inner);
        handle_state_set(&self.core, target, |from, to| {
            let mut inner = inner.lock();
            let now = Instant::now();
            match (from, to) {
                (State::Executing, State::Pause) => inner.media_clock.pause(now),
                (State::Pause, State::Executing) => {
                    inner.media_clock.resume(now);
                    inner.wait_start = None;
                }
                (State::Executing | State::Pause, State::Idle) => inner.reset_playback(),
                (State::Idle, State::Loaded) => {
                    inner.rotator = None;
                    inner.device = None;
                }
                _ => {}
            }
            Ok(())
        });
    }

    fn step(&mut self, inner: &mut RenderInner) -> Step {
        if inner.all_sent {
            if !inner.buffer_flag_sent {
                inner.buffer_flag_sent = true;
                info!(
                    "{} video render all frames sent, shown {}",
                    log_ctx(),
                    inner.counters.show_ok
                );
                self.events.push(Event::BufferFlag);
            }
            return Step::Wait(0);
        }

        if inner.cur.is_none() {
            if let Some(step) = self.fetch(inner) {
                return step;
            }
        }
        let Some(held) = inner.cur.take() else {
            return Step::Ok;
        };

        if !inner.first_shown {
            return self.show_first(inner, held);
        }

        let now = Instant::now();
        if let Some(at) = held.show_at {
            if now < at {
                let remaining = at.duration_since(now).as_micros().max(1) as u64;
                inner.cur = Some(held);
                return Step::Wait(remaining);
            }
            self.show(inner, held.frame);
            return Step::Ok;
        }

        let frame = held.frame;
        let (delay, jumped) = frame_delay(frame.pts, inner.media_time(now));
        if jumped {
            warn!(
                "{} ⚠ pts jump at {}us (previous {}us), clock re-anchored",
                log_ctx(),
                frame.pts,
                inner.media_clock.pre_frame_pts()
            );
            inner.media_clock.reset(frame.pts, now);
        }

        match classify(delay) {
            SyncAction::Delay(delay) => {
                let wait = delay_wait(delay);
                inner.cur = Some(Held {
                    frame,
                    show_at: Some(now + wait),
                });
                Step::Wait((wait.as_micros() as u64).max(1))
            }
            SyncAction::Show => {
                self.show(inner, frame);
                Step::Ok
            }
            SyncAction::Drop => {
                inner.counters.drop += 1;
                debug!("{} drop frame pts {} late by {}us", log_ctx(), frame.pts, -delay);
                if frame.flags.is_eos() {
                    inner.all_sent = true;
                }
                inner.give_back(frame);
                Step::Ok
            }
        }
    }

    /// Takes the next decoded frame into `cur`. Returns a step when there
    /// is nothing to show.
    fn fetch(&mut self, inner: &mut RenderInner) -> Option<Step> {
        let Some(pool) = inner.video_pool() else {
            return Some(Step::Wait(0));
        };
        self.wait_ready_frame.store(true, Ordering::Release);
        match pool.render_get_frame() {
            Some(frame) => {
                self.wait_ready_frame.store(false, Ordering::Release);
                inner.wait_start = None;
                inner.counters.receive += 1;
                let n = inner.counters.receive;
                if n <= LOG_FIRST_FRAMES || n % 100 == 0 {
                    debug!(
                        "{} video render frame #{} id:{} pts:{}",
                        log_ctx(),
                        n,
                        frame.id,
                        frame.pts
                    );
                }
                if inner.counters.disp_frame_num > 0 {
                    if let Some(last) = inner.last.take() {
                        inner.give_back(last);
                    }
                }
                inner.cur = Some(Held {
                    frame,
                    show_at: None,
                });
                None
            }
            None => {
                if inner.frame_end {
                    inner.all_sent = true;
                    return Some(Step::Ok);
                }
                let now = Instant::now();
                let start = *inner.wait_start.get_or_insert(now);
                if now.duration_since(start) >= WAIT_FRAME_MAX {
                    warn!(
                        "{} ⚠ no frame for {:?}, treating stream as finished",
                        log_ctx(),
                        WAIT_FRAME_MAX
                    );
                    inner.all_sent = true;
                    return Some(Step::Ok);
                }
                if let Some(peer) = inner.video.peer() {
                    if let Err(e) = peer.send_command(Command::Nops) {
                        debug!("{} nudge {} failed: {}", log_ctx(), peer.name(), e);
                    }
                }
                Some(Step::Wait(WAIT_FRAME_INTERVAL_US))
            }
        }
    }

    fn show_first(&mut self, inner: &mut RenderInner, held: Held) -> Step {
        let frame = held.frame;
        if let Err(e) = inner.ensure_device() {
            inner.counters.show_fail += 1;
            if !inner.device_failed {
                inner.device_failed = true;
                error!("{} ❌ render device unavailable: {}", log_ctx(), e);
                self.events.push(Event::Error(ErrorCode::InsufficientResources));
            }
            if frame.flags.is_eos() {
                inner.all_sent = true;
            }
            inner.give_back(frame);
            // Bounded: decoder wake-ups are not armed while a frame is held.
            return Step::Wait(DEVICE_RETRY_US);
        }
        inner.device_failed = false;

        if let Some(clock) = inner.clock.peer() {
            let start = Config::ClientStartTime {
                port: inner.clock.peer_port(),
                pts: frame.pts,
            };
            if let Err(e) = clock.set_config(start) {
                warn!("{} ⚠ start time to {} failed: {}", log_ctx(), clock.name(), e);
            }
            if inner.clock_state != ClockState::Running {
                inner.cur = Some(held);
                return Step::Wait(CLOCK_RETRY_US);
            }
        }

        let now = Instant::now();
        let media_time = inner.media_time(now);
        inner.media_clock.reset(frame.pts, now);
        if let (Some(rect), Some(device)) = (inner.config.display_rect, inner.device.as_mut()) {
            if let Err(e) = device.set_dis_rect(rect) {
                warn!("{} ⚠ display rect {:?} rejected: {}", log_ctx(), rect, e);
            }
        }
        let pts = frame.pts;
        if self.show(inner, frame) {
            info!(
                "{} 🎬 first frame pts {}us (clock {}us)",
                log_ctx(),
                pts,
                media_time
            );
            inner.first_shown = true;
            self.events.push(Event::VideoRenderFirstFrame);
        }
        Step::Ok
    }

    /// Displays `frame`; true when the device accepted it.
    fn show(&mut self, inner: &mut RenderInner, frame: VideoFrame) -> bool {
        let eos = frame.flags.is_eos();
        let shown = match inner.render(&frame) {
            Ok(()) => {
                inner.counters.show_ok += 1;
                inner.counters.disp_frame_num += 1;
                inner.media_clock.set_pre_frame_pts(frame.pts);
                self.events.push(Event::VideoRenderPts(frame.pts));
                inner.last = Some(frame);
                true
            }
            Err(e) => {
                inner.counters.show_fail += 1;
                warn!("{} ⚠ render pts {} failed: {}", log_ctx(), frame.pts, e);
                inner.give_back(frame);
                false
            }
        };
        if eos {
            inner.all_sent = true;
        }
        shown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::demuxer::tests::wait_until;
    use crate::component::message::MessageQueue;
    use crate::core::{BufferFlags, PixelFormat, Rect, Size, VideoBuf};
    use crate::render::{MemoryDisplayFactory, MemoryGraphics};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    /// Decoder stand-in exposing a frame pool on its output port.
    pub(crate) struct FrameSource {
        pub(crate) pool: Arc<FramePool<VideoFrame>>,
        commands: MessageQueue<Command>,
    }

    impl FrameSource {
        fn new(slots: u32) -> Arc<Self> {
            let frames = (0..slots)
                .map(|i| {
                    let mut buf = VideoBuf::new(PixelFormat::Nv12, Size::new(64, 32));
                    let base = 10 + i as i32 * 3;
                    buf.fd = [base, base + 1, -1];
                    VideoFrame {
                        id: i,
                        pts: 0,
                        flags: BufferFlags::NONE,
                        buf,
                    }
                })
                .collect();
            Arc::new(Self {
                pool: Arc::new(FramePool::new(frames)),
                commands: MessageQueue::new(),
            })
        }

        fn push(&self, pts: i64, flags: BufferFlags) {
            let mut frame = self.pool.decoder_get_frame().unwrap();
            frame.pts = pts;
            frame.flags = flags;
            self.pool.decoder_put_frame(frame);
        }
    }

    impl Component for FrameSource {
        fn name(&self) -> &str {
            "frame_source"
        }
        fn send_command(&self, command: Command) -> Result<()> {
            self.commands.put(command);
            Ok(())
        }
        fn get_state(&self) -> State {
            State::Executing
        }
        fn get_parameter(&self, _: ParamIndex) -> Result<Param> {
            Err(MppError::Component(ErrorCode::Unsupported))
        }
        fn set_parameter(&self, _: Param) -> Result<()> {
            Ok(())
        }
        fn get_config(&self, _: ConfigIndex) -> Result<Config> {
            Err(MppError::Component(ErrorCode::Unsupported))
        }
        fn set_config(&self, _: Config) -> Result<()> {
            Ok(())
        }
        fn bind_request(&self, _: u32, _: Option<Arc<dyn Component>>, _: u32) -> Result<()> {
            Ok(())
        }
        fn set_callback(&self, _: Arc<dyn EventHandler>) {}
        fn port_direction(&self, _: u32) -> Option<PortDirection> {
            Some(PortDirection::Output)
        }
        fn video_frame_pool(&self, _: u32) -> Option<Arc<FramePool<VideoFrame>>> {
            Some(Arc::clone(&self.pool))
        }
    }

    /// Clock stand-in answering CURRENT_TIME from a script (-1 once empty).
    struct ScriptClock {
        times: StdMutex<VecDeque<i64>>,
        starts: StdMutex<Vec<(u32, i64)>>,
    }

    impl Component for ScriptClock {
        fn name(&self) -> &str {
            "clock"
        }
        fn send_command(&self, _: Command) -> Result<()> {
            Ok(())
        }
        fn get_state(&self) -> State {
            State::Executing
        }
        fn get_parameter(&self, _: ParamIndex) -> Result<Param> {
            Err(MppError::Component(ErrorCode::Unsupported))
        }
        fn set_parameter(&self, _: Param) -> Result<()> {
            Ok(())
        }
        fn get_config(&self, index: ConfigIndex) -> Result<Config> {
            assert_eq!(index, ConfigIndex::CurrentTime);
            let time = self.times.lock().unwrap().pop_front().unwrap_or(-1);
            Ok(Config::CurrentTime(time))
        }
        fn set_config(&self, config: Config) -> Result<()> {
            if let Config::ClientStartTime { port, pts } = config {
                self.starts.lock().unwrap().push((port, pts));
            }
            Ok(())
        }
        fn bind_request(&self, _: u32, _: Option<Arc<dyn Component>>, _: u32) -> Result<()> {
            Ok(())
        }
        fn set_callback(&self, _: Arc<dyn EventHandler>) {}
        fn port_direction(&self, _: u32) -> Option<PortDirection> {
            Some(PortDirection::Output)
        }
    }

    type Events = Arc<StdMutex<Vec<Event>>>;

    struct Rig {
        render: Arc<VideoRenderComponent>,
        source: Arc<FrameSource>,
        display: MemoryDisplayFactory,
        graphics: MemoryGraphics,
        events: Events,
    }

    fn rig(config: RenderConfig) -> Rig {
        let display = MemoryDisplayFactory::new(Size::new(800, 480));
        let graphics = MemoryGraphics::new();
        let render = VideoRenderComponent::new(
            Arc::new(display.clone()),
            Some(Arc::new(graphics.clone())),
            config,
        )
        .unwrap();
        let events: Events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        render.set_callback(Arc::new(move |_: &str, e: Event| sink.lock().unwrap().push(e)));
        let source = FrameSource::new(4);
        let source_dyn: Arc<dyn Component> = source.clone();
        render
            .bind_request(RENDER_PORT_VIDEO, Some(source_dyn), 1)
            .unwrap();
        Rig {
            render,
            source,
            display,
            graphics,
            events,
        }
    }

    fn count(events: &Events, event: Event) -> usize {
        events.lock().unwrap().iter().filter(|e| **e == event).count()
    }

    fn start(rig: &Rig) {
        rig.render.send_command(Command::StateSet(State::Idle)).unwrap();
        rig.render
            .send_command(Command::StateSet(State::Executing))
            .unwrap();
    }

    #[test]
    fn test_external_clock_shows_every_frame() {
        let rig = rig(RenderConfig::default());
        let clock = Arc::new(ScriptClock {
            times: StdMutex::new(VecDeque::from([-1, 33_000, 66_000])),
            starts: StdMutex::new(Vec::new()),
        });
        let clock_dyn: Arc<dyn Component> = clock.clone();
        rig.render
            .bind_request(RENDER_PORT_CLOCK, Some(clock_dyn), 2)
            .unwrap();
        rig.render
            .set_config(Config::ClockState(ClockState::Running))
            .unwrap();

        rig.source.push(0, BufferFlags::NONE);
        rig.source.push(33_000, BufferFlags::NONE);
        rig.source.push(66_000, BufferFlags::EOS);
        start(&rig);

        assert!(wait_until(|| count(&rig.events, Event::BufferFlag) == 1));
        let c = rig.render.counters();
        assert_eq!(c.show_ok, 3);
        assert_eq!(c.drop, 0);
        assert_eq!(c.show_fail, 0);
        assert_eq!(c.giveback_ok, 2);
        assert_eq!(count(&rig.events, Event::VideoRenderFirstFrame), 1);
        assert_eq!(*clock.starts.lock().unwrap(), vec![(2, 0)]);
        assert!(clock.times.lock().unwrap().is_empty());
        assert!(rig.graphics.stats().lock().blits.is_empty());
        assert_eq!(rig.display.stats().lock().vsyncs, 3);
    }

    #[test]
    fn test_first_frame_waits_for_running_clock() {
        let rig = rig(RenderConfig::default());
        let clock = Arc::new(ScriptClock {
            times: StdMutex::new(VecDeque::new()),
            starts: StdMutex::new(Vec::new()),
        });
        let clock_dyn: Arc<dyn Component> = clock.clone();
        rig.render
            .bind_request(RENDER_PORT_CLOCK, Some(clock_dyn), 0)
            .unwrap();
        rig.source.push(0, BufferFlags::EOS);
        start(&rig);

        assert!(wait_until(|| clock.starts.lock().unwrap().len() >= 2));
        assert_eq!(rig.render.counters().show_ok, 0);
        rig.render
            .set_config(Config::ClockState(ClockState::Running))
            .unwrap();
        assert!(wait_until(|| count(&rig.events, Event::BufferFlag) == 1));
        assert_eq!(rig.render.counters().show_ok, 1);
    }

    #[test]
    fn test_late_frame_is_dropped_and_returned() {
        let rig = rig(RenderConfig::default());
        rig.source.push(0, BufferFlags::NONE);
        rig.source.push(-500_000, BufferFlags::NONE);
        rig.source.push(-400_000, BufferFlags::EOS);
        start(&rig);

        assert!(wait_until(|| count(&rig.events, Event::BufferFlag) == 1));
        let c = rig.render.counters();
        assert_eq!(c.show_ok, 1);
        assert_eq!(c.drop, 2);
        assert_eq!(c.giveback_ok, 3);
        assert_eq!(rig.source.pool.empty_frame_num(), 4);
    }

    #[test]
    fn test_early_frame_is_delayed() {
        let rig = rig(RenderConfig::default());
        rig.source.push(0, BufferFlags::NONE);
        rig.source.push(60_000, BufferFlags::EOS);
        let started = Instant::now();
        start(&rig);

        assert!(wait_until(|| count(&rig.events, Event::BufferFlag) == 1));
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(rig.render.counters().show_ok, 2);
        assert_eq!(count(&rig.events, Event::VideoRenderPts(60_000)), 1);
    }

    #[test]
    fn test_rotation_goes_through_graphics_engine() {
        let rig = rig(RenderConfig {
            rotation: Rotation::Deg90,
            ..RenderConfig::default()
        });
        rig.source.push(0, BufferFlags::EOS);
        start(&rig);

        assert!(wait_until(|| count(&rig.events, Event::BufferFlag) == 1));
        assert_eq!(rig.graphics.stats().lock().blits.len(), 1);
        let layer = rig.display.stats().lock().last_layer.unwrap();
        assert_eq!(layer.buf.size, Size::new(32, 64));
        assert_eq!(
            rig.render.get_config(ConfigIndex::Rotation).unwrap(),
            Config::Rotation(Rotation::Deg90)
        );
    }

    #[test]
    fn test_eos_without_frames_emits_one_buffer_flag() {
        let rig = rig(RenderConfig::default());
        start(&rig);
        assert!(wait_until(|| rig.render.get_state() == State::Executing));
        assert!(wait_until(|| rig.source.commands.count() > 0));
        rig.render.send_command(Command::Eos).unwrap();
        assert!(wait_until(|| count(&rig.events, Event::BufferFlag) == 1));
        rig.render.send_command(Command::Nops).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count(&rig.events, Event::BufferFlag), 1);
    }

    #[test]
    fn test_capture_only_in_pause() {
        let rig = rig(RenderConfig::default());
        rig.source.push(0, BufferFlags::NONE);
        start(&rig);
        assert!(wait_until(|| rig.render.counters().show_ok == 1));

        let dir = tempdir().unwrap();
        let request = CaptureRequest {
            path: dir.path().join("cap.jpg"),
            width: 32,
            height: 16,
            quality: 0,
        };
        assert_eq!(
            rig.render
                .set_config(Config::Capture(request.clone()))
                .unwrap_err()
                .code(),
            ErrorCode::InvalidState
        );

        rig.render.send_command(Command::StateSet(State::Pause)).unwrap();
        assert!(wait_until(|| rig.render.get_state() == State::Pause));
        rig.render.set_config(Config::Capture(request.clone())).unwrap();
        assert!(request.path.exists());
    }

    #[test]
    fn test_seek_returns_held_frames() {
        let rig = rig(RenderConfig::default());
        rig.source.push(0, BufferFlags::NONE);
        start(&rig);
        assert!(wait_until(|| rig.render.counters().show_ok == 1));
        assert_eq!(rig.source.pool.empty_frame_num(), 3);

        rig.render.set_config(Config::TimePosition(0)).unwrap();
        assert_eq!(rig.source.pool.empty_frame_num(), 4);
        assert_eq!(
            rig.render.get_config(ConfigIndex::CurrentTime).unwrap(),
            Config::CurrentTime(-1)
        );
    }

    #[test]
    fn test_params_need_device() {
        let rig = rig(RenderConfig::default());
        assert_eq!(
            rig.render
                .get_parameter(ParamIndex::ScreenSize)
                .unwrap_err()
                .code(),
            ErrorCode::Undefined
        );
        rig.render.set_config(Config::RenderInit).unwrap();
        assert_eq!(
            rig.render.get_parameter(ParamIndex::ScreenSize).unwrap(),
            Param::ScreenSize(Size::new(800, 480))
        );
        assert_eq!(
            rig.render.get_parameter(ParamIndex::DisplayRect).unwrap(),
            Param::DisplayRect(Rect::new(0, 0, 800, 480))
        );
        rig.render
            .set_parameter(Param::DisplayRect(Rect::new(0, 0, 320, 240)))
            .unwrap();
        assert_eq!(
            rig.render.get_parameter(ParamIndex::DisplayRect).unwrap(),
            Param::DisplayRect(Rect::new(0, 0, 320, 240))
        );
        assert!(rig.render.get_parameter(ParamIndex::CropRect).is_err());
    }

    /// Display that cannot be opened, or whose device rejects the first
    /// `rend_failures` frames.
    struct FlakyDisplay {
        fail_open: bool,
        rend_failures: Arc<AtomicUsize>,
    }

    struct FlakyDevice {
        rend_failures: Arc<AtomicUsize>,
        rect: Rect,
    }

    impl DisplayFactory for FlakyDisplay {
        fn create(&self) -> Result<Box<dyn VideoRender>> {
            if self.fail_open {
                return Err(MppError::Render("no display".into()));
            }
            Ok(Box::new(FlakyDevice {
                rend_failures: Arc::clone(&self.rend_failures),
                rect: Rect::new(0, 0, 800, 480),
            }))
        }
    }

    impl VideoRender for FlakyDevice {
        fn init(&mut self, _: u32, _: u32) -> Result<()> {
            Ok(())
        }
        fn rend(&mut self, _: &VideoFrame) -> Result<()> {
            let left = self.rend_failures.load(Ordering::SeqCst);
            if left > 0 {
                self.rend_failures.store(left - 1, Ordering::SeqCst);
                return Err(MppError::Render("layer busy".into()));
            }
            Ok(())
        }
        fn screen_size(&self) -> Result<Size> {
            Ok(Size::new(800, 480))
        }
        fn set_dis_rect(&mut self, rect: Rect) -> Result<()> {
            self.rect = rect;
            Ok(())
        }
        fn dis_rect(&self) -> Result<Rect> {
            Ok(self.rect)
        }
        fn set_on_off(&mut self, _: bool) -> Result<()> {
            Ok(())
        }
        fn on_off(&self) -> bool {
            true
        }
    }

    fn flaky_render(
        fail_open: bool,
        rend_failures: usize,
    ) -> (Arc<VideoRenderComponent>, Arc<FrameSource>, Events) {
        let display = FlakyDisplay {
            fail_open,
            rend_failures: Arc::new(AtomicUsize::new(rend_failures)),
        };
        let render =
            VideoRenderComponent::new(Arc::new(display), None, RenderConfig::default()).unwrap();
        let events: Events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        render.set_callback(Arc::new(move |_: &str, e: Event| sink.lock().unwrap().push(e)));
        let source = FrameSource::new(4);
        let source_dyn: Arc<dyn Component> = source.clone();
        render
            .bind_request(RENDER_PORT_VIDEO, Some(source_dyn), 1)
            .unwrap();
        render.send_command(Command::StateSet(State::Idle)).unwrap();
        render.send_command(Command::StateSet(State::Executing)).unwrap();
        (render, source, events)
    }

    #[test]
    fn test_device_open_failure_keeps_fetching_frames() {
        let (render, source, events) = flaky_render(true, 0);
        source.push(0, BufferFlags::NONE);
        assert!(wait_until(|| render.counters().receive == 1));

        source.push(33_000, BufferFlags::NONE);
        render.send_command(Command::Wakeup).unwrap();
        assert!(wait_until(|| render.counters().receive == 2));
        assert!(wait_until(|| render.counters().giveback_ok == 2));

        let c = render.counters();
        assert_eq!(c.show_ok, 0);
        assert_eq!(c.show_fail, 2);
        // Reported once per failure streak, not once per retry.
        assert_eq!(count(&events, Event::Error(ErrorCode::InsufficientResources)), 1);
        assert_eq!(source.pool.empty_frame_num(), 4);
    }

    #[test]
    fn test_first_frame_event_needs_a_displayed_frame() {
        let (render, source, events) = flaky_render(false, 1);
        source.push(0, BufferFlags::NONE);
        source.push(20_000, BufferFlags::NONE);

        assert!(wait_until(|| count(&events, Event::VideoRenderFirstFrame) == 1));
        let c = render.counters();
        assert_eq!(c.show_fail, 1);
        assert_eq!(c.show_ok, 1);
        assert_eq!(count(&events, Event::VideoRenderPts(0)), 0);
        assert_eq!(count(&events, Event::VideoRenderPts(20_000)), 1);
        let events = events.lock().unwrap();
        let first = events
            .iter()
            .position(|e| *e == Event::VideoRenderFirstFrame)
            .unwrap();
        assert_eq!(events[first - 1], Event::VideoRenderPts(20_000));
    }

    #[test]
    fn test_pause_does_not_advance_media_time() {
        let rig = rig(RenderConfig::default());
        rig.source.push(0, BufferFlags::NONE);
        start(&rig);
        assert!(wait_until(|| rig.render.counters().show_ok == 1));

        rig.render.send_command(Command::StateSet(State::Pause)).unwrap();
        assert!(wait_until(|| rig.render.get_state() == State::Pause));
        let paused_at = match rig.render.get_config(ConfigIndex::CurrentTime).unwrap() {
            Config::CurrentTime(t) => t,
            other => panic!("unexpected {:?}", other),
        };
        std::thread::sleep(Duration::from_millis(300));
        match rig.render.get_config(ConfigIndex::CurrentTime).unwrap() {
            Config::CurrentTime(t) => assert_eq!(t, paused_at),
            other => panic!("unexpected {:?}", other),
        }

        rig.render
            .send_command(Command::StateSet(State::Executing))
            .unwrap();
        assert!(wait_until(|| count(
            &rig.events,
            Event::CmdComplete(Command::StateSet(State::Executing))
        ) == 2));
        match rig.render.get_config(ConfigIndex::CurrentTime).unwrap() {
            Config::CurrentTime(t) => {
                assert!(t >= paused_at);
                assert!(t < paused_at + 250_000, "pause leaked into media time: {}", t);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
