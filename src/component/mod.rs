// Component framework: lifecycle, commands, events, port tunnels.

pub mod decoder;
pub mod demuxer;
pub mod message;
pub mod state;
pub mod sync;
pub mod video_render;

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use crate::core::{
    AudioFrame, AudioStreamInfo, ErrorCode, Rect, Result, Rotation, Size, TrackKind, VideoFrame,
    VideoStreamInfo,
};
use crate::decoder::pool::{FramePool, PacketPool};

pub use decoder::DecoderComponent;
pub use demuxer::DemuxerComponent;
pub use message::{Message, MessageQueue};
pub use state::ComponentCore;
pub use video_render::VideoRenderComponent;

/// Component lifecycle states. Every component starts in `Loaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Loaded,
    Idle,
    Executing,
    Pause,
    Invalid,
}

/// Commands posted to a component's message queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StateSet(State),
    Flush,
    Stop,
    Nops,
    Wakeup,
    Eos,
}

/// Asynchronous notifications delivered to the registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A command finished; carries the command (with its target state).
    CmdComplete(Command),
    Error(ErrorCode),
    PortFormatDetected,
    /// This component has pushed out everything up to end of stream.
    BufferFlag,
    VideoRenderPts(i64),
    VideoRenderFirstFrame,
}

pub trait EventHandler: Send + Sync {
    fn on_event(&self, component: &str, event: Event);
}

impl<F> EventHandler for F
where
    F: Fn(&str, Event) + Send + Sync,
{
    fn on_event(&self, component: &str, event: Event) {
        self(component, event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDomain {
    Audio,
    Video,
    Clock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortDefinition {
    pub index: u32,
    pub direction: PortDirection,
    pub domain: PortDomain,
    pub enabled: bool,
}

/// Clock component state as pushed to its clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClockState {
    #[default]
    Stopped,
    WaitingForStartTime,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamIndex {
    PortDefinition(u32),
    StreamCounts,
    ActiveStream(TrackKind),
    AudioPortFormat,
    VideoPortFormat,
    CropRect,
    ScreenSize,
    DisplayRect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    PortDefinition(PortDefinition),
    StreamCounts { audio: u32, video: u32 },
    ActiveStream { kind: TrackKind, index: u32 },
    AudioPortFormat(AudioStreamInfo),
    VideoPortFormat(VideoStreamInfo),
    CropRect(Rect),
    ScreenSize(Size),
    DisplayRect(Rect),
    ContentUri(String),
    SkipTrack(TrackKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigIndex {
    CurrentTime,
    ClockState,
    Rotation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Config {
    /// Seek target in microseconds.
    TimePosition(i64),
    ClearBuffer,
    ClockState(ClockState),
    RenderInit,
    Capture(CaptureRequest),
    Rotation(Rotation),
    ClientStartTime { port: u32, pts: i64 },
    /// Current media time in microseconds, -1 while not yet valid.
    CurrentTime(i64),
}

/// A pipeline element driven by its own worker thread.
///
/// Control calls validate and enqueue; outcomes of commands are only
/// observable through the event handler.
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    fn send_command(&self, command: Command) -> Result<()>;

    fn get_state(&self) -> State;

    fn get_parameter(&self, index: ParamIndex) -> Result<Param>;

    fn set_parameter(&self, param: Param) -> Result<()>;

    fn get_config(&self, index: ConfigIndex) -> Result<Config>;

    fn set_config(&self, config: Config) -> Result<()>;

    /// Tunnels `port` to `peer_port` of `peer`; `None` tears the tunnel down.
    fn bind_request(
        &self,
        port: u32,
        peer: Option<Arc<dyn Component>>,
        peer_port: u32,
    ) -> Result<()>;

    fn set_callback(&self, handler: Arc<dyn EventHandler>);

    fn port_direction(&self, port: u32) -> Option<PortDirection>;

    /// Packet input of a decoder, used by the upstream demuxer.
    fn packet_pool(&self, _port: u32) -> Option<Arc<PacketPool>> {
        None
    }

    /// Video frame output of a decoder, used by the downstream renderer.
    fn video_frame_pool(&self, _port: u32) -> Option<Arc<FramePool<VideoFrame>>> {
        None
    }

    fn audio_frame_pool(&self, _port: u32) -> Option<Arc<FramePool<AudioFrame>>> {
        None
    }
}

/// One side of a port tunnel. The peer is held weakly so that two
/// components bound to each other do not keep each other alive.
#[derive(Clone, Default)]
pub struct BindInfo {
    peer: Option<Weak<dyn Component>>,
    peer_port: u32,
}

impl BindInfo {
    pub fn new(peer: &Arc<dyn Component>, peer_port: u32) -> Self {
        Self {
            peer: Some(Arc::downgrade(peer)),
            peer_port,
        }
    }

    pub fn peer(&self) -> Option<Arc<dyn Component>> {
        self.peer.as_ref().and_then(Weak::upgrade)
    }

    pub fn peer_port(&self) -> u32 {
        self.peer_port
    }

    pub fn is_bound(&self) -> bool {
        self.peer().is_some()
    }
}

impl std::fmt::Debug for BindInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.peer() {
            Some(peer) => write!(f, "BindInfo({}:{})", peer.name(), self.peer_port),
            None => f.write_str("BindInfo(unbound)"),
        }
    }
}

/// Tunnels `out_comp:out_port` to `in_comp:in_port`, registering the
/// binding on both sides.
pub fn bind(
    out_comp: &Arc<dyn Component>,
    out_port: u32,
    in_comp: &Arc<dyn Component>,
    in_port: u32,
) -> Result<()> {
    out_comp.bind_request(out_port, Some(Arc::clone(in_comp)), in_port)?;
    in_comp.bind_request(in_port, Some(Arc::clone(out_comp)), out_port)
}

/// Tears down both sides of a tunnel.
pub fn unbind(
    out_comp: &Arc<dyn Component>,
    out_port: u32,
    in_comp: &Arc<dyn Component>,
    in_port: u32,
) -> Result<()> {
    out_comp.bind_request(out_port, None, 0)?;
    in_comp.bind_request(in_port, None, 0)
}
