use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mpp_pipeline::component::decoder::{DEC_PORT_IN, DEC_PORT_OUT};
use mpp_pipeline::component::demuxer::DEMUX_PORT_VIDEO;
use mpp_pipeline::component::video_render::RENDER_PORT_VIDEO;
use mpp_pipeline::component::{
    bind, Command, Component, DecoderComponent, DemuxerComponent, Event, Param, State,
    VideoRenderComponent,
};
use mpp_pipeline::core::{PipelineConfig, Size};
use mpp_pipeline::decoder::PassthroughVideoDecoder;
use mpp_pipeline::parser::DefaultParserFactory;
use mpp_pipeline::render::{MemoryDisplayFactory, MemoryGraphics};

const SCREEN: Size = Size::new(1920, 1080);
const STATE_TIMEOUT: Duration = Duration::from_secs(5);
const PLAYBACK_TIMEOUT: Duration = Duration::from_secs(600);

type Events = Receiver<(String, Event)>;

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let arg = std::env::args()
        .nth(1)
        .context("usage: mpp_play <config.json | media file>")?;
    let config = load_config(&arg)?;
    info!("🎬 mpp_play starting: {}", config.uri);

    let (tx, rx) = unbounded();
    let handler = Arc::new(move |name: &str, event: Event| {
        let _ = tx.send((name.to_string(), event));
    });

    let demux = DemuxerComponent::new(Arc::new(DefaultParserFactory))?;
    let vdec = DecoderComponent::new(
        "vdec",
        PassthroughVideoDecoder::new(config.video),
        &config.decoder,
    )?;
    let display = MemoryDisplayFactory::new(SCREEN);
    let render = VideoRenderComponent::new(
        Arc::new(display.clone()),
        Some(Arc::new(MemoryGraphics::new())),
        config.render,
    )?;

    let demux_dyn: Arc<dyn Component> = demux.clone();
    let vdec_dyn: Arc<dyn Component> = vdec.clone();
    let render_dyn: Arc<dyn Component> = render.clone();
    for comp in [&demux_dyn, &vdec_dyn, &render_dyn] {
        comp.set_callback(handler.clone());
    }

    bind(&demux_dyn, DEMUX_PORT_VIDEO, &vdec_dyn, DEC_PORT_IN)?;
    bind(&vdec_dyn, DEC_PORT_OUT, &render_dyn, RENDER_PORT_VIDEO)?;
    demux_dyn
        .set_parameter(Param::ContentUri(config.uri.clone()))
        .with_context(|| format!("cannot open {}", config.uri))?;

    // Consumers first so that nothing is produced into a stopped component.
    let start_order = [&render_dyn, &vdec_dyn, &demux_dyn];
    let stop_order = [&demux_dyn, &vdec_dyn, &render_dyn];

    transition(&rx, &start_order, State::Idle)?;
    transition(&rx, &start_order, State::Executing)?;
    let started = Instant::now();

    wait_render_done(&rx)?;
    info!("⏹ playback finished in {:?}", started.elapsed());

    transition(&rx, &stop_order, State::Idle)?;
    transition(&rx, &stop_order, State::Loaded)?;

    info!("demuxer: {:?}", demux.counters());
    info!("vdec: {:?}", vdec.counters());
    info!("render: {:?}", render.counters());
    info!("display: {} layer updates", display.stats().lock().layer_updates);

    demux.deinit()?;
    vdec.deinit()?;
    render.deinit()?;
    Ok(())
}

fn load_config(arg: &str) -> Result<PipelineConfig> {
    if arg.ends_with(".json") {
        return PipelineConfig::from_file(arg).with_context(|| format!("bad config {}", arg));
    }
    let config = PipelineConfig {
        uri: arg.to_string(),
        ..PipelineConfig::default()
    };
    config.validate()?;
    Ok(config)
}

/// Sends STATE_SET to every component and waits for each CMD_COMPLETE.
fn transition(rx: &Events, comps: &[&Arc<dyn Component>], target: State) -> Result<()> {
    let mut pending: Vec<String> = comps.iter().map(|c| c.name().to_string()).collect();
    for comp in comps {
        comp.send_command(Command::StateSet(target))?;
    }
    let deadline = Instant::now() + STATE_TIMEOUT;
    while !pending.is_empty() {
        let (name, event) = rx
            .recv_deadline(deadline)
            .map_err(|_| anyhow!("timeout entering {:?}, waiting on {:?}", target, pending))?;
        match event {
            Event::CmdComplete(Command::StateSet(state)) if state == target => {
                pending.retain(|n| *n != name);
            }
            Event::Error(code) => bail!("{} failed entering {:?}: {}", name, target, code),
            other => debug!("{} event {:?}", name, other),
        }
    }
    info!("pipeline {:?}", target);
    Ok(())
}

fn wait_render_done(rx: &Events) -> Result<()> {
    let deadline = Instant::now() + PLAYBACK_TIMEOUT;
    loop {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
            Ok((name, Event::BufferFlag)) if name == "video_render" => return Ok(()),
            Ok((name, Event::Error(code))) => warn!("⚠ {} reported {}", name, code),
            Ok((name, Event::VideoRenderFirstFrame)) => info!("🎬 {} first frame", name),
            Ok((name, event)) => debug!("{} event {:?}", name, event),
            Err(RecvTimeoutError::Timeout) => bail!("playback timed out"),
            Err(RecvTimeoutError::Disconnected) => bail!("event channel closed"),
        }
    }
}
