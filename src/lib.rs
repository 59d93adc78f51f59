//! Component-based media pipeline: demuxer, decoders and a video renderer,
//! each driven by its own worker thread and tunneled port to port.

pub mod component;
pub mod core;
pub mod decoder;
pub mod parser;
pub mod render;
