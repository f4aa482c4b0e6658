#![forbid(unsafe_code)]

// roomrelay library - SFU signaling and media-routing control plane

pub mod config;
pub mod media;
pub mod metrics;
pub mod room;
pub mod signaling;
