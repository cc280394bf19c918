//! upstream - realtime speech service link

mod connection;
pub mod protocol;

pub use connection::{DeviceAudio, UpstreamConnection};
pub use protocol::{ClientEvent, ServerEvent};
