//! Relay between an embedded voice device and a realtime speech service.
//!
//! The device streams microphone PCM and push-to-talk signals over a
//! WebSocket; [`agent::AgentOrchestrator`] merges that with the upstream
//! event stream and tool results, and routes each event to its consumer.

pub mod agent;
pub mod audio;
pub mod config;
pub mod device_link;
pub mod error;
pub mod state_machine;
pub mod stream_mux;
pub mod tool_gateway;
pub mod upstream;

use std::sync::Arc;

pub use agent::{AgentOrchestrator, SessionStats};
pub use config::Config;
pub use device_link::{ClientRegistry, DeviceServer};
pub use error::{RelayError, Result};
pub use tool_gateway::ToolRegistry;
pub use upstream::UpstreamConnection;

/// Serve devices until the listener fails. Each `/device` connection gets
/// its own [`AgentOrchestrator`]; the upstream connect starts as soon as
/// the request path is known.
pub async fn serve(
    server: DeviceServer,
    config: Arc<Config>,
    tools: Arc<ToolRegistry>,
    instructions: Arc<str>,
) -> Result<()> {
    server
        .run(move |pending| {
            let config = config.clone();
            let tools = tools.clone();
            let instructions = instructions.clone();
            async move {
                let peer = pending.peer();
                let agent = AgentOrchestrator::new(config.clone(), tools, instructions.as_ref());
                match agent
                    .run(pending.ready(), UpstreamConnection::connect(&config))
                    .await
                {
                    Ok(stats) => log::info!("Conversation with {} finished: {:?}", peer, stats),
                    Err(e) => log::error!("Conversation with {} failed: {}", peer, e),
                }
            }
        })
        .await
}
