use std::sync::Arc;

use tokio::signal;
use voice_relay_rs::{Config, DeviceServer, ToolRegistry};

const DEFAULT_INSTRUCTIONS: &str = "You are a friendly voice assistant running on a small \
speaker. Keep answers short and conversational, and use the available tools when they help.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置：编译期默认值 + 运行时环境变量
    let config = Config::new()?.with_env_overrides();
    if config.api_key.is_none() {
        anyhow::bail!("OPENAI_API_KEY is not set");
    }

    let tools = match &config.tools_file {
        Some(path) => ToolRegistry::load_from_file(path)?,
        None => ToolRegistry::new(),
    };
    log::info!("{} tools available: {:?}", tools.len(), tools.names());

    let instructions: Arc<str> = match &config.instructions_file {
        Some(path) => std::fs::read_to_string(path)?.into(),
        None => DEFAULT_INSTRUCTIONS.into(),
    };

    let server = DeviceServer::bind(&config.listen_addr, config.handshake_timeout()).await?;
    log::info!("{} {} started", config.app_name, config.app_version);

    tokio::select! {
        // 监听 Ctrl+C 信号
        _ = signal::ctrl_c() => {
            log::info!("Received Ctrl+C, shutting down...");
        }
        res = voice_relay_rs::serve(server, Arc::new(config), Arc::new(tools), instructions) => {
            res?;
        }
    }
    Ok(())
}
