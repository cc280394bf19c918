use std::path::PathBuf;
use std::time::Duration;

use crate::audio::{CaptureSettings, ConditioningConfig};
use crate::error::{RelayError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 设备端 WebSocket 服务
    pub listen_addr: String,
    pub handshake_timeout_ms: u64,

    // 上游语音服务（静态部分）
    pub upstream_url: String,
    pub upstream_model: String,
    pub connect_timeout_ms: u64,
    pub transcription_model: &'static str,

    // 运行时注入，不写进二进制
    pub api_key: Option<String>,

    // 音频参数
    pub device_input_rate: u32,
    pub device_output_rate: u32,
    pub upstream_rate: u32,
    pub buffer_capacity: usize,
    pub low_watermark: usize,
    pub flush_delay_ms: u64,
    pub conditioning: bool,

    pub recordings_dir: Option<PathBuf>,
    pub tools_file: Option<PathBuf>,
    pub instructions_file: Option<PathBuf>,
}

impl Config {
    /// Build the configuration from the values `build.rs` extracted out of
    /// `config.toml`.
    pub fn new() -> Result<Self> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            listen_addr: env!("LISTEN_ADDR").to_string(),
            handshake_timeout_ms: parse("HANDSHAKE_TIMEOUT_MS", env!("HANDSHAKE_TIMEOUT_MS"))?,

            upstream_url: env!("UPSTREAM_URL").to_string(),
            upstream_model: env!("UPSTREAM_MODEL").to_string(),
            connect_timeout_ms: parse(
                "UPSTREAM_CONNECT_TIMEOUT_MS",
                env!("UPSTREAM_CONNECT_TIMEOUT_MS"),
            )?,
            transcription_model: env!("TRANSCRIPTION_MODEL"),

            api_key: None,

            device_input_rate: parse("DEVICE_INPUT_RATE", env!("DEVICE_INPUT_RATE"))?,
            device_output_rate: parse("DEVICE_OUTPUT_RATE", env!("DEVICE_OUTPUT_RATE"))?,
            upstream_rate: parse("UPSTREAM_RATE", env!("UPSTREAM_RATE"))?,
            buffer_capacity: parse("BUFFER_CAPACITY", env!("BUFFER_CAPACITY"))?,
            low_watermark: parse("LOW_WATERMARK", env!("LOW_WATERMARK"))?,
            flush_delay_ms: parse("FLUSH_DELAY_MS", env!("FLUSH_DELAY_MS"))?,
            conditioning: parse("AUDIO_CONDITIONING", env!("AUDIO_CONDITIONING"))?,

            recordings_dir: Some(PathBuf::from(env!("RECORDINGS_DIR"))),
            tools_file: None,
            instructions_file: None,
        })
    }

    /// Apply overrides from the process environment. The API key is never
    /// baked into the binary.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if !key.is_empty() {
                self.api_key = Some(key);
            }
        }
        if let Ok(addr) = std::env::var("VOICE_RELAY_LISTEN") {
            self.listen_addr = addr;
        }
        if let Ok(path) = std::env::var("VOICE_RELAY_TOOLS") {
            self.tools_file = Some(PathBuf::from(path));
        }
        if let Ok(dir) = std::env::var("VOICE_RELAY_RECORDINGS") {
            // 空字符串表示不落盘
            self.recordings_dir = if dir.is_empty() { None } else { Some(PathBuf::from(dir)) };
        }
        if let Ok(path) = std::env::var("VOICE_RELAY_INSTRUCTIONS") {
            self.instructions_file = Some(PathBuf::from(path));
        }
        self
    }

    /// Realtime endpoint with the model selected in the query string.
    pub fn upstream_endpoint(&self) -> String {
        format!("{}?model={}", self.upstream_url, self.upstream_model)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Capture buffer settings for a recording session.
    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            capacity: self.buffer_capacity,
            low_watermark: self.low_watermark,
            flush_delay: Duration::from_millis(self.flush_delay_ms),
            conditioning: self.conditioning.then(ConditioningConfig::default),
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| RelayError::Config(format!("Failed to parse {key}: {raw:?}")))
}
