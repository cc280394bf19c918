use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize)]
struct Config {
    application: Application,
    server: Server,
    upstream: Upstream,
    audio: Audio,
    recordings: Recordings,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Server {
    listen_addr: String,
    handshake_timeout_ms: u64,
}

#[derive(Deserialize)]
struct Upstream {
    url: String,
    model: String,
    connect_timeout_ms: u64,
    transcription_model: String,
}

#[derive(Deserialize)]
struct Audio {
    device_input_rate: u32,
    device_output_rate: u32,
    upstream_rate: u32,
    buffer_capacity: usize,
    low_watermark: usize,
    flush_delay_ms: u64,
    conditioning: bool,
}

#[derive(Deserialize)]
struct Recordings {
    dir: String,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 服务端配置
    println!("cargo:rustc-env=LISTEN_ADDR={}", config.server.listen_addr);
    println!("cargo:rustc-env=HANDSHAKE_TIMEOUT_MS={}", config.server.handshake_timeout_ms);

    // 上游语音服务
    println!("cargo:rustc-env=UPSTREAM_URL={}", config.upstream.url);
    println!("cargo:rustc-env=UPSTREAM_MODEL={}", config.upstream.model);
    println!("cargo:rustc-env=UPSTREAM_CONNECT_TIMEOUT_MS={}", config.upstream.connect_timeout_ms);
    println!("cargo:rustc-env=TRANSCRIPTION_MODEL={}", config.upstream.transcription_model);

    // 音频配置
    println!("cargo:rustc-env=DEVICE_INPUT_RATE={}", config.audio.device_input_rate);
    println!("cargo:rustc-env=DEVICE_OUTPUT_RATE={}", config.audio.device_output_rate);
    println!("cargo:rustc-env=UPSTREAM_RATE={}", config.audio.upstream_rate);
    println!("cargo:rustc-env=BUFFER_CAPACITY={}", config.audio.buffer_capacity);
    println!("cargo:rustc-env=LOW_WATERMARK={}", config.audio.low_watermark);
    println!("cargo:rustc-env=FLUSH_DELAY_MS={}", config.audio.flush_delay_ms);
    println!("cargo:rustc-env=AUDIO_CONDITIONING={}", config.audio.conditioning);

    println!("cargo:rustc-env=RECORDINGS_DIR={}", config.recordings.dir);
}
