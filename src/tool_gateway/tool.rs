use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use super::config::{ExternalToolConfig, ToolTransport};

/// A function the upstream model may call mid-conversation.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    async fn call(&self, params: Value) -> Result<Value, String>;
}

/// Tool backed by an external program or service.
///
/// Arguments go out as one JSON document; whatever the backend answers is
/// returned to the model as a string.
pub struct DynamicTool {
    config: ExternalToolConfig,
}

impl DynamicTool {
    pub fn new(config: ExternalToolConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExternalToolConfig {
        &self.config
    }
}

impl ToolTransport {
    async fn invoke(&self, params: &Value) -> Result<String, String> {
        match self {
            ToolTransport::Subprocess { executable, args } => {
                run_subprocess(executable, args, params).await
            }
            ToolTransport::Http { url, method } => send_http(url, method, params).await,
            ToolTransport::Tcp { address } => send_tcp_line(address, params).await,
        }
    }
}

/// Arguments on stdin, answer on stdout. A non-zero exit reports stderr.
async fn run_subprocess(executable: &str, args: &[String], params: &Value) -> Result<String, String> {
    let input = params.to_string();
    log::info!("Running {} with {}", executable, input);

    let mut child = Command::new(executable)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("Failed to spawn {}: {}", executable, e))?;

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(input.as_bytes()).await {
            log::warn!("Could not pass arguments to {}: {}", executable, e);
        }
        // closing stdin lets the child see EOF
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("Failed to wait for {}: {}", executable, e))?;

    let text = |bytes: &[u8]| String::from_utf8_lossy(bytes).trim_end().to_string();
    if output.status.success() {
        Ok(text(&output.stdout))
    } else {
        Err(format!("Subprocess error: {}", text(&output.stderr)))
    }
}

/// `GET` ignores the arguments, every other method posts them as JSON.
async fn send_http(url: &str, method: &str, params: &Value) -> Result<String, String> {
    let client = reqwest::Client::new();
    let request = if method.eq_ignore_ascii_case("GET") {
        client.get(url)
    } else {
        client.post(url).json(params)
    };

    let response = request
        .send()
        .await
        .map_err(|e| format!("HTTP request failed: {}", e))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| format!("Failed to read HTTP response: {}", e))?;

    if status.is_success() {
        Ok(body)
    } else {
        Err(format!("HTTP {}: {}", status, body))
    }
}

/// One newline-terminated JSON line out, a single read of the reply back.
async fn send_tcp_line(address: &str, params: &Value) -> Result<String, String> {
    let mut stream = TcpStream::connect(address)
        .await
        .map_err(|e| format!("TCP connection to {} failed: {}", address, e))?;

    let line = format!("{}\n", params);
    stream
        .write_all(line.as_bytes())
        .await
        .map_err(|e| format!("TCP write failed: {}", e))?;

    let mut reply = vec![0u8; TCP_REPLY_LIMIT];
    let n = stream
        .read(&mut reply)
        .await
        .map_err(|e| format!("TCP read failed: {}", e))?;
    Ok(String::from_utf8_lossy(&reply[..n]).trim_end().to_string())
}

const TCP_REPLY_LIMIT: usize = 4096;

#[async_trait]
impl Tool for DynamicTool {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn description(&self) -> &str {
        &self.config.description
    }

    fn input_schema(&self) -> Value {
        self.config.input_schema.clone()
    }

    async fn call(&self, params: Value) -> Result<Value, String> {
        let limit = Duration::from_millis(self.config.timeout_ms);
        match timeout(limit, self.config.transport.invoke(&params)).await {
            Ok(answer) => answer.map(Value::String),
            Err(_) => Err(format!(
                "Tool '{}' execution timed out after {} ms",
                self.config.name, self.config.timeout_ms
            )),
        }
    }
}
