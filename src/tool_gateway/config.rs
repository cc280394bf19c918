use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 传输协议类型
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolTransport {
    /// 子进程 stdin/stdout 模式
    Subprocess {
        executable: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// HTTP/REST 调用
    Http {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
    },
    /// TCP Socket JSON 通信
    Tcp { address: String },
}

fn default_http_method() -> String {
    "POST".to_string()
}

fn default_timeout() -> u64 {
    5000
}

fn default_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// One externally defined tool, as listed in the tools file.
///
/// ```json
/// { "name": "lights", "description": "Switch the lights",
///   "input_schema": { "type": "object" },
///   "type": "http", "url": "http://127.0.0.1:9000/lights" }
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ExternalToolConfig {
    pub name: String,
    pub description: String,
    #[serde(default = "default_schema")]
    pub input_schema: Value,

    /// 统一超时时间（毫秒），默认 5000ms
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// 传输协议配置（扁平化到同一层 JSON）
    #[serde(flatten)]
    pub transport: ToolTransport,
}
