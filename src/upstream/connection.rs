use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use futures_util::stream::{self, BoxStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::connect_async;
use url::Url;

use super::protocol::{ClientEvent, ServerEvent};
use crate::config::Config;
use crate::error::{RelayError, Result};

/// What a binary frame from the device turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAudio {
    RecordingStarted,
    RecordingStopped,
    Heartbeat,
    /// PCM to keep; the gate is open.
    Audio,
    /// PCM that arrived while the gate was closed.
    Dropped,
}

/// The socket to the realtime speech service.
///
/// Writes go through a channel to a dedicated writer task; reads are
/// exposed once as a stream of decoded [`ServerEvent`]s. The connection also
/// owns the recording gate that decides whether device audio is kept.
pub struct UpstreamConnection {
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    inbound: Mutex<Option<BoxStream<'static, ServerEvent>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    recording: AtomicBool,
}

impl UpstreamConnection {
    /// Open the socket, bounded by the configured connect timeout.
    pub async fn connect(config: &Config) -> Result<Self> {
        let api_key = config
            .api_key
            .as_deref()
            .ok_or_else(|| RelayError::Config("OPENAI_API_KEY is not set".into()))?;

        let endpoint = config.upstream_endpoint();
        let url = Url::parse(&endpoint)
            .map_err(|e| RelayError::Config(format!("invalid upstream url {}: {}", endpoint, e)))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(RelayError::Config(format!("no host in {}", endpoint))),
        };

        let request = tungstenite::http::Request::builder()
            .method("GET")
            .uri(endpoint.as_str())
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tungstenite::handshake::client::generate_key(),
            )
            .header("Authorization", format!("Bearer {}", api_key))
            .header("OpenAI-Beta", "realtime=v1")
            .body(())
            .map_err(tungstenite::Error::from)?;

        log::info!("Connecting to {}...", endpoint);
        let (ws_stream, _) = timeout(config.connect_timeout(), connect_async(request))
            .await
            .map_err(|_| RelayError::ConnectTimeout(config.connect_timeout_ms))??;
        log::info!("Connected to upstream");

        Ok(Self::from_socket(ws_stream))
    }

    /// Wrap an already open WebSocket.
    pub fn from_socket<S>(socket: S) -> Self
    where
        S: Stream<Item = std::result::Result<Message, tungstenite::Error>>
            + Sink<Message, Error = tungstenite::Error>
            + Send
            + Unpin
            + 'static,
    {
        let (mut write, read) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    log::error!("Upstream write failed: {}", e);
                    return;
                }
            }
            // 发送端全部释放，正常关闭
            if let Err(e) = write.close().await {
                log::debug!("Upstream close: {}", e);
            }
        });

        let mut conn = Self::with_channels(tx, decode_frames(read));
        conn.writer = Mutex::new(Some(writer));
        conn
    }

    /// Build a connection from a raw outbound channel and an inbound event
    /// stream, with no socket behind it.
    pub fn with_channels(
        outbound: mpsc::UnboundedSender<Message>,
        inbound: BoxStream<'static, ServerEvent>,
    ) -> Self {
        Self {
            outbound: Mutex::new(Some(outbound)),
            inbound: Mutex::new(Some(inbound)),
            writer: Mutex::new(None),
            recording: AtomicBool::new(false),
        }
    }

    /// Serialize and queue one event for the writer.
    pub fn send_event(&self, event: &ClientEvent) -> Result<()> {
        let text = event.to_json()?;
        let guard = self.outbound.lock().map_err(|_| RelayError::NotConnected)?;
        let tx = guard.as_ref().ok_or(RelayError::NotConnected)?;
        tx.send(Message::Text(text.into()))
            .map_err(|_| RelayError::NotConnected)
    }

    /// Inbound events. Can be taken once.
    pub fn events(&self) -> Result<BoxStream<'static, ServerEvent>> {
        self.inbound
            .lock()
            .ok()
            .and_then(|mut inbound| inbound.take())
            .ok_or(RelayError::NotConnected)
    }

    pub fn is_connected(&self) -> bool {
        self.outbound
            .lock()
            .map(|tx| tx.as_ref().is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    pub fn set_recording(&self, recording: bool) {
        let was = self.recording.swap(recording, Ordering::SeqCst);
        if was != recording {
            if recording {
                log::info!("Started recording");
            } else {
                log::info!("Stopped recording");
            }
        }
    }

    /// Classify one binary frame from the device and update the gate.
    ///
    /// One byte is a control frame: `1` starts recording, `0` stops it.
    /// Two bytes holding the little-endian `i16` value `2` are a heartbeat.
    /// Anything else is audio, kept only while recording.
    pub fn handle_device_audio(&self, data: &[u8]) -> Result<DeviceAudio> {
        match data {
            [1] => {
                self.set_recording(true);
                Ok(DeviceAudio::RecordingStarted)
            }
            [0] => {
                self.set_recording(false);
                Ok(DeviceAudio::RecordingStopped)
            }
            [_] => Err(RelayError::MalformedControlFrame(data.to_vec())),
            [lo, hi] if i16::from_le_bytes([*lo, *hi]) == 2 => Ok(DeviceAudio::Heartbeat),
            [] => Ok(DeviceAudio::Dropped),
            _ if self.is_recording() => Ok(DeviceAudio::Audio),
            _ => {
                log::trace!("Skipping {} bytes, recording is not active", data.len());
                Ok(DeviceAudio::Dropped)
            }
        }
    }

    /// Release the socket. Queued events are still written before the
    /// writer closes it.
    pub fn close(&self) {
        self.recording.store(false, Ordering::SeqCst);
        if let Ok(mut tx) = self.outbound.lock() {
            if tx.take().is_some() {
                log::info!("Upstream connection released");
            }
        }
        if let Ok(mut inbound) = self.inbound.lock() {
            inbound.take();
        }
    }

    /// Wait for the writer task to flush and close the socket.
    pub async fn closed(&self) {
        let writer = self.writer.lock().ok().and_then(|mut w| w.take());
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }
}

/// Text frames become events; non-JSON is skipped, close or error ends it.
fn decode_frames<R>(read: R) -> BoxStream<'static, ServerEvent>
where
    R: Stream<Item = std::result::Result<Message, tungstenite::Error>> + Send + Unpin + 'static,
{
    stream::unfold(read, |mut read| async move {
        loop {
            match read.next().await? {
                Ok(Message::Text(text)) => match ServerEvent::decode(&text) {
                    Ok(event) => return Some((event, read)),
                    Err(e) => log::warn!("Skipping non-JSON upstream frame: {}", e),
                },
                Ok(Message::Close(frame)) => {
                    log::info!("Upstream closed connection: {:?}", frame);
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("Upstream read error: {}", e);
                    return None;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn detached() -> (UpstreamConnection, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (UpstreamConnection::with_channels(tx, stream::empty().boxed()), rx)
    }

    #[test]
    fn control_frames_gate_audio() {
        let (conn, _rx) = detached();
        let pcm = [10u8, 0, 20, 0, 30, 0];

        assert!(!conn.is_recording());
        assert_eq!(conn.handle_device_audio(&pcm).unwrap(), DeviceAudio::Dropped);

        assert_eq!(conn.handle_device_audio(&[1]).unwrap(), DeviceAudio::RecordingStarted);
        assert_eq!(conn.handle_device_audio(&pcm).unwrap(), DeviceAudio::Audio);

        assert_eq!(conn.handle_device_audio(&[0]).unwrap(), DeviceAudio::RecordingStopped);
        assert_eq!(conn.handle_device_audio(&pcm).unwrap(), DeviceAudio::Dropped);
    }

    #[test]
    fn heartbeat_and_malformed_frames() {
        let (conn, _rx) = detached();
        assert_eq!(conn.handle_device_audio(&[2, 0]).unwrap(), DeviceAudio::Heartbeat);
        conn.set_recording(true);
        assert_eq!(conn.handle_device_audio(&[2, 0]).unwrap(), DeviceAudio::Heartbeat);
        // other 2-byte frames are audio
        assert_eq!(conn.handle_device_audio(&[3, 0]).unwrap(), DeviceAudio::Audio);

        assert!(matches!(
            conn.handle_device_audio(&[7]),
            Err(RelayError::MalformedControlFrame(b)) if b == vec![7]
        ));
        assert!(conn.is_recording());
    }

    #[test]
    fn send_event_fails_after_close() {
        let (conn, mut rx) = detached();
        conn.send_event(&ClientEvent::response_create()).unwrap();
        let Message::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        let value: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(value["type"], "response.create");

        assert!(conn.events().is_ok());
        assert!(matches!(conn.events(), Err(RelayError::NotConnected)));

        conn.close();
        assert!(!conn.is_connected());
        assert!(matches!(
            conn.send_event(&ClientEvent::response_create()),
            Err(RelayError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn decode_frames_skips_garbage_and_stops_at_close() {
        let frames = stream::iter(vec![
            Ok(Message::Text("garbage".into())),
            Ok(Message::Binary(vec![1u8, 2].into())),
            Ok(Message::Text(r#"{"type":"input_audio_buffer.speech_started"}"#.into())),
            Ok(Message::Close(None)),
            Ok(Message::Text(r#"{"type":"error","error":{}}"#.into())),
        ]);
        let events: Vec<ServerEvent> = decode_frames(frames).collect().await;
        assert_eq!(events, vec![ServerEvent::SpeechStarted]);
    }

    #[tokio::test]
    async fn connect_requires_api_key() {
        let mut config = Config::new().unwrap();
        config.api_key = None;
        assert!(matches!(
            UpstreamConnection::connect(&config).await,
            Err(RelayError::Config(_))
        ));
    }

    #[tokio::test]
    async fn connect_times_out_against_silent_server() {
        // accepts TCP but never answers the handshake
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });

        let mut config = Config::new().unwrap();
        config.api_key = Some("sk-test".into());
        config.upstream_url = format!("ws://{}/v1/realtime", addr);
        config.connect_timeout_ms = 100;

        assert!(matches!(
            UpstreamConnection::connect(&config).await,
            Err(RelayError::ConnectTimeout(100))
        ));
    }
}
