//! One device conversation: connect, initialise the session, then dispatch
//! the merged device / upstream / tool streams until either side hangs up.

use std::future::Future;
use std::sync::Arc;

use base64::prelude::*;
use bytes::Bytes;
use futures_util::future;
use futures_util::stream::{self, StreamExt};
use serde_json::json;

use crate::audio::{resample_bytes, Recorder};
use crate::config::Config;
use crate::device_link::{DeviceConnection, DeviceHandle, DeviceMessage};
use crate::error::Result;
use crate::state_machine::AgentState;
use crate::stream_mux::{StreamEvent, StreamMux};
use crate::tool_gateway::{ToolCallExecutor, ToolCallRequest, ToolCallResult, ToolRegistry};
use crate::upstream::{ClientEvent, DeviceAudio, ServerEvent, UpstreamConnection};

const START_RECORD: &str = "START_RECORD";
const STOP_RECORD: &str = "STOP_RECORD";

/// Tag of the stream an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Mic,
    Upstream,
    Tool,
}

#[derive(Debug)]
enum Input {
    Device(DeviceMessage),
    DeviceClosed,
    Upstream(ServerEvent),
    UpstreamClosed,
    Tool(ToolCallResult),
}

/// What happened during one conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub events: u64,
    pub tool_calls: u64,
    pub tool_results: u64,
    pub clips_submitted: u64,
    pub audio_chunks_out: u64,
}

pub struct AgentOrchestrator {
    config: Arc<Config>,
    tools: Arc<ToolRegistry>,
    instructions: String,
    state: AgentState,
}

impl AgentOrchestrator {
    pub fn new(config: Arc<Config>, tools: Arc<ToolRegistry>, instructions: impl Into<String>) -> Self {
        Self {
            config,
            tools,
            instructions: instructions.into(),
            state: AgentState::Connecting,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    fn transition(&mut self, next: AgentState) {
        if self.state.can_transition_to(next) {
            log::info!("Agent state: {:?} -> {:?}", self.state, next);
            self.state = next;
        } else {
            log::warn!("Ignoring agent state change {:?} -> {:?}", self.state, next);
        }
    }

    /// Drive one conversation to the end.
    ///
    /// `device` and `upstream` are awaited together; either failing ends the
    /// session before anything is sent.
    pub async fn run<D, U>(mut self, device: D, upstream: U) -> Result<SessionStats>
    where
        D: Future<Output = Result<DeviceConnection>>,
        U: Future<Output = Result<UpstreamConnection>>,
    {
        let (device, upstream) = match future::try_join(device, upstream).await {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("Failed to connect: {}", e);
                self.transition(AgentState::Closing);
                return Err(e);
            }
        };

        self.transition(AgentState::SessionInitializing);
        let session_update = ClientEvent::session_update(
            self.instructions.clone(),
            self.config.transcription_model,
            self.tools.definitions(),
        );
        if let Err(e) = upstream.send_event(&session_update) {
            log::error!("Failed to initialise session: {}", e);
            self.transition(AgentState::Closing);
            upstream.close();
            return Err(e);
        }

        let executor = ToolCallExecutor::new(self.tools.clone());
        let (handle, mic) = device.split();
        let mut mux = StreamMux::new()
            .with(
                Source::Mic,
                mic.map(Input::Device)
                    .chain(stream::once(future::ready(Input::DeviceClosed)))
                    .boxed(),
            )
            .with(
                Source::Upstream,
                upstream
                    .events()?
                    .map(Input::Upstream)
                    .chain(stream::once(future::ready(Input::UpstreamClosed)))
                    .boxed(),
            )
            .with(Source::Tool, executor.results()?.map(Input::Tool).boxed());

        let mut session = Session {
            recorder: Recorder::new(
                self.config.capture_settings(),
                self.config.device_input_rate,
                self.config.recordings_dir.clone(),
            ),
            config: self.config.clone(),
            upstream,
            executor,
            handle,
            stats: SessionStats::default(),
        };

        self.transition(AgentState::Active);
        while let Some(StreamEvent { source, payload }) = mux.next().await {
            session.stats.events += 1;
            log::trace!("Event from {:?}", source);
            if !session.dispatch(payload).await {
                break;
            }
        }

        self.transition(AgentState::Closing);
        session.close().await;
        log::info!("Session ended: {:?}", session.stats);
        Ok(session.stats)
    }
}

/// Everything one active conversation owns.
struct Session {
    config: Arc<Config>,
    upstream: UpstreamConnection,
    executor: ToolCallExecutor,
    handle: DeviceHandle,
    recorder: Recorder,
    stats: SessionStats,
}

impl Session {
    /// Returns `false` once the conversation should close.
    async fn dispatch(&mut self, input: Input) -> bool {
        match input {
            Input::Device(msg) => self.on_device(msg).await,
            Input::Upstream(event) => self.on_upstream(event),
            Input::Tool(result) => self.on_tool_result(result),
            Input::DeviceClosed => {
                log::info!("Device disconnected");
                return false;
            }
            Input::UpstreamClosed => {
                log::info!("Upstream event stream ended");
                return false;
            }
        }
        true
    }

    async fn on_device(&mut self, msg: DeviceMessage) {
        match msg {
            DeviceMessage::Binary(data) => match self.upstream.handle_device_audio(&data) {
                Ok(DeviceAudio::RecordingStarted) => self.start_recording().await,
                Ok(DeviceAudio::RecordingStopped) => self.stop_recording().await,
                Ok(DeviceAudio::Heartbeat) => log::trace!("Received PING from device"),
                Ok(DeviceAudio::Audio) => {
                    self.handle.forward_to_monitors(data.clone());
                    if !self.recorder.append(&data).await {
                        log::debug!("No recording session for {} bytes", data.len());
                    }
                }
                Ok(DeviceAudio::Dropped) => {}
                Err(e) => log::warn!("{}", e),
            },
            DeviceMessage::Text(text) => match text.trim() {
                START_RECORD => {
                    self.upstream.set_recording(true);
                    self.start_recording().await;
                }
                STOP_RECORD => {
                    self.upstream.set_recording(false);
                    self.stop_recording().await;
                }
                other => log::debug!("Device text: {}", other),
            },
        }
    }

    async fn start_recording(&mut self) {
        if let Err(e) = self.recorder.start().await {
            log::error!("Failed to start recording: {}", e);
            self.upstream.set_recording(false);
        }
    }

    /// Close the capture and send the clip as one user turn.
    async fn stop_recording(&mut self) {
        let Some(clip) = self.recorder.stop().await else {
            return;
        };
        if clip.is_empty() {
            log::info!("Recording was empty, nothing to submit");
            return;
        }

        let pcm = resample_bytes(&clip, self.config.device_input_rate, self.config.upstream_rate);
        let audio = BASE64_STANDARD.encode(&pcm);
        log::info!(
            "Submitting {} bytes of audio ({} Hz -> {} Hz)",
            pcm.len(),
            self.config.device_input_rate,
            self.config.upstream_rate
        );

        let sent = self
            .upstream
            .send_event(&ClientEvent::user_audio(audio))
            .and_then(|_| self.upstream.send_event(&ClientEvent::response_create()));
        match sent {
            Ok(()) => self.stats.clips_submitted += 1,
            Err(e) => log::error!("Failed to submit recording: {}", e),
        }
    }

    fn on_upstream(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::AudioDelta { delta } => {
                let pcm = match BASE64_STANDARD.decode(delta.as_bytes()) {
                    Ok(pcm) => pcm,
                    Err(e) => {
                        log::warn!("Bad audio delta: {}", e);
                        return;
                    }
                };
                let pcm = resample_bytes(&pcm, self.config.upstream_rate, self.config.device_output_rate);
                let delivered = self.handle.broadcast_binary(Bytes::from(pcm));
                self.stats.audio_chunks_out += 1;
                log::trace!("Audio delta sent to {} clients", delivered);
            }
            ServerEvent::SpeechStarted => {
                let text = json!({ "type": "input_audio_buffer.speech_started" }).to_string();
                self.handle.broadcast_text(&text);
            }
            ServerEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
            } => {
                let request = ToolCallRequest {
                    call_id,
                    name,
                    arguments,
                };
                let call_id = request.call_id.clone();
                match self.executor.add_tool_call(request) {
                    Ok(()) => self.stats.tool_calls += 1,
                    // the model still waits for an answer to this call_id
                    Err(e) => {
                        log::warn!("Rejected tool call {}: {}", call_id, e);
                        self.on_tool_result(ToolCallResult::failed(&call_id, e.to_string()));
                    }
                }
            }
            ServerEvent::Error { error } => log::error!("error: {}", error),
            ServerEvent::AudioTranscriptDone { transcript } => log::info!("model: {}", transcript),
            ServerEvent::InputTranscriptionCompleted { transcript } => {
                log::info!("user: {}", transcript)
            }
            other if other.is_ignored() => {}
            other => log::debug!("{}", other.kind()),
        }
    }

    fn on_tool_result(&mut self, result: ToolCallResult) {
        self.stats.tool_results += 1;
        let sent = self
            .upstream
            .send_event(&ClientEvent::tool_output(&result))
            .and_then(|_| self.upstream.send_event(&ClientEvent::response_create()));
        if let Err(e) = sent {
            log::error!("Failed to return result of {}: {}", result.call_id, e);
        }
    }

    async fn close(&mut self) {
        self.recorder.close().await;
        self.upstream.set_recording(false);
        self.executor.close();
        self.upstream.close();
        self.handle.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm16_to_le_bytes;
    use crate::device_link::{ClientRegistry, Route};
    use crate::error::RelayError;
    use crate::tool_gateway::registry::tests::echo_registry;
    use futures_util::stream::BoxStream;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::Message;

    fn channel_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }

    fn test_config() -> Config {
        let mut config = Config::new().unwrap();
        config.device_input_rate = 16000;
        config.device_output_rate = 24000;
        config.upstream_rate = 24000;
        config.conditioning = false;
        config.recordings_dir = None;
        config
    }

    struct Harness {
        device: mpsc::UnboundedSender<DeviceMessage>,
        upstream: mpsc::UnboundedSender<ServerEvent>,
        outbound: mpsc::UnboundedReceiver<Message>,
        monitor: mpsc::UnboundedReceiver<Message>,
        device_echo: mpsc::UnboundedReceiver<Message>,
        registry: Arc<ClientRegistry>,
        run: JoinHandle<Result<SessionStats>>,
    }

    impl Harness {
        async fn start(config: Config) -> Self {
            let registry = Arc::new(ClientRegistry::new());
            let (monitor_tx, monitor) = mpsc::unbounded_channel();
            registry.add(Route::Monitor, monitor_tx);

            let (device_out, device_echo) = mpsc::unbounded_channel();
            let device_id = registry.add(Route::Device, device_out);
            let (device, device_rx) = mpsc::unbounded_channel();
            let conn = DeviceConnection::detached(device_id, registry.clone(), channel_stream(device_rx));

            let (upstream, upstream_rx) = mpsc::unbounded_channel();
            let (out_tx, outbound) = mpsc::unbounded_channel();
            let up = UpstreamConnection::with_channels(out_tx, channel_stream(upstream_rx));

            let agent = AgentOrchestrator::new(Arc::new(config), Arc::new(echo_registry()), "Be brief.");
            let run = tokio::spawn(agent.run(
                async { Ok::<_, RelayError>(conn) },
                async { Ok::<_, RelayError>(up) },
            ));

            let mut harness = Self {
                device,
                upstream,
                outbound,
                monitor,
                device_echo,
                registry,
                run,
            };
            let init = harness.next_sent().await;
            assert_eq!(init["type"], "session.update");
            assert_eq!(init["session"]["tools"][0]["name"], "echo");
            assert_eq!(init["session"]["instructions"], "Be brief.");
            harness
        }

        async fn next_sent(&mut self) -> Value {
            match self.outbound.recv().await.unwrap() {
                Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
                other => panic!("unexpected frame {:?}", other),
            }
        }

        async fn finish(self) -> SessionStats {
            drop(self.device);
            self.run.await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn tool_result_is_returned_and_response_requested() {
        let mut h = Harness::start(test_config()).await;

        h.upstream
            .send(ServerEvent::FunctionCallArgumentsDone {
                call_id: "call_7".into(),
                name: "echo".into(),
                arguments: r#"{"text":"done"}"#.into(),
            })
            .unwrap();

        let item = h.next_sent().await;
        assert_eq!(item["type"], "conversation.item.create");
        assert_eq!(item["item"]["type"], "function_call_output");
        assert_eq!(item["item"]["call_id"], "call_7");
        assert_eq!(item["item"]["output"], "done");
        assert_eq!(h.next_sent().await["type"], "response.create");

        let stats = h.finish().await;
        assert_eq!(stats.tool_calls, 1);
        assert_eq!(stats.tool_results, 1);
    }

    #[tokio::test]
    async fn back_to_back_tool_calls_are_all_answered() {
        let mut h = Harness::start(test_config()).await;

        for id in ["call_a", "call_b"] {
            h.upstream
                .send(ServerEvent::FunctionCallArgumentsDone {
                    call_id: id.into(),
                    name: "echo".into(),
                    arguments: format!(r#"{{"text":"{id}"}}"#),
                })
                .unwrap();
        }

        // each answer is followed by its own response.create
        let mut answered = Vec::new();
        for _ in 0..2 {
            let item = h.next_sent().await;
            assert_eq!(item["item"]["type"], "function_call_output");
            let call_id = item["item"]["call_id"].as_str().unwrap().to_string();
            let output = item["item"]["output"].as_str().unwrap().to_string();
            assert!(
                output == call_id || output.starts_with("Error: tool call adding already in progress"),
                "{call_id}: {output}"
            );
            answered.push(call_id);
            assert_eq!(h.next_sent().await["type"], "response.create");
        }
        answered.sort();
        assert_eq!(answered, vec!["call_a", "call_b"]);

        let stats = h.finish().await;
        assert_eq!(stats.tool_results, 2);
    }

    #[tokio::test]
    async fn recorded_audio_is_mirrored_to_monitors_only() {
        let mut h = Harness::start(test_config()).await;

        let chunk = Bytes::from(pcm16_to_le_bytes(&[7; 16]));
        h.device.send(DeviceMessage::Binary(Bytes::from_static(&[1]))).unwrap();
        h.device.send(DeviceMessage::Binary(chunk.clone())).unwrap();
        h.device.send(DeviceMessage::Binary(Bytes::from_static(&[0]))).unwrap();

        assert_eq!(h.next_sent().await["item"]["role"], "user");
        assert_eq!(h.monitor.recv().await.unwrap(), Message::Binary(chunk));
        assert!(h.device_echo.try_recv().is_err());

        h.finish().await;
    }

    #[tokio::test]
    async fn recorded_clip_is_resampled_and_submitted() {
        let mut h = Harness::start(test_config()).await;

        h.device.send(DeviceMessage::Binary(Bytes::from_static(&[1]))).unwrap();
        h.device
            .send(DeviceMessage::Binary(Bytes::from(pcm16_to_le_bytes(&[100; 4]))))
            .unwrap();
        h.device.send(DeviceMessage::Binary(Bytes::from_static(&[0]))).unwrap();

        let item = h.next_sent().await;
        assert_eq!(item["item"]["type"], "message");
        assert_eq!(item["item"]["role"], "user");
        let audio = item["item"]["content"][0]["audio"].as_str().unwrap();
        // 16 kHz -> 24 kHz: 4 samples become 6
        assert_eq!(
            BASE64_STANDARD.decode(audio).unwrap(),
            pcm16_to_le_bytes(&[100; 6])
        );
        assert_eq!(h.next_sent().await["type"], "response.create");

        assert_eq!(h.finish().await.clips_submitted, 1);
    }

    #[tokio::test]
    async fn audio_outside_recording_is_dropped() {
        let mut h = Harness::start(test_config()).await;

        h.device
            .send(DeviceMessage::Binary(Bytes::from(pcm16_to_le_bytes(&[5; 32]))))
            .unwrap();
        h.device.send(DeviceMessage::Binary(Bytes::from_static(&[2, 0]))).unwrap();
        h.device.send(DeviceMessage::Binary(Bytes::from_static(&[9]))).unwrap();
        h.device.send(DeviceMessage::Text(STOP_RECORD.into())).unwrap();

        // text commands work too, and an empty clip is not submitted
        h.device.send(DeviceMessage::Text(START_RECORD.into())).unwrap();
        h.device.send(DeviceMessage::Text(STOP_RECORD.into())).unwrap();

        h.upstream
            .send(ServerEvent::FunctionCallArgumentsDone {
                call_id: "c".into(),
                name: "echo".into(),
                arguments: r#"{"text":"x"}"#.into(),
            })
            .unwrap();
        // nothing was sent for the audio above
        assert_eq!(h.next_sent().await["item"]["type"], "function_call_output");

        assert_eq!(h.finish().await.clips_submitted, 0);
    }

    #[tokio::test]
    async fn upstream_audio_and_speech_events_are_broadcast() {
        let mut h = Harness::start(test_config()).await;

        let pcm = pcm16_to_le_bytes(&[1, 2, 3, 4]);
        h.upstream
            .send(ServerEvent::AudioDelta {
                delta: BASE64_STANDARD.encode(&pcm),
            })
            .unwrap();
        h.upstream.send(ServerEvent::SpeechStarted).unwrap();
        h.upstream
            .send(ServerEvent::Other {
                kind: "response.done".into(),
                raw: json!({"type": "response.done"}),
            })
            .unwrap();

        assert_eq!(h.monitor.recv().await.unwrap(), Message::Binary(Bytes::from(pcm)));
        match h.monitor.recv().await.unwrap() {
            Message::Text(text) => assert!(text.as_str().contains("speech_started")),
            other => panic!("unexpected frame {:?}", other),
        }

        let registry = h.registry.clone();
        let stats = h.finish().await;
        assert_eq!(stats.audio_chunks_out, 1);
        // device unregistered, monitor stays
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn upstream_end_closes_session() {
        let h = Harness::start(test_config()).await;
        drop(h.upstream);
        let stats = h.run.await.unwrap().unwrap();
        assert_eq!(stats.tool_calls, 0);
    }

    #[tokio::test]
    async fn connect_failure_is_returned() {
        let registry = Arc::new(ClientRegistry::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.add(Route::Device, tx);
        let conn = DeviceConnection::detached(id, registry.clone(), stream::pending().boxed());

        let agent = AgentOrchestrator::new(
            Arc::new(test_config()),
            Arc::new(ToolRegistry::new()),
            "",
        );
        let result = agent
            .run(
                async { Ok::<_, RelayError>(conn) },
                async { Err::<UpstreamConnection, _>(RelayError::ConnectTimeout(10)) },
            )
            .await;
        assert!(matches!(result, Err(RelayError::ConnectTimeout(10))));
        assert!(registry.is_empty());
    }
}
