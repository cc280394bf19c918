//! Single-slot hand-off between the merge loop and tool invocation.
//!
//! `add_tool_call` parks one request in a bounded(1) channel and fails fast
//! when the slot is taken. The stream returned by `results` pulls requests
//! one at a time, runs them against the registry and yields the outcome.

use std::sync::{Arc, Mutex};

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

use super::registry::ToolRegistry;
use crate::error::{RelayError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    /// Raw JSON text as produced by the model.
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Output(String),
    Failed(String),
}

/// Correlated with its request by `call_id` only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallResult {
    pub call_id: String,
    pub outcome: ToolOutcome,
}

impl ToolCallResult {
    pub fn output(call_id: &str, output: String) -> Self {
        Self {
            call_id: call_id.to_string(),
            outcome: ToolOutcome::Output(output),
        }
    }

    pub fn failed(call_id: &str, message: String) -> Self {
        Self {
            call_id: call_id.to_string(),
            outcome: ToolOutcome::Failed(message),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Failed(_))
    }

    /// Text handed back to the model; failures are prefixed with `Error: `.
    pub fn output_text(&self) -> String {
        match &self.outcome {
            ToolOutcome::Output(s) => s.clone(),
            ToolOutcome::Failed(msg) => format!("Error: {}", msg),
        }
    }
}

pub struct ToolCallExecutor {
    registry: Arc<ToolRegistry>,
    guard: Mutex<()>,
    tx: Mutex<Option<mpsc::Sender<ToolCallRequest>>>,
    rx: Mutex<Option<mpsc::Receiver<ToolCallRequest>>>,
}

impl ToolCallExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            registry,
            guard: Mutex::new(()),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Park a request for the result stream.
    ///
    /// Fails with `ToolCallAlreadyInFlight` while a previous request has not
    /// been picked up yet, and with `ExecutorClosed` after [`close`](Self::close).
    pub fn add_tool_call(&self, request: ToolCallRequest) -> Result<()> {
        let _guard = self
            .guard
            .try_lock()
            .map_err(|_| RelayError::ToolCallAlreadyInFlight)?;

        let tx = self
            .tx
            .lock()
            .ok()
            .and_then(|tx| tx.clone())
            .ok_or(RelayError::ExecutorClosed)?;

        log::info!("Queued tool call {} -> {}", request.call_id, request.name);
        tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RelayError::ToolCallAlreadyInFlight,
            mpsc::error::TrySendError::Closed(_) => RelayError::ExecutorClosed,
        })
    }

    /// The stream of results. Can be taken once.
    pub fn results(&self) -> Result<BoxStream<'static, ToolCallResult>> {
        let rx = self
            .rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or(RelayError::ExecutorClosed)?;
        let registry = self.registry.clone();

        Ok(stream::unfold((rx, registry), |(mut rx, registry)| async move {
            let request = rx.recv().await?;
            log::info!("Invoking tool {} for call {}", request.name, request.call_id);
            let result = registry.invoke(&request).await;
            Some((result, (rx, registry)))
        })
        .boxed())
    }

    /// Stop accepting calls. The result stream ends once a parked request,
    /// if any, has been run.
    pub fn close(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            if tx.take().is_some() {
                log::info!("Tool executor closed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().map(|tx| tx.is_none()).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool_gateway::registry::tests::echo_registry;

    fn echo(call_id: &str, text: &str) -> ToolCallRequest {
        ToolCallRequest {
            call_id: call_id.into(),
            name: "echo".into(),
            arguments: format!(r#"{{"text":"{}"}}"#, text),
        }
    }

    #[tokio::test]
    async fn second_call_is_rejected_while_slot_is_taken() {
        let executor = ToolCallExecutor::new(Arc::new(echo_registry()));

        executor.add_tool_call(echo("a", "one")).unwrap();
        assert!(matches!(
            executor.add_tool_call(echo("b", "two")),
            Err(RelayError::ToolCallAlreadyInFlight)
        ));

        let mut results = executor.results().unwrap();
        let first = results.next().await.unwrap();
        assert_eq!(first, ToolCallResult::output("a", "one".into()));

        // slot is free again once the request was pulled
        executor.add_tool_call(echo("c", "three")).unwrap();
        let next = results.next().await.unwrap();
        assert_eq!(next.call_id, "c");
        assert_eq!(next.output_text(), "three");
    }

    #[tokio::test]
    async fn errors_stay_inside_the_stream() {
        let executor = ToolCallExecutor::new(Arc::new(echo_registry()));
        let mut results = executor.results().unwrap();

        executor
            .add_tool_call(ToolCallRequest {
                call_id: "x".into(),
                name: "nope".into(),
                arguments: "{}".into(),
            })
            .unwrap();
        let r = results.next().await.unwrap();
        assert!(r.is_error());
        assert_eq!(r.call_id, "x");

        executor
            .add_tool_call(ToolCallRequest {
                call_id: "y".into(),
                name: "echo".into(),
                arguments: "[1,".into(),
            })
            .unwrap();
        assert!(results.next().await.unwrap().is_error());

        // stream is still alive
        executor.add_tool_call(echo("z", "ok")).unwrap();
        assert_eq!(results.next().await.unwrap().output_text(), "ok");
    }

    #[tokio::test]
    async fn close_ends_the_stream() {
        let executor = ToolCallExecutor::new(Arc::new(echo_registry()));
        let mut results = executor.results().unwrap();
        assert!(matches!(executor.results(), Err(RelayError::ExecutorClosed)));

        executor.add_tool_call(echo("last", "bye")).unwrap();
        executor.close();
        assert!(executor.is_closed());
        assert!(matches!(
            executor.add_tool_call(echo("late", "x")),
            Err(RelayError::ExecutorClosed)
        ));

        // parked request still runs, then the stream ends
        assert_eq!(results.next().await.unwrap().call_id, "last");
        assert!(results.next().await.is_none());
    }
}
