use std::time::Duration;

use serde_json::{Value, json};

use crate::error::EngineError;
use crate::transport::Transport;

/// Handle value for global-scope methods (`OpenDoc`, `GetDocList`, ...).
pub const GLOBAL_HANDLE: i64 = -1;

/// Frame-level transport the correlator runs over. `Transport` is the
/// live implementation; tests substitute a scripted frame source.
pub trait FrameTransport: Send {
    fn send_text(
        &mut self,
        payload: String,
    ) -> impl std::future::Future<Output = Result<(), EngineError>> + Send;
    fn recv_text(
        &mut self,
    ) -> impl std::future::Future<Output = Result<Option<String>, EngineError>> + Send;
    fn close(&mut self) -> impl std::future::Future<Output = ()> + Send;
}

impl FrameTransport for Transport {
    async fn send_text(&mut self, payload: String) -> Result<(), EngineError> {
        Transport::send_text(self, payload).await
    }

    async fn recv_text(&mut self) -> Result<Option<String>, EngineError> {
        Transport::recv_text(self).await
    }

    async fn close(&mut self) {
        Transport::close(self).await;
    }
}

/// One JSON-RPC connection to the engine with a monotonic request-id
/// counter.
///
/// At most one request may be in flight at a time; `call` takes `&mut self`
/// so the type system enforces the discipline. Concurrent document sessions
/// need separate connections.
pub struct Connection<T: FrameTransport = Transport> {
    transport: T,
    next_id: u64,
    call_timeout: Duration,
}

impl Connection {
    pub fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }
}

impl<T: FrameTransport> Connection<T> {
    pub fn new(transport: T, call_timeout: Duration) -> Self {
        Self {
            transport,
            next_id: 0,
            call_timeout,
        }
    }

    fn next_request_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Send one request and resolve its response.
    ///
    /// Responses are matched on the echoed request id; frames without that
    /// id (engine push notifications, stale envelopes) are discarded. The
    /// whole exchange is bounded by the configured call timeout — the
    /// engine protocol has no mid-flight cancellation, so a timeout leaves
    /// the connection unusable and the caller must reconnect.
    pub async fn call(
        &mut self,
        method: &str,
        params: Value,
        handle: i64,
    ) -> Result<Value, EngineError> {
        let id = self.next_request_id();
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "handle": handle,
            "method": method,
            "params": params,
        });

        let encoded = serde_json::to_string(&request)
            .map_err(|e| EngineError::structural(format!("unserializable request: {e}")))?;

        tracing::trace!(method, handle, id, "engine call");

        let exchange = async {
            self.transport.send_text(encoded).await?;
            loop {
                let Some(frame) = self.transport.recv_text().await? else {
                    return Err(EngineError::ConnectionLost(
                        "connection closed while awaiting response".to_string(),
                    ));
                };
                let Ok(envelope) = serde_json::from_str::<Value>(&frame) else {
                    tracing::trace!("discarding unparsable engine frame");
                    continue;
                };
                if envelope.get("id").and_then(Value::as_u64) != Some(id) {
                    // Push notification or unrelated envelope.
                    continue;
                }
                if let Some(error) = envelope.get("error") {
                    return Err(EngineError::Engine {
                        payload: error.clone(),
                    });
                }
                if let Some(result) = envelope.get("result") {
                    return Ok(result.clone());
                }
                // Envelope echoes our id but carries neither key; keep
                // reading rather than guessing.
            }
        };

        match tokio::time::timeout(self.call_timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => Err(EngineError::ConnectionLost(format!(
                "call {method} timed out after {:?}",
                self.call_timeout
            ))),
        }
    }

    /// Close the socket. Session-object handles die with the connection on
    /// the server side, so no destroy calls are issued here.
    pub async fn disconnect(&mut self) {
        self.transport.close().await;
    }
}

/// `qReturn.qHandle` from a create/open result, when present.
pub fn returned_handle(result: &Value) -> Option<i64> {
    result
        .get("qReturn")
        .and_then(|r| r.get("qHandle"))
        .and_then(Value::as_i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;

    enum Frame {
        Text(String),
        Closed,
        Stall,
    }

    /// Scripted frame source: pops canned incoming frames and records
    /// everything sent.
    struct ScriptedFrames {
        incoming: VecDeque<Frame>,
        sent: Vec<String>,
    }

    impl ScriptedFrames {
        fn new(incoming: Vec<Frame>) -> Self {
            Self {
                incoming: incoming.into(),
                sent: Vec::new(),
            }
        }
    }

    impl FrameTransport for ScriptedFrames {
        async fn send_text(&mut self, payload: String) -> Result<(), EngineError> {
            self.sent.push(payload);
            Ok(())
        }

        async fn recv_text(&mut self) -> Result<Option<String>, EngineError> {
            match self.incoming.pop_front() {
                Some(Frame::Text(text)) => Ok(Some(text)),
                Some(Frame::Closed) | None => Ok(None),
                Some(Frame::Stall) => std::future::pending().await,
            }
        }

        async fn close(&mut self) {}
    }

    fn frame(envelope: Value) -> Frame {
        Frame::Text(envelope.to_string())
    }

    #[test]
    fn returned_handle_reads_nested_path() {
        let result = json!({"qReturn": {"qHandle": 7, "qGenericId": "doc"}});
        assert_eq!(returned_handle(&result), Some(7));
        assert_eq!(returned_handle(&json!({"qReturn": {}})), None);
        assert_eq!(returned_handle(&json!({})), None);
    }

    #[tokio::test]
    async fn pushes_and_stale_ids_are_discarded() {
        let mut conn = Connection::new(
            ScriptedFrames::new(vec![
                Frame::Text("not json".to_string()),
                frame(json!({"method": "OnAuthenticationInformation", "params": {}})),
                frame(json!({"id": 99, "result": {"stale": true}})),
                frame(json!({"id": 1, "result": {"qReturn": {"qHandle": 4}}})),
            ]),
            Duration::from_secs(5),
        );
        let result = conn
            .call("OpenDoc", json!(["app"]), GLOBAL_HANDLE)
            .await
            .unwrap();
        assert_eq!(result["qReturn"]["qHandle"], 4);

        let request: Value = serde_json::from_str(&conn.transport.sent[0]).unwrap();
        assert_eq!(request["jsonrpc"], "2.0");
        assert_eq!(request["id"], 1);
        assert_eq!(request["method"], "OpenDoc");
        assert_eq!(request["handle"], GLOBAL_HANDLE);
        assert_eq!(request["params"], json!(["app"]));
    }

    #[tokio::test]
    async fn request_ids_increment_per_call() {
        let mut conn = Connection::new(
            ScriptedFrames::new(vec![
                frame(json!({"id": 1, "result": {"first": true}})),
                // Late duplicate of the finished exchange.
                frame(json!({"id": 1, "result": {"duplicate": true}})),
                frame(json!({"id": 2, "result": {"second": true}})),
            ]),
            Duration::from_secs(5),
        );
        conn.call("GetDocList", json!([]), GLOBAL_HANDLE)
            .await
            .unwrap();
        let second = conn
            .call("GetDocList", json!([]), GLOBAL_HANDLE)
            .await
            .unwrap();
        assert_eq!(second["second"], true);
    }

    #[tokio::test]
    async fn error_envelopes_become_engine_errors() {
        let mut conn = Connection::new(
            ScriptedFrames::new(vec![frame(
                json!({"id": 1, "error": {"code": 1002, "message": "App already open"}}),
            )]),
            Duration::from_secs(5),
        );
        let err = conn
            .call("OpenDoc", json!(["app"]), GLOBAL_HANDLE)
            .await
            .unwrap_err();
        match err {
            EngineError::Engine { payload } => assert_eq!(payload["code"], 1002),
            other => panic!("expected Engine error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_stream_is_connection_lost() {
        let mut conn = Connection::new(
            ScriptedFrames::new(vec![Frame::Closed]),
            Duration::from_secs(5),
        );
        let err = conn
            .call("GetDocList", json!([]), GLOBAL_HANDLE)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn silent_engine_times_out_as_connection_lost() {
        let mut conn = Connection::new(
            ScriptedFrames::new(vec![Frame::Stall]),
            Duration::from_millis(50),
        );
        let err = conn
            .call("GetDocList", json!([]), GLOBAL_HANDLE)
            .await
            .unwrap_err();
        match err {
            EngineError::ConnectionLost(message) => assert!(message.contains("timed out")),
            other => panic!("expected ConnectionLost, got {other:?}"),
        }
    }
}
