use serde_json::{Value, json};

use crate::error::EngineError;
use crate::rpc::{Connection, FrameTransport, returned_handle};

/// The single seam between the lifecycle manager and the wire, so the
/// create/layout/destroy discipline can be exercised without a live
/// engine.
pub trait RpcCall {
    fn call(
        &mut self,
        method: &str,
        params: Value,
        handle: i64,
    ) -> impl std::future::Future<Output = Result<Value, EngineError>> + Send;
}

impl<T: FrameTransport> RpcCall for Connection<T> {
    async fn call(
        &mut self,
        method: &str,
        params: Value,
        handle: i64,
    ) -> Result<Value, EngineError> {
        Connection::call(self, method, params, handle).await
    }
}

/// A materialized session-object layout plus any non-fatal cleanup
/// diagnostic.
#[derive(Debug)]
pub struct SessionLayout {
    pub layout: Value,
    /// Set when `DestroySessionObject` failed. The computation itself
    /// succeeded; the server will reap the object when the connection
    /// closes.
    pub cleanup_warning: Option<String>,
}

impl SessionLayout {
    /// The `qHyperCube` portion, or a structural error if absent.
    pub fn hypercube(&self) -> Result<&Value, EngineError> {
        self.layout
            .get("qHyperCube")
            .ok_or_else(|| EngineError::structural("no qHyperCube in layout"))
    }

    /// The `qListObject` portion, or a structural error if absent.
    pub fn list_object(&self) -> Result<&Value, EngineError> {
        self.layout
            .get("qListObject")
            .ok_or_else(|| EngineError::structural("no qListObject in layout"))
    }
}

/// Create a session object, fetch its layout (which materializes the
/// initial data page), and destroy it again.
///
/// State machine: Created -> LayoutFetched -> Destroyed. Once creation
/// succeeds, exactly one destroy attempt is made on every exit path; a
/// destroy failure is demoted to `cleanup_warning`. A failed creation
/// destroys nothing, since nothing exists server-side.
pub async fn with_session_layout(
    rpc: &mut impl RpcCall,
    app_handle: i64,
    definition: Value,
    object_id: &str,
) -> Result<SessionLayout, EngineError> {
    let created = rpc
        .call("CreateSessionObject", json!([definition]), app_handle)
        .await?;
    let Some(object_handle) = returned_handle(&created) else {
        return Err(EngineError::structural(format!(
            "CreateSessionObject returned no handle for '{object_id}'"
        )));
    };

    let layout_result = rpc.call("GetLayout", json!([]), object_handle).await;

    let cleanup_warning = match rpc
        .call("DestroySessionObject", json!([object_id]), app_handle)
        .await
    {
        Ok(_) => None,
        Err(err) => {
            tracing::warn!(object_id, error = %err, "session object cleanup failed");
            Some(err.to_string())
        }
    };

    let envelope = layout_result?;
    let Some(layout) = envelope.get("qLayout") else {
        return Err(EngineError::structural(format!(
            "GetLayout returned no qLayout for '{object_id}'"
        )));
    };

    Ok(SessionLayout {
        layout: layout.clone(),
        cleanup_warning,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Scripted RPC endpoint: pops canned responses and records every call.
    pub(crate) struct ScriptedRpc {
        pub calls: Vec<(String, Value, i64)>,
        pub responses: Vec<Result<Value, EngineError>>,
    }

    impl ScriptedRpc {
        pub fn new(responses: Vec<Result<Value, EngineError>>) -> Self {
            Self {
                calls: Vec::new(),
                responses,
            }
        }

        pub fn destroy_count(&self) -> usize {
            self.calls
                .iter()
                .filter(|(method, _, _)| method == "DestroySessionObject")
                .count()
        }
    }

    impl RpcCall for ScriptedRpc {
        async fn call(
            &mut self,
            method: &str,
            params: Value,
            handle: i64,
        ) -> Result<Value, EngineError> {
            self.calls.push((method.to_string(), params, handle));
            if self.responses.is_empty() {
                return Err(EngineError::ConnectionLost("script exhausted".to_string()));
            }
            self.responses.remove(0)
        }
    }

    fn created(handle: i64) -> Result<Value, EngineError> {
        Ok(json!({"qReturn": {"qHandle": handle, "qGenericId": "obj"}}))
    }

    #[tokio::test]
    async fn happy_path_destroys_exactly_once() {
        let mut rpc = ScriptedRpc::new(vec![
            created(12),
            Ok(json!({"qLayout": {"qHyperCube": {"qDataPages": []}}})),
            Ok(json!({"qSuccess": true})),
        ]);
        let result = with_session_layout(&mut rpc, 1, json!({}), "table-data-x")
            .await
            .unwrap();
        assert!(result.cleanup_warning.is_none());
        assert!(result.hypercube().is_ok());
        assert_eq!(rpc.destroy_count(), 1);
        // GetLayout targets the created object handle, destroy the app.
        assert_eq!(rpc.calls[1].2, 12);
        assert_eq!(rpc.calls[2].2, 1);
        assert_eq!(rpc.calls[2].1, json!(["table-data-x"]));
    }

    #[tokio::test]
    async fn missing_hypercube_is_structural_but_still_destroyed() {
        let mut rpc = ScriptedRpc::new(vec![
            created(12),
            Ok(json!({"qLayout": {"title": "no cube here"}})),
            Ok(json!({"qSuccess": true})),
        ]);
        let layout = with_session_layout(&mut rpc, 1, json!({}), "table-data-x")
            .await
            .unwrap();
        assert!(matches!(
            layout.hypercube(),
            Err(EngineError::Structural { .. })
        ));
        assert_eq!(rpc.destroy_count(), 1);
    }

    #[tokio::test]
    async fn layout_error_still_triggers_destroy() {
        let mut rpc = ScriptedRpc::new(vec![
            created(12),
            Err(EngineError::Engine {
                payload: json!({"message": "Invalid object"}),
            }),
            Ok(json!({"qSuccess": true})),
        ]);
        let err = with_session_layout(&mut rpc, 1, json!({}), "field-stats-f")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Engine { .. }));
        assert_eq!(rpc.destroy_count(), 1);
    }

    #[tokio::test]
    async fn create_without_handle_destroys_nothing() {
        let mut rpc = ScriptedRpc::new(vec![Ok(json!({"qReturn": {}}))]);
        let err = with_session_layout(&mut rpc, 1, json!({}), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Structural { .. }));
        assert_eq!(rpc.destroy_count(), 0);
    }

    #[tokio::test]
    async fn destroy_failure_becomes_cleanup_warning() {
        let mut rpc = ScriptedRpc::new(vec![
            created(12),
            Ok(json!({"qLayout": {"qListObject": {}}})),
            Err(EngineError::Engine {
                payload: json!({"message": "Object not found"}),
            }),
        ]);
        let result = with_session_layout(&mut rpc, 1, json!({}), "field-values-f")
            .await
            .unwrap();
        let warning = result.cleanup_warning.clone().unwrap();
        assert!(warning.contains("Object not found"));
        assert!(result.list_object().is_ok());
    }
}
