//! MCP runtime: a stdio JSON-RPC server exposing Qlik Cloud catalog reads
//! and Engine API analytics as Model Context Protocol tools.

use clap::{Args, Subcommand};
use serde_json::{Map, Value, json};
use tokio::io::{self, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

use qlik_core::QlikConfig;
use qlik_engine::{DimensionSpec, EngineClient, EngineError, MeasureSpec, analyze};

mod auth;
mod cloud;

use cloud::CloudClient;

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const MCP_SERVER_NAME: &str = "qlik-mcp";

const DEFAULT_LIST_LIMIT: usize = 100;
const DEFAULT_TABLE_ROWS: usize = 1000;
const DEFAULT_FIELD_VALUES: usize = 100;
const DEFAULT_HYPERCUBE_ROWS: usize = 1000;

#[derive(Subcommand)]
pub enum McpCommands {
    /// Run a Qlik MCP server over stdio
    Serve(McpServeArgs),
}

#[derive(Args, Clone, Debug)]
pub struct McpServeArgs {
    /// Explicit bearer token override (otherwise QLIK_API_KEY or the
    /// credential store)
    #[arg(long, env = "QLIK_MCP_TOKEN")]
    pub token: Option<String>,
}

pub async fn run(command: McpCommands) -> i32 {
    match command {
        McpCommands::Serve(args) => {
            let config = match QlikConfig::from_env() {
                Ok(config) => config,
                Err(err) => {
                    let payload = json!({
                        "error": "config_error",
                        "message": err.to_string(),
                    });
                    eprintln!("{}", to_pretty_json(&payload));
                    return 1;
                }
            };
            let mut server = McpServer::new(config, args.token);
            match server.serve_stdio().await {
                Ok(()) => 0,
                Err(err) => {
                    let payload = json!({
                        "error": "mcp_server_error",
                        "message": err,
                    });
                    eprintln!("{}", to_pretty_json(&payload));
                    1
                }
            }
        }
    }
}

struct McpServer {
    config: QlikConfig,
    explicit_token: Option<String>,
}

impl McpServer {
    fn new(config: QlikConfig, explicit_token: Option<String>) -> Self {
        Self {
            config,
            explicit_token,
        }
    }

    async fn serve_stdio(&mut self) -> Result<(), String> {
        tracing::info!(server = MCP_SERVER_NAME, "serving MCP over stdio");

        let stdin = io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut stdout = io::stdout();

        loop {
            let incoming = read_framed_json(&mut reader)
                .await
                .map_err(|e| format!("Failed to read MCP message: {e}"))?;
            let Some(incoming) = incoming else {
                break;
            };

            let responses = self.handle_incoming_message(incoming).await;
            for response in responses {
                write_framed_json(&mut stdout, &response)
                    .await
                    .map_err(|e| format!("Failed to write MCP response: {e}"))?;
            }
        }

        Ok(())
    }

    async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Some(batch) = incoming.as_array() {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(item.clone()).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // Most likely a client response; server does not issue outbound requests.
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        if let Some(id) = obj.get("id").cloned() {
            let result = self.handle_request(method, params).await;
            Some(match result {
                Ok(payload) => success_response(id, payload),
                Err(err) => error_response(id, err),
            })
        } else {
            self.handle_notification(method, params).await;
            None
        }
    }

    async fn handle_notification(&self, method: &str, _params: Value) {
        if matches!(
            method,
            "notifications/initialized" | "notifications/cancelled"
        ) {
            return;
        }
        // Unknown notifications are intentionally ignored.
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            "resources/list" => Ok(json!({ "resources": [] })),
            "prompts/list" => Ok(json!({ "prompts": [] })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize_payload(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": {
                    "listChanged": false
                },
                "resources": {
                    "listChanged": false
                },
                "prompts": {
                    "listChanged": false
                }
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": "Start with qlik_get_apps to discover app ids, then use the qlik_engine_* tools against one app_id: qlik_engine_fields for the data model, qlik_engine_table_data / qlik_engine_field_values for raw data, qlik_engine_hypercube for aggregations, qlik_engine_field_usage to see which visualizations reference a field, qlik_engine_items for the master library, qlik_engine_search to find objects by text."
        })
    }

    fn tools_list_payload(&self) -> Value {
        let tools: Vec<Value> = tool_definitions()
            .into_iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        let result = self.execute_tool(name, &args).await;
        Ok(match result {
            Ok(payload) => {
                let envelope = json!({
                    "status": "ok",
                    "phase": "final",
                    "tool": name,
                    "data": payload
                });
                build_tool_call_response(envelope, false)
            }
            Err(err) => {
                tracing::warn!(tool = name, error = %err.message, code = %err.code, "tool call failed");
                let envelope = json!({
                    "status": "error",
                    "phase": "final",
                    "tool": name,
                    "error": err.to_value()
                });
                build_tool_call_response(envelope, true)
            }
        })
    }

    async fn execute_tool(&self, name: &str, args: &Map<String, Value>) -> Result<Value, ToolError> {
        match name {
            "qlik_get_apps" => self.tool_get_apps(args).await,
            "qlik_get_app_details" => self.tool_get_app_details(args).await,
            "qlik_get_spaces" => self.tool_get_spaces(args).await,
            "qlik_get_data_assets" => self.tool_get_data_assets(args).await,
            "qlik_engine_fields" => {
                let app_id = require_str(args, "app_id")?;
                self.run_engine_op(app_id, EngineOp::Fields).await
            }
            "qlik_engine_table_data" => {
                let app_id = require_str(args, "app_id")?;
                let table_name = require_str(args, "table_name")?;
                let max_rows = opt_usize(args, "max_rows", DEFAULT_TABLE_ROWS)?;
                self.run_engine_op(
                    app_id,
                    EngineOp::TableData {
                        table_name,
                        max_rows,
                    },
                )
                .await
            }
            "qlik_engine_field_values" => {
                let app_id = require_str(args, "app_id")?;
                let field_name = require_str(args, "field_name")?;
                let max_values = opt_usize(args, "max_values", DEFAULT_FIELD_VALUES)?;
                let include_frequency = opt_bool(args, "include_frequency", true)?;
                self.run_engine_op(
                    app_id,
                    EngineOp::FieldValues {
                        field_name,
                        max_values,
                        include_frequency,
                    },
                )
                .await
            }
            "qlik_engine_field_statistics" => {
                let app_id = require_str(args, "app_id")?;
                let field_name = require_str(args, "field_name")?;
                self.run_engine_op(app_id, EngineOp::FieldStatistics { field_name })
                    .await
            }
            "qlik_engine_hypercube" => {
                let app_id = require_str(args, "app_id")?;
                let dimensions = parse_dimension_specs(args.get("dimensions"))?;
                let measures = parse_measure_specs(args.get("measures"))?;
                if dimensions.is_empty() && measures.is_empty() {
                    return Err(ToolError::new(
                        "invalid_arguments",
                        "At least one dimension or measure is required",
                    )
                    .with_field("dimensions"));
                }
                let max_rows = opt_usize(args, "max_rows", DEFAULT_HYPERCUBE_ROWS)?;
                self.run_engine_op(
                    app_id,
                    EngineOp::Hypercube {
                        dimensions,
                        measures,
                        max_rows,
                    },
                )
                .await
            }
            "qlik_engine_field_usage" => {
                let app_id = require_str(args, "app_id")?;
                self.run_engine_op(app_id, EngineOp::FieldUsage).await
            }
            "qlik_engine_evaluate" => {
                let app_id = require_str(args, "app_id")?;
                let expression = require_str(args, "expression")?;
                self.run_engine_op(app_id, EngineOp::Evaluate { expression })
                    .await
            }
            "qlik_engine_selections" => {
                let app_id = require_str(args, "app_id")?;
                let op = parse_selection_op(args)?;
                self.run_engine_op(app_id, op).await
            }
            "qlik_engine_items" => {
                let app_id = require_str(args, "app_id")?;
                let item_type = require_str(args, "item_type")?;
                if !matches!(
                    item_type,
                    "measures" | "dimensions" | "variables" | "bookmarks"
                ) {
                    return Err(ToolError::new(
                        "invalid_arguments",
                        format!("Unknown item_type '{item_type}'"),
                    )
                    .with_field("item_type")
                    .with_docs_hint(
                        "Supported item types: measures, dimensions, variables, bookmarks.",
                    ));
                }
                self.run_engine_op(app_id, EngineOp::Items { item_type }).await
            }
            "qlik_engine_search" => {
                let app_id = require_str(args, "app_id")?;
                let terms = opt_str_array(args, "terms").unwrap_or_default();
                if terms.is_empty() {
                    return Err(ToolError::new(
                        "invalid_arguments",
                        "A non-empty string array 'terms' is required",
                    )
                    .with_field("terms"));
                }
                let object_types = opt_str_array(args, "object_types");
                self.run_engine_op(app_id, EngineOp::Search { terms, object_types })
                    .await
            }
            _ => Err(ToolError::new(
                "unknown_tool",
                format!("Unknown tool: {name}"),
            )
            .with_docs_hint("Call tools/list for the available tool surface.")),
        }
    }

    async fn tool_get_apps(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let limit = opt_usize(args, "limit", DEFAULT_LIST_LIMIT)?;
        let cloud = self.cloud_client().await?;
        let result = cloud.get_apps(limit).await?;
        Ok(json!({
            "request": { "path": "/api/v1/items", "resource_type": "app", "limit": limit },
            "response": result.to_value(),
        }))
    }

    async fn tool_get_app_details(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let app_id = require_str(args, "app_id")?;
        let include_metadata = opt_bool(args, "include_metadata", true)?;
        let cloud = self.cloud_client().await?;

        let app = cloud.get_app(app_id).await?;
        let mut payload = json!({
            "request": { "app_id": app_id, "include_metadata": include_metadata },
            "app": app.to_value(),
        });
        if include_metadata && app.is_success() {
            let metadata = cloud.get_app_metadata(app_id).await?;
            payload["metadata"] = metadata.to_value();
        }
        Ok(payload)
    }

    async fn tool_get_spaces(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let limit = opt_usize(args, "limit", DEFAULT_LIST_LIMIT)?;
        let cloud = self.cloud_client().await?;
        let result = cloud.get_spaces(limit).await?;
        Ok(json!({
            "request": { "path": "/api/v1/spaces", "limit": limit },
            "response": result.to_value(),
        }))
    }

    async fn tool_get_data_assets(&self, args: &Map<String, Value>) -> Result<Value, ToolError> {
        let limit = opt_usize(args, "limit", DEFAULT_LIST_LIMIT)?;
        let cloud = self.cloud_client().await?;
        let result = cloud.get_data_assets(limit).await?;
        Ok(json!({
            "request": { "path": "/api/v1/data-assets", "limit": limit },
            "response": result.to_value(),
        }))
    }

    async fn cloud_client(&self) -> Result<CloudClient, ToolError> {
        let token = self.resolve_bearer_token().await?;
        CloudClient::new(&self.config, token)
    }

    async fn resolve_bearer_token(&self) -> Result<String, ToolError> {
        if let Some(token) = &self.explicit_token {
            return Ok(token.clone());
        }
        if let Some(key) = &self.config.api_key {
            return Ok(key.clone());
        }
        auth::resolve_token(&self.config.server_url)
            .await
            .map_err(|e| {
                ToolError::new("auth_missing", e.to_string())
                    .with_docs_hint("Set QLIK_API_KEY or pass --token.")
            })
    }

    /// One Engine session per tool call: connect, open the document, run
    /// the operation, always tear the socket down.
    async fn run_engine_op(&self, app_id: &str, op: EngineOp<'_>) -> Result<Value, ToolError> {
        let mut client = EngineClient::connect(&self.config)
            .await
            .map_err(engine_tool_error)?;
        let outcome = execute_engine_op(&mut client, app_id, op).await;
        client.disconnect().await;
        outcome.map_err(engine_tool_error)
    }
}

/// The Engine-backed operations, dispatched after the document is open so
/// connect/open/teardown lives in exactly one place.
enum EngineOp<'a> {
    Fields,
    TableData {
        table_name: &'a str,
        max_rows: usize,
    },
    FieldValues {
        field_name: &'a str,
        max_values: usize,
        include_frequency: bool,
    },
    FieldStatistics {
        field_name: &'a str,
    },
    Hypercube {
        dimensions: Vec<DimensionSpec>,
        measures: Vec<MeasureSpec>,
        max_rows: usize,
    },
    FieldUsage,
    Evaluate {
        expression: &'a str,
    },
    GetSelections,
    Select {
        field_name: &'a str,
        values: Vec<String>,
        toggle: bool,
    },
    ClearSelections,
    Items {
        item_type: &'a str,
    },
    Search {
        terms: Vec<String>,
        object_types: Option<Vec<String>>,
    },
}

async fn execute_engine_op(
    client: &mut EngineClient,
    app_id: &str,
    op: EngineOp<'_>,
) -> Result<Value, EngineError> {
    let app_handle = client.open_doc(app_id, false).await?;
    match op {
        EngineOp::Fields => client.fields(app_handle).await,
        EngineOp::TableData {
            table_name,
            max_rows,
        } => client.table_data(app_handle, table_name, max_rows).await,
        EngineOp::FieldValues {
            field_name,
            max_values,
            include_frequency,
        } => {
            client
                .field_values(app_handle, field_name, max_values, include_frequency)
                .await
        }
        EngineOp::FieldStatistics { field_name } => {
            client.field_statistics(app_handle, field_name).await
        }
        EngineOp::Hypercube {
            dimensions,
            measures,
            max_rows,
        } => {
            client
                .hypercube(app_handle, dimensions, measures, max_rows)
                .await
        }
        EngineOp::FieldUsage => analyze::field_usage(client, app_handle).await,
        EngineOp::Evaluate { expression } => {
            let result = client.evaluate(app_handle, expression).await?;
            Ok(json!({ "expression": expression, "result": result }))
        }
        EngineOp::GetSelections => {
            let selections = client.current_selections(app_handle).await?;
            Ok(json!({ "selections": selections }))
        }
        EngineOp::Select {
            field_name,
            values,
            toggle,
        } => {
            let applied = client
                .select_in_field(app_handle, field_name, &values, toggle)
                .await?;
            let selections = client.current_selections(app_handle).await?;
            Ok(json!({
                "field_name": field_name,
                "applied": applied,
                "selections": selections,
            }))
        }
        EngineOp::ClearSelections => {
            let cleared = client.clear_all(app_handle, false).await?;
            Ok(json!({ "cleared": cleared }))
        }
        EngineOp::Items { item_type } => {
            let items = match item_type {
                "measures" => client.measure_list(app_handle).await?,
                "dimensions" => client.dimension_list(app_handle).await?,
                "variables" => client.variable_list(app_handle).await?,
                _ => client.bookmark_list(app_handle).await?,
            };
            let count = items.len();
            Ok(json!({ "item_type": item_type, "items": items, "count": count }))
        }
        EngineOp::Search { terms, object_types } => {
            let results = client
                .search_objects(app_handle, &terms, object_types.as_deref())
                .await?;
            let suggestions = client.search_suggest(app_handle, &terms, None).await?;
            Ok(json!({
                "terms": terms,
                "results": results,
                "suggestions": suggestions,
            }))
        }
    }
}

fn engine_tool_error(err: EngineError) -> ToolError {
    match err {
        EngineError::Connection { .. } => ToolError::new("engine_connection_failed", err.to_string())
            .with_docs_hint(
                "Check QLIK_SERVER_URL, QLIK_ENGINE_PORT and the TLS settings (QLIK_VERIFY_SSL, certificate paths).",
            ),
        EngineError::ConnectionLost(_) => {
            ToolError::new("engine_connection_lost", err.to_string())
                .with_docs_hint("Retry the call; the session is re-established per tool call.")
        }
        EngineError::Engine { ref payload } => {
            let details = payload.clone();
            ToolError::new("engine_error", err.to_string()).with_details(details)
        }
        EngineError::Structural { .. } => ToolError::new("engine_protocol_error", err.to_string()),
        EngineError::Config(_) => ToolError::new("config_error", err.to_string())
            .with_docs_hint("Set QLIK_SERVER_URL plus either QLIK_API_KEY or QLIK_USER_DIRECTORY/QLIK_USER_ID."),
    }
}

fn parse_selection_op<'a>(args: &'a Map<String, Value>) -> Result<EngineOp<'a>, ToolError> {
    let action = args
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or("get");
    match action {
        "get" => Ok(EngineOp::GetSelections),
        "clear" => Ok(EngineOp::ClearSelections),
        "select" => {
            let field_name = require_str(args, "field_name")?;
            let values: Vec<String> = args
                .get("values")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            if values.is_empty() {
                return Err(ToolError::new(
                    "invalid_arguments",
                    "action 'select' requires a non-empty string array 'values'",
                )
                .with_field("values"));
            }
            let toggle = opt_bool(args, "toggle", false)?;
            Ok(EngineOp::Select {
                field_name,
                values,
                toggle,
            })
        }
        other => Err(ToolError::new(
            "invalid_arguments",
            format!("Unknown selections action '{other}'"),
        )
        .with_field("action")
        .with_docs_hint("Supported actions: get, select, clear.")),
    }
}

fn parse_dimension_specs(raw: Option<&Value>) -> Result<Vec<DimensionSpec>, ToolError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let items = raw.as_array().ok_or_else(|| {
        ToolError::new("invalid_arguments", "'dimensions' must be an array")
            .with_field("dimensions")
    })?;
    items
        .iter()
        .map(|item| match item {
            Value::String(field) => Ok(DimensionSpec::new(field.clone())),
            Value::Object(_) => serde_json::from_value(item.clone()).map_err(|e| {
                ToolError::new("invalid_arguments", format!("Invalid dimension spec: {e}"))
                    .with_field("dimensions")
            }),
            _ => Err(ToolError::new(
                "invalid_arguments",
                "Each dimension must be a field name or an object with 'field'",
            )
            .with_field("dimensions")),
        })
        .collect()
}

fn parse_measure_specs(raw: Option<&Value>) -> Result<Vec<MeasureSpec>, ToolError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let items = raw.as_array().ok_or_else(|| {
        ToolError::new("invalid_arguments", "'measures' must be an array").with_field("measures")
    })?;
    items
        .iter()
        .map(|item| match item {
            Value::String(expression) => Ok(MeasureSpec::new(expression.clone())),
            Value::Object(_) => serde_json::from_value(item.clone()).map_err(|e| {
                ToolError::new("invalid_arguments", format!("Invalid measure spec: {e}"))
                    .with_field("measures")
            }),
            _ => Err(ToolError::new(
                "invalid_arguments",
                "Each measure must be an expression string or an object with 'expression'",
            )
            .with_field("measures")),
        })
        .collect()
}

fn require_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            ToolError::new(
                "invalid_arguments",
                format!("Missing required string argument '{key}'"),
            )
            .with_field(key)
        })
}

fn opt_usize(args: &Map<String, Value>, key: &str, default: usize) -> Result<usize, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| {
                ToolError::new(
                    "invalid_arguments",
                    format!("Argument '{key}' must be a non-negative integer"),
                )
                .with_field(key)
            }),
    }
}

fn opt_str_array(args: &Map<String, Value>, key: &str) -> Option<Vec<String>> {
    args.get(key).and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}

fn opt_bool(args: &Map<String, Value>, key: &str, default: bool) -> Result<bool, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value.as_bool().ok_or_else(|| {
            ToolError::new(
                "invalid_arguments",
                format!("Argument '{key}' must be a boolean"),
            )
            .with_field(key)
        }),
    }
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
    data: Option<Value>,
}

impl RpcError {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
            data: None,
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ToolError {
    code: String,
    message: String,
    field: Option<String>,
    docs_hint: Option<String>,
    details: Option<Value>,
}

impl ToolError {
    pub(crate) fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
            docs_hint: None,
            details: None,
        }
    }

    pub(crate) fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub(crate) fn with_docs_hint(mut self, docs_hint: impl Into<String>) -> Self {
        self.docs_hint = Some(docs_hint.into());
        self
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    fn to_value(&self) -> Value {
        let mut payload = json!({
            "error": self.code,
            "message": self.message
        });
        if let Some(field) = &self.field {
            payload["field"] = Value::String(field.clone());
        }
        if let Some(docs_hint) = &self.docs_hint {
            payload["docs_hint"] = Value::String(docs_hint.clone());
        }
        if let Some(details) = &self.details {
            payload["details"] = details.clone();
        }
        payload
    }
}

#[derive(Debug)]
struct ToolDefinition {
    name: &'static str,
    description: &'static str,
    input_schema: Value,
}

fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "qlik_get_apps",
            description: "List available Qlik apps with space and ownership attributes.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "limit": { "type": "integer", "default": DEFAULT_LIST_LIMIT }
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "qlik_get_app_details",
            description: "Fetch one app's attributes, optionally with reload/data metadata.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "app_id": { "type": "string" },
                    "include_metadata": { "type": "boolean", "default": true }
                },
                "required": ["app_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "qlik_get_spaces",
            description: "List spaces (shared/managed containers for apps).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "limit": { "type": "integer", "default": DEFAULT_LIST_LIMIT }
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "qlik_get_data_assets",
            description: "List data assets (files and datasets registered in the catalog).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "limit": { "type": "integer", "default": DEFAULT_LIST_LIMIT }
                },
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "qlik_engine_fields",
            description: "Data model of an app: every field with its table, type, key role and cardinality.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "app_id": { "type": "string" }
                },
                "required": ["app_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "qlik_engine_table_data",
            description: "Extract rows of one data-model table (up to 20 fields wide).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "app_id": { "type": "string" },
                    "table_name": { "type": "string" },
                    "max_rows": { "type": "integer", "default": DEFAULT_TABLE_ROWS }
                },
                "required": ["app_id", "table_name"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "qlik_engine_field_values",
            description: "Distinct values of one field with selection state and optional frequency.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "app_id": { "type": "string" },
                    "field_name": { "type": "string" },
                    "max_values": { "type": "integer", "default": DEFAULT_FIELD_VALUES },
                    "include_frequency": { "type": "boolean", "default": true }
                },
                "required": ["app_id", "field_name"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "qlik_engine_field_statistics",
            description: "Statistical profile of one field: counts, min/max, average, median, mode, stdev, completeness.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "app_id": { "type": "string" },
                    "field_name": { "type": "string" }
                },
                "required": ["app_id", "field_name"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "qlik_engine_hypercube",
            description: "Aggregate data with dimensions and measure expressions (e.g. Sum([Sales])). Dimensions and measures accept plain strings or objects with sort overrides.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "app_id": { "type": "string" },
                    "dimensions": {
                        "type": "array",
                        "items": {
                            "anyOf": [
                                { "type": "string" },
                                {
                                    "type": "object",
                                    "properties": {
                                        "field": { "type": "string" },
                                        "sort": { "type": "object" }
                                    },
                                    "required": ["field"]
                                }
                            ]
                        }
                    },
                    "measures": {
                        "type": "array",
                        "items": {
                            "anyOf": [
                                { "type": "string" },
                                {
                                    "type": "object",
                                    "properties": {
                                        "expression": { "type": "string" },
                                        "label": { "type": "string" },
                                        "sort": { "type": "object" }
                                    },
                                    "required": ["expression"]
                                }
                            ]
                        }
                    },
                    "max_rows": { "type": "integer", "default": DEFAULT_HYPERCUBE_ROWS }
                },
                "required": ["app_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "qlik_engine_field_usage",
            description: "Walk every sheet and visualization to report which objects reference which fields.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "app_id": { "type": "string" }
                },
                "required": ["app_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "qlik_engine_evaluate",
            description: "Evaluate one Qlik expression against the app (e.g. Count(DISTINCT [Customer])).",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "app_id": { "type": "string" },
                    "expression": { "type": "string" }
                },
                "required": ["app_id", "expression"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "qlik_engine_selections",
            description: "Inspect or change the app's selection state: action 'get', 'select' (field_name + values) or 'clear'.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "app_id": { "type": "string" },
                    "action": { "type": "string", "enum": ["get", "select", "clear"], "default": "get" },
                    "field_name": { "type": "string" },
                    "values": { "type": "array", "items": { "type": "string" } },
                    "toggle": { "type": "boolean", "default": false }
                },
                "required": ["app_id"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "qlik_engine_items",
            description: "List library items of one kind: master measures, dimensions, variables or bookmarks.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "app_id": { "type": "string" },
                    "item_type": {
                        "type": "string",
                        "enum": ["measures", "dimensions", "variables", "bookmarks"]
                    }
                },
                "required": ["app_id", "item_type"],
                "additionalProperties": false
            }),
        },
        ToolDefinition {
            name: "qlik_engine_search",
            description: "Full-text search across an app's objects, with suggestions for partial terms.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "app_id": { "type": "string" },
                    "terms": { "type": "array", "items": { "type": "string" } },
                    "object_types": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["app_id", "terms"],
                "additionalProperties": false
            }),
        },
    ]
}

fn build_tool_call_response(envelope: Value, is_error: bool) -> Value {
    let text = to_pretty_json(&envelope);
    if is_error {
        json!({
            "isError": true,
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    } else {
        json!({
            "content": [{ "type": "text", "text": text }],
            "structuredContent": envelope
        })
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn error_response(id: Value, error: RpcError) -> Value {
    let mut payload = json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message
        }
    });
    if let Some(data) = error.data {
        payload["error"]["data"] = data;
    }
    payload
}

async fn read_framed_json(
    reader: &mut BufReader<tokio::io::Stdin>,
) -> Result<Option<Value>, std::io::Error> {
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if content_length.is_none() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading MCP headers",
            ));
        }

        if line == "\r\n" {
            break;
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.to_ascii_lowercase().starts_with("content-length:") {
            let raw_len = line
                .split_once(':')
                .map(|(_, right)| right.trim())
                .unwrap_or_default();
            let parsed = raw_len.parse::<usize>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Invalid Content-Length header",
                )
            })?;
            content_length = Some(parsed);
        }
    }

    let content_length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        )
    })?;
    let mut payload = vec![0_u8; content_length];
    reader.read_exact(&mut payload).await?;

    let json: Value = serde_json::from_slice(&payload).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Invalid JSON payload: {e}"),
        )
    })?;
    Ok(Some(json))
}

async fn write_framed_json(
    writer: &mut tokio::io::Stdout,
    value: &Value,
) -> Result<(), std::io::Error> {
    let body = serde_json::to_vec(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    let header = format!(
        "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
        body.len()
    );
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

fn to_pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server() -> McpServer {
        McpServer::new(
            QlikConfig {
                server_url: "https://tenant.example.com".to_string(),
                api_key: Some("test-key".to_string()),
                user_directory: None,
                user_id: None,
                engine_port: 443,
                verify_ssl: true,
                client_cert_path: None,
                client_key_path: None,
                ca_cert_path: None,
                ws_timeout_secs: 8.0,
                ws_retries: 2,
                http_timeout_secs: 30.0,
            },
            None,
        )
    }

    #[test]
    fn tool_names_are_unique_and_namespaced() {
        let tools = tool_definitions();
        let mut names: Vec<&str> = tools.iter().map(|t| t.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), tools.len());
        for tool in &tools {
            assert!(tool.name.starts_with("qlik_"), "bad name: {}", tool.name);
            assert_eq!(tool.input_schema["type"], "object");
        }
    }

    #[tokio::test]
    async fn rejects_wrong_jsonrpc_version() {
        let server = test_server();
        let response = server
            .handle_single_message(json!({"jsonrpc": "1.0", "id": 1, "method": "ping"}))
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let server = test_server();
        let response = server
            .handle_single_message(json!({"jsonrpc": "2.0", "id": 7, "method": "nope"}))
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32601);
        assert_eq!(response["id"], 7);
    }

    #[tokio::test]
    async fn notifications_produce_no_response() {
        let server = test_server();
        let response = server
            .handle_single_message(json!({
                "jsonrpc": "2.0",
                "method": "notifications/initialized"
            }))
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn empty_batch_is_invalid_request() {
        let server = test_server();
        let responses = server.handle_incoming_message(json!([])).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn initialize_reports_tool_capability() {
        let server = test_server();
        let payload = server
            .handle_request("initialize", Value::Null)
            .await
            .unwrap();
        assert_eq!(payload["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(payload["serverInfo"]["name"], MCP_SERVER_NAME);
        assert!(payload["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn tools_call_requires_name() {
        let server = test_server();
        let err = server
            .handle_request("tools/call", json!({"arguments": {}}))
            .await
            .unwrap_err();
        assert_eq!(err.code, -32602);
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_envelope_not_rpc_error() {
        let server = test_server();
        let response = server
            .handle_request("tools/call", json!({"name": "qlik_nope", "arguments": {}}))
            .await
            .unwrap();
        assert_eq!(response["isError"], true);
        assert_eq!(response["structuredContent"]["status"], "error");
        assert_eq!(
            response["structuredContent"]["error"]["error"],
            "unknown_tool"
        );
    }

    #[tokio::test]
    async fn missing_required_argument_is_a_tool_error() {
        let server = test_server();
        let response = server
            .handle_request(
                "tools/call",
                json!({"name": "qlik_engine_fields", "arguments": {}}),
            )
            .await
            .unwrap();
        assert_eq!(response["isError"], true);
        let error = &response["structuredContent"]["error"];
        assert_eq!(error["error"], "invalid_arguments");
        assert_eq!(error["field"], "app_id");
    }

    #[tokio::test]
    async fn items_tool_rejects_unknown_item_type() {
        let server = test_server();
        let response = server
            .handle_request(
                "tools/call",
                json!({
                    "name": "qlik_engine_items",
                    "arguments": {"app_id": "abc", "item_type": "widgets"}
                }),
            )
            .await
            .unwrap();
        assert_eq!(response["isError"], true);
        let error = &response["structuredContent"]["error"];
        assert_eq!(error["error"], "invalid_arguments");
        assert_eq!(error["field"], "item_type");
    }

    #[tokio::test]
    async fn search_tool_requires_terms() {
        let server = test_server();
        let response = server
            .handle_request(
                "tools/call",
                json!({
                    "name": "qlik_engine_search",
                    "arguments": {"app_id": "abc", "terms": []}
                }),
            )
            .await
            .unwrap();
        assert_eq!(response["isError"], true);
        let error = &response["structuredContent"]["error"];
        assert_eq!(error["error"], "invalid_arguments");
        assert_eq!(error["field"], "terms");
    }

    #[test]
    fn dimension_specs_accept_strings_and_objects() {
        let raw = json!(["Country", {"field": "Region", "sort": {"by_numeric": -1}}]);
        let specs = parse_dimension_specs(Some(&raw)).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].field, "Country");
        assert_eq!(specs[1].field, "Region");
        assert_eq!(specs[1].sort.as_ref().unwrap().by_numeric, -1);

        assert!(parse_dimension_specs(Some(&json!([42]))).is_err());
        assert!(parse_dimension_specs(None).unwrap().is_empty());
    }

    #[test]
    fn measure_specs_accept_strings_and_objects() {
        let raw = json!(["Sum([Sales])", {"expression": "Avg([X])", "label": "avg_x"}]);
        let specs = parse_measure_specs(Some(&raw)).unwrap();
        assert_eq!(specs[0].expression, "Sum([Sales])");
        assert_eq!(specs[1].label.as_deref(), Some("avg_x"));
    }

    #[test]
    fn selection_op_parsing_validates_values() {
        let mut args = Map::new();
        args.insert("action".to_string(), json!("select"));
        args.insert("field_name".to_string(), json!("Country"));
        args.insert("values".to_string(), json!([]));
        assert!(parse_selection_op(&args).is_err());

        args.insert("values".to_string(), json!(["US", "FR"]));
        assert!(matches!(
            parse_selection_op(&args),
            Ok(EngineOp::Select { toggle: false, .. })
        ));

        let empty = Map::new();
        assert!(matches!(parse_selection_op(&empty), Ok(EngineOp::GetSelections)));
    }

    #[test]
    fn error_envelope_marks_is_error() {
        let envelope = json!({"status": "error", "tool": "x"});
        let response = build_tool_call_response(envelope, true);
        assert_eq!(response["isError"], true);
        assert!(response["content"][0]["text"].as_str().is_some());

        let ok = build_tool_call_response(json!({"status": "ok"}), false);
        assert!(ok.get("isError").is_none());
    }

    #[test]
    fn api_path_normalization_adds_leading_slash() {
        assert_eq!(cloud::normalize_api_path("api/v1/spaces").unwrap(), "/api/v1/spaces");
        assert_eq!(cloud::normalize_api_path("/api/v1/items").unwrap(), "/api/v1/items");
        assert!(cloud::normalize_api_path("  ").is_err());
    }
}
