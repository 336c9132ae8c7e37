use qlik_core::QlikConfig;
use serde_json::{Value, json};

use crate::decode::{decode_list_values, decode_rows, matrix_size};
use crate::error::EngineError;
use crate::query::{DimensionSpec, HypercubeQuery, ListObjectQuery, MeasureSpec, SortRule};
use crate::rpc::{Connection, GLOBAL_HANDLE, returned_handle};
use crate::session::{RpcCall, with_session_layout};
use crate::transport::Transport;

/// Field cap for whole-table extraction, matching the engine's practical
/// column-width limits.
const TABLE_DATA_MAX_FIELDS: usize = 20;

const STAT_LABELS: [&str; 10] = [
    "unique_values",
    "total_count",
    "non_null_count",
    "min_value",
    "max_value",
    "avg_value",
    "sum_value",
    "median_value",
    "mode_value",
    "std_deviation",
];

/// High-level Engine API client: one connection, one document session.
pub struct EngineClient {
    conn: Connection,
}

impl EngineClient {
    pub async fn connect(config: &QlikConfig) -> Result<Self, EngineError> {
        let transport = Transport::negotiate(config).await?;
        Ok(Self {
            conn: Connection::new(transport, config.ws_timeout()),
        })
    }

    /// Closing the socket invalidates all session-object handles server
    /// side; no destroy calls are issued past this point.
    pub async fn disconnect(mut self) {
        self.conn.disconnect().await;
    }

    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub async fn doc_list(&mut self) -> Result<Vec<Value>, EngineError> {
        doc_list_with(&mut self.conn).await
    }

    /// Open a document and return its handle.
    ///
    /// Opening a document that is already open on this connection is not a
    /// failure: the existing handle is recovered via `GetActiveDoc`, then a
    /// doc-list scan, before the original error is surfaced.
    pub async fn open_doc(&mut self, app_id: &str, no_data: bool) -> Result<i64, EngineError> {
        open_doc_with(&mut self.conn, app_id, no_data).await
    }

    pub async fn close_doc(&mut self, app_handle: i64) -> Result<bool, EngineError> {
        let result = self.conn.call("CloseDoc", json!([]), app_handle).await?;
        Ok(result
            .get("qReturn")
            .and_then(|r| r.get("qSuccess"))
            .or_else(|| result.get("qSuccess"))
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    /// Flattened per-field records from `GetTablesAndKeys`.
    pub async fn fields(&mut self, app_handle: i64) -> Result<Value, EngineError> {
        fields_with(&mut self.conn, app_handle).await
    }

    /// Field names grouped by table, for table discovery.
    pub async fn tables_overview(&mut self, app_handle: i64) -> Result<Value, EngineError> {
        let fields_result = self.fields(app_handle).await?;
        let mut tables = serde_json::Map::new();
        for field in fields_result["fields"].as_array().into_iter().flatten() {
            let table = field["table_name"].as_str().unwrap_or("Unknown").to_string();
            let name = field["field_name"].clone();
            if let Some(list) = tables
                .entry(table)
                .or_insert_with(|| Value::Array(Vec::new()))
                .as_array_mut()
            {
                list.push(name);
            }
        }
        Ok(Value::Object(tables))
    }

    /// Extract up to `max_rows` rows of one data-model table by compiling
    /// every table field into a dimension.
    pub async fn table_data(
        &mut self,
        app_handle: i64,
        table_name: &str,
        max_rows: usize,
    ) -> Result<Value, EngineError> {
        table_data_with(&mut self.conn, app_handle, table_name, max_rows).await
    }

    /// Distinct values of one field with selection state and frequency,
    /// through a session list object.
    pub async fn field_values(
        &mut self,
        app_handle: i64,
        field_name: &str,
        max_values: usize,
        include_frequency: bool,
    ) -> Result<Value, EngineError> {
        let query = ListObjectQuery {
            field: field_name.to_string(),
            max_values,
            include_frequency,
        };
        let object_id = query.object_id();
        let session =
            with_session_layout(&mut self.conn, app_handle, query.compile(), &object_id).await?;
        let list_object = session.list_object()?;
        let values = decode_list_values(list_object);
        let (total_values, _) = matrix_size(list_object);
        let returned_count = values.len();

        let mut result = json!({
            "field_name": field_name,
            "values": values,
            "total_values": total_values,
            "returned_count": returned_count,
        });
        if let Some(warning) = session.cleanup_warning {
            result["cleanup_warning"] = json!(warning);
        }
        Ok(result)
    }

    /// Ten aggregations over one field in a zero-dimension hypercube, plus
    /// derived null/completeness percentages.
    pub async fn field_statistics(
        &mut self,
        app_handle: i64,
        field_name: &str,
    ) -> Result<Value, EngineError> {
        let expressions = [
            format!("Count(DISTINCT [{field_name}])"),
            format!("Count([{field_name}])"),
            format!("Count({{$<[{field_name}]={{'*'}}>}})"),
            format!("Min([{field_name}])"),
            format!("Max([{field_name}])"),
            format!("Avg([{field_name}])"),
            format!("Sum([{field_name}])"),
            format!("Median([{field_name}])"),
            format!("Mode([{field_name}])"),
            format!("Stdev([{field_name}])"),
        ];
        let measures: Vec<MeasureSpec> = expressions
            .iter()
            .enumerate()
            .map(|(i, expr)| MeasureSpec {
                expression: expr.clone(),
                label: Some(format!("Stat_{i}")),
                sort: None,
            })
            .collect();
        let query = HypercubeQuery::new("", Vec::new(), measures, 1)
            .with_object_id(format!("field-stats-{field_name}"));

        let object_id = query.object_id().to_string();
        let session =
            with_session_layout(&mut self.conn, app_handle, query.compile(), &object_id).await?;
        let hypercube = session.hypercube()?;

        let labels: Vec<String> = STAT_LABELS.iter().map(|s| s.to_string()).collect();
        let rows = decode_rows(hypercube, &labels);

        let mut statistics = json!({"field_name": field_name});
        if let Some(row) = rows.first() {
            for (label, cell) in row {
                statistics[label] = cell.clone();
            }
        }

        let total = statistics["total_count"]["numeric"].as_f64();
        let non_null = statistics["non_null_count"]["numeric"].as_f64();
        if let (Some(total), Some(non_null)) = (total, non_null) {
            if total > 0.0 {
                statistics["null_percentage"] =
                    json!(((total - non_null) / total * 10_000.0).round() / 100.0);
                statistics["completeness_percentage"] =
                    json!((non_null / total * 10_000.0).round() / 100.0);
            }
        }
        if let Some(warning) = session.cleanup_warning {
            statistics["cleanup_warning"] = json!(warning);
        }
        Ok(statistics)
    }

    /// Ad-hoc dimensions/measures query through the compiler, lifecycle
    /// manager and decoder.
    pub async fn hypercube(
        &mut self,
        app_handle: i64,
        dimensions: Vec<DimensionSpec>,
        measures: Vec<MeasureSpec>,
        max_rows: usize,
    ) -> Result<Value, EngineError> {
        let query = HypercubeQuery::ad_hoc(dimensions, measures, max_rows);
        let columns = query.column_names();
        let object_id = query.object_id().to_string();
        let session =
            with_session_layout(&mut self.conn, app_handle, query.compile(), &object_id).await?;
        let hypercube = session.hypercube()?;
        let rows = decode_rows(hypercube, &columns);
        let (total_rows, total_columns) = matrix_size(hypercube);
        let returned_rows = rows.len();

        let mut result = json!({
            "columns": columns,
            "data": rows,
            "total_rows": total_rows,
            "total_columns": total_columns,
            "returned_rows": returned_rows,
        });
        if let Some(warning) = session.cleanup_warning {
            result["cleanup_warning"] = json!(warning);
        }
        Ok(result)
    }

    pub async fn evaluate(&mut self, app_handle: i64, expression: &str) -> Result<Value, EngineError> {
        let result = self
            .conn
            .call("Evaluate", json!({"qExpression": expression}), app_handle)
            .await?;
        Ok(result.get("qReturn").cloned().unwrap_or(Value::Null))
    }

    pub async fn select_in_field(
        &mut self,
        app_handle: i64,
        field_name: &str,
        values: &[String],
        toggle: bool,
    ) -> Result<bool, EngineError> {
        let result = self
            .conn
            .call(
                "SelectInField",
                json!({"qFieldName": field_name, "qValues": values, "qToggleMode": toggle}),
                app_handle,
            )
            .await?;
        Ok(result
            .get("qReturn")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    pub async fn clear_all(&mut self, app_handle: i64, locked_also: bool) -> Result<bool, EngineError> {
        let result = self
            .conn
            .call("ClearAll", json!({"qLockedAlso": locked_also}), app_handle)
            .await?;
        Ok(result
            .get("qReturn")
            .and_then(Value::as_bool)
            .unwrap_or(true))
    }

    pub async fn current_selections(&mut self, app_handle: i64) -> Result<Vec<Value>, EngineError> {
        let result = self
            .conn
            .call("GetCurrentSelections", json!([]), app_handle)
            .await?;
        Ok(result
            .get("qSelections")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn measure_list(&mut self, app_handle: i64) -> Result<Vec<Value>, EngineError> {
        item_list_with(&mut self.conn, app_handle, "GetMeasureList", "qMeasureList").await
    }

    pub async fn dimension_list(&mut self, app_handle: i64) -> Result<Vec<Value>, EngineError> {
        item_list_with(&mut self.conn, app_handle, "GetDimensionList", "qDimensionList").await
    }

    pub async fn variable_list(&mut self, app_handle: i64) -> Result<Vec<Value>, EngineError> {
        item_list_with(&mut self.conn, app_handle, "GetVariableList", "qVariableList").await
    }

    pub async fn bookmark_list(&mut self, app_handle: i64) -> Result<Vec<Value>, EngineError> {
        item_list_with(&mut self.conn, app_handle, "GetBookmarkList", "qBookmarkList").await
    }

    pub async fn apply_bookmark(
        &mut self,
        app_handle: i64,
        bookmark_id: &str,
    ) -> Result<bool, EngineError> {
        apply_bookmark_with(&mut self.conn, app_handle, bookmark_id).await
    }

    pub async fn search_objects(
        &mut self,
        app_handle: i64,
        terms: &[String],
        object_types: Option<&[String]>,
    ) -> Result<Vec<Value>, EngineError> {
        search_objects_with(&mut self.conn, app_handle, terms, object_types).await
    }

    pub async fn search_suggest(
        &mut self,
        app_handle: i64,
        terms: &[String],
        suggestion_types: Option<&[String]>,
    ) -> Result<Vec<Value>, EngineError> {
        search_suggest_with(&mut self.conn, app_handle, terms, suggestion_types).await
    }

    pub async fn export_data(
        &mut self,
        app_handle: i64,
        object_id: &str,
        file_path: &str,
    ) -> Result<Value, EngineError> {
        export_data_with(&mut self.conn, app_handle, object_id, file_path).await
    }

    /// `GetObject` + handle extraction, used by the structural analyzer.
    pub async fn object_handle(
        &mut self,
        app_handle: i64,
        object_id: &str,
    ) -> Result<i64, EngineError> {
        let result = self
            .conn
            .call("GetObject", json!({"qId": object_id}), app_handle)
            .await?;
        returned_handle(&result).ok_or_else(|| {
            EngineError::structural(format!("GetObject returned no handle for '{object_id}'"))
        })
    }

    pub async fn layout(&mut self, object_handle: i64) -> Result<Value, EngineError> {
        let result = self.conn.call("GetLayout", json!([]), object_handle).await?;
        result
            .get("qLayout")
            .cloned()
            .ok_or_else(|| EngineError::structural("GetLayout returned no qLayout"))
    }

    pub async fn all_infos(&mut self, app_handle: i64) -> Result<Vec<Value>, EngineError> {
        all_infos_with(&mut self.conn, app_handle).await
    }
}

async fn fields_with(rpc: &mut impl RpcCall, app_handle: i64) -> Result<Value, EngineError> {
    let result = rpc
        .call(
            "GetTablesAndKeys",
            json!([
                {"qcx": 1000, "qcy": 1000},
                {"qcx": 0, "qcy": 0},
                30,
                true,
                false,
            ]),
            app_handle,
        )
        .await?;

    let tables = result
        .get("qtr")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut fields = Vec::new();
    for table in &tables {
        let table_name = table
            .get("qName")
            .and_then(Value::as_str)
            .unwrap_or("Unknown");
        for field in table
            .get("qFields")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            fields.push(json!({
                "field_name": field.get("qName").and_then(Value::as_str).unwrap_or(""),
                "table_name": table_name,
                "data_type": field.get("qType").and_then(Value::as_str).unwrap_or(""),
                "is_key": field.get("qIsKey").and_then(Value::as_bool).unwrap_or(false),
                "is_system": field.get("qIsSystem").and_then(Value::as_bool).unwrap_or(false),
                "is_hidden": field.get("qIsHidden").and_then(Value::as_bool).unwrap_or(false),
                "distinct_values": field.get("qnTotalDistinctValues").cloned().unwrap_or(json!(0)),
                "present_distinct_values": field.get("qnPresentDistinctValues").cloned().unwrap_or(json!(0)),
                "rows_count": field.get("qnRows").cloned().unwrap_or(json!(0)),
                "key_type": field.get("qKeyType").and_then(Value::as_str).unwrap_or(""),
                "tags": field.get("qTags").cloned().unwrap_or(json!([])),
            }));
        }
    }
    let total_fields = fields.len();
    Ok(json!({
        "fields": fields,
        "tables_count": tables.len(),
        "total_fields": total_fields,
    }))
}

async fn table_data_with(
    rpc: &mut impl RpcCall,
    app_handle: i64,
    table_name: &str,
    max_rows: usize,
) -> Result<Value, EngineError> {
    let fields_result = fields_with(rpc, app_handle).await?;
    let mut table_fields: Vec<String> = fields_result["fields"]
        .as_array()
        .into_iter()
        .flatten()
        .filter(|f| f["table_name"].as_str() == Some(table_name))
        .filter_map(|f| f["field_name"].as_str().map(str::to_string))
        .collect();
    if table_fields.is_empty() {
        return Err(EngineError::structural(format!(
            "table '{table_name}' not found or has no fields"
        )));
    }
    let truncated = table_fields.len() > TABLE_DATA_MAX_FIELDS;
    table_fields.truncate(TABLE_DATA_MAX_FIELDS);

    let dimensions: Vec<DimensionSpec> = table_fields
        .iter()
        .map(|f| DimensionSpec {
            field: f.clone(),
            sort: Some(SortRule::numeric_ascii_load_order()),
        })
        .collect();
    let query = HypercubeQuery::new("", dimensions, Vec::new(), max_rows)
        .with_object_id(format!("table-data-{table_name}"));

    let object_id = query.object_id().to_string();
    let session = with_session_layout(rpc, app_handle, query.compile(), &object_id).await?;
    let hypercube = session.hypercube()?;
    let rows = decode_rows(hypercube, &table_fields);
    let (total_rows, _) = matrix_size(hypercube);
    let returned_rows = rows.len();
    let total_columns = table_fields.len();
    let dimension_info = hypercube
        .get("qDimensionInfo")
        .cloned()
        .unwrap_or_else(|| json!([]));

    let mut result = json!({
        "table_name": table_name,
        "headers": table_fields,
        "data": rows,
        "total_rows": total_rows,
        "returned_rows": returned_rows,
        "total_columns": total_columns,
        "truncated_fields": truncated,
        "dimension_info": dimension_info,
    });
    if let Some(warning) = session.cleanup_warning {
        result["cleanup_warning"] = json!(warning);
    }
    Ok(result)
}

async fn item_list_with(
    rpc: &mut impl RpcCall,
    app_handle: i64,
    method: &str,
    list_key: &str,
) -> Result<Vec<Value>, EngineError> {
    let result = rpc.call(method, json!([]), app_handle).await?;
    Ok(result
        .get(list_key)
        .and_then(|l| l.get("qItems"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default())
}

async fn apply_bookmark_with(
    rpc: &mut impl RpcCall,
    app_handle: i64,
    bookmark_id: &str,
) -> Result<bool, EngineError> {
    let result = rpc
        .call("ApplyBookmark", json!({"qBookmarkId": bookmark_id}), app_handle)
        .await?;
    Ok(result
        .get("qReturn")
        .and_then(Value::as_bool)
        .unwrap_or(false))
}

async fn search_objects_with(
    rpc: &mut impl RpcCall,
    app_handle: i64,
    terms: &[String],
    object_types: Option<&[String]>,
) -> Result<Vec<Value>, EngineError> {
    let mut options = json!({"qSearchFields": ["*"], "qContext": "LockedFieldsOnly"});
    if let Some(types) = object_types {
        options["qTypes"] = json!(types);
    }
    let result = rpc
        .call(
            "SearchObjects",
            json!({
                "qOptions": options,
                "qTerms": terms,
                "qPage": {"qOffset": 0, "qCount": 100, "qMaxNbrFieldMatches": 5},
            }),
            app_handle,
        )
        .await?;
    Ok(result
        .get("qResult")
        .and_then(|r| r.get("qSearchTerms"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default())
}

async fn search_suggest_with(
    rpc: &mut impl RpcCall,
    app_handle: i64,
    terms: &[String],
    suggestion_types: Option<&[String]>,
) -> Result<Vec<Value>, EngineError> {
    let types = match suggestion_types {
        Some(types) => json!(types),
        None => json!(["Field", "Value", "Object"]),
    };
    let result = rpc
        .call(
            "SearchSuggest",
            json!({"qSuggestions": {"qSuggestionTypes": types}, "qTerms": terms}),
            app_handle,
        )
        .await?;
    Ok(result
        .get("qResult")
        .and_then(|r| r.get("qSuggestions"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default())
}

async fn export_data_with(
    rpc: &mut impl RpcCall,
    app_handle: i64,
    object_id: &str,
    file_path: &str,
) -> Result<Value, EngineError> {
    rpc.call(
        "ExportData",
        json!({"qObjectId": object_id, "qPath": file_path, "qExportState": "A"}),
        app_handle,
    )
    .await
}

async fn all_infos_with(rpc: &mut impl RpcCall, app_handle: i64) -> Result<Vec<Value>, EngineError> {
    let result = rpc.call("GetAllInfos", json!([]), app_handle).await?;
    Ok(result
        .get("qInfos")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default())
}

async fn doc_list_with(rpc: &mut impl RpcCall) -> Result<Vec<Value>, EngineError> {
    let result = rpc.call("GetDocList", json!([]), GLOBAL_HANDLE).await?;
    Ok(result
        .get("qDocList")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default())
}

async fn open_doc_with(
    rpc: &mut impl RpcCall,
    app_id: &str,
    no_data: bool,
) -> Result<i64, EngineError> {
    let params = if no_data {
        json!([app_id, "", "", "", true])
    } else {
        json!([app_id])
    };
    match rpc.call("OpenDoc", params, GLOBAL_HANDLE).await {
        Ok(result) => returned_handle(&result).ok_or_else(|| {
            EngineError::structural(format!("OpenDoc returned no handle for '{app_id}'"))
        }),
        Err(err) if err.is_already_open() => {
            if let Some(handle) = recover_open_handle(rpc, app_id).await {
                tracing::debug!(app_id, handle, "recovered already-open document");
                return Ok(handle);
            }
            Err(err)
        }
        Err(err) => Err(err),
    }
}

async fn recover_open_handle(rpc: &mut impl RpcCall, app_id: &str) -> Option<i64> {
    if let Ok(active) = rpc.call("GetActiveDoc", json!([]), GLOBAL_HANDLE).await {
        if let Some(handle) = returned_handle(&active) {
            return Some(handle);
        }
    }
    let docs = doc_list_with(rpc).await.ok()?;
    docs.iter()
        .find(|doc| {
            doc.get("qDocId").and_then(Value::as_str) == Some(app_id)
                || doc.get("qDocName").and_then(Value::as_str) == Some(app_id)
        })
        .and_then(|doc| doc.get("qHandle").and_then(Value::as_i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::ScriptedRpc;

    fn already_open() -> Result<Value, EngineError> {
        Err(EngineError::Engine {
            payload: json!({"code": 1002, "message": "App already open"}),
        })
    }

    #[tokio::test]
    async fn open_doc_returns_fresh_handle() {
        let mut rpc = ScriptedRpc::new(vec![Ok(json!({"qReturn": {"qHandle": 3}}))]);
        let handle = open_doc_with(&mut rpc, "sales.qvf", false).await.unwrap();
        assert_eq!(handle, 3);
        assert_eq!(rpc.calls[0].0, "OpenDoc");
        assert_eq!(rpc.calls[0].2, GLOBAL_HANDLE);
    }

    #[tokio::test]
    async fn reopening_recovers_handle_via_active_doc() {
        let mut rpc = ScriptedRpc::new(vec![
            already_open(),
            Ok(json!({"qReturn": {"qHandle": 5}})),
        ]);
        let handle = open_doc_with(&mut rpc, "sales.qvf", false).await.unwrap();
        assert_eq!(handle, 5);
        assert_eq!(rpc.calls[1].0, "GetActiveDoc");
    }

    #[tokio::test]
    async fn reopening_falls_back_to_doc_list_scan() {
        let mut rpc = ScriptedRpc::new(vec![
            already_open(),
            // GetActiveDoc carries no handle.
            Ok(json!({"qReturn": {}})),
            Ok(json!({"qDocList": [
                {"qDocId": "other.qvf", "qHandle": 2},
                {"qDocId": "sales.qvf", "qHandle": 9}
            ]})),
        ]);
        let handle = open_doc_with(&mut rpc, "sales.qvf", false).await.unwrap();
        assert_eq!(handle, 9);
    }

    #[tokio::test]
    async fn unrecoverable_reopen_surfaces_original_error() {
        let mut rpc = ScriptedRpc::new(vec![
            already_open(),
            Ok(json!({"qReturn": {}})),
            Ok(json!({"qDocList": []})),
        ]);
        let err = open_doc_with(&mut rpc, "sales.qvf", false)
            .await
            .unwrap_err();
        assert!(err.is_already_open());
    }

    #[tokio::test]
    async fn other_open_errors_propagate_without_recovery() {
        let mut rpc = ScriptedRpc::new(vec![Err(EngineError::Engine {
            payload: json!({"code": 404, "message": "Doc not found"}),
        })]);
        let err = open_doc_with(&mut rpc, "missing.qvf", false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Engine { .. }));
        assert_eq!(rpc.calls.len(), 1);
    }

    #[tokio::test]
    async fn no_data_open_uses_extended_params() {
        let mut rpc = ScriptedRpc::new(vec![Ok(json!({"qReturn": {"qHandle": 1}}))]);
        open_doc_with(&mut rpc, "sales.qvf", true).await.unwrap();
        assert_eq!(rpc.calls[0].1, json!(["sales.qvf", "", "", "", true]));
    }

    #[tokio::test]
    async fn fields_flatten_tables_into_records() {
        let mut rpc = ScriptedRpc::new(vec![Ok(json!({"qtr": [
            {"qName": "Orders", "qFields": [
                {"qName": "OrderId", "qType": "NOT_KEY", "qIsKey": false, "qnRows": 10},
                {"qName": "CustomerId", "qType": "PERFECT_KEY", "qIsKey": true}
            ]},
            {"qName": "Customers", "qFields": [
                {"qName": "CustomerId", "qIsKey": true}
            ]}
        ]}))]);
        let result = fields_with(&mut rpc, 1).await.unwrap();
        assert_eq!(result["tables_count"], 2);
        assert_eq!(result["total_fields"], 3);
        assert_eq!(result["fields"][0]["field_name"], "OrderId");
        assert_eq!(result["fields"][0]["table_name"], "Orders");
        assert_eq!(result["fields"][0]["rows_count"], 10);
        assert_eq!(result["fields"][1]["is_key"], true);
        assert_eq!(result["fields"][2]["table_name"], "Customers");
        assert_eq!(rpc.calls[0].0, "GetTablesAndKeys");
    }

    #[tokio::test]
    async fn table_data_sorts_numeric_ascii_load_order() {
        let mut rpc = ScriptedRpc::new(vec![
            Ok(json!({"qtr": [{"qName": "Orders", "qFields": [
                {"qName": "OrderId"}, {"qName": "Amount"}
            ]}]})),
            Ok(json!({"qReturn": {"qHandle": 7}})),
            Ok(json!({"qLayout": {"qHyperCube": {
                "qSize": {"qcy": 1, "qcx": 2},
                "qDimensionInfo": [
                    {"qFallbackTitle": "OrderId"},
                    {"qFallbackTitle": "Amount"}
                ],
                "qDataPages": [{"qMatrix": [[
                    {"qText": "1", "qNum": 1.0, "qIsNumeric": true},
                    {"qText": "9.5", "qNum": 9.5, "qIsNumeric": true}
                ]]}]
            }}})),
            Ok(json!({"qSuccess": true})),
        ]);
        let result = table_data_with(&mut rpc, 1, "Orders", 100).await.unwrap();
        assert_eq!(result["headers"], json!(["OrderId", "Amount"]));
        assert_eq!(result["returned_rows"], 1);
        assert_eq!(result["dimension_info"][0]["qFallbackTitle"], "OrderId");

        let (method, params, _) = &rpc.calls[1];
        assert_eq!(method, "CreateSessionObject");
        assert_eq!(params[0]["qInfo"]["qId"], "table-data-Orders");
        let criteria = &params[0]["qHyperCubeDef"]["qDimensions"][0]["qDef"]["qSortCriterias"][0];
        assert_eq!(criteria["qSortByNumeric"], 1);
        assert_eq!(criteria["qSortByAscii"], 1);
        assert_eq!(criteria["qSortByLoadOrder"], 1);
    }

    #[tokio::test]
    async fn unknown_table_is_structural_without_session_object() {
        let mut rpc = ScriptedRpc::new(vec![Ok(json!({"qtr": []}))]);
        let err = table_data_with(&mut rpc, 1, "Nope", 100).await.unwrap_err();
        assert!(matches!(err, EngineError::Structural { .. }));
        assert_eq!(rpc.calls.len(), 1);
    }

    #[tokio::test]
    async fn item_lists_unwrap_their_list_key() {
        let mut rpc = ScriptedRpc::new(vec![Ok(json!({
            "qMeasureList": {"qItems": [{"qInfo": {"qId": "m1"}}]}
        }))]);
        let items = item_list_with(&mut rpc, 1, "GetMeasureList", "qMeasureList")
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["qInfo"]["qId"], "m1");
        assert_eq!(rpc.calls[0].0, "GetMeasureList");

        let mut rpc = ScriptedRpc::new(vec![Ok(json!({}))]);
        let items = item_list_with(&mut rpc, 1, "GetBookmarkList", "qBookmarkList")
            .await
            .unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn search_results_unwrap_nested_terms() {
        let mut rpc = ScriptedRpc::new(vec![Ok(json!({
            "qResult": {"qSearchTerms": [{"qText": "Sales"}]}
        }))]);
        let hits = search_objects_with(&mut rpc, 1, &["sales".to_string()], None)
            .await
            .unwrap();
        assert_eq!(hits[0]["qText"], "Sales");
        let params = &rpc.calls[0].1;
        assert_eq!(params["qOptions"]["qSearchFields"], json!(["*"]));
        assert_eq!(params["qPage"]["qCount"], 100);
        assert!(params["qOptions"].get("qTypes").is_none());

        let types = vec!["sheet".to_string()];
        let mut rpc = ScriptedRpc::new(vec![Ok(json!({"qResult": {}}))]);
        let hits = search_objects_with(&mut rpc, 1, &["x".to_string()], Some(&types))
            .await
            .unwrap();
        assert!(hits.is_empty());
        assert_eq!(rpc.calls[0].1["qOptions"]["qTypes"], json!(["sheet"]));
    }

    #[tokio::test]
    async fn search_suggest_defaults_suggestion_types() {
        let mut rpc = ScriptedRpc::new(vec![Ok(json!({
            "qResult": {"qSuggestions": [{"qValue": "Sales"}]}
        }))]);
        let suggestions = search_suggest_with(&mut rpc, 1, &["sal".to_string()], None)
            .await
            .unwrap();
        assert_eq!(suggestions[0]["qValue"], "Sales");
        assert_eq!(
            rpc.calls[0].1["qSuggestions"]["qSuggestionTypes"],
            json!(["Field", "Value", "Object"])
        );
    }

    #[tokio::test]
    async fn apply_bookmark_reads_success_flag() {
        let mut rpc = ScriptedRpc::new(vec![Ok(json!({"qReturn": true}))]);
        assert!(apply_bookmark_with(&mut rpc, 1, "bm1").await.unwrap());
        assert_eq!(rpc.calls[0].1, json!({"qBookmarkId": "bm1"}));

        let mut rpc = ScriptedRpc::new(vec![Ok(json!({}))]);
        assert!(!apply_bookmark_with(&mut rpc, 1, "bm1").await.unwrap());
    }

    #[tokio::test]
    async fn export_requests_full_state() {
        let mut rpc = ScriptedRpc::new(vec![Ok(json!({"qUrl": "/tmp/export.csv"}))]);
        let result = export_data_with(&mut rpc, 1, "obj-1", "/tmp/export.csv")
            .await
            .unwrap();
        assert_eq!(result["qUrl"], "/tmp/export.csv");
        assert_eq!(rpc.calls[0].1["qExportState"], "A");
        assert_eq!(rpc.calls[0].1["qObjectId"], "obj-1");
    }

    #[tokio::test]
    async fn all_infos_unwraps_qinfos() {
        let mut rpc = ScriptedRpc::new(vec![Ok(json!({
            "qInfos": [{"qId": "sheet1", "qType": "sheet"}]
        }))]);
        let infos = all_infos_with(&mut rpc, 1).await.unwrap();
        assert_eq!(infos[0]["qType"], "sheet");

        let mut rpc = ScriptedRpc::new(vec![Ok(json!({}))]);
        assert!(all_infos_with(&mut rpc, 1).await.unwrap().is_empty());
    }
}
