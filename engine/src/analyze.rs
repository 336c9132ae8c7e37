use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};

use crate::client::EngineClient;
use crate::error::EngineError;
use crate::session::with_session_layout;

static BRACKET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]").expect("valid bracket pattern"));

const SHEET_LIST_OBJECT_ID: &str = "sheet-list";

/// Walk the document's object graph (sheets, their child visualizations,
/// their layouts) and report which fields each visualization references.
///
/// Field extraction is a heuristic, not an expression parser: dimension
/// definitions are taken literally when they are a single bracketed
/// identifier or a bare word, and measure expressions are scanned for
/// bracketed substrings. Objects whose layout cannot be fetched are
/// skipped and tallied, never fatal.
pub async fn field_usage(
    client: &mut EngineClient,
    app_handle: i64,
) -> Result<Value, EngineError> {
    let sheets = sheet_list(client, app_handle).await?;

    let mut usage = serde_json::Map::new();
    let mut detailed_sheets = Vec::new();
    let mut objects_scanned = 0usize;
    let mut objects_skipped = 0usize;

    for sheet in &sheets {
        let Some(sheet_id) = sheet.get("qInfo").and_then(|i| i.get("qId")).and_then(Value::as_str)
        else {
            continue;
        };
        let sheet_title = sheet
            .get("qMeta")
            .and_then(|m| m.get("title"))
            .and_then(Value::as_str)
            .unwrap_or("");

        let children = match sheet_children(client, app_handle, sheet_id).await {
            Ok(children) => children,
            Err(err) => {
                tracing::warn!(sheet_id, error = %err, "skipping unreadable sheet");
                objects_skipped += 1;
                continue;
            }
        };

        let mut sheet_objects = Vec::new();
        for child in &children {
            let object_id = child
                .get("qInfo")
                .and_then(|i| i.get("qId"))
                .and_then(Value::as_str)
                .unwrap_or("");
            let object_type = child
                .get("qInfo")
                .and_then(|i| i.get("qType"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if object_id.is_empty() {
                continue;
            }

            let layout = match object_layout(client, app_handle, object_id).await {
                Ok(layout) => layout,
                Err(err) => {
                    tracing::warn!(object_id, error = %err, "skipping unreadable object");
                    objects_skipped += 1;
                    continue;
                }
            };
            objects_scanned += 1;

            let fields = fields_from_layout(&layout);
            let object_title = layout
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or("");

            for field in &fields {
                let entry = usage.entry(field.clone()).or_insert_with(|| {
                    json!({"objects": [], "sheets": []})
                });
                if let Some(objects) = entry["objects"].as_array_mut() {
                    objects.push(json!({
                        "object_id": object_id,
                        "object_type": object_type,
                        "object_title": object_title,
                        "sheet_id": sheet_id,
                        "sheet_title": sheet_title,
                    }));
                }
                if let Some(sheet_refs) = entry["sheets"].as_array_mut() {
                    let seen = sheet_refs
                        .iter()
                        .any(|s| s["sheet_id"].as_str() == Some(sheet_id));
                    if !seen {
                        sheet_refs.push(json!({"sheet_id": sheet_id, "sheet_title": sheet_title}));
                    }
                }
            }

            sheet_objects.push(json!({
                "object_id": object_id,
                "object_type": object_type,
                "object_title": object_title,
                "fields_used": fields,
            }));
        }

        let objects_count = sheet_objects.len();
        detailed_sheets.push(json!({
            "sheet_id": sheet_id,
            "sheet_title": sheet_title,
            "objects": sheet_objects,
            "objects_count": objects_count,
        }));
    }

    let total_sheets = detailed_sheets.len();
    Ok(json!({
        "sheets": detailed_sheets,
        "total_sheets": total_sheets,
        "field_usage": usage,
        "diagnostics": {
            "sheets_from_api": sheets.len(),
            "objects_scanned": objects_scanned,
            "objects_skipped": objects_skipped,
        },
    }))
}

/// Sheet list through a session app-object-list, destroyed after reading.
async fn sheet_list(
    client: &mut EngineClient,
    app_handle: i64,
) -> Result<Vec<Value>, EngineError> {
    let definition = json!({
        "qInfo": {"qId": SHEET_LIST_OBJECT_ID, "qType": "SheetList"},
        "qAppObjectListDef": {
            "qType": "sheet",
            "qData": {
                "title": "/qMetaDef/title",
                "description": "/qMetaDef/description",
                "rank": "/rank",
                "cells": "/cells",
            },
        },
    });
    let session = with_session_layout(
        client.connection(),
        app_handle,
        definition,
        SHEET_LIST_OBJECT_ID,
    )
    .await?;
    session
        .layout
        .get("qAppObjectList")
        .and_then(|l| l.get("qItems"))
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| EngineError::structural("no qAppObjectList in sheet list layout"))
}

async fn sheet_children(
    client: &mut EngineClient,
    app_handle: i64,
    sheet_id: &str,
) -> Result<Vec<Value>, EngineError> {
    let handle = client.object_handle(app_handle, sheet_id).await?;
    let layout = client.layout(handle).await?;
    Ok(layout
        .get("qChildList")
        .and_then(|l| l.get("qItems"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default())
}

async fn object_layout(
    client: &mut EngineClient,
    app_handle: i64,
    object_id: &str,
) -> Result<Value, EngineError> {
    let handle = client.object_handle(app_handle, object_id).await?;
    client.layout(handle).await
}

/// Field references from one visualization layout.
pub fn fields_from_layout(layout: &Value) -> Vec<String> {
    let mut fields = Vec::new();

    if let Some(hypercube) = layout.get("qHyperCube") {
        collect_dimension_fields(hypercube, &mut fields);
        for measure in hypercube
            .get("qMeasureInfo")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(expression) = measure.get("qDef").and_then(Value::as_str) {
                for field in extract_bracketed_fields(expression) {
                    push_unique(&mut fields, field);
                }
            }
        }
    }

    if let Some(list_object) = layout.get("qListObject") {
        collect_dimension_fields(list_object, &mut fields);
    }

    fields
}

fn collect_dimension_fields(container: &Value, fields: &mut Vec<String>) {
    for dimension in container
        .get("qDimensionInfo")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        for def in dimension
            .get("qGroupFieldDefs")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(name) = def.as_str().and_then(extract_field_name) {
                push_unique(fields, name.to_string());
            }
        }
    }
}

fn push_unique(fields: &mut Vec<String>, field: String) {
    if !fields.contains(&field) {
        fields.push(field);
    }
}

/// A field definition is taken literally only when it is one bracketed
/// identifier (`[Sales Amount]`) or a bare word without operators;
/// anything else is a derived expression and non-extractable here.
pub fn extract_field_name(expression: &str) -> Option<&str> {
    let expression = expression.trim();
    if expression.is_empty() {
        return None;
    }
    if expression.starts_with('[')
        && expression.ends_with(']')
        && expression.matches('[').count() == 1
    {
        return Some(&expression[1..expression.len() - 1]);
    }
    let has_operator = expression
        .chars()
        .any(|c| matches!(c, ' ' | '(' | '=' | '+' | '-' | '*' | '/'));
    if !has_operator { Some(expression) } else { None }
}

/// All bracketed substrings of a measure expression, deduplicated.
/// Best-effort: does not parse set analysis or string literals.
pub fn extract_bracketed_fields(expression: &str) -> Vec<String> {
    let mut fields = Vec::new();
    for capture in BRACKET_RE.captures_iter(expression) {
        if let Some(inner) = capture.get(1) {
            push_unique(&mut fields, inner.as_str().to_string());
        }
    }
    fields
}
