//! Self-contained HTML table rendering
//!
//! Emits inline-styled HTML suitable for email bodies, with no HTML
//! library involved. Input may be an array of objects, 2-D rows, or a
//! markdown string whose table is converted. Column lookups are fuzzy, so
//! `columns: ["owner"]` finds an `Owner` field.

use super::{config_str, transform_failure, TransformInput};
use crate::resolver::inline_value;
use crate::shape::find_field;
use flowpilot_core::error::WorkflowError;
use flowpilot_core::step::TransformOperation;
use serde_json::{json, Map, Value};

const TABLE_STYLE: &str =
    "border-collapse:collapse;width:100%;font-family:Arial,Helvetica,sans-serif;font-size:14px";
const TH_STYLE: &str =
    "border:1px solid #d0d0d0;padding:8px 12px;background:#f4f4f4;text-align:left;font-weight:600";
const TD_STYLE: &str = "border:1px solid #d0d0d0;padding:8px 12px;vertical-align:top";
const TITLE_STYLE: &str = "font-family:Arial,Helvetica,sans-serif;font-size:16px;margin:0 0 8px 0";

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn render_table(
    input: &TransformInput,
    config: &Map<String, Value>,
) -> Result<Value, WorkflowError> {
    let (headers, rows) = tabulate(input, config)?;

    let header_names = config
        .get("header_names")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let mut html = String::new();
    if let Some(title) = config_str(config, &["title"]) {
        html.push_str(&format!(
            "<p style=\"{}\">{}</p>",
            TITLE_STYLE,
            escape_html(title)
        ));
    }
    html.push_str(&format!("<table style=\"{}\">", TABLE_STYLE));
    html.push_str("<thead><tr>");
    for header in &headers {
        let display = header_names
            .get(header)
            .and_then(Value::as_str)
            .unwrap_or(header);
        html.push_str(&format!(
            "<th style=\"{}\">{}</th>",
            TH_STYLE,
            escape_html(display)
        ));
    }
    html.push_str("</tr></thead><tbody>");
    for row in &rows {
        html.push_str("<tr>");
        for cell in row {
            html.push_str(&format!("<td style=\"{}\">{}</td>", TD_STYLE, escape_html(cell)));
        }
        html.push_str("</tr>");
    }
    html.push_str("</tbody></table>");

    Ok(json!({
        "html": html,
        "format": "html",
        "count": rows.len(),
    }))
}

/// Normalize any accepted input into headers plus stringified rows
fn tabulate(
    input: &TransformInput,
    config: &Map<String, Value>,
) -> Result<(Vec<String>, Vec<Vec<String>>), WorkflowError> {
    if let Value::String(text) = &input.value {
        return parse_markdown_table(text).ok_or_else(|| {
            transform_failure(
                TransformOperation::RenderTable,
                "string input does not contain a markdown table",
            )
        });
    }

    let items = input.require_items(TransformOperation::RenderTable)?;
    let configured_columns: Option<Vec<String>> = config
        .get("columns")
        .and_then(Value::as_array)
        .map(|cols| cols.iter().map(inline_value).collect());

    // 2-D rows: first row is the header
    if items.first().map(Value::is_array).unwrap_or(false) {
        let headers: Vec<String> = items
            .first()
            .and_then(Value::as_array)
            .map(|row| row.iter().map(inline_value).collect())
            .unwrap_or_default();
        let rows: Vec<Vec<String>> = items
            .iter()
            .skip(1)
            .map(|row| {
                row.as_array()
                    .map(|cells| cells.iter().map(inline_value).collect())
                    .unwrap_or_default()
            })
            .collect();
        return Ok((headers, rows));
    }

    // objects: configured columns or the union of the first item's keys
    let headers = match configured_columns {
        Some(columns) if !columns.is_empty() => columns,
        _ => items
            .first()
            .and_then(Value::as_object)
            .map(|object| object.keys().cloned().collect())
            .unwrap_or_default(),
    };

    let rows: Vec<Vec<String>> = items
        .iter()
        .map(|item| {
            headers
                .iter()
                .map(|header| {
                    item.as_object()
                        .and_then(|object| find_field(object, header, None))
                        .map(|(value, _)| match value {
                            Value::Array(_) | Value::Object(_) => {
                                serde_json::to_string(&value).unwrap_or_default()
                            }
                            other => inline_value(&other),
                        })
                        .unwrap_or_default()
                })
                .collect()
        })
        .collect();

    Ok((headers, rows))
}

/// Extract the first pipe-delimited table from markdown text
fn parse_markdown_table(text: &str) -> Option<(Vec<String>, Vec<Vec<String>>)> {
    let mut lines = text
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('|') && line.ends_with('|'));

    let split_row = |line: &str| -> Vec<String> {
        line.trim_matches('|')
            .split('|')
            .map(|cell| cell.trim().to_string())
            .collect()
    };

    let headers = split_row(lines.next()?);
    let mut rows = Vec::new();
    for line in lines {
        let cells = split_row(line);
        // skip the |---|---| separator row
        if cells
            .iter()
            .all(|cell| !cell.is_empty() && cell.chars().all(|c| c == '-' || c == ':'))
        {
            continue;
        }
        rows.push(cells);
    }
    Some((headers, rows))
}
