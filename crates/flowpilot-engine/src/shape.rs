//! Schema-aware data shape reconciliation
//!
//! Connector payloads are heterogeneous: the primary collection may sit
//! under `items`, `results`, `emails`, `data.rows`, or anywhere else,
//! surrounded by pagination and status fields. This module finds the
//! primary collection generically, with no plugin names hardcoded, and
//! provides the fuzzy field lookup used by transforms and extraction.
//!
//! Selection order when unwrapping an object: a declared output schema
//! wins, then generic primary-data names, then pluralized nouns (longest
//! first), then the largest non-empty array, then the first array seen.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// Metadata field names that never hold the primary collection
const METADATA_DENYLIST: [&str; 32] = [
    // pagination
    "count",
    "total",
    "offset",
    "limit",
    "cursor",
    "page",
    "page_size",
    "per_page",
    "next_page",
    "next_page_token",
    "next_cursor",
    "prev_cursor",
    "total_count",
    "total_found",
    "total_pages",
    "has_more",
    "has_next",
    // status and envelope
    "success",
    "error",
    "errors",
    "warnings",
    "meta",
    "metadata",
    "status",
    "message",
    "code",
    "request_id",
    // transform residue
    "removed",
    "original_count",
    "originalcount",
    "filtered",
    "keys",
];

static PRIMARY_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(items|results|records|entries|list|rows|values|objects|entities|resources|elements|content|response)$",
    )
    .expect("primary name regex")
});

fn is_denied(name: &str) -> bool {
    let lowered = name.to_lowercase();
    METADATA_DENYLIST.contains(&lowered.as_str())
}

fn is_primary_name(name: &str) -> bool {
    PRIMARY_NAME_RE.is_match(&name.to_lowercase())
}

fn is_plural_noun(name: &str) -> bool {
    let lowered = name.to_lowercase();
    lowered.len() > 2 && lowered.ends_with('s') && !lowered.ends_with("ss")
}

/// Array field named by a declared output schema, if one names any
fn schema_array_field(schema: &Value) -> Option<String> {
    let properties = schema.get("properties")?.as_object()?;
    properties
        .iter()
        .find(|(_, prop)| prop.get("type").and_then(Value::as_str) == Some("array"))
        .map(|(name, _)| name.clone())
}

/// Extract the primary collection from a connector payload.
///
/// Returns the array when one can be discovered, the value itself when it
/// already is an array, and `None` when nothing array-like exists.
pub fn unwrap_structured_output(value: &Value, schema: Option<&Value>) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items.clone()),
        Value::Object(object) => unwrap_object(object, schema),
        _ => None,
    }
}

fn unwrap_object(object: &Map<String, Value>, schema: Option<&Value>) -> Option<Vec<Value>> {
    // nested `data` envelopes unwrap first
    if let Some(nested) = object.get("data") {
        if let Some(found) = unwrap_structured_output(nested, schema) {
            return Some(found);
        }
    }

    // authoritative schema hint beats every heuristic
    if let Some(field) = schema.and_then(schema_array_field) {
        if let Some(Value::Array(items)) = object.get(&field) {
            return Some(items.clone());
        }
    }

    let candidates: Vec<(&String, &Vec<Value>)> = object
        .iter()
        .filter(|(name, _)| !is_denied(name))
        .filter_map(|(name, value)| value.as_array().map(|items| (name, items)))
        .collect();

    if candidates.is_empty() {
        // single non-denied nested object unwraps transparently
        let nested: Vec<&Value> = object
            .iter()
            .filter(|(name, value)| !is_denied(name) && value.is_object())
            .map(|(_, value)| value)
            .collect();
        if nested.len() == 1 {
            return unwrap_structured_output(nested[0], schema);
        }
        return None;
    }

    if let Some((_, items)) = candidates.iter().find(|(name, _)| is_primary_name(name)) {
        return Some((*items).clone());
    }

    let mut plurals: Vec<&(&String, &Vec<Value>)> = candidates
        .iter()
        .filter(|(name, _)| is_plural_noun(name))
        .collect();
    if !plurals.is_empty() {
        plurals.sort_by_key(|(name, _)| std::cmp::Reverse(name.len()));
        return Some(plurals[0].1.clone());
    }

    if let Some((_, items)) = candidates
        .iter()
        .filter(|(_, items)| !items.is_empty())
        .max_by_key(|(_, items)| items.len())
    {
        return Some((*items).clone());
    }

    Some(candidates[0].1.clone())
}

/// Strip parenthetical hints and collapse non-alphanumerics:
/// `"Deal Amount (USD)"` normalizes to `"dealamount"`.
fn normalize_field_name(name: &str) -> String {
    static PAREN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\([^)]*\)").expect("paren regex"));
    let without_hints = PAREN_RE.replace_all(name, "");
    without_hints
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

/// Tokens of three or more characters used for word-overlap matching
fn significant_words(name: &str) -> Vec<String> {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| word.len() >= 3)
        .map(|word| word.to_lowercase())
        .collect()
}

/// How a field lookup succeeded; fuzzy outcomes mark outputs as repaired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldMatch {
    Exact,
    CaseInsensitive,
    Mapped,
    Fuzzy,
}

/// Look up `key` on an item: direct match, case-insensitive match,
/// declared column mapping, normalized fuzzy match, and finally
/// word-overlap (at least 60% of significant tokens shared).
pub fn find_field(
    item: &Map<String, Value>,
    key: &str,
    column_mapping: Option<&Map<String, Value>>,
) -> Option<(Value, FieldMatch)> {
    if let Some(value) = item.get(key) {
        return Some((value.clone(), FieldMatch::Exact));
    }

    let lowered = key.to_lowercase();
    if let Some((_, value)) = item.iter().find(|(name, _)| name.to_lowercase() == lowered) {
        return Some((value.clone(), FieldMatch::CaseInsensitive));
    }

    if let Some(mapping) = column_mapping {
        if let Some(mapped) = mapping.get(key).and_then(Value::as_str) {
            if let Some(value) = item.get(mapped) {
                return Some((value.clone(), FieldMatch::Mapped));
            }
        }
    }

    let normalized = normalize_field_name(key);
    if !normalized.is_empty() {
        if let Some((_, value)) = item
            .iter()
            .find(|(name, _)| normalize_field_name(name) == normalized)
        {
            return Some((value.clone(), FieldMatch::Fuzzy));
        }
    }

    let wanted = significant_words(key);
    if !wanted.is_empty() {
        for (name, value) in item {
            let have = significant_words(name);
            if have.is_empty() {
                continue;
            }
            let shared = wanted.iter().filter(|word| have.contains(word)).count();
            if (shared as f64) / (wanted.len() as f64) >= 0.6 {
                return Some((value.clone(), FieldMatch::Fuzzy));
            }
        }
    }

    None
}

/// Field value by key with all fallbacks, dropping the match kind
pub fn extract_value_by_key(
    item: &Value,
    key: &str,
    column_mapping: Option<&Map<String, Value>>,
) -> Option<Value> {
    item.as_object()
        .and_then(|object| find_field(object, key, column_mapping))
        .map(|(value, _)| value)
}

/// Sampled field names for output metadata: first item's keys for arrays,
/// top-level keys for objects, capped at `limit`
pub fn sample_field_names(value: &Value, limit: usize) -> Option<Vec<String>> {
    let object = match value {
        Value::Array(items) => items.first()?.as_object()?,
        Value::Object(object) => object,
        _ => return None,
    };
    Some(object.keys().take(limit).cloned().collect())
}

/// Derive an item count for output metadata: array length, else the first
/// nested array field's length, else an explicit count field, else 1 for
/// a bare object.
pub fn derive_item_count(value: &Value) -> Option<usize> {
    match value {
        Value::Array(items) => Some(items.len()),
        Value::Object(object) => {
            if let Some(items) = object.values().find_map(Value::as_array) {
                return Some(items.len());
            }
            for key in ["count", "total", "total_found", "total_count", "length"] {
                if let Some(n) = object.get(key).and_then(Value::as_u64) {
                    return Some(n as usize);
                }
            }
            Some(1)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unwrap_pluralized_noun_over_metadata() {
        let payload = json!({
            "emails": [{"id": "a"}],
            "total": 1,
            "next_page_token": "x"
        });
        let items = unwrap_structured_output(&payload, None).unwrap();
        assert_eq!(items, vec![json!({"id": "a"})]);
    }

    #[test]
    fn test_unwrap_primary_name_wins_over_plural() {
        let payload = json!({
            "items": [{"id": 1}],
            "warnings_list": [{"w": true}, {"w": false}]
        });
        let items = unwrap_structured_output(&payload, None).unwrap();
        assert_eq!(items, vec![json!({"id": 1})]);
    }

    #[test]
    fn test_unwrap_longest_plural_preferred() {
        let payload = json!({
            "ids": [1, 2],
            "opportunities": [{"id": 1}]
        });
        let items = unwrap_structured_output(&payload, None).unwrap();
        assert_eq!(items, vec![json!({"id": 1})]);
    }

    #[test]
    fn test_unwrap_nested_data_envelope() {
        let payload = json!({"data": {"rows": [[1, 2]]}, "success": true});
        let items = unwrap_structured_output(&payload, None).unwrap();
        assert_eq!(items, vec![json!([1, 2])]);
    }

    #[test]
    fn test_unwrap_schema_hint_is_authoritative() {
        let payload = json!({
            "records": [{"id": "wrong"}],
            "attachments": [{"id": "right"}]
        });
        let schema = json!({
            "type": "object",
            "properties": {"attachments": {"type": "array"}}
        });
        let items = unwrap_structured_output(&payload, Some(&schema)).unwrap();
        assert_eq!(items, vec![json!({"id": "right"})]);
    }

    #[test]
    fn test_unwrap_largest_nonempty_fallback() {
        let payload = json!({"aa": [], "bb": [1, 2, 3]});
        let items = unwrap_structured_output(&payload, None).unwrap();
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn test_unwrap_single_nested_object() {
        let payload = json!({"payload": {"contacts": [{"id": 9}]}, "success": true});
        let items = unwrap_structured_output(&payload, None).unwrap();
        assert_eq!(items, vec![json!({"id": 9})]);
    }

    #[test]
    fn test_no_array_anywhere() {
        assert!(unwrap_structured_output(&json!({"total": 4}), None).is_none());
        assert!(unwrap_structured_output(&json!("text"), None).is_none());
    }

    #[test]
    fn test_find_field_fallback_chain() {
        let item = json!({
            "Sales Person": "Alice",
            "Deal Amount (USD)": 1200
        });
        let object = item.as_object().unwrap();

        let (value, kind) = find_field(object, "Sales Person", None).unwrap();
        assert_eq!(value, json!("Alice"));
        assert_eq!(kind, FieldMatch::Exact);

        let (value, kind) = find_field(object, "sales person", None).unwrap();
        assert_eq!(value, json!("Alice"));
        assert_eq!(kind, FieldMatch::CaseInsensitive);

        let (value, kind) = find_field(object, "deal_amount", None).unwrap();
        assert_eq!(value, json!(1200));
        assert_eq!(kind, FieldMatch::Fuzzy);
    }

    #[test]
    fn test_find_field_word_overlap() {
        let item = json!({"customer_email_address": "a@b.c"});
        let object = item.as_object().unwrap();
        let (value, kind) = find_field(object, "email address", None).unwrap();
        assert_eq!(value, json!("a@b.c"));
        assert_eq!(kind, FieldMatch::Fuzzy);
    }

    #[test]
    fn test_column_mapping_lookup() {
        let item = json!({"c_17": "Open"});
        let object = item.as_object().unwrap();
        let mapping = json!({"Status": "c_17"});
        let (value, kind) =
            find_field(object, "Status", mapping.as_object()).unwrap();
        assert_eq!(value, json!("Open"));
        assert_eq!(kind, FieldMatch::Mapped);
    }

    #[test]
    fn test_item_count_derivation() {
        assert_eq!(derive_item_count(&json!([1, 2, 3])), Some(3));
        assert_eq!(derive_item_count(&json!({"rows": [1, 2]})), Some(2));
        assert_eq!(derive_item_count(&json!({"total_found": 7})), Some(7));
        assert_eq!(derive_item_count(&json!({"a": 1})), Some(1));
        assert_eq!(derive_item_count(&json!("scalar")), None);
    }

    #[test]
    fn test_field_name_sampling_capped() {
        let value = json!([{
            "a": 1, "b": 2, "c": 3, "d": 4, "e": 5, "f": 6,
            "g": 7, "h": 8, "i": 9, "j": 10, "k": 11
        }]);
        let names = sample_field_names(&value, 10).unwrap();
        assert_eq!(names.len(), 10);
    }
}
