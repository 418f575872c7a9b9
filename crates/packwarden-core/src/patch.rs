//! JSON patch operations over values documents
//!
//! Supports the `add`, `remove` and `replace` operations with RFC 6901
//! pointers. Patches are applied either strictly (a missing target is an
//! error) or leniently (operations with missing targets are skipped).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{CoreError, Result};

/// Patch operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Remove,
    Replace,
}

/// A single JSON patch operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    pub op: PatchOp,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
}

impl PatchOperation {
    pub fn add(path: impl Into<String>, value: JsonValue) -> Self {
        Self {
            op: PatchOp::Add,
            path: path.into(),
            value: Some(value),
        }
    }

    pub fn replace(path: impl Into<String>, value: JsonValue) -> Self {
        Self {
            op: PatchOp::Replace,
            path: path.into(),
            value: Some(value),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Remove,
            path: path.into(),
            value: None,
        }
    }

    /// True if this operation targets `path` itself or something below it
    fn is_under(&self, path: &str) -> bool {
        self.path == path
            || (self.path.starts_with(path) && self.path[path.len()..].starts_with('/'))
    }

    /// True if the pointer can address an array position. Such operations
    /// depend on the elements before them and never override earlier ones.
    fn addresses_array(&self) -> bool {
        match parse_pointer(&self.path) {
            Ok(tokens) => tokens.iter().any(|token| is_array_token(token)),
            Err(_) => true,
        }
    }
}

/// How missing targets are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchMode {
    /// Missing targets fail the whole patch
    Strict,
    /// Operations with missing targets are skipped
    Lenient,
}

/// An ordered list of patch operations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValuesPatch {
    pub operations: Vec<PatchOperation>,
}

impl ValuesPatch {
    pub fn new(operations: Vec<PatchOperation>) -> Self {
        Self { operations }
    }

    /// Parse hook output: a JSON array, a single operation, or several such
    /// documents concatenated (one per line).
    pub fn from_json(input: &str) -> Result<Self> {
        let mut operations = Vec::new();

        for doc in serde_json::Deserializer::from_str(input).into_iter::<JsonValue>() {
            match doc? {
                JsonValue::Array(items) => {
                    for item in items {
                        operations.push(serde_json::from_value(item)?);
                    }
                }
                JsonValue::Null => {}
                item @ JsonValue::Object(_) => operations.push(serde_json::from_value(item)?),
                other => {
                    return Err(CoreError::InvalidPatch {
                        message: format!("unexpected patch document: {}", other),
                    });
                }
            }
        }

        Ok(Self { operations })
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatchOperation> {
        self.operations.iter()
    }

    /// Append operations, dropping earlier ones that a new operation
    /// fully overrides (same path or a path below it).
    ///
    /// Only operations on object keys override: appends, index inserts and
    /// index removals are always kept.
    pub fn compact_with(&mut self, other: &ValuesPatch) {
        for op in &other.operations {
            if !op.addresses_array() {
                self.operations.retain(|existing| !existing.is_under(&op.path));
            }
            self.operations.push(op.clone());
        }
    }

    /// Apply to a copy of `doc`
    pub fn apply(&self, doc: &JsonValue, mode: PatchMode) -> Result<JsonValue> {
        let mut result = doc.clone();
        for op in &self.operations {
            match apply_operation(&mut result, op) {
                Ok(()) => {}
                Err(CoreError::PatchPathNotFound { path }) if mode == PatchMode::Lenient => {
                    tracing::debug!(path = %path, "skip patch operation for missing path");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(result)
    }
}

impl From<Vec<PatchOperation>> for ValuesPatch {
    fn from(operations: Vec<PatchOperation>) -> Self {
        Self { operations }
    }
}

fn parse_pointer(path: &str) -> Result<Vec<String>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }

    let Some(rest) = path.strip_prefix('/') else {
        return Err(CoreError::InvalidPatch {
            message: format!("path '{}' must start with '/'", path),
        });
    };

    Ok(rest
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn apply_operation(doc: &mut JsonValue, op: &PatchOperation) -> Result<()> {
    let tokens = parse_pointer(&op.path)?;
    let not_found = || CoreError::PatchPathNotFound {
        path: op.path.clone(),
    };

    let value = || {
        op.value.clone().ok_or_else(|| CoreError::InvalidPatch {
            message: format!("operation '{:?}' on '{}' requires a value", op.op, op.path),
        })
    };

    let Some((last, parents)) = tokens.split_last() else {
        // Whole-document operations
        return match op.op {
            PatchOp::Add | PatchOp::Replace => {
                *doc = value()?;
                Ok(())
            }
            PatchOp::Remove => Err(CoreError::InvalidPatch {
                message: "cannot remove the document root".to_string(),
            }),
        };
    };

    let mut parent = doc;
    for token in parents {
        parent = match parent {
            JsonValue::Object(map) => map.get_mut(token).ok_or_else(not_found)?,
            JsonValue::Array(items) => {
                let index = parse_index(token, items.len(), false).ok_or_else(not_found)?;
                &mut items[index]
            }
            _ => return Err(not_found()),
        };
    }

    match (parent, op.op) {
        (JsonValue::Object(map), PatchOp::Add) => {
            map.insert(last.clone(), value()?);
        }
        (JsonValue::Object(map), PatchOp::Replace) => {
            let slot = map.get_mut(last).ok_or_else(not_found)?;
            *slot = value()?;
        }
        (JsonValue::Object(map), PatchOp::Remove) => {
            map.remove(last).ok_or_else(not_found)?;
        }
        (JsonValue::Array(items), PatchOp::Add) => {
            let index = parse_index(last, items.len(), true).ok_or_else(not_found)?;
            items.insert(index, value()?);
        }
        (JsonValue::Array(items), PatchOp::Replace) => {
            let index = parse_index(last, items.len(), false).ok_or_else(not_found)?;
            items[index] = value()?;
        }
        (JsonValue::Array(items), PatchOp::Remove) => {
            let index = parse_index(last, items.len(), false).ok_or_else(not_found)?;
            items.remove(index);
        }
        _ => return Err(not_found()),
    }

    Ok(())
}

fn is_array_token(token: &str) -> bool {
    token == "-" || (!token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()))
}

/// Array index for a pointer token; `-` means "append" for add operations
fn parse_index(token: &str, len: usize, for_insert: bool) -> Option<usize> {
    if for_insert && token == "-" {
        return Some(len);
    }
    if token.len() > 1 && token.starts_with('0') {
        return None;
    }
    let index: usize = token.parse().ok()?;
    let bound = if for_insert { len + 1 } else { len };
    (index < bound).then_some(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_replace_remove() {
        let doc = json!({"a": {"b": 1}, "list": [1, 2]});
        let patch = ValuesPatch::new(vec![
            PatchOperation::add("/a/c", json!("x")),
            PatchOperation::replace("/a/b", json!(2)),
            PatchOperation::add("/list/-", json!(3)),
            PatchOperation::remove("/list/0"),
        ]);

        let result = patch.apply(&doc, PatchMode::Strict).unwrap();
        assert_eq!(result, json!({"a": {"b": 2, "c": "x"}, "list": [2, 3]}));
        // Source untouched
        assert_eq!(doc, json!({"a": {"b": 1}, "list": [1, 2]}));
    }

    #[test]
    fn test_strict_rejects_missing_path() {
        let doc = json!({"a": 1});

        let err = ValuesPatch::new(vec![PatchOperation::remove("/missing")])
            .apply(&doc, PatchMode::Strict)
            .unwrap_err();
        assert!(matches!(err, CoreError::PatchPathNotFound { .. }));

        let err = ValuesPatch::new(vec![PatchOperation::replace("/x/y", json!(1))])
            .apply(&doc, PatchMode::Strict)
            .unwrap_err();
        assert!(matches!(err, CoreError::PatchPathNotFound { .. }));
    }

    #[test]
    fn test_lenient_skips_missing_path() {
        let doc = json!({"a": 1});
        let patch = ValuesPatch::new(vec![
            PatchOperation::remove("/missing"),
            PatchOperation::replace("/a", json!(5)),
        ]);

        let result = patch.apply(&doc, PatchMode::Lenient).unwrap();
        assert_eq!(result, json!({"a": 5}));
    }

    #[test]
    fn test_pointer_escaping() {
        let doc = json!({"a/b": {"c~d": 1}});
        let patch = ValuesPatch::new(vec![PatchOperation::replace("/a~1b/c~0d", json!(2))]);

        let result = patch.apply(&doc, PatchMode::Strict).unwrap();
        assert_eq!(result, json!({"a/b": {"c~d": 2}}));
    }

    #[test]
    fn test_invalid_pointer() {
        let err = ValuesPatch::new(vec![PatchOperation::add("a", json!(1))])
            .apply(&json!({}), PatchMode::Lenient)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidPatch { .. }));
    }

    #[test]
    fn test_from_json_concatenated_documents() {
        let input = r#"[{"op":"add","path":"/a","value":1}]
{"op":"remove","path":"/b"}
[{"op":"replace","path":"/c","value":{"x":true}}]"#;

        let patch = ValuesPatch::from_json(input).unwrap();
        assert_eq!(patch.len(), 3);
        assert_eq!(patch.operations[1], PatchOperation::remove("/b"));
        assert_eq!(patch.operations[2].value, Some(json!({"x": true})));
    }

    #[test]
    fn test_compaction_is_idempotent() {
        let incoming = ValuesPatch::new(vec![
            PatchOperation::add("/a", json!(1)),
            PatchOperation::add("/b", json!(2)),
        ]);

        let mut once = ValuesPatch::default();
        once.compact_with(&incoming);

        let mut twice = once.clone();
        twice.compact_with(&incoming);

        assert_eq!(once, twice);
    }

    #[test]
    fn test_compaction_drops_overridden_children() {
        let mut patch = ValuesPatch::new(vec![
            PatchOperation::add("/a/b", json!(1)),
            PatchOperation::add("/ab", json!(1)),
        ]);
        patch.compact_with(&ValuesPatch::new(vec![PatchOperation::replace(
            "/a",
            json!({}),
        )]));

        assert_eq!(
            patch.operations,
            vec![
                PatchOperation::add("/ab", json!(1)),
                PatchOperation::replace("/a", json!({})),
            ]
        );
    }

    #[test]
    fn test_compaction_keeps_array_operations() {
        let mut patch = ValuesPatch::default();
        let step = ValuesPatch::new(vec![
            PatchOperation::add("/list/-", json!(1)),
            PatchOperation::remove("/list/0"),
            PatchOperation::replace("/items/0/name", json!("a")),
        ]);
        patch.compact_with(&step);
        patch.compact_with(&step);

        assert_eq!(patch.len(), 6);
    }

    #[test]
    fn test_object_operation_drops_array_operations_below() {
        let mut patch = ValuesPatch::new(vec![
            PatchOperation::add("/list/-", json!(1)),
            PatchOperation::add("/list/-", json!(2)),
        ]);
        patch.compact_with(&ValuesPatch::new(vec![PatchOperation::replace(
            "/list",
            json!([]),
        )]));

        assert_eq!(patch.operations, vec![PatchOperation::replace("/list", json!([]))]);
    }
}
