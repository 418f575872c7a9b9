//! OpenAPI values schemas
//!
//! Packages ship `openapi/config-values.yaml` (user settings) and
//! `openapi/values.yaml` (the full values document). Both are plain
//! JSON-schema-compatible OpenAPI objects.

use serde_json::{Value as JsonValue, json};

use crate::error::{CoreError, Result, ValidationErrorInfo};
use crate::values::Values;

/// A compiled OpenAPI schema with its extracted defaults
pub struct OpenApiSchema {
    raw: JsonValue,
    compiled: jsonschema::Validator,
    defaults: JsonValue,
}

impl std::fmt::Debug for OpenApiSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenApiSchema")
            .field("raw", &self.raw)
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl OpenApiSchema {
    /// Parse a YAML or JSON schema. Empty input means "no schema".
    pub fn from_bytes(bytes: &[u8]) -> Result<Option<Self>> {
        let text = std::str::from_utf8(bytes).map_err(|e| CoreError::InvalidSchema {
            message: format!("schema is not valid UTF-8: {}", e),
        })?;

        if text.trim().is_empty() {
            return Ok(None);
        }

        let raw: JsonValue = serde_yaml::from_str(text).map_err(|e| CoreError::InvalidSchema {
            message: e.to_string(),
        })?;

        Self::from_value(raw).map(Some)
    }

    /// Compile an already parsed schema document
    pub fn from_value(raw: JsonValue) -> Result<Self> {
        if !raw.is_object() {
            return Err(CoreError::InvalidSchema {
                message: "schema must be an object".to_string(),
            });
        }

        let compiled = jsonschema::validator_for(&raw).map_err(|e| CoreError::InvalidSchema {
            message: e.to_string(),
        })?;
        let defaults = extract_defaults_recursive(&raw);

        Ok(Self {
            raw,
            compiled,
            defaults,
        })
    }

    /// Validate a document, collecting every violation
    pub fn validate(&self, values: &JsonValue) -> Result<()> {
        if self.compiled.is_valid(values) {
            return Ok(());
        }

        let errors = self
            .compiled
            .iter_errors(values)
            .map(|e| {
                let path = e.instance_path.to_string();
                ValidationErrorInfo {
                    path: if path.is_empty() {
                        "(root)".to_string()
                    } else {
                        path
                    },
                    message: e.to_string().replace('"', "'"),
                }
            })
            .collect();

        Err(CoreError::Validation { errors })
    }

    /// Defaults declared by the schema, as a values layer
    pub fn defaults(&self) -> Values {
        Values::from(self.defaults.clone())
    }

    pub fn raw(&self) -> &JsonValue {
        &self.raw
    }
}

/// Add the `registry` section to a values schema that does not declare one,
/// so charts can always reference registry settings.
pub fn inject_registry_property(schema: &mut JsonValue) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };

    let properties = obj
        .entry("properties")
        .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));

    if let Some(props) = properties.as_object_mut() {
        props.entry("registry").or_insert_with(|| {
            json!({
                "type": "object",
                "default": {},
                "properties": {
                    "base": {"type": "string"},
                    "dockercfg": {"type": "string"},
                    "scheme": {"type": "string", "enum": ["http", "https", "HTTP", "HTTPS"]},
                    "ca": {"type": "string"}
                }
            })
        });
    }
}

fn extract_defaults_recursive(schema: &JsonValue) -> JsonValue {
    let Some(obj) = schema.as_object() else {
        return JsonValue::Null;
    };

    let nested = obj
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|props| {
            props
                .iter()
                .filter_map(|(key, prop_schema)| {
                    let value = extract_defaults_recursive(prop_schema);
                    (!value.is_null()).then(|| (key.clone(), value))
                })
                .collect::<serde_json::Map<_, _>>()
        })
        .unwrap_or_default();

    match obj.get("default") {
        // An object default is completed by its properties' own defaults
        Some(JsonValue::Object(default)) => {
            let mut merged = JsonValue::Object(nested);
            crate::values::deep_merge(&mut merged, &JsonValue::Object(default.clone()));
            merged
        }
        Some(default) => default.clone(),
        None if !nested.is_empty() => JsonValue::Object(nested),
        None => JsonValue::Null,
    }
}
