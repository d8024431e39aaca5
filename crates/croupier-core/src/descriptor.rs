// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function descriptors loaded from a pack directory.
//!
//! A pack is a directory tree of JSON files. Files under a `ui/` directory
//! and files without a non-empty string `id` are ignored; everything else is
//! parsed as a descriptor and indexed by id.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::policy::AuthDescriptor;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Descriptor {
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub risk: String,
    #[serde(default)]
    pub auth: Option<AuthDescriptor>,
    /// JSON Schema subset constraining the invocation payload.
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub outputs: Option<Value>,
    #[serde(default)]
    pub ui: Option<Value>,
}

/// Descriptor index, rebuilt wholesale on (re)load.
#[derive(Default)]
pub struct DescriptorStore {
    by_id: RwLock<HashMap<String, Descriptor>>,
}

impl DescriptorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every descriptor under `dir`, replacing the current index.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        let mut loaded = HashMap::new();
        collect_descriptors(dir, &mut loaded)?;
        let count = loaded.len();
        debug!(dir = %dir.display(), count, "descriptor pack loaded");
        let mut by_id = self.by_id.write().unwrap_or_else(|e| e.into_inner());
        *by_id = loaded;
        Ok(count)
    }

    pub fn get(&self, id: &str) -> Option<Descriptor> {
        let by_id = self.by_id.read().unwrap_or_else(|e| e.into_inner());
        by_id.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        let by_id = self.by_id.read().unwrap_or_else(|e| e.into_inner());
        by_id.contains_key(id)
    }

    /// All descriptor ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let by_id = self.by_id.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = by_id.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Look up the descriptor and validate the payload against its `params`
    /// schema. Unknown ids fail with `UNKNOWN_FUNCTION`.
    pub fn validate_invocation(&self, function_id: &str, payload: &[u8]) -> Result<Descriptor> {
        let descriptor = self
            .get(function_id)
            .ok_or_else(|| CoreError::UnknownFunction(function_id.to_string()))?;
        if let Some(schema) = &descriptor.params {
            validate_payload(function_id, schema, payload)?;
        }
        Ok(descriptor)
    }
}

fn collect_descriptors(dir: &Path, out: &mut HashMap<String, Descriptor>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            if path.file_name().is_some_and(|n| n == "ui") {
                continue;
            }
            collect_descriptors(&path, out)?;
            continue;
        }
        if path.extension().is_none_or(|e| e != "json") {
            continue;
        }
        let bytes = std::fs::read(&path)?;
        let probe: Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(err) => {
                warn!(path = %path.display(), %err, "skipping unparseable descriptor");
                continue;
            }
        };
        match probe.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => {}
            _ => continue,
        }
        let descriptor: Descriptor = serde_json::from_value(probe)?;
        out.insert(descriptor.id.clone(), descriptor);
    }
    Ok(())
}

/// Validate `payload` against a JSON Schema subset: `type: object` at the
/// top level, `required[]`, and per-property `type` of string, number,
/// integer, boolean, or object (objects are checked shallowly). The first
/// violation wins.
pub fn validate_payload(function_id: &str, schema: &Value, payload: &[u8]) -> Result<()> {
    let invalid = |field: &str, reason: String| CoreError::PayloadInvalid {
        function_id: function_id.to_string(),
        field: field.to_string(),
        reason,
    };

    let data: Value = if payload.is_empty() {
        Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_slice(payload)
            .map_err(|e| invalid("", format!("invalid JSON: {}", e)))?
    };
    let Value::Object(fields) = &data else {
        return Err(invalid("", "payload must be a JSON object".to_string()));
    };

    if let Some(schema_type) = schema.get("type").and_then(Value::as_str)
        && schema_type != "object"
    {
        return Err(invalid(
            "",
            format!("schema type '{}' not supported", schema_type),
        ));
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !key.is_empty() && !fields.contains_key(key) {
                return Err(invalid(key, "missing required field".to_string()));
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (key, prop) in props {
            let Some(expected) = prop.get("type").and_then(Value::as_str) else {
                continue;
            };
            let Some(value) = fields.get(key) else {
                continue;
            };
            if let Err(reason) = check_type(expected, value) {
                return Err(invalid(key, reason));
            }
        }
    }

    Ok(())
}

fn check_type(expected: &str, value: &Value) -> std::result::Result<(), String> {
    let ok = match expected {
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "number" => value.is_number(),
        "integer" => match value.as_f64() {
            Some(n) => n == n.trunc(),
            None => false,
        },
        "object" => value.is_object(),
        // unknown types pass through
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(format!("want {}, got {}", expected, type_name(value)))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
