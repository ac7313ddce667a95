//! Declarative payload schemas and the validator that checks fixed payloads
//! against them.
//!
//! Schemas are plain data (serde) so they can be shipped in a content
//! manifest.  A [`SchemaSet`] holds one schema per data version; validation
//! always targets the version the fixer chain produced.

use crate::identifier::{Category, Identifier};
use crate::payload::{payload_version, Payload, PayloadPath, VERSION_FIELD};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Report every violated constraint.
    #[default]
    Diagnostic,
    /// Stop at the first violation.
    FastPath,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Any,
    Bool,
    Integer {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    Float,
    String {
        #[serde(default)]
        max_len: Option<usize>,
    },
    Identifier,
    Enum {
        values: Vec<String>,
    },
    List {
        items: Box<FieldKind>,
    },
    Object {
        schema: Schema,
    },
}

impl FieldKind {
    fn label(&self) -> &'static str {
        match self {
            FieldKind::Any => "any",
            FieldKind::Bool => "bool",
            FieldKind::Integer { .. } => "integer",
            FieldKind::Float => "number",
            FieldKind::String { .. } => "string",
            FieldKind::Identifier => "identifier",
            FieldKind::Enum { .. } => "enum string",
            FieldKind::List { .. } => "list",
            FieldKind::Object { .. } => "object",
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub kind: FieldKind,
    #[serde(default = "default_true")]
    pub required: bool,
}

impl FieldSchema {
    pub fn required(kind: FieldKind) -> Self {
        Self {
            kind,
            required: true,
        }
    }

    pub fn optional(kind: FieldKind) -> Self {
        Self {
            kind,
            required: false,
        }
    }
}

/// Shape of one object level.  Unknown fields are accepted unless
/// `allow_unknown` is cleared, so payloads written by newer content keep
/// validating.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSchema>,
    #[serde(default = "default_true")]
    pub allow_unknown: bool,
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            fields: BTreeMap::new(),
            allow_unknown: true,
        }
    }
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, field: FieldSchema) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    pub fn closed(mut self) -> Self {
        self.allow_unknown = false;
        self
    }
}

/// Schemas for every declared version of one type.  An empty set declares
/// no constraints at all.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaSet {
    by_version: BTreeMap<u32, Schema>,
}

impl SchemaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, version: u32, schema: Schema) -> Self {
        self.by_version.insert(version, schema);
        self
    }

    pub fn insert(&mut self, version: u32, schema: Schema) {
        self.by_version.insert(version, schema);
    }

    pub fn get(&self, version: u32) -> Option<&Schema> {
        self.by_version.get(&version)
    }

    pub fn is_empty(&self) -> bool {
        self.by_version.is_empty()
    }

    pub fn versions(&self) -> impl Iterator<Item = u32> + '_ {
        self.by_version.keys().copied()
    }

    /// Check `payload` against the schema declared for `version`.
    pub fn validate(
        &self,
        version: u32,
        payload: &Payload,
        mode: ValidationMode,
    ) -> Result<(), Vec<ValidationError>> {
        let mut checker = Checker {
            mode,
            errors: Vec::new(),
        };
        checker.check_envelope(self, version, payload);
        if checker.errors.is_empty() {
            Ok(())
        } else {
            Err(checker.errors)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    pub path: PayloadPath,
    pub reason: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

/// All violations found for one record.  Holds exactly one entry in
/// fast-path mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationReport {
    pub category: Category,
    pub id: Identifier,
    pub version: u32,
    pub errors: Vec<ValidationError>,
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} v{} failed validation ({} violation(s))",
            self.category,
            self.id,
            self.version,
            self.errors.len()
        )?;
        for error in &self.errors {
            write!(f, "; {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationReport {}

struct Checker {
    mode: ValidationMode,
    errors: Vec<ValidationError>,
}

impl Checker {
    fn done(&self) -> bool {
        self.mode == ValidationMode::FastPath && !self.errors.is_empty()
    }

    fn report(&mut self, path: &PayloadPath, reason: impl Into<String>) {
        if self.done() {
            return;
        }
        self.errors.push(ValidationError {
            path: path.clone(),
            reason: reason.into(),
        });
    }

    fn check_envelope(&mut self, schemas: &SchemaSet, version: u32, payload: &Payload) {
        let root = PayloadPath::root();
        if !payload.is_object() {
            self.report(&root, "payload must be an object");
            return;
        }
        match payload_version(payload) {
            Ok(declared) if declared == version => {}
            Ok(declared) => self.report(
                &root.field(VERSION_FIELD),
                format!("payload declares version {declared}, expected {version}"),
            ),
            Err(error) => self.report(&root.field(VERSION_FIELD), error.to_string()),
        }
        if schemas.is_empty() {
            return;
        }
        match schemas.get(version) {
            Some(schema) => self.check_object(schema, payload, &root, true),
            None => self.report(&root, format!("no schema declared for version {version}")),
        }
    }

    fn check_object(&mut self, schema: &Schema, value: &Payload, path: &PayloadPath, top: bool) {
        let Some(map) = value.as_object() else {
            self.report(path, "expected object");
            return;
        };
        for (name, field) in &schema.fields {
            if self.done() {
                return;
            }
            match map.get(name) {
                Some(child) => self.check_kind(&field.kind, child, &path.field(name)),
                None if field.required => self.report(&path.field(name), "missing required field"),
                None => {}
            }
        }
        if schema.allow_unknown {
            return;
        }
        for name in map.keys() {
            if self.done() {
                return;
            }
            if top && name == VERSION_FIELD {
                continue;
            }
            if !schema.fields.contains_key(name) {
                self.report(&path.field(name), "unknown field");
            }
        }
    }

    fn check_kind(&mut self, kind: &FieldKind, value: &Payload, path: &PayloadPath) {
        match kind {
            FieldKind::Any => {}
            FieldKind::Bool => {
                if !value.is_boolean() {
                    self.mismatch(kind, value, path);
                }
            }
            FieldKind::Integer { min, max } => {
                let number = value
                    .as_i64()
                    .map(i128::from)
                    .or_else(|| value.as_u64().map(i128::from));
                let Some(number) = number else {
                    self.mismatch(kind, value, path);
                    return;
                };
                if let Some(min) = min {
                    if number < i128::from(*min) {
                        self.report(path, format!("{number} is below minimum {min}"));
                    }
                }
                if let Some(max) = max {
                    if number > i128::from(*max) {
                        self.report(path, format!("{number} is above maximum {max}"));
                    }
                }
            }
            FieldKind::Float => {
                if !value.is_number() {
                    self.mismatch(kind, value, path);
                }
            }
            FieldKind::String { max_len } => {
                let Some(text) = value.as_str() else {
                    self.mismatch(kind, value, path);
                    return;
                };
                if let Some(max_len) = max_len {
                    if text.len() > *max_len {
                        self.report(
                            path,
                            format!("string length {} exceeds {max_len}", text.len()),
                        );
                    }
                }
            }
            FieldKind::Identifier => match value.as_str() {
                Some(text) => {
                    if let Err(error) = Identifier::parse(text) {
                        self.report(path, error.to_string());
                    }
                }
                None => self.mismatch(kind, value, path),
            },
            FieldKind::Enum { values } => match value.as_str() {
                Some(text) if values.iter().any(|v| v == text) => {}
                Some(text) => self.report(
                    path,
                    format!("'{text}' is not one of [{}]", values.join(", ")),
                ),
                None => self.mismatch(kind, value, path),
            },
            FieldKind::List { items } => {
                let Some(list) = value.as_array() else {
                    self.mismatch(kind, value, path);
                    return;
                };
                for (index, item) in list.iter().enumerate() {
                    if self.done() {
                        return;
                    }
                    self.check_kind(items, item, &path.index(index));
                }
            }
            FieldKind::Object { schema } => self.check_object(schema, value, path, false),
        }
    }

    fn mismatch(&mut self, kind: &FieldKind, value: &Payload, path: &PayloadPath) {
        self.report(
            path,
            format!("expected {}, found {}", kind.label(), value_label(value)),
        );
    }
}

fn value_label(value: &Payload) -> &'static str {
    match value {
        Payload::Null => "null",
        Payload::Bool(_) => "bool",
        Payload::Number(_) => "number",
        Payload::String(_) => "string",
        Payload::Array(_) => "list",
        Payload::Object(_) => "object",
    }
}
