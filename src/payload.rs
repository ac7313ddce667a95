use std::fmt;

/// Dynamically typed record body shared by the codec, fixers and validator.
pub type Payload = serde_json::Value;

/// Field every payload carries once it enters the fixer chain.
pub const VERSION_FIELD: &str = "version";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PayloadError {
    NotAnObject,
    InvalidVersion(String),
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnObject => f.write_str("payload is not an object"),
            Self::InvalidVersion(raw) => write!(f, "payload version {raw} is not a u32"),
        }
    }
}

impl std::error::Error for PayloadError {}

/// Read the declared version.  A missing `version` field means version 0.
pub fn payload_version(payload: &Payload) -> Result<u32, PayloadError> {
    let map = payload.as_object().ok_or(PayloadError::NotAnObject)?;
    match map.get(VERSION_FIELD) {
        None => Ok(0),
        Some(raw) => raw
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| PayloadError::InvalidVersion(raw.to_string())),
    }
}

pub fn set_payload_version(payload: &mut Payload, version: u32) -> Result<(), PayloadError> {
    let map = payload.as_object_mut().ok_or(PayloadError::NotAnObject)?;
    map.insert(VERSION_FIELD.to_string(), Payload::from(version));
    Ok(())
}

/// Deepest array/object nesting in `payload`; a flat object is 1 and a
/// scalar is 0.
pub fn payload_depth(payload: &Payload) -> usize {
    let mut deepest = 0;
    let mut pending = vec![(payload, 1usize)];
    while let Some((value, depth)) = pending.pop() {
        match value {
            Payload::Array(items) => {
                deepest = deepest.max(depth);
                pending.extend(items.iter().map(|item| (item, depth + 1)));
            }
            Payload::Object(map) => {
                deepest = deepest.max(depth);
                pending.extend(map.values().map(|item| (item, depth + 1)));
            }
            _ => {}
        }
    }
    deepest
}

/// Location inside a payload tree, rendered as `$.field[3].inner`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PayloadPath {
    segments: Vec<PathSegment>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum PathSegment {
    Field(String),
    Index(usize),
}

impl PayloadPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn field(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.segments.push(PathSegment::Field(name.to_string()));
        next
    }

    pub fn index(&self, index: usize) -> Self {
        let mut next = self.clone();
        next.segments.push(PathSegment::Index(index));
        next
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for PayloadPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("$")?;
        for segment in &self.segments {
            match segment {
                PathSegment::Field(name) => write!(f, ".{name}")?,
                PathSegment::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_version_reads_as_zero() {
        assert_eq!(payload_version(&json!({ "hardness": 5 })), Ok(0));
        assert_eq!(payload_version(&json!({ "version": 7 })), Ok(7));
    }

    #[test]
    fn depth_counts_nested_containers() {
        assert_eq!(payload_depth(&json!(3)), 0);
        assert_eq!(payload_depth(&json!({})), 1);
        assert_eq!(payload_depth(&json!({ "a": [1, { "b": [] }], "c": {} })), 4);
    }

    #[test]
    fn rejects_non_integer_versions() {
        assert!(matches!(
            payload_version(&json!({ "version": "two" })),
            Err(PayloadError::InvalidVersion(_))
        ));
        assert!(matches!(
            payload_version(&json!({ "version": -1 })),
            Err(PayloadError::InvalidVersion(_))
        ));
        assert!(matches!(
            payload_version(&json!({ "version": 4_294_967_296u64 })),
            Err(PayloadError::InvalidVersion(_))
        ));
        assert_eq!(payload_version(&json!([1, 2])), Err(PayloadError::NotAnObject));
    }

    #[test]
    fn path_renders_fields_and_indices() {
        let path = PayloadPath::root().field("drops").index(2).field("count");
        assert_eq!(path.to_string(), "$.drops[2].count");
        assert_eq!(PayloadPath::root().to_string(), "$");
    }
}
