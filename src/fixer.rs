use crate::identifier::Identifier;
use crate::payload::{set_payload_version, Payload, PayloadError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Transformation body of a fixer.  Must be pure: no clocks, no randomness,
/// no shared state.
pub type FixerFn = Arc<dyn Fn(&mut Payload) -> Result<(), String> + Send + Sync>;

/// Declarative fixer steps for content shipped as data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FixerOp {
    /// Move `from` to `to`.  No-op when `from` is absent.
    Rename { from: String, to: String },
    /// Insert `value` at `field` unless the field already exists.
    SetDefault { field: String, value: Payload },
    /// Overwrite `field` with `value`.
    Set { field: String, value: Payload },
    Remove { field: String },
}

impl FixerOp {
    pub fn apply(&self, payload: &mut Payload) -> Result<(), String> {
        let map = payload
            .as_object_mut()
            .ok_or_else(|| "payload is not an object".to_string())?;
        match self {
            FixerOp::Rename { from, to } => {
                if let Some(value) = map.remove(from) {
                    map.insert(to.clone(), value);
                }
            }
            FixerOp::SetDefault { field, value } => {
                map.entry(field.clone()).or_insert_with(|| value.clone());
            }
            FixerOp::Set { field, value } => {
                map.insert(field.clone(), value.clone());
            }
            FixerOp::Remove { field } => {
                map.remove(field);
            }
        }
        Ok(())
    }
}

/// One migration step: accepts payloads at exactly `from_version` and
/// produces `from_version + 1`.
#[derive(Clone)]
pub struct DataFixer {
    pub from_version: u32,
    pub label: String,
    transform: FixerFn,
}

impl DataFixer {
    pub fn new<F>(from_version: u32, label: impl Into<String>, transform: F) -> Self
    where
        F: Fn(&mut Payload) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            from_version,
            label: label.into(),
            transform: Arc::new(transform),
        }
    }

    pub fn from_ops(from_version: u32, ops: Vec<FixerOp>) -> Self {
        let label = ops
            .iter()
            .map(|op| match op {
                FixerOp::Rename { from, to } => format!("rename {from}->{to}"),
                FixerOp::SetDefault { field, .. } => format!("default {field}"),
                FixerOp::Set { field, .. } => format!("set {field}"),
                FixerOp::Remove { field } => format!("remove {field}"),
            })
            .collect::<Vec<_>>()
            .join(", ");
        Self::new(from_version, label, move |payload| {
            ops.iter().try_for_each(|op| op.apply(payload))
        })
    }

    pub fn to_version(&self) -> u32 {
        self.from_version.saturating_add(1)
    }
}

impl fmt::Debug for DataFixer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataFixer")
            .field("from_version", &self.from_version)
            .field("label", &self.label)
            .finish()
    }
}

/// Structural problems in a declared chain.  Raised while the registry is
/// built, never at load time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FixerChainError {
    Duplicate { from_version: u32 },
    Gap { after: u32, next: u32 },
    BeyondCurrent { from_version: u32, current_version: u32 },
    FallsShort { reaches: u32, current_version: u32 },
}

impl fmt::Display for FixerChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate { from_version } => {
                write!(f, "two fixers declared for version {from_version}")
            }
            Self::Gap { after, next } => write!(
                f,
                "fixer chain jumps from v{after} to a fixer for v{next}",
            ),
            Self::BeyondCurrent {
                from_version,
                current_version,
            } => write!(
                f,
                "fixer for v{from_version} is not older than current version {current_version}",
            ),
            Self::FallsShort {
                reaches,
                current_version,
            } => write!(
                f,
                "fixer chain ends at v{reaches} but current version is {current_version}",
            ),
        }
    }
}

impl std::error::Error for FixerChainError {}

/// Per-record migration failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FixerError {
    /// Payload was written by a newer program than this registry knows.
    FutureVersion {
        id: Identifier,
        version: u32,
        current_version: u32,
    },
    MissingFixer {
        id: Identifier,
        version: u32,
        target_version: u32,
    },
    TransformFailed {
        id: Identifier,
        from_version: u32,
        reason: String,
    },
    Payload {
        id: Identifier,
        error: PayloadError,
    },
}

impl fmt::Display for FixerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FutureVersion {
                id,
                version,
                current_version,
            } => write!(
                f,
                "{id}: payload version {version} is newer than supported version {current_version}",
            ),
            Self::MissingFixer {
                id,
                version,
                target_version,
            } => write!(
                f,
                "{id}: no fixer upgrades v{version} (target v{target_version})",
            ),
            Self::TransformFailed {
                id,
                from_version,
                reason,
            } => write!(f, "{id}: fixer for v{from_version} failed: {reason}"),
            Self::Payload { id, error } => write!(f, "{id}: {error}"),
        }
    }
}

impl std::error::Error for FixerError {}

/// Ordered, gap-free fixers of one type.
#[derive(Clone, Debug, Default)]
pub struct FixerChain {
    fixers: Vec<DataFixer>,
}

impl FixerChain {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Sort `fixers` and check they form one contiguous run ending at
    /// `current_version`.
    pub fn new(mut fixers: Vec<DataFixer>, current_version: u32) -> Result<Self, FixerChainError> {
        fixers.sort_by_key(|fixer| fixer.from_version);
        for pair in fixers.windows(2) {
            let (prev, next) = (pair[0].from_version, pair[1].from_version);
            if prev == next {
                return Err(FixerChainError::Duplicate { from_version: prev });
            }
            if next != prev + 1 {
                return Err(FixerChainError::Gap { after: prev, next });
            }
        }
        if let Some(last) = fixers.last() {
            if last.from_version >= current_version {
                return Err(FixerChainError::BeyondCurrent {
                    from_version: last.from_version,
                    current_version,
                });
            }
            if last.to_version() != current_version {
                return Err(FixerChainError::FallsShort {
                    reaches: last.to_version(),
                    current_version,
                });
            }
        }
        Ok(Self { fixers })
    }

    pub fn len(&self) -> usize {
        self.fixers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixers.is_empty()
    }

    /// Oldest version this chain can upgrade, if it has any fixers.
    pub fn oldest_version(&self) -> Option<u32> {
        self.fixers.first().map(|fixer| fixer.from_version)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataFixer> {
        self.fixers.iter()
    }

    fn fixer_for(&self, version: u32) -> Option<&DataFixer> {
        self.fixers
            .binary_search_by_key(&version, |fixer| fixer.from_version)
            .ok()
            .map(|index| &self.fixers[index])
    }

    /// Upgrade `payload` one version at a time from `from_version` to
    /// `to_version`, stamping the `version` field after every step.
    pub fn apply(
        &self,
        id: &Identifier,
        mut payload: Payload,
        from_version: u32,
        to_version: u32,
    ) -> Result<Payload, FixerError> {
        if from_version > to_version {
            return Err(FixerError::FutureVersion {
                id: id.clone(),
                version: from_version,
                current_version: to_version,
            });
        }
        let mut version = from_version;
        while version < to_version {
            let fixer = self.fixer_for(version).ok_or_else(|| FixerError::MissingFixer {
                id: id.clone(),
                version,
                target_version: to_version,
            })?;
            (fixer.transform)(&mut payload).map_err(|reason| FixerError::TransformFailed {
                id: id.clone(),
                from_version: version,
                reason,
            })?;
            version += 1;
            set_payload_version(&mut payload, version).map_err(|error| FixerError::Payload {
                id: id.clone(),
                error,
            })?;
            log::trace!("{id}: applied fixer '{}' -> v{version}", fixer.label);
        }
        Ok(payload)
    }
}
