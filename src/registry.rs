use crate::fixer::{DataFixer, FixerChain, FixerChainError, FixerError};
use crate::identifier::{Category, Identifier};
use crate::payload::{payload_version, Payload};
use crate::record::{DataRecord, Record};
use crate::schema::{Schema, SchemaSet, ValidationMode, ValidationReport};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub type DeserializeFn =
    Arc<dyn Fn(&Payload, u32) -> Result<Box<dyn Record>, String> + Send + Sync>;
pub type SerializeFn = Arc<dyn Fn(&dyn Record) -> Result<Payload, String> + Send + Sync>;

type RegistryKey = (Category, Identifier);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Lookup miss.  Whether this is fatal is the caller's policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotFound {
    pub category: Category,
    pub id: Identifier,
}

impl fmt::Display for NotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} is not registered", self.category, self.id)
    }
}

impl std::error::Error for NotFound {}

/// Validator passed but the registered deserializer still refused the
/// payload, or built a record of the wrong type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeserializeError {
    pub category: Category,
    pub id: Identifier,
    pub version: u32,
    pub reason: String,
}

impl fmt::Display for DeserializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} v{} failed to materialize: {}",
            self.category, self.id, self.version, self.reason
        )
    }
}

impl std::error::Error for DeserializeError {}

/// Configuration errors found while building the registry.  Any of these
/// stops startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryError {
    Duplicate {
        category: Category,
        id: Identifier,
    },
    InvalidFixerChain {
        category: Category,
        id: Identifier,
        error: FixerChainError,
    },
    MissingCurrentSchema {
        category: Category,
        id: Identifier,
        current_version: u32,
    },
    DanglingAlias {
        category: Category,
        alias: Identifier,
        target: Identifier,
    },
    /// Declaration could not be turned into a type definition.
    InvalidDefinition {
        id: String,
        reason: String,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate { category, id } => {
                write!(f, "{category} {id} registered more than once")
            }
            Self::InvalidFixerChain {
                category,
                id,
                error,
            } => write!(f, "{category} {id}: {error}"),
            Self::MissingCurrentSchema {
                category,
                id,
                current_version,
            } => write!(
                f,
                "{category} {id} declares schemas but none for current version {current_version}",
            ),
            Self::DanglingAlias {
                category,
                alias,
                target,
            } => write!(f, "{category} alias {alias} points at unregistered {target}"),
            Self::InvalidDefinition { id, reason } => {
                write!(f, "invalid type definition {id}: {reason}")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Outcome of checking one payload against a registered type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckError {
    NotFound(NotFound),
    Fixer(FixerError),
    Invalid(ValidationReport),
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(e) => e.fmt(f),
            Self::Fixer(e) => e.fmt(f),
            Self::Invalid(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for CheckError {}

impl From<NotFound> for CheckError {
    fn from(e: NotFound) -> Self {
        Self::NotFound(e)
    }
}

impl From<FixerError> for CheckError {
    fn from(e: FixerError) -> Self {
        Self::Fixer(e)
    }
}

impl From<ValidationReport> for CheckError {
    fn from(e: ValidationReport) -> Self {
        Self::Invalid(e)
    }
}

// ---------------------------------------------------------------------------
// Type definition (registration input)
// ---------------------------------------------------------------------------

/// Everything the registry needs to know about one `(category, id)`.
pub struct TypeDefinition {
    pub category: Category,
    pub id: Identifier,
    pub current_version: u32,
    pub schemas: SchemaSet,
    pub fixers: Vec<DataFixer>,
    /// Expected encoded payload size, used to pre-size save buffers.
    pub size_hint: usize,
    deserialize: DeserializeFn,
    serialize: SerializeFn,
}

impl TypeDefinition {
    pub fn new<F>(category: Category, id: Identifier, current_version: u32, deserialize: F) -> Self
    where
        F: Fn(&Payload, u32) -> Result<Box<dyn Record>, String> + Send + Sync + 'static,
    {
        Self {
            category,
            id,
            current_version,
            schemas: SchemaSet::new(),
            fixers: Vec::new(),
            size_hint: 0,
            deserialize: Arc::new(deserialize),
            serialize: Arc::new(|record: &dyn Record| Ok::<Payload, String>(record.serialize())),
        }
    }

    /// Type materialized as a generic [`DataRecord`].
    pub fn data(category: Category, id: Identifier, current_version: u32) -> Self {
        let record_id = id.clone();
        Self::new(category, id, current_version, move |payload, _version| {
            Ok(Box::new(DataRecord {
                category,
                id: record_id.clone(),
                payload: payload.clone(),
            }) as Box<dyn Record>)
        })
    }

    pub fn with_schema(mut self, version: u32, schema: Schema) -> Self {
        self.schemas.insert(version, schema);
        self
    }

    pub fn with_schemas(mut self, schemas: SchemaSet) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn with_fixer(mut self, fixer: DataFixer) -> Self {
        self.fixers.push(fixer);
        self
    }

    pub fn with_serializer<F>(mut self, serialize: F) -> Self
    where
        F: Fn(&dyn Record) -> Result<Payload, String> + Send + Sync + 'static,
    {
        self.serialize = Arc::new(serialize);
        self
    }

    pub fn with_size_hint(mut self, size_hint: usize) -> Self {
        self.size_hint = size_hint;
        self
    }
}

// ---------------------------------------------------------------------------
// Registry entry
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RegistryEntry {
    pub category: Category,
    pub id: Identifier,
    pub current_version: u32,
    pub schemas: SchemaSet,
    pub fixers: FixerChain,
    pub size_hint: usize,
    deserialize: DeserializeFn,
    serialize: SerializeFn,
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("category", &self.category)
            .field("id", &self.id)
            .field("current_version", &self.current_version)
            .field("fixers", &self.fixers.len())
            .finish()
    }
}

impl RegistryEntry {
    /// Bring `payload` from `from_version` to this type's current version.
    pub fn migrate(&self, payload: Payload, from_version: u32) -> Result<Payload, FixerError> {
        self.fixers
            .apply(&self.id, payload, from_version, self.current_version)
    }

    pub fn validate(
        &self,
        version: u32,
        payload: &Payload,
        mode: ValidationMode,
    ) -> Result<(), ValidationReport> {
        self.schemas
            .validate(version, payload, mode)
            .map_err(|errors| ValidationReport {
                category: self.category,
                id: self.id.clone(),
                version,
                errors,
            })
    }

    /// Run the registered deserializer and check it produced this type.
    pub fn deserialize(
        &self,
        payload: &Payload,
        version: u32,
    ) -> Result<Box<dyn Record>, DeserializeError> {
        let error = |reason: String| DeserializeError {
            category: self.category,
            id: self.id.clone(),
            version,
            reason,
        };
        let record = (self.deserialize)(payload, version).map_err(error)?;
        if record.category() != self.category || record.identity() != &self.id {
            return Err(error(format!(
                "deserializer produced {} {}",
                record.category(),
                record.identity()
            )));
        }
        Ok(record)
    }

    pub fn serialize(&self, record: &dyn Record) -> Result<Payload, String> {
        (self.serialize)(record)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects type definitions during startup.  Duplicates and broken fixer
/// chains are rejected as soon as they are registered.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: HashMap<RegistryKey, RegistryEntry>,
    order: Vec<RegistryKey>,
    aliases: HashMap<RegistryKey, Identifier>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: TypeDefinition) -> Result<(), RegistryError> {
        let TypeDefinition {
            category,
            id,
            current_version,
            schemas,
            fixers,
            size_hint,
            deserialize,
            serialize,
        } = definition;
        let key = (category, id.clone());
        if self.entries.contains_key(&key) || self.aliases.contains_key(&key) {
            return Err(RegistryError::Duplicate { category, id });
        }
        if !schemas.is_empty() && schemas.get(current_version).is_none() {
            return Err(RegistryError::MissingCurrentSchema {
                category,
                id,
                current_version,
            });
        }
        let fixers = FixerChain::new(fixers, current_version).map_err(|error| {
            RegistryError::InvalidFixerChain {
                category,
                id: id.clone(),
                error,
            }
        })?;
        self.entries.insert(
            key.clone(),
            RegistryEntry {
                category,
                id,
                current_version,
                schemas,
                fixers,
                size_hint,
                deserialize,
                serialize,
            },
        );
        self.order.push(key);
        Ok(())
    }

    /// Resolve records stored under a retired identifier to its replacement.
    pub fn register_alias(
        &mut self,
        category: Category,
        alias: Identifier,
        target: Identifier,
    ) -> Result<(), RegistryError> {
        let key = (category, alias.clone());
        if self.entries.contains_key(&key) || self.aliases.contains_key(&key) {
            return Err(RegistryError::Duplicate { category, id: alias });
        }
        self.aliases.insert(key, target);
        Ok(())
    }

    pub fn build(self) -> Result<TypeRegistry, RegistryError> {
        for ((category, alias), target) in &self.aliases {
            if !self.entries.contains_key(&(*category, target.clone())) {
                return Err(RegistryError::DanglingAlias {
                    category: *category,
                    alias: alias.clone(),
                    target: target.clone(),
                });
            }
        }
        log::info!(
            "type registry built: {} types, {} aliases",
            self.entries.len(),
            self.aliases.len()
        );
        Ok(TypeRegistry {
            entries: self.entries,
            order: self.order,
            aliases: self.aliases,
        })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Immutable type registry, shared by reference (usually behind an `Arc`)
/// with every loader thread.
pub struct TypeRegistry {
    entries: HashMap<RegistryKey, RegistryEntry>,
    order: Vec<RegistryKey>,
    aliases: HashMap<RegistryKey, Identifier>,
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("entries", &self.entries.len())
            .field("aliases", &self.aliases.len())
            .finish()
    }
}

impl TypeRegistry {
    /// Look up a type, transparently resolving retired aliases.
    pub fn lookup(&self, category: Category, id: &Identifier) -> Result<&RegistryEntry, NotFound> {
        let key = (category, id.clone());
        self.entries
            .get(&key)
            .or_else(|| {
                self.aliases
                    .get(&key)
                    .and_then(|target| self.entries.get(&(category, target.clone())))
            })
            .ok_or_else(|| NotFound {
                category,
                id: id.clone(),
            })
    }

    pub fn contains(&self, category: Category, id: &Identifier) -> bool {
        self.lookup(category, id).is_ok()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries of `category` in registration order.
    pub fn entries(&self, category: Category) -> impl Iterator<Item = &RegistryEntry> {
        self.order
            .iter()
            .filter(move |(c, _)| *c == category)
            .filter_map(move |key| self.entries.get(key))
    }

    pub fn validate(
        &self,
        category: Category,
        id: &Identifier,
        version: u32,
        payload: &Payload,
        mode: ValidationMode,
    ) -> Result<(), CheckError> {
        let entry = self.lookup(category, id)?;
        entry.validate(version, payload, mode)?;
        Ok(())
    }

    /// Fix each historical fixture to the current version and validate it.
    /// Returns every failure with the fixture's index.
    pub fn check_fixtures(
        &self,
        category: Category,
        id: &Identifier,
        fixtures: &[Payload],
        mode: ValidationMode,
    ) -> Vec<(usize, CheckError)> {
        let entry = match self.lookup(category, id) {
            Ok(entry) => entry,
            Err(error) => return vec![(0, error.into())],
        };
        let mut failures = Vec::new();
        for (index, fixture) in fixtures.iter().enumerate() {
            let outcome = payload_version(fixture)
                .map_err(|error| {
                    CheckError::Fixer(FixerError::Payload {
                        id: entry.id.clone(),
                        error,
                    })
                })
                .and_then(|version| Ok(entry.migrate(fixture.clone(), version)?))
                .and_then(|fixed| Ok(entry.validate(entry.current_version, &fixed, mode)?));
            if let Err(error) = outcome {
                failures.push((index, error));
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixer::FixerOp;
    use crate::schema::{FieldKind, FieldSchema};
    use serde_json::json;

    fn id(text: &str) -> Identifier {
        Identifier::parse(text).expect("valid id")
    }

    fn stone_definition(category: Category) -> TypeDefinition {
        TypeDefinition::data(category, id("core:stone"), 2)
            .with_schema(
                2,
                Schema::new()
                    .field(
                        "toughness",
                        FieldSchema::required(FieldKind::Integer {
                            min: Some(0),
                            max: None,
                        }),
                    )
                    .field(
                        "luminance",
                        FieldSchema::required(FieldKind::Integer {
                            min: Some(0),
                            max: Some(15),
                        }),
                    ),
            )
            .with_fixer(DataFixer::from_ops(
                0,
                vec![FixerOp::Rename {
                    from: "hardness".into(),
                    to: "toughness".into(),
                }],
            ))
            .with_fixer(DataFixer::from_ops(
                1,
                vec![FixerOp::SetDefault {
                    field: "luminance".into(),
                    value: json!(0),
                }],
            ))
    }

    #[test]
    fn same_id_in_different_categories_is_allowed() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(stone_definition(Category::Block))
            .expect("block");
        builder
            .register(stone_definition(Category::Item))
            .expect("item");
        let registry = builder.build().expect("registry");
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(Category::Block, &id("core:stone")));
        assert!(registry.contains(Category::Item, &id("core:stone")));
        assert!(!registry.contains(Category::Entity, &id("core:stone")));
        assert_eq!(registry.entries(Category::Item).count(), 1);
        assert_eq!(registry.entries(Category::Entity).count(), 0);
    }

    #[test]
    fn duplicate_registration_is_fatal() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(stone_definition(Category::Block))
            .expect("first");
        assert_eq!(
            builder.register(stone_definition(Category::Block)),
            Err(RegistryError::Duplicate {
                category: Category::Block,
                id: id("core:stone")
            })
        );
    }

    #[test]
    fn gap_in_fixers_is_fatal_at_registration() {
        let mut builder = RegistryBuilder::new();
        let definition = TypeDefinition::data(Category::Entity, id("core:orb"), 3)
            .with_fixer(DataFixer::from_ops(0, Vec::new()))
            .with_fixer(DataFixer::from_ops(2, Vec::new()));
        assert!(matches!(
            builder.register(definition),
            Err(RegistryError::InvalidFixerChain {
                error: FixerChainError::Gap { after: 0, next: 2 },
                ..
            })
        ));
    }

    #[test]
    fn schemas_must_cover_current_version() {
        let mut builder = RegistryBuilder::new();
        let definition = TypeDefinition::data(Category::Item, id("core:gem"), 1)
            .with_schema(0, Schema::new());
        assert!(matches!(
            builder.register(definition),
            Err(RegistryError::MissingCurrentSchema { current_version: 1, .. })
        ));
    }

    #[test]
    fn lookup_unknown_is_not_found() {
        let registry = RegistryBuilder::new().build().expect("empty registry");
        assert_eq!(
            registry.lookup(Category::Block, &id("mod:unknown_block")).map(|e| e.id.clone()),
            Err(NotFound {
                category: Category::Block,
                id: id("mod:unknown_block")
            })
        );
    }

    #[test]
    fn aliases_resolve_and_must_point_somewhere() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(stone_definition(Category::Block))
            .expect("stone");
        builder
            .register_alias(Category::Block, id("legacy:rock"), id("core:stone"))
            .expect("alias");
        let registry = builder.build().expect("registry");
        let entry = registry
            .lookup(Category::Block, &id("legacy:rock"))
            .expect("alias resolves");
        assert_eq!(entry.id, id("core:stone"));

        let mut builder = RegistryBuilder::new();
        builder
            .register_alias(Category::Block, id("legacy:rock"), id("core:missing"))
            .expect("alias");
        assert!(matches!(
            builder.build(),
            Err(RegistryError::DanglingAlias { .. })
        ));
    }

    #[test]
    fn deserializer_identity_mismatch_is_a_deserialize_error() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(TypeDefinition::new(
                Category::Block,
                id("core:liar"),
                0,
                |payload, _| {
                    Ok(Box::new(DataRecord {
                        category: Category::Block,
                        id: Identifier::parse("core:other").map_err(|e| e.to_string())?,
                        payload: payload.clone(),
                    }) as Box<dyn Record>)
                },
            ))
            .expect("register");
        let registry = builder.build().expect("registry");
        let entry = registry
            .lookup(Category::Block, &id("core:liar"))
            .expect("entry");
        let error = entry.deserialize(&json!({}), 0).expect_err("mismatch");
        assert!(error.reason.contains("core:other"));
    }

    #[test]
    fn historical_fixtures_fix_and_validate() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(stone_definition(Category::Block))
            .expect("stone");
        let registry = builder.build().expect("registry");
        let fixtures = vec![
            json!({ "hardness": 5 }),
            json!({ "version": 0, "hardness": 1 }),
            json!({ "version": 1, "toughness": 2 }),
            json!({ "version": 2, "toughness": 3, "luminance": 7 }),
        ];
        assert!(registry
            .check_fixtures(
                Category::Block,
                &id("core:stone"),
                &fixtures,
                ValidationMode::Diagnostic
            )
            .is_empty());

        let broken = vec![
            json!({ "version": 2, "toughness": 3, "luminance": 99 }),
            json!({ "version": 3 }),
        ];
        let failures = registry.check_fixtures(
            Category::Block,
            &id("core:stone"),
            &broken,
            ValidationMode::Diagnostic,
        );
        assert_eq!(failures.len(), 2);
        assert!(matches!(failures[0], (0, CheckError::Invalid(_))));
        assert!(matches!(
            failures[1],
            (1, CheckError::Fixer(FixerError::FutureVersion { .. }))
        ));
    }
}
