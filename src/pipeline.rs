//! Load and save paths tying the codec, fixers, validator and registry
//! together.
//!
//! Load: bytes -> decode -> fix to current -> validate -> deserialize.
//! Save: record -> serialize -> stamp current version -> (validate) -> encode.
//!
//! Every record is processed independently.  A failure only affects the
//! record that caused it and never touches the world.

use crate::codec::{DecodeError, DecodedRecord, EncodeError, RecordCodec, RecordEncoding};
use crate::config::StoreConfig;
use crate::fixer::FixerError;
use crate::identifier::{Category, Identifier};
use crate::payload::{payload_version, set_payload_version, Payload, VERSION_FIELD};
use crate::record::{Record, UnknownRecord};
use crate::registry::{DeserializeError, NotFound, RegistryEntry, TypeRegistry};
use crate::schema::{ValidationMode, ValidationReport};
use crate::world::{Biome, BiomeError, BlockCoordinate, EntityUuid, WorldModel};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// What to do with records whose id is not registered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownPolicy {
    /// Fail the record with `NotFound`.
    Strict,
    /// Keep the stored data in an [`UnknownRecord`] placeholder.
    #[default]
    Lenient,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum LoadError {
    Decode(DecodeError),
    NotFound(NotFound),
    /// `FutureVersion`, `MissingFixer` or a failed transform.
    Fixer(FixerError),
    Validation(ValidationReport),
    Deserialize(DeserializeError),
    Biome(BiomeError),
    WrongCategory {
        expected: Category,
        found: Category,
        id: Identifier,
    },
}

impl LoadError {
    pub fn is_future_version(&self) -> bool {
        matches!(self, Self::Fixer(FixerError::FutureVersion { .. }))
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => e.fmt(f),
            Self::NotFound(e) => e.fmt(f),
            Self::Fixer(e) => e.fmt(f),
            Self::Validation(e) => e.fmt(f),
            Self::Deserialize(e) => e.fmt(f),
            Self::Biome(e) => e.fmt(f),
            Self::WrongCategory {
                expected,
                found,
                id,
            } => write!(f, "expected {expected} record, found {found} {id}"),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            Self::NotFound(e) => Some(e),
            Self::Fixer(e) => Some(e),
            Self::Validation(e) => Some(e),
            Self::Deserialize(e) => Some(e),
            Self::Biome(e) => Some(e),
            Self::WrongCategory { .. } => None,
        }
    }
}

impl From<DecodeError> for LoadError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<NotFound> for LoadError {
    fn from(e: NotFound) -> Self {
        Self::NotFound(e)
    }
}

impl From<FixerError> for LoadError {
    fn from(e: FixerError) -> Self {
        Self::Fixer(e)
    }
}

impl From<ValidationReport> for LoadError {
    fn from(e: ValidationReport) -> Self {
        Self::Validation(e)
    }
}

impl From<DeserializeError> for LoadError {
    fn from(e: DeserializeError) -> Self {
        Self::Deserialize(e)
    }
}

impl From<BiomeError> for LoadError {
    fn from(e: BiomeError) -> Self {
        Self::Biome(e)
    }
}

#[derive(Debug)]
pub enum SaveError {
    NotFound(NotFound),
    Serialize {
        category: Category,
        id: Identifier,
        reason: String,
    },
    Validation(ValidationReport),
    Encode(EncodeError),
}

impl fmt::Display for SaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(e) => e.fmt(f),
            Self::Serialize {
                category,
                id,
                reason,
            } => write!(f, "{category} {id} failed to serialize: {reason}"),
            Self::Validation(e) => e.fmt(f),
            Self::Encode(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for SaveError {}

impl From<NotFound> for SaveError {
    fn from(e: NotFound) -> Self {
        Self::NotFound(e)
    }
}

impl From<ValidationReport> for SaveError {
    fn from(e: ValidationReport) -> Self {
        Self::Validation(e)
    }
}

impl From<EncodeError> for SaveError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct LoadedRecord {
    pub record: Box<dyn Record>,
    /// Version the record was stored at.
    pub stored_version: u32,
}

impl LoadedRecord {
    pub fn is_placeholder(&self) -> bool {
        self.record.is_placeholder()
    }
}

/// Shared, immutable load/save driver.  Cheap to clone; clones share the
/// registry.
#[derive(Clone, Debug)]
pub struct RecordPipeline {
    registry: Arc<TypeRegistry>,
    codec: RecordCodec,
    policy: UnknownPolicy,
    mode: ValidationMode,
    validate_on_save: bool,
}

impl RecordPipeline {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            codec: RecordCodec::default(),
            policy: UnknownPolicy::default(),
            mode: ValidationMode::default(),
            validate_on_save: true,
        }
    }

    pub fn from_config(registry: Arc<TypeRegistry>, config: &StoreConfig) -> Self {
        Self::new(registry)
            .with_policy(config.unknown_policy)
            .with_mode(config.validation_mode)
            .with_encoding(config.encoding)
            .with_validate_on_save(config.validate_on_save)
    }

    pub fn with_policy(mut self, policy: UnknownPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_mode(mut self, mode: ValidationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_encoding(mut self, encoding: RecordEncoding) -> Self {
        self.codec = RecordCodec::new(encoding);
        self
    }

    pub fn with_validate_on_save(mut self, validate_on_save: bool) -> Self {
        self.validate_on_save = validate_on_save;
        self
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn codec(&self) -> RecordCodec {
        self.codec
    }

    pub fn policy(&self) -> UnknownPolicy {
        self.policy
    }

    // -- load ---------------------------------------------------------------

    pub fn load_record(&self, bytes: &[u8]) -> Result<LoadedRecord, LoadError> {
        let decoded = self.codec.decode(bytes)?;
        self.load_decoded(decoded)
    }

    pub fn load_decoded(&self, decoded: DecodedRecord) -> Result<LoadedRecord, LoadError> {
        let DecodedRecord {
            category,
            id,
            version,
            payload,
        } = decoded;
        let entry = match self.registry.lookup(category, &id) {
            Ok(entry) => entry,
            Err(not_found) => return self.unknown(not_found, version, payload),
        };
        let record = self.materialize(entry, payload, version)?;
        Ok(LoadedRecord {
            record,
            stored_version: version,
        })
    }

    fn unknown(
        &self,
        not_found: NotFound,
        version: u32,
        payload: Payload,
    ) -> Result<LoadedRecord, LoadError> {
        match self.policy {
            UnknownPolicy::Strict => Err(not_found.into()),
            UnknownPolicy::Lenient => {
                log::warn!(
                    "keeping unregistered {} {} (v{version}) as placeholder",
                    not_found.category,
                    not_found.id
                );
                Ok(LoadedRecord {
                    record: Box::new(UnknownRecord {
                        category: not_found.category,
                        id: not_found.id,
                        version,
                        payload,
                    }),
                    stored_version: version,
                })
            }
        }
    }

    /// Fix, validate and deserialize one payload of a known type.
    fn materialize(
        &self,
        entry: &RegistryEntry,
        payload: Payload,
        version: u32,
    ) -> Result<Box<dyn Record>, LoadError> {
        let fixed = self.fix_to_current(entry, payload, version)?;
        entry.validate(entry.current_version, &fixed, self.mode)?;
        Ok(entry.deserialize(&fixed, entry.current_version)?)
    }

    fn fix_to_current(
        &self,
        entry: &RegistryEntry,
        mut payload: Payload,
        version: u32,
    ) -> Result<Payload, LoadError> {
        if payload.get(VERSION_FIELD).is_none() {
            set_payload_version(&mut payload, version).map_err(|error| FixerError::Payload {
                id: entry.id.clone(),
                error,
            })?;
        }
        Ok(entry.migrate(payload, version)?)
    }

    /// Fix and validate a bare payload, reading its version from the
    /// payload itself.  Returns the current-version payload.
    pub fn migrate_payload(
        &self,
        category: Category,
        id: &Identifier,
        payload: Payload,
    ) -> Result<Payload, LoadError> {
        let entry = self.registry.lookup(category, id)?;
        let version = payload_version(&payload).map_err(|error| FixerError::Payload {
            id: entry.id.clone(),
            error,
        })?;
        let fixed = self.fix_to_current(entry, payload, version)?;
        entry.validate(entry.current_version, &fixed, self.mode)?;
        Ok(fixed)
    }

    /// Results are in input order, one per input.
    pub fn load_batch<B: AsRef<[u8]>>(&self, inputs: &[B]) -> Vec<Result<LoadedRecord, LoadError>> {
        inputs
            .iter()
            .enumerate()
            .map(|(index, bytes)| self.load_logged(index, bytes.as_ref()))
            .collect()
    }

    /// Parallel [`load_batch`](Self::load_batch).  Output order matches input.
    pub fn par_load_batch<B: AsRef<[u8]> + Sync>(
        &self,
        inputs: &[B],
    ) -> Vec<Result<LoadedRecord, LoadError>> {
        inputs
            .par_iter()
            .enumerate()
            .map(|(index, bytes)| self.load_logged(index, bytes.as_ref()))
            .collect()
    }

    fn load_logged(&self, index: usize, bytes: &[u8]) -> Result<LoadedRecord, LoadError> {
        let outcome = self.load_record(bytes);
        if let Err(error) = &outcome {
            log::warn!("record #{index} skipped: {error}");
        }
        outcome
    }

    /// Turn one stored block cell of `biome` into a typed record.
    pub fn materialize_block(
        &self,
        biome: &Biome,
        coord: BlockCoordinate,
    ) -> Result<Option<LoadedRecord>, LoadError> {
        let Some(cell) = biome.block_cell(coord)? else {
            return Ok(None);
        };
        let version = payload_version(&cell.data).map_err(|error| FixerError::Payload {
            id: cell.id.clone(),
            error,
        })?;
        log::trace!("materializing {} at {coord} in {}", cell.id, biome.id);
        self.load_decoded(DecodedRecord {
            category: Category::Block,
            id: cell.id,
            version,
            payload: cell.data,
        })
        .map(Some)
    }

    /// Load an entity record and insert it at `uuid`.  The world is only
    /// touched once the record has fully loaded.
    pub fn load_entity_into(
        &self,
        world: &WorldModel,
        uuid: EntityUuid,
        bytes: &[u8],
    ) -> Result<Option<Box<dyn Record>>, LoadError> {
        let loaded = self.load_record(bytes)?;
        let category = loaded.record.category();
        if category != Category::Entity {
            return Err(LoadError::WrongCategory {
                expected: Category::Entity,
                found: category,
                id: loaded.record.identity().clone(),
            });
        }
        Ok(world.insert_entity(uuid, loaded.record))
    }

    // -- save ---------------------------------------------------------------

    pub fn save_record(&self, record: &dyn Record) -> Result<Vec<u8>, SaveError> {
        if let Some(unknown) = record.downcast_ref::<UnknownRecord>() {
            log::debug!(
                "writing placeholder {} {} back at v{}",
                unknown.category,
                unknown.id,
                unknown.version
            );
            return Ok(self.codec.encode(
                unknown.category,
                &unknown.id,
                unknown.version,
                &unknown.payload,
            )?);
        }

        let entry = self.registry.lookup(record.category(), record.identity())?;
        let serialize_error = |reason: String| SaveError::Serialize {
            category: entry.category,
            id: entry.id.clone(),
            reason,
        };
        let mut payload = entry.serialize(record).map_err(serialize_error)?;
        set_payload_version(&mut payload, entry.current_version)
            .map_err(|error| serialize_error(error.to_string()))?;
        if self.validate_on_save {
            entry.validate(entry.current_version, &payload, self.mode)?;
        }
        Ok(self.codec.encode_with_hint(
            entry.category,
            &entry.id,
            entry.current_version,
            &payload,
            entry.size_hint,
        )?)
    }

    /// Save the entity at `uuid`, if present.
    pub fn save_entity(
        &self,
        world: &WorldModel,
        uuid: EntityUuid,
    ) -> Result<Option<Vec<u8>>, SaveError> {
        world
            .with_entity(uuid, |entity| self.save_record(entity))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin_content::{register_builtin_content, ExperienceOrb, Stone};
    use crate::codec::{decode_any, encode_binary, encode_json};
    use crate::registry::RegistryBuilder;
    use crate::world::BlockCell;
    use serde_json::json;

    fn id(text: &str) -> Identifier {
        Identifier::parse(text).expect("valid id")
    }

    fn pipeline(policy: UnknownPolicy) -> RecordPipeline {
        let mut builder = RegistryBuilder::new();
        register_builtin_content(&mut builder).expect("builtin");
        RecordPipeline::new(Arc::new(builder.build().expect("registry"))).with_policy(policy)
    }

    fn stone_bytes(version: u32, payload: Payload) -> Vec<u8> {
        encode_binary(Category::Block, &id("core:stone"), version, &payload, 0).expect("encode")
    }

    fn orb_bytes(version: u32, payload: Payload) -> Vec<u8> {
        encode_binary(Category::Entity, &id("core:experience_orb"), version, &payload, 0)
            .expect("encode")
    }

    #[test]
    fn stone_migrates_from_v0() {
        let pipeline = pipeline(UnknownPolicy::Strict);
        let loaded = pipeline
            .load_record(&stone_bytes(0, json!({ "version": 0, "hardness": 5 })))
            .expect("load");
        assert_eq!(loaded.stored_version, 0);
        assert!(!loaded.is_placeholder());
        let stone = loaded.record.downcast_ref::<Stone>().expect("typed stone");
        assert_eq!((stone.toughness, stone.luminance), (5, 0));

        let saved = pipeline.save_record(loaded.record.as_ref()).expect("save");
        let decoded = decode_any(&saved).expect("decode");
        assert_eq!(decoded.version, 2);
        assert_eq!(
            decoded.payload,
            json!({ "version": 2, "toughness": 5, "luminance": 0 })
        );
    }

    #[test]
    fn fixing_is_deterministic() {
        let pipeline = pipeline(UnknownPolicy::Strict);
        let stone = id("core:stone");
        let input = json!({ "hardness": 5, "extra": { "kept": [1, 2] } });
        let first = pipeline
            .migrate_payload(Category::Block, &stone, input.clone())
            .expect("first");
        let second = pipeline
            .migrate_payload(Category::Block, &stone, input)
            .expect("second");
        assert_eq!(
            serde_json::to_vec(&first).expect("bytes"),
            serde_json::to_vec(&second).expect("bytes")
        );
        assert_eq!(first["extra"], json!({ "kept": [1, 2] }));
    }

    #[test]
    fn missing_version_field_takes_header_version() {
        let pipeline = pipeline(UnknownPolicy::Strict);
        let loaded = pipeline
            .load_record(&stone_bytes(1, json!({ "toughness": 4 })))
            .expect("load");
        let stone = loaded.record.downcast_ref::<Stone>().expect("stone");
        assert_eq!(stone.toughness, 4);
    }

    #[test]
    fn future_version_leaves_world_unchanged() {
        let pipeline = pipeline(UnknownPolicy::Lenient);
        let error = pipeline
            .load_record(&stone_bytes(3, json!({ "version": 3 })))
            .expect_err("future");
        assert!(error.is_future_version());

        let world = WorldModel::default();
        let uuid = EntityUuid::new(0, 1);
        let error = pipeline
            .load_entity_into(&world, uuid, &orb_bytes(5, json!({ "version": 5 })))
            .expect_err("future");
        assert!(error.is_future_version());
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    fn invalid_payload_is_a_validation_error() {
        let pipeline = pipeline(UnknownPolicy::Strict);
        let error = pipeline
            .load_record(&stone_bytes(
                2,
                json!({ "version": 2, "toughness": -1, "luminance": 99 }),
            ))
            .expect_err("invalid");
        match error {
            LoadError::Validation(report) => {
                assert_eq!(report.errors.len(), 2);
                assert_eq!(report.version, 2);
            }
            other => panic!("unexpected error: {other}"),
        }

        let fast = pipeline.clone().with_mode(ValidationMode::FastPath);
        match fast.load_record(&stone_bytes(
            2,
            json!({ "version": 2, "toughness": -1, "luminance": 99 }),
        )) {
            Err(LoadError::Validation(report)) => assert_eq!(report.errors.len(), 1),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn unknown_record_strict_and_lenient() {
        let bytes = encode_binary(
            Category::Block,
            &id("mod:unknown_block"),
            4,
            &json!({ "version": 4, "glow": 3 }),
            0,
        )
        .expect("encode");

        let strict = pipeline(UnknownPolicy::Strict);
        assert!(matches!(
            strict.load_record(&bytes),
            Err(LoadError::NotFound(NotFound {
                category: Category::Block,
                ..
            }))
        ));

        let lenient = pipeline(UnknownPolicy::Lenient);
        let loaded = lenient.load_record(&bytes).expect("placeholder");
        assert!(loaded.is_placeholder());
        let saved = lenient.save_record(loaded.record.as_ref()).expect("save back");
        assert_eq!(saved, bytes);
    }

    #[test]
    fn unknown_entity_enters_world_only_when_lenient() {
        let payload = json!({ "version": 2, "hover": 1.5 });
        let bytes = encode_binary(Category::Entity, &id("mod:unknown_drone"), 2, &payload, 0)
            .expect("encode");
        let uuid = EntityUuid::new(7, 11);

        let world = WorldModel::default();
        let strict = pipeline(UnknownPolicy::Strict);
        assert!(matches!(
            strict.load_entity_into(&world, uuid, &bytes),
            Err(LoadError::NotFound(NotFound {
                category: Category::Entity,
                ..
            }))
        ));
        assert_eq!(world.entity_count(), 0);
        assert!(!world.contains_entity(uuid));

        let lenient = pipeline(UnknownPolicy::Lenient);
        let previous = lenient
            .load_entity_into(&world, uuid, &bytes)
            .expect("placeholder inserted");
        assert!(previous.is_none());
        assert_eq!(world.entity_count(), 1);
        let (placeholder, identity) = world
            .with_entity(uuid, |entity| {
                (entity.is_placeholder(), entity.identity().clone())
            })
            .expect("present");
        assert!(placeholder);
        assert_eq!(identity, id("mod:unknown_drone"));
        let saved = lenient
            .save_entity(&world, uuid)
            .expect("save")
            .expect("present");
        assert_eq!(saved, bytes);
    }

    #[test]
    fn unknown_json_record_is_written_back_in_pipeline_encoding() {
        let payload = json!({ "version": 1, "speed": 2.5 });
        let bytes = encode_json(Category::Entity, &id("mod:drone"), 1, &payload, 0).expect("json");
        let pipeline = pipeline(UnknownPolicy::Lenient).with_encoding(RecordEncoding::Json);
        let loaded = pipeline.load_record(&bytes).expect("placeholder");
        let saved = pipeline.save_record(loaded.record.as_ref()).expect("save");
        let decoded = decode_any(&saved).expect("decode");
        assert_eq!(decoded.id, id("mod:drone"));
        assert_eq!(decoded.version, 1);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn legacy_alias_loads_as_current_id() {
        let pipeline = pipeline(UnknownPolicy::Strict);
        let bytes = encode_binary(
            Category::Entity,
            &id("core:xp_orb"),
            0,
            &json!({ "amount": 12 }),
            0,
        )
        .expect("encode");
        let loaded = pipeline.load_record(&bytes).expect("alias");
        let orb = loaded
            .record
            .downcast_ref::<ExperienceOrb>()
            .expect("orb");
        assert_eq!(orb.exp_amount, 12);
        let saved = decode_any(&pipeline.save_record(loaded.record.as_ref()).expect("save"))
            .expect("decode");
        assert_eq!(saved.id, id("core:experience_orb"));
    }

    #[test]
    fn batches_report_independent_outcomes_in_order() {
        let pipeline = pipeline(UnknownPolicy::Strict);
        let inputs = vec![
            stone_bytes(0, json!({ "hardness": 1 })),
            b"not a record".to_vec(),
            stone_bytes(3, json!({ "version": 3 })),
            orb_bytes(1, json!({ "version": 1, "exp_amount": 4 })),
        ];
        for results in [pipeline.load_batch(&inputs), pipeline.par_load_batch(&inputs)] {
            assert_eq!(results.len(), 4);
            assert!(results[0].is_ok());
            assert!(matches!(results[1], Err(LoadError::Decode(_))));
            assert!(matches!(&results[2], Err(e) if e.is_future_version()));
            assert!(results[3].is_ok());
        }
    }

    #[test]
    fn blocks_materialize_lazily() {
        let pipeline = pipeline(UnknownPolicy::Strict);
        let mut biome = Biome::new(id("core:plains"));
        let coord = BlockCoordinate::new(4, 70, 9);
        assert!(pipeline
            .materialize_block(&biome, coord)
            .expect("empty cell")
            .is_none());
        biome
            .set_block(
                coord,
                BlockCell {
                    id: id("core:stone"),
                    data: json!({ "hardness": 8 }),
                },
            )
            .expect("set");
        let loaded = pipeline
            .materialize_block(&biome, coord)
            .expect("materialize")
            .expect("cell present");
        assert_eq!(
            loaded.record.downcast_ref::<Stone>().map(|s| s.toughness),
            Some(8)
        );
        // The stored cell is left as written.
        assert_eq!(
            biome.block_cell(coord).expect("cell").map(|c| c.data),
            Some(json!({ "hardness": 8 }))
        );
    }

    #[test]
    fn entities_load_into_world_and_save_back() {
        let pipeline = pipeline(UnknownPolicy::Strict);
        let world = WorldModel::default();
        let uuid = EntityUuid::new(9, 9);
        assert!(pipeline
            .load_entity_into(&world, uuid, &orb_bytes(0, json!({ "amount": 3 })))
            .expect("load")
            .is_none());
        let saved = pipeline
            .save_entity(&world, uuid)
            .expect("save")
            .expect("present");
        assert_eq!(
            decode_any(&saved).expect("decode").payload,
            json!({ "version": 1, "exp_amount": 3 })
        );
        assert!(pipeline
            .save_entity(&world, EntityUuid::new(0, 0))
            .expect("save")
            .is_none());

        let error = pipeline
            .load_entity_into(
                &world,
                uuid,
                &stone_bytes(2, json!({ "toughness": 1, "luminance": 1 })),
            )
            .expect_err("stone is not an entity");
        assert!(matches!(error, LoadError::WrongCategory { .. }));
        assert_eq!(world.entity_count(), 1);
    }

    #[test]
    fn invalid_record_is_not_saved() {
        let pipeline = pipeline(UnknownPolicy::Strict);
        let stone = Stone {
            category: Category::Block,
            id: id("core:stone"),
            toughness: 1,
            luminance: 200,
        };
        assert!(matches!(
            pipeline.save_record(&stone),
            Err(SaveError::Validation(_))
        ));
        assert!(pipeline
            .clone()
            .with_validate_on_save(false)
            .save_record(&stone)
            .is_ok());
    }
}
