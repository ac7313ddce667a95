//! Versioned record persistence for a voxel world.
//!
//! Stored blocks, entities and items carry a data version.  On load each
//! record is decoded, upgraded through its registered fixer chain, checked
//! against the schema of the current version and handed to the registered
//! deserializer.  Saving reverses the path and always writes the current
//! version.

pub mod builtin_content;
pub mod codec;
pub mod config;
pub mod fixer;
pub mod identifier;
pub mod manifest;
pub mod payload;
pub mod pipeline;
pub mod record;
pub mod registry;
pub mod schema;
pub mod tags;
pub mod world;

pub use codec::{DecodeError, DecodedRecord, EncodeError, RecordCodec, RecordEncoding};
pub use config::{ConfigError, StoreConfig};
pub use fixer::{DataFixer, FixerChain, FixerChainError, FixerError, FixerOp};
pub use identifier::{Category, Identifier, IdentifierError};
pub use manifest::{ContentManifest, ManifestError};
pub use payload::Payload;
pub use pipeline::{LoadError, LoadedRecord, RecordPipeline, SaveError, UnknownPolicy};
pub use record::{DataRecord, Record, UnknownRecord};
pub use registry::{
    CheckError, DeserializeError, NotFound, RegistryBuilder, RegistryEntry, RegistryError,
    TypeDefinition, TypeRegistry,
};
pub use schema::{Schema, SchemaSet, ValidationError, ValidationMode, ValidationReport};
pub use tags::{TagDeclaration, TagIndex};
pub use world::{Biome, BlockCoordinate, EntityUuid, WorldModel};
