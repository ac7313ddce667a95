use crate::fixer::{DataFixer, FixerOp};
use crate::identifier::{Category, Identifier, CORE_NAMESPACE};
use crate::registry::{RegistryBuilder, RegistryError, TypeDefinition};
use crate::schema::SchemaSet;
use crate::tags::TagDeclaration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// Content declared as data by a mod, loaded at startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentManifest {
    pub namespace: String,
    #[serde(default)]
    pub types: Vec<TypeDeclaration>,
    #[serde(default)]
    pub tags: Vec<TagDeclaration>,
    #[serde(default)]
    pub aliases: Vec<AliasDeclaration>,
}

/// A record type declared by a manifest.  Materializes as a `DataRecord`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypeDeclaration {
    pub category: Category,
    pub id: Identifier,
    pub current_version: u32,
    #[serde(default)]
    pub schemas: SchemaSet,
    #[serde(default)]
    pub fixers: Vec<FixerDeclaration>,
    #[serde(default)]
    pub size_hint: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixerDeclaration {
    pub from_version: u32,
    pub ops: Vec<FixerOp>,
}

/// Renamed content: records stored under `from` load as `to`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AliasDeclaration {
    pub category: Category,
    pub from: Identifier,
    pub to: Identifier,
}

#[derive(Debug)]
pub enum ManifestError {
    Io { path: PathBuf, error: io::Error },
    Parse(serde_json::Error),
    ReservedNamespace(String),
    ForeignIdentifier { namespace: String, id: Identifier },
    Registry(RegistryError),
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, error } => {
                write!(f, "failed to read manifest {}: {error}", path.display())
            }
            Self::Parse(e) => write!(f, "invalid manifest: {e}"),
            Self::ReservedNamespace(ns) => write!(f, "namespace '{ns}' is reserved"),
            Self::ForeignIdentifier { namespace, id } => {
                write!(f, "manifest for '{namespace}' declares {id} outside its namespace")
            }
            Self::Registry(e) => write!(f, "manifest registration failed: {e}"),
        }
    }
}

impl std::error::Error for ManifestError {}

impl From<serde_json::Error> for ManifestError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e)
    }
}

impl From<RegistryError> for ManifestError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

impl ContentManifest {
    pub fn from_json_str(raw: &str) -> Result<Self, ManifestError> {
        let manifest: Self = serde_json::from_str(raw)?;
        manifest.check_namespaces()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let raw = std::fs::read_to_string(path).map_err(|error| ManifestError::Io {
            path: path.to_path_buf(),
            error,
        })?;
        let manifest = Self::from_json_str(&raw)?;
        log::info!(
            "loaded manifest '{}' from {}: {} types, {} tags",
            manifest.namespace,
            path.display(),
            manifest.types.len(),
            manifest.tags.len()
        );
        Ok(manifest)
    }

    /// Declared type ids, tag ids and alias sources must live in the
    /// manifest's own namespace.  Tag members and alias targets may point
    /// anywhere.
    fn check_namespaces(&self) -> Result<(), ManifestError> {
        if self.namespace == CORE_NAMESPACE {
            return Err(ManifestError::ReservedNamespace(self.namespace.clone()));
        }
        let owned = self
            .types
            .iter()
            .map(|ty| &ty.id)
            .chain(self.tags.iter().map(|tag| &tag.tag))
            .chain(self.aliases.iter().map(|alias| &alias.from));
        for id in owned {
            if id.namespace() != self.namespace {
                return Err(ManifestError::ForeignIdentifier {
                    namespace: self.namespace.clone(),
                    id: id.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn register_into(&self, builder: &mut RegistryBuilder) -> Result<(), ManifestError> {
        for declaration in &self.types {
            let mut definition = TypeDefinition::data(
                declaration.category,
                declaration.id.clone(),
                declaration.current_version,
            )
            .with_schemas(declaration.schemas.clone())
            .with_size_hint(declaration.size_hint);
            for fixer in &declaration.fixers {
                definition = definition.with_fixer(DataFixer::from_ops(
                    fixer.from_version,
                    fixer.ops.clone(),
                ));
            }
            builder.register(definition)?;
        }
        for alias in &self.aliases {
            builder.register_alias(alias.category, alias.from.clone(), alias.to.clone())?;
        }
        Ok(())
    }

    pub fn tag_source(&self) -> Vec<TagDeclaration> {
        self.tags.clone()
    }
}
