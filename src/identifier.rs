use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Namespace reserved for engine-owned content.
pub const CORE_NAMESPACE: &str = "core";

/// Record category.  A block and an item may share an [`Identifier`]; the
/// category keeps them apart in the registry and on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Block,
    Entity,
    Item,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Block, Category::Entity, Category::Item];

    pub fn to_u8(self) -> u8 {
        match self {
            Category::Block => 0,
            Category::Entity => 1,
            Category::Item => 2,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Category::Block),
            1 => Some(Category::Entity),
            2 => Some(Category::Item),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Category::Block => "block",
            Category::Entity => "entity",
            Category::Item => "item",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Category {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(Category::Block),
            "entity" => Ok(Category::Entity),
            "item" => Ok(Category::Item),
            other => Err(IdentifierError::UnknownCategory(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentifierError {
    MissingSeparator(String),
    EmptyNamespace(String),
    EmptyPath(String),
    InvalidCharacter { text: String, ch: char },
    UnknownCategory(String),
}

impl fmt::Display for IdentifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSeparator(text) => write!(f, "identifier '{text}' has no ':' separator"),
            Self::EmptyNamespace(text) => write!(f, "identifier '{text}' has an empty namespace"),
            Self::EmptyPath(text) => write!(f, "identifier '{text}' has an empty path"),
            Self::InvalidCharacter { text, ch } => {
                write!(f, "identifier '{text}' contains invalid character {ch:?}")
            }
            Self::UnknownCategory(text) => write!(f, "unknown record category '{text}'"),
        }
    }
}

impl std::error::Error for IdentifierError {}

/// Namespaced type identity, e.g. `core:stone`.
///
/// Namespaces allow `[a-z0-9_.-]`, paths additionally allow `/`.  Stored as
/// the joined text so comparisons and hashing work on a single key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier {
    text: String,
    split: usize,
}

impl Identifier {
    pub fn new(namespace: &str, path: &str) -> Result<Self, IdentifierError> {
        Self::parse(&format!("{namespace}:{path}"))
    }

    pub fn parse(text: &str) -> Result<Self, IdentifierError> {
        let split = text
            .find(':')
            .ok_or_else(|| IdentifierError::MissingSeparator(text.to_string()))?;
        let (namespace, path) = (&text[..split], &text[split + 1..]);
        if namespace.is_empty() {
            return Err(IdentifierError::EmptyNamespace(text.to_string()));
        }
        if path.is_empty() {
            return Err(IdentifierError::EmptyPath(text.to_string()));
        }
        if let Some(ch) = namespace.chars().find(|&ch| !is_namespace_char(ch)) {
            return Err(IdentifierError::InvalidCharacter {
                text: text.to_string(),
                ch,
            });
        }
        if let Some(ch) = path.chars().find(|&ch| !is_path_char(ch)) {
            return Err(IdentifierError::InvalidCharacter {
                text: text.to_string(),
                ch,
            });
        }
        Ok(Self {
            text: text.to_string(),
            split,
        })
    }

    /// Shorthand for engine content.
    pub fn core(path: &str) -> Result<Self, IdentifierError> {
        Self::new(CORE_NAMESPACE, path)
    }

    pub fn namespace(&self) -> &str {
        &self.text[..self.split]
    }

    pub fn path(&self) -> &str {
        &self.text[self.split + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

fn is_namespace_char(ch: char) -> bool {
    ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '_' | '-' | '.')
}

fn is_path_char(ch: char) -> bool {
    is_namespace_char(ch) || ch == '/'
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self.text)
    }
}

impl FromStr for Identifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identifier {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.text
    }
}
