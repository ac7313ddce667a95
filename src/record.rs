use crate::identifier::{Category, Identifier};
use crate::payload::Payload;
use std::any::Any;
use std::fmt;

/// Capability set shared by every materialized block, entity and item.
///
/// Concrete variants are never enumerated by the core; they are built by the
/// deserializer registered for their identifier.
pub trait Record: Any + Send + Sync + fmt::Debug {
    fn category(&self) -> Category;

    fn identity(&self) -> &Identifier;

    /// Current-version payload.  The save path stamps the version field.
    fn serialize(&self) -> Payload;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl dyn Record {
    pub fn downcast_ref<T: Record>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Record>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }

    pub fn is_placeholder(&self) -> bool {
        self.as_any().is::<UnknownRecord>()
    }
}

/// Tombstone for a record whose type is not registered.  Keeps the stored
/// version and payload so saving it writes the original data back.
#[derive(Clone, Debug, PartialEq)]
pub struct UnknownRecord {
    pub category: Category,
    pub id: Identifier,
    pub version: u32,
    pub payload: Payload,
}

impl Record for UnknownRecord {
    fn category(&self) -> Category {
        self.category
    }

    fn identity(&self) -> &Identifier {
        &self.id
    }

    fn serialize(&self) -> Payload {
        self.payload.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Generic record for content declared purely as data.  The payload is the
/// record; field access goes through `serde_json`.
#[derive(Clone, Debug, PartialEq)]
pub struct DataRecord {
    pub category: Category,
    pub id: Identifier,
    pub payload: Payload,
}

impl DataRecord {
    pub fn field(&self, name: &str) -> Option<&Payload> {
        self.payload.get(name)
    }
}

impl Record for DataRecord {
    fn category(&self) -> Category {
        self.category
    }

    fn identity(&self) -> &Identifier {
        &self.id
    }

    fn serialize(&self) -> Payload {
        self.payload.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn downcast_distinguishes_placeholders() {
        let id = Identifier::parse("mod:unknown_block").expect("valid id");
        let mut unknown: Box<dyn Record> = Box::new(UnknownRecord {
            category: Category::Block,
            id: id.clone(),
            version: 4,
            payload: json!({ "version": 4, "glow": 3 }),
        });
        assert!(unknown.is_placeholder());
        assert_eq!(unknown.identity(), &id);
        assert_eq!(unknown.serialize()["glow"], json!(3));
        assert!(unknown.downcast_ref::<DataRecord>().is_none());
        unknown
            .downcast_mut::<UnknownRecord>()
            .expect("placeholder")
            .version = 5;
        assert_eq!(unknown.downcast_ref::<UnknownRecord>().map(|r| r.version), Some(5));

        let data: Box<dyn Record> = Box::new(DataRecord {
            category: Category::Item,
            id,
            payload: json!({ "count": 2 }),
        });
        assert!(!data.is_placeholder());
        assert_eq!(
            data.downcast_ref::<DataRecord>().and_then(|r| r.field("count")),
            Some(&json!(2))
        );
    }
}
