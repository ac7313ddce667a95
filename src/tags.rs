use crate::identifier::{Category, Identifier};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Raw membership list for one tag, as supplied by the tag data source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDeclaration {
    pub category: Category,
    pub tag: Identifier,
    pub members: Vec<Identifier>,
}

/// Read-only tag lookup built once at startup.
///
/// `tags_of` is derived from `members` at build time; declarations naming the
/// same tag twice are merged.
#[derive(Debug, Default)]
pub struct TagIndex {
    members: HashMap<(Category, Identifier), BTreeSet<Identifier>>,
    tags_of: HashMap<(Category, Identifier), BTreeSet<Identifier>>,
    empty: BTreeSet<Identifier>,
}

impl TagIndex {
    pub fn build<I>(declarations: I) -> Self
    where
        I: IntoIterator<Item = TagDeclaration>,
    {
        let mut members: HashMap<(Category, Identifier), BTreeSet<Identifier>> = HashMap::new();
        for declaration in declarations {
            members
                .entry((declaration.category, declaration.tag))
                .or_default()
                .extend(declaration.members);
        }

        let mut tags_of: HashMap<(Category, Identifier), BTreeSet<Identifier>> = HashMap::new();
        for ((category, tag), ids) in &members {
            for id in ids {
                tags_of
                    .entry((*category, id.clone()))
                    .or_default()
                    .insert(tag.clone());
            }
        }

        log::debug!(
            "tag index built: {} tags, {} tagged ids",
            members.len(),
            tags_of.len()
        );
        Self {
            members,
            tags_of,
            empty: BTreeSet::new(),
        }
    }

    /// Ids in `tag`.  Unknown tags yield an empty set.
    pub fn members(&self, category: Category, tag: &Identifier) -> &BTreeSet<Identifier> {
        self.members
            .get(&(category, tag.clone()))
            .unwrap_or(&self.empty)
    }

    /// Tags containing `id`.  Untagged ids yield an empty set.
    pub fn tags_of(&self, category: Category, id: &Identifier) -> &BTreeSet<Identifier> {
        self.tags_of
            .get(&(category, id.clone()))
            .unwrap_or(&self.empty)
    }

    pub fn has_tag(&self, category: Category, id: &Identifier, tag: &Identifier) -> bool {
        self.members(category, tag).contains(id)
    }

    /// Every tag declared for `category`, sorted.
    pub fn tags(&self, category: Category) -> Vec<&Identifier> {
        let mut tags: Vec<&Identifier> = self
            .members
            .keys()
            .filter(|(c, _)| *c == category)
            .map(|(_, tag)| tag)
            .collect();
        tags.sort();
        tags
    }
}
