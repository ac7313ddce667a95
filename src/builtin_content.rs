use crate::fixer::{DataFixer, FixerOp};
use crate::identifier::{Category, Identifier, IdentifierError};
use crate::payload::Payload;
use crate::record::Record;
use crate::registry::{RegistryBuilder, RegistryError, TypeDefinition};
use crate::schema::{FieldKind, FieldSchema, Schema};
use crate::tags::TagDeclaration;
use serde::Deserialize;
use serde_json::json;
use std::any::Any;

pub const STONE: &str = "stone";
pub const EXPERIENCE_ORB: &str = "experience_orb";

pub const STONE_VERSION: u32 = 2;
pub const EXPERIENCE_ORB_VERSION: u32 = 1;

const MAX_LUMINANCE: i64 = 15;

/// Builtin stone, shared by the block and the item of the same id.
#[derive(Clone, Debug, PartialEq)]
pub struct Stone {
    pub category: Category,
    pub id: Identifier,
    pub toughness: u64,
    pub luminance: u8,
}

#[derive(Deserialize)]
struct StoneFields {
    toughness: u64,
    luminance: u8,
}

impl Record for Stone {
    fn category(&self) -> Category {
        self.category
    }

    fn identity(&self) -> &Identifier {
        &self.id
    }

    fn serialize(&self) -> Payload {
        json!({ "toughness": self.toughness, "luminance": self.luminance })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExperienceOrb {
    pub id: Identifier,
    pub exp_amount: u64,
}

#[derive(Deserialize)]
struct ExperienceOrbFields {
    exp_amount: u64,
}

impl Record for ExperienceOrb {
    fn category(&self) -> Category {
        Category::Entity
    }

    fn identity(&self) -> &Identifier {
        &self.id
    }

    fn serialize(&self) -> Payload {
        json!({ "exp_amount": self.exp_amount })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn core_id(path: &str) -> Result<Identifier, RegistryError> {
    Identifier::core(path).map_err(|error: IdentifierError| RegistryError::InvalidDefinition {
        id: format!("core:{path}"),
        reason: error.to_string(),
    })
}

/// Register engine builtin types and their legacy remaps.
pub fn register_builtin_content(builder: &mut RegistryBuilder) -> Result<(), RegistryError> {
    register_stone(builder, Category::Block)?;
    register_stone(builder, Category::Item)?;
    register_experience_orb(builder)?;
    register_legacy_aliases(builder)
}

fn register_stone(builder: &mut RegistryBuilder, category: Category) -> Result<(), RegistryError> {
    let id = core_id(STONE)?;
    let record_id = id.clone();
    let definition = TypeDefinition::new(category, id, STONE_VERSION, move |payload, _version| {
        let fields: StoneFields =
            serde_json::from_value(payload.clone()).map_err(|e| e.to_string())?;
        Ok(Box::new(Stone {
            category,
            id: record_id.clone(),
            toughness: fields.toughness,
            luminance: fields.luminance,
        }) as Box<dyn Record>)
    })
    .with_schema(0, Schema::new().field("hardness", toughness_field()))
    .with_schema(1, Schema::new().field("toughness", toughness_field()))
    .with_schema(
        STONE_VERSION,
        Schema::new()
            .field("toughness", toughness_field())
            .field(
                "luminance",
                FieldSchema::required(FieldKind::Integer {
                    min: Some(0),
                    max: Some(MAX_LUMINANCE),
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
    .with_size_hint(32);
    builder.register(definition)
}

fn toughness_field() -> FieldSchema {
    FieldSchema::required(FieldKind::Integer {
        min: Some(0),
        max: None,
    })
}

fn register_experience_orb(builder: &mut RegistryBuilder) -> Result<(), RegistryError> {
    let id = core_id(EXPERIENCE_ORB)?;
    let record_id = id.clone();
    let amount = || {
        FieldSchema::required(FieldKind::Integer {
            min: Some(0),
            max: None,
        })
    };
    let definition = TypeDefinition::new(
        Category::Entity,
        id,
        EXPERIENCE_ORB_VERSION,
        move |payload, _version| {
            let fields: ExperienceOrbFields =
                serde_json::from_value(payload.clone()).map_err(|e| e.to_string())?;
            Ok(Box::new(ExperienceOrb {
                id: record_id.clone(),
                exp_amount: fields.exp_amount,
            }) as Box<dyn Record>)
        },
    )
    .with_schema(0, Schema::new().field("amount", amount()))
    .with_schema(
        EXPERIENCE_ORB_VERSION,
        Schema::new().field("exp_amount", amount()),
    )
    .with_fixer(DataFixer::from_ops(
        0,
        vec![FixerOp::Rename {
            from: "amount".into(),
            to: "exp_amount".into(),
        }],
    ))
    .with_size_hint(24);
    builder.register(definition)
}

/// Ids retired from older saves, mapped onto their replacements.
fn register_legacy_aliases(builder: &mut RegistryBuilder) -> Result<(), RegistryError> {
    const LEGACY_ALIASES: [(Category, &str, &str); 3] = [
        (Category::Block, "rock", STONE),
        (Category::Item, "rock", STONE),
        (Category::Entity, "xp_orb", EXPERIENCE_ORB),
    ];
    for (category, old, new) in LEGACY_ALIASES {
        builder.register_alias(category, core_id(old)?, core_id(new)?)?;
    }
    Ok(())
}

/// Builtin tag memberships.
pub fn builtin_tags() -> Result<Vec<TagDeclaration>, IdentifierError> {
    const BUILTIN_TAGS: [(Category, &str, &[&str]); 7] = [
        (Category::Block, "stone", &[STONE]),
        (Category::Item, "stone", &[STONE]),
        (Category::Block, "can_be_burnt", &["oak_log", "oak_planks"]),
        (Category::Item, "can_be_burnt", &["oak_log", "oak_planks", "coal"]),
        (Category::Block, "wood", &["oak_log", "oak_planks"]),
        (Category::Block, "dirt", &["dirt", "grass_block"]),
        (
            Category::Block,
            "redstone_power_source",
            &["redstone_block", "redstone_torch", "lever"],
        ),
    ];
    BUILTIN_TAGS
        .iter()
        .map(|&(category, tag, members)| {
            Ok(TagDeclaration {
                category,
                tag: Identifier::core(tag)?,
                members: members
                    .iter()
                    .map(|member| Identifier::core(member))
                    .collect::<Result<Vec<_>, _>>()?,
            })
        })
        .collect()
}
