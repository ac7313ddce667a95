use crate::config::StoreConfig;
use crate::identifier::Identifier;
use crate::payload::Payload;
use crate::record::Record;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

pub const DEFAULT_SHARD_COUNT: usize = 16;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockCoordinate {
    pub x: u64,
    pub y: u64,
    pub z: u64,
}

impl BlockCoordinate {
    pub const fn new(x: u64, y: u64, z: u64) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for BlockCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.x, self.y, self.z)
    }
}

impl FromStr for BlockCoordinate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',').map(|part| part.trim().parse::<u64>());
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(Ok(x)), Some(Ok(y)), Some(Ok(z)), None) => Ok(Self { x, y, z }),
            _ => Err(format!("'{s}' is not an x,y,z block coordinate")),
        }
    }
}

/// 128-bit entity id held as two halves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityUuid {
    pub high: u64,
    pub low: u64,
}

impl EntityUuid {
    pub const fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    pub fn as_u128(self) -> u128 {
        ((self.high as u128) << 64) | self.low as u128
    }

    pub fn from_u128(raw: u128) -> Self {
        Self {
            high: (raw >> 64) as u64,
            low: raw as u64,
        }
    }
}

impl fmt::Display for EntityUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = self.as_u128();
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (raw >> 96) as u32,
            (raw >> 80) as u16,
            (raw >> 64) as u16,
            (raw >> 48) as u16,
            raw & 0xffff_ffff_ffff
        )
    }
}

impl FromStr for EntityUuid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|c| *c != '-').collect();
        if hex.len() != 32 {
            return Err(format!("'{s}' is not a 128-bit uuid"));
        }
        u128::from_str_radix(&hex, 16)
            .map(Self::from_u128)
            .map_err(|e| format!("'{s}' is not a 128-bit uuid: {e}"))
    }
}

// ---------------------------------------------------------------------------
// Biomes
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weather {
    #[default]
    Sunny,
    Rainy,
    ThunderStorm,
    Snowy,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    #[default]
    Normal,
    Hard,
}

/// Stored form of one block: its id plus a versioned payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockCell {
    pub id: Identifier,
    pub data: Payload,
}

#[derive(Debug)]
pub enum BiomeError {
    BlocksNotAnObject,
    InvalidCell { coord: BlockCoordinate, reason: String },
}

impl fmt::Display for BiomeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlocksNotAnObject => f.write_str("biome blocks payload is not an object"),
            Self::InvalidCell { coord, reason } => {
                write!(f, "block cell at {coord} is malformed: {reason}")
            }
        }
    }
}

impl std::error::Error for BiomeError {}

/// A biome keeps its blocks as raw payload.  Cells are only turned into
/// typed records when somebody asks for them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Biome {
    pub id: Identifier,
    #[serde(default)]
    pub weather: Weather,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default = "empty_blocks")]
    pub blocks: Payload,
}

fn empty_blocks() -> Payload {
    Payload::Object(serde_json::Map::new())
}

impl Biome {
    pub fn new(id: Identifier) -> Self {
        Self {
            id,
            weather: Weather::default(),
            difficulty: Difficulty::default(),
            blocks: empty_blocks(),
        }
    }

    fn blocks_map(&self) -> Result<&serde_json::Map<String, Payload>, BiomeError> {
        self.blocks.as_object().ok_or(BiomeError::BlocksNotAnObject)
    }

    fn blocks_map_mut(&mut self) -> Result<&mut serde_json::Map<String, Payload>, BiomeError> {
        self.blocks.as_object_mut().ok_or(BiomeError::BlocksNotAnObject)
    }

    pub fn set_block(
        &mut self,
        coord: BlockCoordinate,
        cell: BlockCell,
    ) -> Result<Option<Payload>, BiomeError> {
        let raw = serde_json::to_value(cell).map_err(|e| BiomeError::InvalidCell {
            coord,
            reason: e.to_string(),
        })?;
        Ok(self.blocks_map_mut()?.insert(coord.to_string(), raw))
    }

    pub fn block_cell(&self, coord: BlockCoordinate) -> Result<Option<BlockCell>, BiomeError> {
        match self.blocks_map()?.get(&coord.to_string()) {
            None => Ok(None),
            Some(raw) => BlockCell::deserialize(raw)
                .map(Some)
                .map_err(|e| BiomeError::InvalidCell {
                    coord,
                    reason: e.to_string(),
                }),
        }
    }

    pub fn remove_block(&mut self, coord: BlockCoordinate) -> Result<Option<Payload>, BiomeError> {
        Ok(self.blocks_map_mut()?.remove(&coord.to_string()))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.as_object().map_or(0, |map| map.len())
    }
}

// ---------------------------------------------------------------------------
// Sharded storage
// ---------------------------------------------------------------------------

/// Hash-sharded map.  Each key lives in exactly one shard, so operations on
/// different shards never contend and operations on one key are serialized.
pub struct ShardedMap<K, V> {
    shards: Vec<Mutex<HashMap<K, V>>>,
    hasher: RandomState,
}

impl<K: Eq + Hash, V> ShardedMap<K, V> {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, key: &K) -> MutexGuard<'_, HashMap<K, V>> {
        let index = (self.hasher.hash_one(key) % self.shards.len() as u64) as usize;
        // Poisoned shards stay usable.
        self.shards[index]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard(key).remove(key)
    }

    /// Swap the value at an existing key.  Absent keys hand the value back.
    pub fn replace(&self, key: &K, value: V) -> Result<V, V> {
        match self.shard(key).get_mut(key) {
            Some(slot) => Ok(std::mem::replace(slot, value)),
            None => Err(value),
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.shard(key).contains_key(key)
    }

    pub fn with<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.shard(key).get(key).map(f)
    }

    pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.shard(key).get_mut(key).map(f)
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .len()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone, V> ShardedMap<K, V> {
    /// Snapshot of the keys; concurrent writers may change the map meanwhile.
    pub fn keys(&self) -> Vec<K> {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// World model
// ---------------------------------------------------------------------------

/// In-memory world.  Holds whatever it is given; validation happens on the
/// load path before anything reaches it.
pub struct WorldModel {
    biomes: ShardedMap<BlockCoordinate, Biome>,
    entities: ShardedMap<EntityUuid, Box<dyn Record>>,
    global_data: ShardedMap<Identifier, Payload>,
}

impl Default for WorldModel {
    fn default() -> Self {
        Self::new(DEFAULT_SHARD_COUNT)
    }
}

impl fmt::Debug for WorldModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldModel")
            .field("biomes", &self.biomes.len())
            .field("entities", &self.entities.len())
            .field("global_data", &self.global_data.len())
            .finish()
    }
}

impl WorldModel {
    pub fn new(shard_count: usize) -> Self {
        Self {
            biomes: ShardedMap::new(shard_count),
            entities: ShardedMap::new(shard_count),
            global_data: ShardedMap::new(shard_count),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        log::debug!("world model with {} shards", config.shard_count);
        Self::new(config.shard_count)
    }

    pub fn shard_count(&self) -> usize {
        self.entities.shard_count()
    }

    // Biomes

    pub fn insert_biome(&self, coord: BlockCoordinate, biome: Biome) -> Option<Biome> {
        self.biomes.insert(coord, biome)
    }

    pub fn remove_biome(&self, coord: BlockCoordinate) -> Option<Biome> {
        self.biomes.remove(&coord)
    }

    pub fn replace_biome(&self, coord: BlockCoordinate, biome: Biome) -> Result<Biome, Biome> {
        self.biomes.replace(&coord, biome)
    }

    pub fn with_biome<R>(&self, coord: BlockCoordinate, f: impl FnOnce(&Biome) -> R) -> Option<R> {
        self.biomes.with(&coord, f)
    }

    pub fn update_biome<R>(
        &self,
        coord: BlockCoordinate,
        f: impl FnOnce(&mut Biome) -> R,
    ) -> Option<R> {
        self.biomes.update(&coord, f)
    }

    pub fn biome_coordinates(&self) -> Vec<BlockCoordinate> {
        let mut coords = self.biomes.keys();
        coords.sort();
        coords
    }

    pub fn biome_count(&self) -> usize {
        self.biomes.len()
    }

    // Entities

    pub fn insert_entity(
        &self,
        uuid: EntityUuid,
        entity: Box<dyn Record>,
    ) -> Option<Box<dyn Record>> {
        self.entities.insert(uuid, entity)
    }

    pub fn remove_entity(&self, uuid: EntityUuid) -> Option<Box<dyn Record>> {
        self.entities.remove(&uuid)
    }

    pub fn replace_entity(
        &self,
        uuid: EntityUuid,
        entity: Box<dyn Record>,
    ) -> Result<Box<dyn Record>, Box<dyn Record>> {
        self.entities.replace(&uuid, entity)
    }

    pub fn contains_entity(&self, uuid: EntityUuid) -> bool {
        self.entities.contains(&uuid)
    }

    pub fn with_entity<R>(&self, uuid: EntityUuid, f: impl FnOnce(&dyn Record) -> R) -> Option<R> {
        self.entities.with(&uuid, |entity| f(entity.as_ref()))
    }

    pub fn update_entity<R>(
        &self,
        uuid: EntityUuid,
        f: impl FnOnce(&mut dyn Record) -> R,
    ) -> Option<R> {
        self.entities.update(&uuid, |entity| f(entity.as_mut()))
    }

    pub fn entity_ids(&self) -> Vec<EntityUuid> {
        let mut ids = self.entities.keys();
        ids.sort();
        ids
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    // Global data

    pub fn set_global(&self, key: Identifier, value: Payload) -> Option<Payload> {
        self.global_data.insert(key, value)
    }

    pub fn global(&self, key: &Identifier) -> Option<Payload> {
        self.global_data.with(key, Payload::clone)
    }

    pub fn remove_global(&self, key: &Identifier) -> Option<Payload> {
        self.global_data.remove(key)
    }

    pub fn global_keys(&self) -> Vec<Identifier> {
        let mut keys = self.global_data.keys();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::Category;
    use crate::record::DataRecord;
    use serde_json::json;

    fn id(text: &str) -> Identifier {
        Identifier::parse(text).expect("valid id")
    }

    fn orb(amount: u64) -> Box<dyn Record> {
        Box::new(DataRecord {
            category: Category::Entity,
            id: id("core:experience_orb"),
            payload: json!({ "version": 1, "exp_amount": amount }),
        })
    }

    fn orb_amount(record: &dyn Record) -> Option<u64> {
        record.serialize()["exp_amount"].as_u64()
    }

    #[test]
    fn coordinate_and_uuid_text_forms() {
        let coord = BlockCoordinate::new(1, 20, 300);
        assert_eq!(coord.to_string(), "1,20,300");
        assert_eq!("1,20,300".parse::<BlockCoordinate>(), Ok(coord));
        assert!("1,2".parse::<BlockCoordinate>().is_err());
        assert!("1,2,3,4".parse::<BlockCoordinate>().is_err());
        assert!("1,-2,3".parse::<BlockCoordinate>().is_err());

        let uuid = EntityUuid::new(0x0123_4567_89ab_cdef, 0xfedc_ba98_7654_3210);
        let text = uuid.to_string();
        assert_eq!(text, "01234567-89ab-cdef-fedc-ba9876543210");
        assert_eq!(text.parse::<EntityUuid>(), Ok(uuid));
    }

    #[test]
    fn biome_block_cells() {
        let mut biome = Biome::new(id("core:plains"));
        let coord = BlockCoordinate::new(0, 64, 3);
        assert_eq!(biome.block_cell(coord).expect("cell"), None);
        let cell = BlockCell {
            id: id("core:stone"),
            data: json!({ "version": 0, "hardness": 5 }),
        };
        assert!(biome.set_block(coord, cell.clone()).expect("set").is_none());
        assert_eq!(biome.block_count(), 1);
        assert_eq!(biome.block_cell(coord).expect("cell"), Some(cell));
        assert!(biome.remove_block(coord).expect("remove").is_some());
        assert_eq!(biome.block_count(), 0);

        biome.blocks = json!({ "0,64,3": { "id": 7 } });
        assert!(matches!(
            biome.block_cell(coord),
            Err(BiomeError::InvalidCell { .. })
        ));
        biome.blocks = json!([]);
        assert!(matches!(
            biome.block_cell(coord),
            Err(BiomeError::BlocksNotAnObject)
        ));
    }

    #[test]
    fn shard_count_follows_config() {
        let config = StoreConfig {
            shard_count: 4,
            ..StoreConfig::default()
        };
        let world = WorldModel::from_config(&config);
        assert_eq!(world.shard_count(), 4);
        assert_eq!(WorldModel::default().shard_count(), DEFAULT_SHARD_COUNT);
        let unclamped = StoreConfig {
            shard_count: 0,
            ..StoreConfig::default()
        };
        assert_eq!(WorldModel::from_config(&unclamped).shard_count(), 1);
    }

    #[test]
    fn biome_serde_defaults() {
        let raw = json!({ "id": "core:tundra", "weather": "snowy" });
        let biome: Biome = serde_json::from_value(raw).expect("biome");
        assert_eq!(biome.weather, Weather::Snowy);
        assert_eq!(biome.difficulty, Difficulty::Normal);
        assert_eq!(biome.block_count(), 0);
        let storm: Weather = serde_json::from_value(json!("thunder_storm")).expect("weather");
        assert_eq!(storm, Weather::ThunderStorm);
    }

    #[test]
    fn insert_remove_replace() {
        let world = WorldModel::new(4);
        let uuid = EntityUuid::new(1, 2);
        assert!(world.replace_entity(uuid, orb(1)).is_err());
        assert!(world.insert_entity(uuid, orb(1)).is_none());
        let old = world.replace_entity(uuid, orb(2)).expect("present");
        assert_eq!(orb_amount(old.as_ref()), Some(1));
        assert_eq!(world.with_entity(uuid, orb_amount), Some(Some(2)));
        world.update_entity(uuid, |entity| {
            if let Some(data) = entity.downcast_mut::<DataRecord>() {
                data.payload["exp_amount"] = json!(9);
            }
        });
        assert_eq!(world.with_entity(uuid, orb_amount), Some(Some(9)));
        assert!(world.remove_entity(uuid).is_some());
        assert!(!world.contains_entity(uuid));

        let key = id("mod:weather_cycle");
        assert!(world.set_global(key.clone(), json!({ "day": 3 })).is_none());
        assert_eq!(world.global(&key), Some(json!({ "day": 3 })));
        assert_eq!(world.global_keys(), vec![key.clone()]);
        assert!(world.remove_global(&key).is_some());
        assert_eq!(world.global(&key), None);
    }

    #[test]
    fn concurrent_inserts_at_distinct_coordinates() {
        let world = WorldModel::new(8);
        std::thread::scope(|scope| {
            for thread in 0..8u64 {
                let world = &world;
                scope.spawn(move || {
                    for i in 0..100u64 {
                        let coord = BlockCoordinate::new(thread, i, 0);
                        let mut biome = Biome::new(Identifier::core("plains").expect("id"));
                        biome.weather = Weather::Rainy;
                        world.insert_biome(coord, biome);
                    }
                });
            }
        });
        assert_eq!(world.biome_count(), 800);
        for thread in 0..8u64 {
            for i in 0..100u64 {
                assert_eq!(
                    world.with_biome(BlockCoordinate::new(thread, i, 0), |b| b.weather),
                    Some(Weather::Rainy)
                );
            }
        }
        assert_eq!(world.biome_coordinates().len(), 800);
    }

    #[test]
    fn concurrent_writes_to_one_uuid_are_serialized() {
        let world = WorldModel::new(8);
        let uuid = EntityUuid::new(7, 7);
        world.insert_entity(uuid, orb(0));
        std::thread::scope(|scope| {
            for writer in 1..=8u64 {
                let world = &world;
                scope.spawn(move || {
                    for _ in 0..50 {
                        world.insert_entity(uuid, orb(writer));
                    }
                });
            }
        });
        let last = world
            .with_entity(uuid, orb_amount)
            .flatten()
            .expect("entity present");
        assert!((1..=8).contains(&last));
        assert_eq!(world.entity_count(), 1);

        // Read-modify-write under the shard lock loses no increments.
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let world = &world;
                scope.spawn(move || {
                    for _ in 0..100 {
                        world.update_entity(uuid, |entity| {
                            if let Some(data) = entity.downcast_mut::<DataRecord>() {
                                let current = data.payload["exp_amount"].as_u64().unwrap_or(0);
                                data.payload["exp_amount"] = json!(current + 1);
                            }
                        });
                    }
                });
            }
        });
        assert_eq!(
            world.with_entity(uuid, orb_amount).flatten(),
            Some(last + 800)
        );
    }
}
