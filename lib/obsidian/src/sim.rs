use crate::replay::ReplayFile;
use hashbrown::HashMap;
use serde_derive::Deserialize;

/// The deterministic game engine, consumed as a black box: given a replay (seed,
/// per-frame inputs, level identifiers) it re-executes the run and returns the final
/// in-game time. `None` means the replay could not be executed at all.
pub trait GameSimulation {
    fn execute_replay(&self, replay: &ReplayFile) -> Option<f64>;
}

/// Knows which pack/level combinations exist and which of them award scores.
pub trait LevelCatalog {
    fn level_exists(&self, pack_id: &str, level_id: &str) -> bool;
    fn level_scored(&self, pack_id: &str, level_id: &str) -> bool;
}

/// One catalog entry, as configured for the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct LevelRecord {
    pub pack_id: String,
    pub level_id: String,
    #[serde(default = "default_scored")]
    pub scored: bool,
}

fn default_scored() -> bool {
    true
}

/// Catalog backed by a fixed table built at startup.
pub struct StaticCatalog {
    levels: HashMap<(String, String), bool>,
}

impl StaticCatalog {
    pub fn new(records: Vec<LevelRecord>) -> StaticCatalog {
        let levels = records
            .into_iter()
            .map(|record| ((record.pack_id, record.level_id), record.scored))
            .collect();

        StaticCatalog { levels }
    }
}

impl LevelCatalog for StaticCatalog {
    fn level_exists(&self, pack_id: &str, level_id: &str) -> bool {
        self.levels.contains_key(&(pack_id.to_string(), level_id.to_string()))
    }

    fn level_scored(&self, pack_id: &str, level_id: &str) -> bool {
        *self
            .levels
            .get(&(pack_id.to_string(), level_id.to_string()))
            .unwrap_or(&false)
    }
}

/// Stand-in simulation for deployments where the engine is not linked in: trusts the
/// replay's claimed score. Replace with the real engine binding to get actual
/// replay verification.
pub struct ClaimedScoreSimulation;

impl GameSimulation for ClaimedScoreSimulation {
    fn execute_replay(&self, replay: &ReplayFile) -> Option<f64> {
        Some(replay.claimed_score)
    }
}
