use crate::sequencer::LoopPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine sizing. Everything here is allocated up front so the audio path
/// never has to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Frames rendered per pass; longer host blocks are split.
    pub max_block_size: usize,
    /// Note-ons queued per voice per block.
    pub events_per_voice: usize,
    pub max_active_notes: usize,
    pub loop_policy: LoopPolicy,
    pub command_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_block_size: 4096,
            events_per_voice: 256,
            max_active_notes: 512,
            loop_policy: LoopPolicy::ProjectBars,
            command_queue_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, anyhow::Error> {
        let config: EngineConfig = serde_json::from_str(json)?;
        Ok(config.sanitized())
    }

    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {:?}: {}", path, e))?;
        Self::from_json(&json)
    }

    /// Zero sizes would make the engine drop everything.
    pub fn sanitized(mut self) -> Self {
        self.max_block_size = self.max_block_size.max(1);
        self.events_per_voice = self.events_per_voice.max(1);
        self.max_active_notes = self.max_active_notes.max(1);
        self.command_queue_capacity = self.command_queue_capacity.max(1);
        self
    }
}
