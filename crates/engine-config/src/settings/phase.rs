use serde::{Deserialize, Serialize};

/// Relative weight of each phase in a migration's overall progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseWeights {
    pub maintenance: u32,
    pub backup: u32,
    pub restore: u32,
    pub finalize: u32,
}

impl Default for PhaseWeights {
    fn default() -> Self {
        PhaseWeights {
            maintenance: 5,
            backup: 45,
            restore: 45,
            finalize: 5,
        }
    }
}

impl PhaseWeights {
    pub fn total(&self) -> u32 {
        self.maintenance + self.backup + self.restore + self.finalize
    }
}
