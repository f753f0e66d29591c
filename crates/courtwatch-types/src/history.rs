use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Diagnostic summary of one poll cycle. Written to the history log, never
/// read back by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckCycleResult {
    pub cycle_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub slots_found: usize,
    pub venues_checked: Vec<String>,
    pub error: Option<String>,
    /// Non-fatal sub-errors such as a single court lookup failing.
    #[serde(default)]
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

impl CheckCycleResult {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            timestamp: at,
            success: false,
            slots_found: 0,
            venues_checked: Vec::new(),
            error: None,
            warnings: Vec::new(),
            duration_ms: 0,
        }
    }
}
