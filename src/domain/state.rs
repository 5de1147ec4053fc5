//! `UnitState`: the scheduler's private bookkeeping for one unit.
//!
//! Exactly one `UnitState` exists per discovered `Unit`. It is never
//! persisted; on restart the scheduler is rebuilt from a fresh Discovery
//! pass and every unit whose on-disk frontmatter shows incomplete tasks
//! starts again from `Pending`.

use std::time::Instant;

use super::unit::UnitStatus;

#[derive(Debug, Clone)]
pub struct UnitState {
    pub status: UnitStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub dispatched_at: Option<Instant>,
}

impl UnitState {
    pub fn new() -> Self {
        Self {
            status: UnitStatus::Pending,
            attempt_count: 0,
            last_error: None,
            dispatched_at: None,
        }
    }
}

impl Default for UnitState {
    fn default() -> Self {
        Self::new()
    }
}
