use core_affinity::{CoreId, get_core_ids, set_for_current};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorePickPolicy {
    /// Leave placement to the OS.
    #[default]
    None,
    /// Worker `n` goes to the `n`-th usable core, wrapping around.
    RoundRobin,
    /// Worker `n` goes to `core_ids[n % core_ids.len()]`.
    Specific,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AffinityConfig {
    pub policy: CorePickPolicy,
    pub core_ids: Vec<usize>,
    /// Cores never handed to workers.
    pub reserved_core_ids: Vec<usize>,
}

impl AffinityConfig {
    /// Core a worker should pin itself to, if any.
    pub fn core_for_worker(&self, worker_id: usize) -> Option<usize> {
        match self.policy {
            CorePickPolicy::None => None,
            CorePickPolicy::Specific => {
                let usable: Vec<usize> = self
                    .core_ids
                    .iter()
                    .copied()
                    .filter(|id| !self.reserved_core_ids.contains(id))
                    .collect();
                if usable.is_empty() {
                    return None;
                }
                Some(usable[worker_id % usable.len()])
            }
            CorePickPolicy::RoundRobin => {
                let usable: Vec<usize> = available_cores()
                    .into_iter()
                    .filter(|id| !self.reserved_core_ids.contains(id))
                    .collect();
                if usable.is_empty() {
                    return None;
                }
                Some(usable[worker_id % usable.len()])
            }
        }
    }
}

pub fn available_cores() -> Vec<usize> {
    get_core_ids()
        .map(|ids| ids.into_iter().map(|c| c.id).collect())
        .unwrap_or_default()
}

pub fn try_pin_core(core_id: usize) -> anyhow::Result<usize> {
    if let Some(core_ids) = get_core_ids()
        && core_ids.iter().any(|c| c.id == core_id)
        && set_for_current(CoreId { id: core_id })
    {
        return Ok(core_id);
    }
    Err(anyhow::anyhow!("failed to pin core {core_id}"))
}
