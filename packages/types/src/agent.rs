use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{AgentId, RunId, Timestamp, Zone};

/// Everything an agent advertises about itself at registration.
/// A plain tagged record: scheduling eligibility is a function of
/// this value and a run's requirements, nothing polymorphic.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode, Default,
)]
pub struct AgentCaps {
    /// Network zones this agent can reach
    pub zones: BTreeSet<Zone>,
    /// Runtime name -> version, e.g. "node" -> "22.1.0"
    pub runtimes: BTreeMap<String, String>,
    /// How many runs the agent will execute concurrently
    pub max_parallel: u32,
    pub docker_available: bool,
    /// Free-form resource hints (cpu count, memory, labels)
    pub resources: BTreeMap<String, String>,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Connecting,
    Idle,
    Busy,
    Draining,
    Offline,
}

impl AgentState {
    /// States in which the scheduler may hand out new work
    pub fn accepts_work(&self) -> bool {
        matches!(self, AgentState::Idle | AgentState::Busy)
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentState::Connecting => "connecting",
            AgentState::Idle => "idle",
            AgentState::Busy => "busy",
            AgentState::Draining => "draining",
            AgentState::Offline => "offline",
        };
        write!(f, "{}", s)
    }
}

/// The registry's authoritative record for one agent.
///
/// Runs are referenced by id only; the repository is the only place
/// that materializes the agent<->run relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub version: String,
    pub caps: AgentCaps,
    pub state: AgentState,
    pub last_heartbeat: Timestamp,
    pub active_runs: BTreeSet<RunId>,
}

impl Agent {
    pub fn residual_capacity(&self) -> u32 {
        self.caps
            .max_parallel
            .saturating_sub(self.active_runs.len() as u32)
    }

    /// Busy iff it holds work and is not draining; recomputed after every
    /// claim/release so the state never drifts from the active set.
    pub fn recompute_state(&mut self) {
        self.state = match self.state {
            AgentState::Draining | AgentState::Offline | AgentState::Connecting => self.state,
            AgentState::Idle | AgentState::Busy => {
                if self.active_runs.is_empty() {
                    AgentState::Idle
                } else {
                    AgentState::Busy
                }
            }
        };
    }

    pub fn reaches(&self, zones: &BTreeSet<Zone>) -> bool {
        zones.iter().all(|z| self.caps.zones.contains(z))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(max_parallel: u32) -> Agent {
        Agent {
            id: AgentId::new("agent-1").unwrap(),
            name: "test".to_string(),
            version: "1.0.0".to_string(),
            caps: AgentCaps {
                zones: ["zone-a".parse().unwrap()].into(),
                max_parallel,
                ..Default::default()
            },
            state: AgentState::Idle,
            last_heartbeat: Timestamp::now(),
            active_runs: BTreeSet::new(),
        }
    }

    #[test]
    fn capacity_never_goes_negative() {
        let mut a = agent(1);
        a.active_runs.insert(RunId::new("run-1").unwrap());
        a.active_runs.insert(RunId::new("run-2").unwrap());
        assert_eq!(a.residual_capacity(), 0);
    }

    #[test]
    fn state_follows_active_set() {
        let mut a = agent(2);
        a.active_runs.insert(RunId::new("run-1").unwrap());
        a.recompute_state();
        assert_eq!(a.state, AgentState::Busy);

        a.active_runs.clear();
        a.recompute_state();
        assert_eq!(a.state, AgentState::Idle);
    }

    #[test]
    fn draining_is_sticky() {
        let mut a = agent(2);
        a.state = AgentState::Draining;
        a.recompute_state();
        assert_eq!(a.state, AgentState::Draining);
    }

    #[test]
    fn zone_superset_check() {
        let a = agent(1);
        let wanted: BTreeSet<Zone> = ["zone-a".parse().unwrap()].into();
        assert!(a.reaches(&wanted));

        let wanted: BTreeSet<Zone> = ["zone-a".parse().unwrap(), "zone-b".parse().unwrap()].into();
        assert!(!a.reaches(&wanted));
    }
}
