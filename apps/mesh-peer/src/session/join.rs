use mesh_protocol::ParticipantId;
use std::collections::HashSet;
use thiserror::Error;

pub const DEFAULT_MAX_PEERS: usize = 10;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("roster of {size} participants exceeds the mesh limit of {max}")]
    Capacity { size: usize, max: usize },
}

/// Who the newcomer should call, in roster order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinPlan {
    pub initiate: Vec<ParticipantId>,
    /// Roster members that already have a session.
    pub skipped: Vec<ParticipantId>,
}

impl JoinPlan {
    pub fn is_empty(&self) -> bool {
        self.initiate.is_empty() && self.skipped.is_empty()
    }
}

/// Mesh construction policy: the participant that joins later offers to
/// everyone already present, so there is never a tie to break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOrchestrator {
    max_peers: usize,
}

impl Default for JoinOrchestrator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PEERS)
    }
}

impl JoinOrchestrator {
    pub fn new(max_peers: usize) -> Self {
        Self { max_peers }
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    pub fn plan(
        &self,
        roster: &[ParticipantId],
        local: &ParticipantId,
        is_known: impl Fn(&ParticipantId) -> bool,
    ) -> Result<JoinPlan, JoinError> {
        let mut seen = HashSet::new();
        let members: Vec<&ParticipantId> = roster
            .iter()
            .filter(|id| *id != local)
            .filter(|id| seen.insert(*id))
            .collect();

        if members.len() > self.max_peers {
            return Err(JoinError::Capacity {
                size: members.len(),
                max: self.max_peers,
            });
        }

        let mut plan = JoinPlan::default();
        for id in members {
            if is_known(id) {
                plan.skipped.push(id.clone());
            } else {
                plan.initiate.push(id.clone());
            }
        }
        Ok(plan)
    }
}
