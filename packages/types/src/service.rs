use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{Duration, RepoSource, ServiceId, Zone};

/// A source repository whose manifest declares tests. The manifest itself
/// is resolved by an external collaborator; the core only needs the
/// coordinates and scheduling defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub repo: RepoSource,
    /// Zones applied to a run when its specs do not narrow them further
    pub default_zones: BTreeSet<Zone>,
    pub default_timeout: Option<Duration>,
}
