use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub timestamp: DateTime<Utc>,
    pub subsystems: HashMap<String, SubsystemHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemHealth {
    Healthy,
    Unhealthy { error: String },
    Unknown,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            subsystems: HashMap::new(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.subsystems
            .values()
            .all(|result| matches!(result, SubsystemHealth::Healthy))
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedHealthStatus = Arc<RwLock<HealthStatus>>;

pub fn create_shared_health_status() -> SharedHealthStatus {
    Arc::new(RwLock::new(HealthStatus::new()))
}

pub fn set_subsystem_health(health: &SharedHealthStatus, name: &str, result: SubsystemHealth) {
    let mut status = health.write().unwrap();
    status.timestamp = Utc::now();
    status.subsystems.insert(name.to_string(), result);
}
