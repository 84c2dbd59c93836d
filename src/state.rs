use crate::config::ServiceEndpoint;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One physical device as reported by a single poll of the status tool.
///
/// Memory figures are bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuReading {
    pub device_id: String,
    pub bus_id: String,
    pub name: String,
    #[serde(rename = "mem_total")]
    pub memory_total_bytes: u64,
    #[serde(rename = "mem_used")]
    pub memory_used_bytes: u64,
    #[serde(rename = "gpu_used")]
    pub utilization_percent: u64,
    #[serde(rename = "temperature")]
    pub temperature_celsius: u64,
    #[serde(rename = "power_usage")]
    pub power_draw_watts: f64,
    #[serde(rename = "power_limit")]
    pub power_limit_watts: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuProcessReading {
    pub bus_id: String,
    pub pid: u64,
    pub name: String,
    #[serde(rename = "mem_used")]
    pub memory_used_bytes: u64,
}

/// Devices and compute processes captured in one tick. A default value is the
/// "nothing collected yet" snapshot: no readings and a zero timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuSnapshot {
    #[serde(rename = "gpu_info")]
    pub gpus: Vec<GpuReading>,
    #[serde(rename = "gpu_processes")]
    pub processes: Vec<GpuProcessReading>,
    pub timestamp: i64,
}

impl GpuSnapshot {
    pub fn is_empty(&self) -> bool {
        self.timestamp == 0 && self.gpus.is_empty() && self.processes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatusReading {
    pub endpoint: ServiceEndpoint,
    pub reachable: bool,
    pub status_code: Option<u16>,
    pub payload: Option<Value>,
    pub error: Option<String>,
}

impl ServiceStatusReading {
    pub fn reachable(endpoint: ServiceEndpoint, status_code: u16, payload: Value) -> Self {
        Self {
            endpoint,
            reachable: true,
            status_code: Some(status_code),
            payload: Some(payload),
            error: None,
        }
    }

    pub fn unreachable(endpoint: ServiceEndpoint, status_code: Option<u16>, error: String) -> Self {
        Self {
            endpoint,
            reachable: false,
            status_code,
            payload: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionState {
    #[default]
    Uninitialized,
    NotConfigured,
    Collected,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceStatusSnapshot {
    pub state: CollectionState,
    pub timestamp: i64,
    pub endpoints: Vec<ServiceStatusReading>,
}

impl ServiceStatusSnapshot {
    pub fn not_configured(timestamp: i64) -> Self {
        Self {
            state: CollectionState::NotConfigured,
            timestamp,
            endpoints: Vec::new(),
        }
    }

    pub fn collected(timestamp: i64, endpoints: Vec<ServiceStatusReading>) -> Self {
        Self {
            state: CollectionState::Collected,
            timestamp,
            endpoints,
        }
    }
}

/// Latest GPU and service-status snapshots shared between collectors and the
/// gateway. Each slot holds an `Arc` that is swapped whole on publish, so a
/// reader only ever clones a pointer to a complete snapshot.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    gpu: RwLock<Arc<GpuSnapshot>>,
    services: RwLock<Arc<ServiceStatusSnapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish_gpu(&self, snapshot: GpuSnapshot) {
        let next = Arc::new(snapshot);
        *self.gpu.write().await = next;
    }

    pub async fn publish_service_status(&self, snapshot: ServiceStatusSnapshot) {
        let next = Arc::new(snapshot);
        *self.services.write().await = next;
    }

    pub async fn current_gpu(&self) -> Arc<GpuSnapshot> {
        self.gpu.read().await.clone()
    }

    pub async fn current_service_status(&self) -> Arc<ServiceStatusSnapshot> {
        self.services.read().await.clone()
    }
}
