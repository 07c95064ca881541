//! Shared API type definitions
//!
//! This crate contains the type definitions crossing the boundary
//! between the runtime shim and the placement policy: container
//! admission payloads, device topology hints and inter-container
//! affinity declarations.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Preferred CPU priority class for a container's CPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CpuPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl std::fmt::Display for CpuPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CpuPriority::Low => write!(f, "low"),
            CpuPriority::Normal => write!(f, "normal"),
            CpuPriority::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for CpuPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(CpuPriority::Low),
            "normal" => Ok(CpuPriority::Normal),
            "high" => Ok(CpuPriority::High),
            other => Err(format!("unknown CPU priority {other:?}")),
        }
    }
}

/// A device-topology hint attached to a container by the runtime
/// (CRI device info or CDI annotations). Sets are CPU / NUMA node
/// list strings in kubelet syntax.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyHint {
    /// CPUs close to the device, e.g. `"0-7"`
    pub cpus: Option<String>,
    /// NUMA nodes close to the device, e.g. `"0"`
    pub numas: Option<String>,
}

/// Affinity of a container towards already-placed containers. Positive
/// weights attract, negative weights repel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityRule {
    /// Glob matched against the pretty names of existing containers
    pub scope: String,
    pub weight: i32,
}

/// Container admission payload as delivered by the runtime shim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Runtime container id, unique across the node
    pub id: String,
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod_name: String,
    /// Container name within the pod
    pub container_name: String,
    /// Requested CPU in millicpu
    pub millicpu_request: i64,
    /// Requested memory in bytes
    pub mem_request: u64,
    /// Effective pod + container annotations
    pub annotations: BTreeMap<String, String>,
    /// Topology hints keyed by provider (device) identifier
    pub topology_hints: BTreeMap<String, TopologyHint>,
    /// Affinity declarations towards other containers
    pub affinity: Vec<AffinityRule>,
}

impl ContainerInfo {
    /// Human-readable `namespace/pod:container` name used in logs and
    /// metrics.
    pub fn pretty_name(&self) -> String {
        format!(
            "{}/{}:{}",
            self.namespace, self.pod_name, self.container_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_info_round_trips_through_json() {
        let mut annotations = BTreeMap::new();
        annotations.insert("corepin.io/memory-type".to_string(), "pmem".to_string());

        let info = ContainerInfo {
            id: "c0".to_string(),
            namespace: "default".to_string(),
            pod_name: "pod0".to_string(),
            container_name: "main".to_string(),
            millicpu_request: 1500,
            mem_request: 1 << 30,
            annotations,
            ..Default::default()
        };

        let encoded = serde_json::to_string(&info).expect("should serialize");
        let decoded: ContainerInfo = serde_json::from_str(&encoded).expect("should deserialize");
        assert_eq!(decoded.id, "c0");
        assert_eq!(decoded.millicpu_request, 1500);
        assert_eq!(
            decoded.annotations.get("corepin.io/memory-type").unwrap(),
            "pmem"
        );
    }

    #[test]
    fn pretty_name_format() {
        let info = ContainerInfo {
            namespace: "kube-system".to_string(),
            pod_name: "dns".to_string(),
            container_name: "coredns".to_string(),
            ..Default::default()
        };
        assert_eq!(info.pretty_name(), "kube-system/dns:coredns");
    }

    #[test]
    fn cpu_priority_parses_lowercase_names() {
        assert_eq!("high".parse::<CpuPriority>().unwrap(), CpuPriority::High);
        assert!("urgent".parse::<CpuPriority>().is_err());
        let encoded = serde_json::to_string(&CpuPriority::Low).unwrap();
        assert_eq!(encoded, "\"low\"");
    }
}
