//! Policy configuration
//!
//! The options record is deserialized from the runtime shim's
//! configuration payload and handed to the allocator at construction;
//! there is no mutable process-wide configuration state.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PolicyOptions {
    /// Issue cpuset CPU pinning at all.
    #[serde(rename = "pinCPU")]
    pub pin_cpu: bool,

    /// Issue cpuset-mems memory pinning.
    pub pin_memory: bool,

    /// Namespace globs whose containers are forced onto reserved CPUs.
    pub reserved_pool_namespaces: Vec<String>,

    /// CPU list carved out of the shared pools for system workloads,
    /// e.g. `"0-1"`. Empty means no reserved partition.
    pub reserved_resources: Option<String>,
}

impl Default for PolicyOptions {
    fn default() -> Self {
        Self {
            pin_cpu: true,
            pin_memory: true,
            reserved_pool_namespaces: Vec::new(),
            reserved_resources: None,
        }
    }
}

impl PolicyOptions {
    /// Whether a namespace falls into the reserved pool.
    pub fn is_reserved_namespace(&self, namespace: &str) -> bool {
        self.reserved_pool_namespaces.iter().any(|pattern| {
            glob::Pattern::new(pattern)
                .map(|p| p.matches(namespace))
                .unwrap_or_else(|e| {
                    tracing::warn!(pattern = %pattern, error = %e, "bad namespace glob");
                    false
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pin_everything() {
        let opts: PolicyOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.pin_cpu);
        assert!(opts.pin_memory);
        assert!(opts.reserved_pool_namespaces.is_empty());
        assert!(opts.reserved_resources.is_none());
    }

    #[test]
    fn deserializes_overrides() {
        let opts: PolicyOptions = serde_json::from_str(
            r#"{
                "pinCPU": false,
                "pinMemory": false,
                "reservedPoolNamespaces": ["kube-*"],
                "reservedResources": "0-1"
            }"#,
        )
        .unwrap();
        assert!(!opts.pin_cpu);
        assert!(!opts.pin_memory);
        assert_eq!(opts.reserved_resources.as_deref(), Some("0-1"));
    }

    #[test]
    fn namespace_globs_match() {
        let opts = PolicyOptions {
            reserved_pool_namespaces: vec!["kube-system".into(), "monitoring-*".into()],
            ..Default::default()
        };
        assert!(opts.is_reserved_namespace("kube-system"));
        assert!(opts.is_reserved_namespace("monitoring-agents"));
        assert!(!opts.is_reserved_namespace("default"));
    }
}
