//! Pod and container annotations recognized by the policy

use std::collections::BTreeMap;

use api_types::CpuPriority;
use error_stack::Report;
use error_stack::ResultExt;
use thiserror::Error;

use super::memory::MemTypeMask;

/// Domain prefix for corepin annotations.
const COREPIN_DOMAIN: &str = "corepin.io";

#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("invalid annotation value: {message}")]
    InvalidValue { message: String },
}

/// Placement preferences extracted from a container's effective
/// annotations.
#[derive(Debug, Clone, Default)]
pub(crate) struct PlacementAnnotations {
    /// Leave the container's existing pinning untouched
    pub cpu_preserve: bool,
    /// Allocate from the reserved CPU partition
    pub prefer_reserved: bool,
    /// Whole-CPU requests take isolated CPUs when available
    pub prefer_isolated: Option<bool>,
    /// Preferred CPU priority class
    pub cpu_priority: Option<CpuPriority>,
    /// Acceptable memory types
    pub memory_type: Option<MemTypeMask>,
    /// Expose only one logical CPU per physical core
    pub hide_hyperthreads: bool,
}

impl PlacementAnnotations {
    /// Parse corepin annotations from a container's effective annotation
    /// map. Only keys with the corepin.io domain are considered.
    ///
    /// # Errors
    ///
    /// - [`AnnotationError::InvalidValue`] if an annotation value does not parse
    pub(crate) fn from_annotations(
        annotations: &BTreeMap<String, String>,
    ) -> Result<Self, Report<AnnotationError>> {
        let mut result = Self::default();

        if let Some(value) = annotations.get(&format!("{COREPIN_DOMAIN}/cpu-preserve")) {
            result.cpu_preserve = parse_bool("cpu-preserve", value)?;
        }

        if let Some(value) = annotations.get(&format!("{COREPIN_DOMAIN}/prefer-reserved-cpus")) {
            result.prefer_reserved = parse_bool("prefer-reserved-cpus", value)?;
        }

        if let Some(value) = annotations.get(&format!("{COREPIN_DOMAIN}/prefer-isolated-cpus")) {
            result.prefer_isolated = Some(parse_bool("prefer-isolated-cpus", value)?);
        }

        if let Some(value) = annotations.get(&format!("{COREPIN_DOMAIN}/prefer-cpu-priority")) {
            result.cpu_priority = Some(value.parse::<CpuPriority>().map_err(|e| {
                Report::new(AnnotationError::InvalidValue {
                    message: format!("prefer-cpu-priority: {e}"),
                })
            })?);
        }

        if let Some(value) = annotations.get(&format!("{COREPIN_DOMAIN}/memory-type")) {
            result.memory_type = Some(MemTypeMask::parse(value).map_err(|e| {
                Report::new(AnnotationError::InvalidValue {
                    message: format!("memory-type: {e}"),
                })
            })?);
        }

        if let Some(value) = annotations.get(&format!("{COREPIN_DOMAIN}/hide-hyperthreads")) {
            result.hide_hyperthreads = parse_bool("hide-hyperthreads", value)?;
        }

        Ok(result)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Report<AnnotationError>> {
    value
        .parse::<bool>()
        .change_context(AnnotationError::InvalidValue {
            message: format!("{key}: expected true or false, got {value:?}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (format!("{COREPIN_DOMAIN}/{k}"), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_when_unannotated() {
        let parsed = PlacementAnnotations::from_annotations(&BTreeMap::new()).unwrap();
        assert!(!parsed.cpu_preserve);
        assert!(!parsed.prefer_reserved);
        assert!(parsed.prefer_isolated.is_none());
        assert!(parsed.cpu_priority.is_none());
        assert!(parsed.memory_type.is_none());
    }

    #[test]
    fn parses_all_recognized_keys() {
        let parsed = PlacementAnnotations::from_annotations(&annotations(&[
            ("cpu-preserve", "false"),
            ("prefer-reserved-cpus", "true"),
            ("prefer-isolated-cpus", "false"),
            ("prefer-cpu-priority", "high"),
            ("memory-type", "dram,pmem"),
            ("hide-hyperthreads", "true"),
        ]))
        .unwrap();

        assert!(parsed.prefer_reserved);
        assert_eq!(parsed.prefer_isolated, Some(false));
        assert_eq!(parsed.cpu_priority, Some(CpuPriority::High));
        assert_eq!(
            parsed.memory_type,
            Some(MemTypeMask::DRAM | MemTypeMask::PMEM)
        );
        assert!(parsed.hide_hyperthreads);
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(
            PlacementAnnotations::from_annotations(&annotations(&[("cpu-preserve", "yes")]))
                .is_err()
        );
        assert!(
            PlacementAnnotations::from_annotations(&annotations(&[("memory-type", "optane")]))
                .is_err()
        );
        assert!(PlacementAnnotations::from_annotations(&annotations(&[(
            "prefer-cpu-priority",
            "urgent"
        )]))
        .is_err());
    }

    #[test]
    fn foreign_domains_are_ignored() {
        let mut map = BTreeMap::new();
        map.insert("other.io/memory-type".to_string(), "bogus".to_string());
        let parsed = PlacementAnnotations::from_annotations(&map).unwrap();
        assert!(parsed.memory_type.is_none());
    }
}
