//! Partition resolution: requirement strings -> cluster partition expression.

use std::collections::BTreeMap;

/// Maps a requirement string (e.g. `"architecture is x86_64"`) to the
/// partitions that satisfy it. An empty list means "no partition constraint".
pub type PartitionMap = BTreeMap<String, Vec<String>>;

/// Resolve the partition for a task's requirements.
///
/// Starts from `default` and walks `requires` in order; every requirement
/// found in `partition_map` replaces the current selection with its
/// comma-joined partitions (or `None` for an empty list). The last matching
/// requirement wins.
///
/// NOTE: the override chain does not intersect constraints, so
/// `["architecture is x86_64", "cpu_count is 2"]` ends up on whatever
/// `"cpu_count is 2"` maps to. Existing partition maps rely on this; treat a
/// change to intersection semantics as a breaking change.
pub fn resolve(
    requires: &[String],
    partition_map: &PartitionMap,
    default: Option<&str>,
) -> Option<String> {
    let mut partition = default.map(str::to_string);
    for requirement in requires {
        if let Some(partitions) = partition_map.get(requirement) {
            partition = if partitions.is_empty() {
                None
            } else {
                Some(partitions.join(","))
            };
        }
    }
    partition
}
