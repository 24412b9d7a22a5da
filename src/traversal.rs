use std::collections::{BTreeMap, BTreeSet};

use crate::models::normalize_id;

/// Upper bound on authorization walk depth. Simple-path semantics already
/// guarantee termination; the bound caps pathological hierarchies.
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Typed description of the authorization walk: start at the target vertices,
/// follow only auth-checked edges outward, stop each branch on arrival at one
/// of the caller's claimed paths. Backends translate this into their own
/// traversal vocabulary; none of it leaks into the authorization service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalSpec {
    start_ids: Vec<String>,
    claimed_paths: BTreeSet<String>,
    max_depth: usize,
}

impl TraversalSpec {
    pub fn authorization<S: AsRef<str>>(start_ids: &[S]) -> Self {
        let mut ids: Vec<String> = start_ids
            .iter()
            .map(|id| normalize_id(id.as_ref()))
            .collect();
        ids.sort();
        ids.dedup();
        Self {
            start_ids: ids,
            claimed_paths: BTreeSet::new(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_claimed_paths<S: AsRef<str>>(mut self, paths: &[S]) -> Self {
        self.claimed_paths = paths
            .iter()
            .map(|p| normalize_id(p.as_ref()))
            .collect();
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn start_ids(&self) -> &[String] {
        &self.start_ids
    }

    pub fn claimed_paths(&self) -> &BTreeSet<String> {
        &self.claimed_paths
    }

    pub fn is_claimed(&self, path: &str) -> bool {
        self.claimed_paths.contains(path)
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }
}

/// Result of one atomic authorization traversal: which requested vertices
/// exist, and for each, the claimed paths reachable over auth-checked edges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthTraversalOutcome {
    pub exists: BTreeSet<String>,
    pub authorized_paths: BTreeMap<String, Vec<String>>,
}

impl AuthTraversalOutcome {
    pub fn record_exists(&mut self, id: &str) {
        self.exists.insert(id.to_string());
    }

    pub fn record_authorized_path(&mut self, id: &str, claimed_path: &str) {
        let paths = self.authorized_paths.entry(id.to_string()).or_default();
        if !paths.iter().any(|p| p == claimed_path) {
            paths.push(claimed_path.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_normalizes_and_dedupes_start_ids() {
        let spec = TraversalSpec::authorization(&["Device-B", "device-a", "DEVICE-B"]);
        assert_eq!(spec.start_ids(), ["device-a", "device-b"]);
    }

    #[test]
    fn claimed_path_membership_is_normalized() {
        let spec =
            TraversalSpec::authorization(&["d1"]).with_claimed_paths(&["/Region/Site-A"]);
        assert!(spec.is_claimed("/region/site-a"));
        assert!(!spec.is_claimed("/region/site-b"));
    }

    #[test]
    fn outcome_dedupes_repeated_paths_per_target() {
        let mut outcome = AuthTraversalOutcome::default();
        outcome.record_authorized_path("d1", "/a");
        outcome.record_authorized_path("d1", "/a");
        outcome.record_authorized_path("d1", "/b");
        assert_eq!(outcome.authorized_paths["d1"], ["/a", "/b"]);
    }
}
