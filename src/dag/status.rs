//! Per-object build outcomes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::resources::ObjectKey;

/// Reasons attached to outcomes.
pub mod reason {
    pub const VALID: &str = "Valid";
    pub const ORPHANED: &str = "Orphaned";
    pub const ROUTE_CONFLICT: &str = "RouteConflict";
    pub const DUPLICATE_MATCH_CONDITIONS: &str = "DuplicateMatchConditions";
    pub const DUPLICATE_VHOST: &str = "DuplicateVhost";
    pub const INCLUDE_CYCLE: &str = "IncludeCycle";
    pub const INCLUDE_ERROR: &str = "IncludeError";
    pub const ROOT_NAMESPACE: &str = "RootNamespaceError";
    pub const INVALID_MATCH: &str = "InvalidMatchCondition";
    pub const INVALID_HOSTNAME: &str = "InvalidHostname";
    pub const INVALID_POLICY: &str = "InvalidPolicy";
    pub const TLS_ERROR: &str = "TLSError";
    pub const SECRET_NOT_VALID: &str = "SecretNotValid";
    pub const DELEGATION_NOT_PERMITTED: &str = "DelegationNotPermitted";
    pub const SERVICE_UNRESOLVED: &str = "ServiceUnresolvedReference";
    pub const REF_NOT_PERMITTED: &str = "RefNotPermitted";
    pub const NO_BACKENDS: &str = "NoBackends";
    pub const LISTENER_INVALID: &str = "ListenerInvalid";
    pub const NOT_ALLOWED_BY_LISTENERS: &str = "NotAllowedByListeners";
    pub const UNSUPPORTED: &str = "NotImplemented";
}

/// Validity of a source object after a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Validity {
    Valid,
    Invalid,
    /// Not reachable from any root object.
    Orphaned,
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validity::Valid => f.write_str("valid"),
            Validity::Invalid => f.write_str("invalid"),
            Validity::Orphaned => f.write_str("orphaned"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusOutcome {
    pub validity: Validity,
    pub reason: String,
    pub description: String,
    /// Generation of the object the outcome was computed for.
    pub observed_generation: i64,
}

impl StatusOutcome {
    pub fn valid(generation: i64, description: impl Into<String>) -> Self {
        Self {
            validity: Validity::Valid,
            reason: reason::VALID.to_string(),
            description: description.into(),
            observed_generation: generation,
        }
    }

    pub fn invalid(generation: i64, error: ValidationError) -> Self {
        Self {
            validity: Validity::Invalid,
            reason: error.reason.to_string(),
            description: error.description,
            observed_generation: generation,
        }
    }

    pub fn orphaned(generation: i64, description: impl Into<String>) -> Self {
        Self {
            validity: Validity::Orphaned,
            reason: reason::ORPHANED.to_string(),
            description: description.into(),
            observed_generation: generation,
        }
    }
}

/// A local validation failure: excludes the object, never fails the build.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}: {description}")]
pub struct ValidationError {
    pub reason: &'static str,
    pub description: String,
}

impl ValidationError {
    pub fn new(reason: &'static str, description: impl Into<String>) -> Self {
        Self { reason, description: description.into() }
    }
}

/// One object's outcome, as handed to the status sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub key: ObjectKey,
    pub outcome: StatusOutcome,
}

/// Accumulates outcomes during a build.
///
/// An `Invalid` outcome is sticky: later `Valid` or `Orphaned` outcomes for
/// the same object are ignored, and the first invalid reason is kept.
#[derive(Debug, Default)]
pub struct StatusCollector {
    outcomes: BTreeMap<ObjectKey, StatusOutcome>,
}

impl StatusCollector {
    pub fn record(&mut self, key: ObjectKey, outcome: StatusOutcome) {
        match self.outcomes.get(&key) {
            Some(existing) if existing.validity == Validity::Invalid => {}
            _ => {
                self.outcomes.insert(key, outcome);
            }
        }
    }

    pub fn valid(&mut self, key: &ObjectKey, generation: i64, description: impl Into<String>) {
        self.record(key.clone(), StatusOutcome::valid(generation, description));
    }

    pub fn invalid(&mut self, key: &ObjectKey, generation: i64, error: ValidationError) {
        self.record(key.clone(), StatusOutcome::invalid(generation, error));
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&StatusOutcome> {
        self.outcomes.get(key)
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.outcomes.contains_key(key)
    }

    pub fn into_updates(self) -> Vec<StatusUpdate> {
        self.outcomes.into_iter().map(|(key, outcome)| StatusUpdate { key, outcome }).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Kind;

    #[test]
    fn test_invalid_is_sticky() {
        let key = ObjectKey::new(Kind::HttpProxy, "default", "a");
        let mut collector = StatusCollector::default();
        collector.valid(&key, 1, "ok");
        collector.invalid(&key, 1, ValidationError::new(reason::ROUTE_CONFLICT, "first"));
        collector.invalid(&key, 1, ValidationError::new(reason::INVALID_MATCH, "second"));
        collector.valid(&key, 1, "ok again");

        let outcome = collector.get(&key).unwrap();
        assert_eq!(outcome.validity, Validity::Invalid);
        assert_eq!(outcome.reason, "RouteConflict");
        assert_eq!(outcome.description, "first");
    }

    #[test]
    fn test_updates_are_ordered_by_key() {
        let mut collector = StatusCollector::default();
        collector.valid(&ObjectKey::new(Kind::Ingress, "b", "x"), 1, "");
        collector.valid(&ObjectKey::new(Kind::HttpProxy, "a", "x"), 1, "");
        let keys: Vec<_> = collector.into_updates().into_iter().map(|u| u.key.kind).collect();
        assert_eq!(keys, vec![Kind::HttpProxy, Kind::Ingress]);
    }
}
