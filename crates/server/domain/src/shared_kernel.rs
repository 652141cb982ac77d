use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of one saga instance (the engine's workflow id).
///
/// Opaque to the saga; the intake generates `kubevirt-<uuid>` ids but any
/// string handed over by an engine is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SagaId(pub String);

impl SagaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh id for a provider-scoped workflow, e.g. `kubevirt-<uuid>`.
    pub fn generate(provider: &str) -> Self {
        Self(format!("{}-{}", provider, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SagaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SagaId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SagaId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_provider_prefixed_and_unique() {
        let a = SagaId::generate("kubevirt");
        let b = SagaId::generate("kubevirt");

        assert!(a.as_str().starts_with("kubevirt-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = SagaId::new("kubevirt-42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"kubevirt-42\"");
    }
}
