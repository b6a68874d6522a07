//! Resource request descriptors and pool lookup results

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{context::RunRef, Error, Result};

/// What one lock step asks the pool for.
///
/// Either an explicit resource name, or a label with a quantity. A quantity
/// of 0 means "every resource carrying the label".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceRequest {
    /// Explicit resource name
    pub resource: Option<String>,
    /// Label selecting a group of resources
    pub label: Option<String>,
    /// Number of labeled resources required (0 = all)
    pub quantity: u32,
}

impl ResourceRequest {
    /// Request a single resource by name
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            resource: Some(name.into()),
            label: None,
            quantity: 0,
        }
    }

    /// Request `quantity` resources carrying `label`
    #[must_use]
    pub fn labeled(label: impl Into<String>, quantity: u32) -> Self {
        Self {
            resource: None,
            label: Some(label.into()),
            quantity,
        }
    }

    /// The explicit resource name, ignoring blank values
    #[must_use]
    pub fn resource_name(&self) -> Option<&str> {
        non_blank(self.resource.as_deref())
    }

    /// The label, ignoring blank values
    #[must_use]
    pub fn label_name(&self) -> Option<&str> {
        non_blank(self.label.as_deref())
    }

    /// Check the descriptor names exactly one of resource or label.
    pub fn validate(&self) -> Result<()> {
        match (self.resource_name(), self.label_name()) {
            (None, None) => Err(Error::InvalidConfig(
                "Either a resource name or a label must be specified".into(),
            )),
            (Some(_), Some(_)) => Err(Error::InvalidConfig(
                "Label and resource name cannot be specified simultaneously".into(),
            )),
            (Some(name), None) if self.quantity > 0 => Err(Error::InvalidConfig(format!(
                "Quantity applies to labels only, not to resource '{name}'"
            ))),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ResourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.resource_name(), self.label_name()) {
            (Some(name), _) => write!(f, "{name}"),
            (None, Some(label)) if self.quantity > 0 => {
                write!(f, "Label: {label}, Quantity: {}", self.quantity)
            }
            (None, Some(label)) => write!(f, "Label: {label}"),
            (None, None) => write!(f, "<empty>"),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Concrete resource names the pool resolved a request list to.
///
/// Names are unique and keep the order of the requests that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResolvedSet(Vec<String>);

impl ResolvedSet {
    /// Create an empty set
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Add a name unless already present. Returns whether it was added.
    pub fn insert(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        if self.contains(&name) {
            return false;
        }
        self.0.push(name);
        true
    }

    /// Check whether a name is part of the set
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }

    /// Resolved names in request order
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.0
    }

    /// Consume the set, returning the names
    #[must_use]
    pub fn into_names(self) -> Vec<String> {
        self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<String> for ResolvedSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut set = Self::new();
        for name in iter {
            set.insert(name);
        }
        set
    }
}

/// What the pool knows about one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// Resource name
    pub name: String,
    /// Labels attached to the resource
    pub labels: Vec<String>,
    /// Run currently holding the resource
    pub holder_run: Option<RunRef>,
    /// Human-readable description of the current holder
    pub current_holder: Option<String>,
    /// Kept held when its holder run completes
    pub exempt: bool,
}

impl ResourceInfo {
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.holder_run.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_request_display() {
        assert_eq!(ResourceRequest::named("db1").to_string(), "db1");
    }

    #[test]
    fn test_labeled_request_display() {
        assert_eq!(
            ResourceRequest::labeled("rig", 2).to_string(),
            "Label: rig, Quantity: 2"
        );
        assert_eq!(ResourceRequest::labeled("rig", 0).to_string(), "Label: rig");
    }

    #[test]
    fn test_validate_requires_name_or_label() {
        assert!(ResourceRequest::default().validate().is_err());
        assert!(ResourceRequest::named("   ").validate().is_err());
        assert!(ResourceRequest::named("db1").validate().is_ok());
        assert!(ResourceRequest::labeled("rig", 0).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_name_and_label() {
        let request = ResourceRequest {
            resource: Some("db1".into()),
            label: Some("database".into()),
            quantity: 0,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_quantity_on_named() {
        let request = ResourceRequest {
            resource: Some("db1".into()),
            label: None,
            quantity: 2,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_resolved_set_deduplicates() {
        let set: ResolvedSet = ["a", "b", "a"].into_iter().map(String::from).collect();
        assert_eq!(set.names(), ["a".to_string(), "b".to_string()]);
        assert_eq!(set.len(), 2);
    }
}
