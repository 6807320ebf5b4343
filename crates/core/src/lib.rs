//! Hydro core types: resources, status entries and the error taxonomy shared
//! by the store clients and the reconciliation operator.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Dry-run stage that makes the store validate a call without persisting it.
pub const DRY_RUN_ALL: &str = "All";

/// Returns true when the stage list asks the store to simulate the call.
pub fn is_dry_run(stages: &[String]) -> bool {
    stages.iter().any(|s| s == DRY_RUN_ALL)
}

/// Parent identity pointer. Used for cascading deletion by the store and for
/// orphan discovery through the dependent label.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    /// Assigned by the store; never set by callers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// Generic addressable object tracked by the store.
///
/// Identity is `(kind, namespace, name)`. The payload under `spec` is opaque
/// to everything in this workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Json::is_null")]
    pub spec: Json,
}

impl Resource {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            metadata: Metadata { name: name.into(), ..Default::default() },
            spec: Json::Null,
        }
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.metadata.namespace = Some(ns.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_spec(mut self, spec: Json) -> Self {
        self.spec = spec;
        self
    }

    pub fn name(&self) -> &str { &self.metadata.name }
    pub fn uid(&self) -> Option<&str> { self.metadata.uid.as_deref() }

    /// Merge `extra` into the labels; keys in `extra` win.
    pub fn merge_labels(&mut self, extra: &BTreeMap<String, String>) {
        for (k, v) in extra {
            self.metadata.labels.insert(k.clone(), v.clone());
        }
    }

    /// True when every `key=value` pair of the selector matches the labels.
    pub fn matches(&self, selector: &LabelSelector) -> bool {
        selector.0.iter().all(|(k, v)| self.metadata.labels.get(k) == Some(v))
    }
}

/// Equality-based label selector (`k1=v1,k2=v2`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(pub BTreeMap<String, String>);

impl LabelSelector {
    pub fn single(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut m = BTreeMap::new();
        m.insert(key.into(), value.into());
        Self(m)
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        f.write_str(&parts.join(","))
    }
}

/// Result of one store call, as seen by interceptors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Outcome {
    /// Reported to pre-callbacks; the store has not been called yet.
    Pending,
    Created,
    Updated,
    Deleted,
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Pending => "pending",
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Deleted => "deleted",
            Outcome::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Immutable snapshot of an object's identity and the outcome of a store call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusEntry {
    pub name: String,
    pub uid: Option<String>,
    pub api_version: String,
    pub kind: String,
    pub outcome: Outcome,
}

impl StatusEntry {
    pub fn new(obj: &Resource, outcome: Outcome) -> Self {
        Self {
            name: obj.metadata.name.clone(),
            uid: obj.metadata.uid.clone(),
            api_version: obj.api_version.clone(),
            kind: obj.kind.clone(),
            outcome,
        }
    }

    pub fn pending(obj: &Resource) -> Self { Self::new(obj, Outcome::Pending) }
    pub fn failed(obj: &Resource) -> Self { Self::new(obj, Outcome::Failed) }
    pub fn deleted(obj: &Resource) -> Self { Self::new(obj, Outcome::Deleted) }

    /// Owner reference pointing at the object this entry describes.
    /// `None` until the store has assigned a UID.
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        self.uid.as_ref().map(|uid| OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: uid.clone(),
        })
    }
}

/// How the store treats dependents of a deleted object.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Propagation {
    Foreground,
    #[default]
    Background,
    Orphan,
}

/// Kind metadata an operator is parameterised with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub plural: String,
    pub kind: String,
    /// Label carrying the owner UID on children; enables orphan pruning.
    pub dependent_label: Option<String>,
    /// Kind of the owner whose UID feeds `dependent_label`.
    pub parent_kind: Option<String>,
}

impl ResourceKind {
    pub fn functions() -> Self {
        Self {
            group: "serverless.kyma-project.io".into(),
            version: "v1alpha1".into(),
            plural: "functions".into(),
            kind: "Function".into(),
            dependent_label: None,
            parent_kind: None,
        }
    }

    pub fn triggers() -> Self {
        Self {
            group: "eventing.knative.dev".into(),
            version: "v1alpha1".into(),
            plural: "triggers".into(),
            kind: "Trigger".into(),
            dependent_label: Some("functionUID".into()),
            parent_kind: Some("Function".into()),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn prunes(&self) -> bool { self.dependent_label.is_some() }
}

/// Errors shared by store clients, interceptors and operators.
///
/// Variants carry rendered strings so errors can be cloned, compared and
/// handed to every interceptor of a chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("not found: {kind} {name}")]
    NotFound { kind: String, name: String },
    #[error("not found: owner reference of kind {kind}")]
    MissingOwner { kind: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("aborted: {0}")]
    Aborted(String),
}

impl Error {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound { kind: kind.into(), name: name.into() }
    }

    /// NotFound-class test. A missing owner reference counts as NotFound.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. } | Error::MissingOwner { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_serializes_in_kube_shape() {
        let r = Resource::new("v1", "ConfigMap", "x").with_namespace("ns").with_label("a", "b");
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["apiVersion"], "v1");
        assert_eq!(v["metadata"]["name"], "x");
        assert_eq!(v["metadata"]["labels"]["a"], "b");
        assert!(v["metadata"].get("uid").is_none());
        assert!(v.get("spec").is_none());

        let back: Resource = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": "x", "uid": "u1", "ownerReferences": [
                { "apiVersion": "v1", "kind": "Function", "name": "f", "uid": "abc" }
            ]},
            "spec": { "k": 1 }
        })).unwrap();
        assert_eq!(back.uid(), Some("u1"));
        assert_eq!(back.metadata.owner_references[0].uid, "abc");
        assert_eq!(back.spec["k"], 1);
    }

    #[test]
    fn label_selector_renders_and_matches() {
        let mut sel = LabelSelector::single("functionUID", "abc");
        sel.0.insert("app".into(), "x".into());
        assert_eq!(sel.to_string(), "app=x,functionUID=abc");
        let r = Resource::new("v1", "T", "t").with_label("functionUID", "abc").with_label("app", "x");
        assert!(r.matches(&sel));
        assert!(!r.matches(&LabelSelector::single("functionUID", "other")));
        assert_eq!(LabelSelector::default().to_string(), "");
    }

    #[test]
    fn merge_labels_overrides_existing_keys() {
        let mut r = Resource::new("v1", "T", "t").with_label("functionUID", "old").with_label("keep", "1");
        let mut extra = BTreeMap::new();
        extra.insert("functionUID".to_string(), "new".to_string());
        r.merge_labels(&extra);
        assert_eq!(r.metadata.labels.get("functionUID").map(String::as_str), Some("new"));
        assert_eq!(r.metadata.labels.get("keep").map(String::as_str), Some("1"));
    }

    #[test]
    fn status_entry_owner_reference_requires_uid() {
        let mut r = Resource::new("serverless.kyma-project.io/v1alpha1", "Function", "fn");
        assert!(StatusEntry::new(&r, Outcome::Created).owner_reference().is_none());
        r.metadata.uid = Some("abc".into());
        let oref = StatusEntry::new(&r, Outcome::Created).owner_reference().unwrap();
        assert_eq!(oref.kind, "Function");
        assert_eq!(oref.uid, "abc");
    }

    #[test]
    fn missing_owner_is_not_found_class() {
        assert!(Error::MissingOwner { kind: "Function".into() }.is_not_found());
        assert!(Error::not_found("Trigger", "t1").is_not_found());
        assert!(!Error::Conflict("x".into()).is_not_found());
        assert!(is_dry_run(&[DRY_RUN_ALL.to_string()]));
        assert!(!is_dry_run(&[]));
    }

    #[test]
    fn kinds_render_api_version() {
        assert_eq!(ResourceKind::functions().api_version(), "serverless.kyma-project.io/v1alpha1");
        assert!(ResourceKind::triggers().prunes());
        assert!(!ResourceKind::functions().prunes());
    }
}
