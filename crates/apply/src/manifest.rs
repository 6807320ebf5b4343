//! YAML manifests → desired resources.

use anyhow::{anyhow, Context, Result};
use hydro_core::Resource;
use serde::Deserialize;
use serde_json::Value as Json;

/// Size guards applied to every manifest before it becomes a `Resource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestLimits {
    /// Whole payload, all documents together.
    pub max_bytes: usize,
    /// JSON nodes per document.
    pub max_nodes: usize,
}

impl Default for ManifestLimits {
    fn default() -> Self {
        Self { max_bytes: 1 << 20, max_nodes: 100_000 }
    }
}

impl ManifestLimits {
    /// Defaults overridden by `HYDRO_MAX_YAML_BYTES` and `HYDRO_MAX_YAML_NODES`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let read = |key: &str, default: usize| std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default);
        Self { max_bytes: read("HYDRO_MAX_YAML_BYTES", d.max_bytes), max_nodes: read("HYDRO_MAX_YAML_NODES", d.max_nodes) }
    }

    /// Walk the document, stopping as soon as the node budget is spent.
    fn within_node_budget(&self, root: &Json) -> bool {
        let mut pending = vec![root];
        let mut seen = 0usize;
        while let Some(v) = pending.pop() {
            seen += 1;
            if seen > self.max_nodes {
                return false;
            }
            match v {
                Json::Object(map) => pending.extend(map.values()),
                Json::Array(items) => pending.extend(items.iter()),
                _ => {}
            }
        }
        true
    }
}

/// Parse every document of a (multi-document) YAML string. Empty documents
/// are skipped; `ns_override` replaces `metadata.namespace` when given.
pub fn parse_manifests(yaml: &str, ns_override: Option<&str>) -> Result<Vec<Resource>> {
    parse_manifests_with(yaml, ns_override, &ManifestLimits::from_env())
}

pub fn parse_manifests_with(yaml: &str, ns_override: Option<&str>, limits: &ManifestLimits) -> Result<Vec<Resource>> {
    if yaml.len() > limits.max_bytes {
        return Err(anyhow!("YAML payload too large (>{} bytes)", limits.max_bytes));
    }
    let mut out = Vec::new();
    for (idx, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing YAML document {idx}"))?;
        if val.is_null() { continue; }
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        out.push(resource_from_json(json, ns_override, limits).with_context(|| format!("document {idx}"))?);
    }
    Ok(out)
}

fn resource_from_json(json: Json, ns_override: Option<&str>, limits: &ManifestLimits) -> Result<Resource> {
    if !limits.within_node_budget(&json) {
        return Err(anyhow!("YAML document too complex (>{} nodes)", limits.max_nodes));
    }
    json.get("apiVersion").and_then(Json::as_str).ok_or_else(|| anyhow!("YAML missing apiVersion"))?;
    json.get("kind").and_then(Json::as_str).ok_or_else(|| anyhow!("YAML missing kind"))?;
    json.get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Json::as_str)
        .ok_or_else(|| anyhow!("YAML missing metadata.name"))?;
    let mut res: Resource = serde_json::from_value(json).context("decoding resource")?;
    if let Some(ns) = ns_override {
        res.metadata.namespace = Some(ns.to_string());
    }
    // Store-managed identity never comes from a manifest.
    res.metadata.uid = None;
    res.metadata.resource_version = None;
    Ok(res)
}

pub fn load_manifests(path: &std::path::Path, ns_override: Option<&str>) -> Result<Vec<Resource>> {
    let yaml = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_manifests(&yaml, ns_override).with_context(|| format!("loading {}", path.display()))
}
