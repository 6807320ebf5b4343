//! Hydro kubehub: the resource store contract and its kube-rs backed
//! implementation over `DynamicObject`.

#![forbid(unsafe_code)]

use anyhow::anyhow;
use hydro_core::{is_dry_run, Error, LabelSelector, Outcome, Propagation, Resource, ResourceKind, Result};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PropagationPolicy},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use serde_json::Value as Json;
use tracing::debug;

pub mod memory;

pub use memory::MemoryClient;

/// Representation returned by the store after a create-or-update.
#[derive(Debug, Clone, PartialEq)]
pub struct Upserted {
    pub object: Resource,
    /// `Created` or `Updated`.
    pub outcome: Outcome,
}

/// Options for a store delete call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteRequest {
    pub dry_run: Vec<String>,
    pub propagation: Propagation,
}

/// CRUD contract against one resource kind in one namespace.
///
/// Calls are idempotent by name: `create_or_update` creates the object when
/// absent and otherwise updates it, leaving store-managed fields intact.
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    async fn list(&self, selector: &LabelSelector) -> Result<Vec<Resource>>;
    async fn create_or_update(&self, obj: &Resource, dry_run: &[String]) -> Result<Upserted>;
    async fn delete(&self, name: &str, req: &DeleteRequest) -> Result<()>;
}

fn field_manager() -> String {
    std::env::var("HYDRO_FIELD_MANAGER").unwrap_or_else(|_| "hydro".to_string())
}

/// Store client talking to a Kubernetes API server.
pub struct KubeResourceClient {
    api: Api<DynamicObject>,
    kind: String,
    field_manager: String,
}

impl KubeResourceClient {
    pub fn new(client: Client, ar: &ApiResource, namespace: Option<&str>) -> Self {
        let api = match namespace {
            Some(ns) => Api::namespaced_with(client, ns, ar),
            None => Api::all_with(client, ar),
        };
        Self { api, kind: ar.kind.clone(), field_manager: field_manager() }
    }

    /// Resolve the kind through API discovery; fails when it is not served.
    pub async fn discover(client: Client, kind: &ResourceKind, namespace: Option<&str>) -> anyhow::Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == kind.group && ar.version == kind.version && ar.kind == kind.kind {
                    let ns = if matches!(caps.scope, Scope::Namespaced) { namespace } else { None };
                    return Ok(Self::new(client, &ar, ns));
                }
            }
        }
        Err(anyhow!("kind not served: {}/{}", kind.api_version(), kind.kind))
    }

    fn map_err(&self, name: &str, e: kube::Error) -> Error {
        map_kube_err(&self.kind, name, e)
    }
}

/// Classify a kube error. 404 is NotFound so rollback can ignore it.
fn map_kube_err(kind: &str, name: &str, e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(kind, name),
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict(ae.message),
        kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => Error::Invalid(ae.message),
        other => Error::Transport(other.to_string()),
    }
}

/// Drop server-populated metadata that must not travel in an apply patch.
fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
    }
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

fn to_resource(obj: &DynamicObject) -> Result<Resource> {
    let v = serde_json::to_value(obj).map_err(|e| Error::Invalid(format!("serializing DynamicObject: {e}")))?;
    serde_json::from_value(v).map_err(|e| Error::Invalid(format!("decoding store object: {e}")))
}

fn propagation_policy(p: Propagation) -> PropagationPolicy {
    match p {
        Propagation::Foreground => PropagationPolicy::Foreground,
        Propagation::Background => PropagationPolicy::Background,
        Propagation::Orphan => PropagationPolicy::Orphan,
    }
}

#[async_trait::async_trait]
impl ResourceClient for KubeResourceClient {
    async fn list(&self, selector: &LabelSelector) -> Result<Vec<Resource>> {
        let lp = ListParams::default().labels(&selector.to_string());
        let list = self.api.list(&lp).await.map_err(|e| self.map_err("", e))?;
        list.items.iter().map(to_resource).collect()
    }

    async fn create_or_update(&self, obj: &Resource, dry_run: &[String]) -> Result<Upserted> {
        let name = obj.name();
        let existing = self.api.get_opt(name).await.map_err(|e| self.map_err(name, e))?;
        let outcome = if existing.is_some() { Outcome::Updated } else { Outcome::Created };

        let body = serde_json::to_value(obj).map_err(|e| Error::Invalid(format!("serializing {name}: {e}")))?;
        let mut pp = PatchParams::apply(&self.field_manager).force();
        if is_dry_run(dry_run) {
            pp = pp.dry_run();
        }
        let applied = self
            .api
            .patch(name, &pp, &Patch::Apply(&strip_noisy(body)))
            .await
            .map_err(|e| self.map_err(name, e))?;
        debug!(kind = %self.kind, name = %name, outcome = %outcome, "server-side apply done");
        Ok(Upserted { object: to_resource(&applied)?, outcome })
    }

    async fn delete(&self, name: &str, req: &DeleteRequest) -> Result<()> {
        let dp = DeleteParams {
            dry_run: is_dry_run(&req.dry_run),
            propagation_policy: Some(propagation_policy(req.propagation)),
            ..Default::default()
        };
        self.api.delete(name, &dp).await.map_err(|e| self.map_err(name, e))?;
        debug!(kind = %self.kind, name = %name, propagation = ?req.propagation, "delete issued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_noisy_prunes_server_fields() {
        let v = serde_json::json!({
            "apiVersion": "eventing.knative.dev/v1alpha1",
            "kind": "Trigger",
            "metadata": {
                "name": "t1",
                "uid": "u1",
                "managedFields": [ {"manager": "x"} ],
                "resourceVersion": "12",
                "generation": 3,
                "creationTimestamp": "2020-01-01T00:00:00Z"
            },
            "status": { "ready": true },
            "spec": { "broker": "default" }
        });
        let pruned = strip_noisy(v);
        let meta = pruned["metadata"].as_object().unwrap();
        assert!(!meta.contains_key("managedFields"));
        assert!(!meta.contains_key("resourceVersion"));
        assert!(!meta.contains_key("generation"));
        assert!(!meta.contains_key("creationTimestamp"));
        assert_eq!(meta["uid"], "u1");
        assert!(pruned.get("status").is_none());
        assert_eq!(pruned["spec"]["broker"], "default");
    }

    #[test]
    fn dynamic_object_converts_to_resource() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "eventing.knative.dev/v1alpha1",
            "kind": "Trigger",
            "metadata": {
                "name": "t1",
                "namespace": "default",
                "uid": "u1",
                "labels": { "functionUID": "abc" },
                "ownerReferences": [{
                    "apiVersion": "serverless.kyma-project.io/v1alpha1",
                    "kind": "Function", "name": "fn", "uid": "abc", "controller": true
                }]
            },
            "spec": { "broker": "default" }
        }))
        .unwrap();
        let r = to_resource(&obj).unwrap();
        assert_eq!(r.kind, "Trigger");
        assert_eq!(r.uid(), Some("u1"));
        assert_eq!(r.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(r.metadata.labels["functionUID"], "abc");
        assert_eq!(r.metadata.owner_references[0].kind, "Function");
        assert_eq!(r.spec["broker"], "default");
    }

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: format!("{reason} from api server"),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn api_404_is_not_found_so_rollback_can_ignore_it() {
        let err = map_kube_err("Function", "hello", api_error(404, "NotFound"));
        assert_eq!(err, Error::not_found("Function", "hello"));
        assert!(err.is_not_found());
    }

    #[test]
    fn api_conflict_and_validation_codes_are_classified() {
        assert_eq!(map_kube_err("Trigger", "t1", api_error(409, "Conflict")), Error::Conflict("Conflict from api server".into()));
        assert_eq!(map_kube_err("Trigger", "t1", api_error(422, "Invalid")), Error::Invalid("Invalid from api server".into()));
        assert_eq!(map_kube_err("Trigger", "t1", api_error(400, "BadRequest")), Error::Invalid("BadRequest from api server".into()));
        let other = map_kube_err("Trigger", "t1", api_error(500, "InternalError"));
        assert!(matches!(other, Error::Transport(_)));
        assert!(!other.is_not_found());
    }

    #[test]
    fn propagation_maps_to_kube_policy() {
        assert!(matches!(propagation_policy(Propagation::Foreground), PropagationPolicy::Foreground));
        assert!(matches!(propagation_policy(Propagation::Background), PropagationPolicy::Background));
        assert!(matches!(propagation_policy(Propagation::Orphan), PropagationPolicy::Orphan));
    }
}
