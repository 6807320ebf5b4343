//! In-memory resource store for one kind/namespace.
//!
//! Mirrors the store behaviour the operator relies on: name-keyed idempotent
//! upserts, store-assigned UIDs and resource versions, dry-run, and label
//! selection. Failures can be injected per name and per call type.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use hydro_core::{is_dry_run, Error, LabelSelector, Outcome, Resource, Result};
use uuid::Uuid;

use crate::{DeleteRequest, ResourceClient, Upserted};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    List,
    Upsert,
    Delete,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Resource>,
    failures: HashMap<(Call, String), Error>,
    list_failure: Option<Error>,
    calls: Vec<(Call, String)>,
    next_rv: u64,
}

#[derive(Default)]
pub struct MemoryClient {
    state: Mutex<State>,
}

impl MemoryClient {
    pub fn new() -> Self { Self::default() }

    /// Seed an object as if it already existed in the store. A UID is
    /// assigned when the object has none.
    pub fn insert(&self, mut obj: Resource) -> Resource {
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(Uuid::new_v4().to_string());
        }
        if let Ok(mut st) = self.state.lock() {
            st.objects.insert(obj.metadata.name.clone(), obj.clone());
        }
        obj
    }

    pub fn get(&self, name: &str) -> Option<Resource> {
        self.state.lock().ok().and_then(|st| st.objects.get(name).cloned())
    }

    /// Names of all stored objects, sorted.
    pub fn names(&self) -> Vec<String> {
        self.state.lock().map(|st| st.objects.keys().cloned().collect()).unwrap_or_default()
    }

    /// Fail the next and every later `call` on `name` with `err`.
    pub fn fail_on(&self, call: Call, name: &str, err: Error) {
        if let Ok(mut st) = self.state.lock() {
            st.failures.insert((call, name.to_string()), err);
        }
    }

    pub fn fail_list(&self, err: Error) {
        if let Ok(mut st) = self.state.lock() {
            st.list_failure = Some(err);
        }
    }

    /// Calls received so far, in order. List calls record the selector.
    pub fn calls(&self) -> Vec<(Call, String)> {
        self.state.lock().map(|st| st.calls.clone()).unwrap_or_default()
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| Error::Transport("memory store poisoned".into()))
    }
}

#[async_trait::async_trait]
impl ResourceClient for MemoryClient {
    async fn list(&self, selector: &LabelSelector) -> Result<Vec<Resource>> {
        let mut st = self.locked()?;
        st.calls.push((Call::List, selector.to_string()));
        if let Some(err) = st.list_failure.clone() {
            return Err(err);
        }
        Ok(st.objects.values().filter(|o| o.matches(selector)).cloned().collect())
    }

    async fn create_or_update(&self, obj: &Resource, dry_run: &[String]) -> Result<Upserted> {
        let mut st = self.locked()?;
        let name = obj.metadata.name.clone();
        st.calls.push((Call::Upsert, name.clone()));
        if let Some(err) = st.failures.get(&(Call::Upsert, name.clone())) {
            return Err(err.clone());
        }
        if name.is_empty() {
            return Err(Error::Invalid("metadata.name is required".into()));
        }

        let mut next = obj.clone();
        let outcome = match st.objects.get(&name) {
            Some(live) => {
                next.metadata.uid = live.metadata.uid.clone();
                Outcome::Updated
            }
            None => {
                next.metadata.uid = Some(Uuid::new_v4().to_string());
                Outcome::Created
            }
        };
        st.next_rv += 1;
        next.metadata.resource_version = Some(st.next_rv.to_string());
        if !is_dry_run(dry_run) {
            st.objects.insert(name, next.clone());
        }
        Ok(Upserted { object: next, outcome })
    }

    async fn delete(&self, name: &str, req: &DeleteRequest) -> Result<()> {
        let mut st = self.locked()?;
        st.calls.push((Call::Delete, name.to_string()));
        if let Some(err) = st.failures.get(&(Call::Delete, name.to_string())) {
            return Err(err.clone());
        }
        let kind = st.objects.get(name).map(|o| o.kind.clone());
        match kind {
            None => Err(Error::not_found("object", name)),
            Some(_) if is_dry_run(&req.dry_run) => Ok(()),
            Some(_) => {
                st.objects.remove(name);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydro_core::DRY_RUN_ALL;

    fn trigger(name: &str) -> Resource {
        Resource::new("eventing.knative.dev/v1alpha1", "Trigger", name)
    }

    #[tokio::test]
    async fn upsert_creates_then_updates_keeping_uid() {
        let c = MemoryClient::new();
        let first = c.create_or_update(&trigger("t1"), &[]).await.unwrap();
        assert_eq!(first.outcome, Outcome::Created);
        let uid = first.object.metadata.uid.clone();
        assert!(uid.is_some());

        let second = c.create_or_update(&trigger("t1").with_label("a", "b"), &[]).await.unwrap();
        assert_eq!(second.outcome, Outcome::Updated);
        assert_eq!(second.object.metadata.uid, uid);
        assert_ne!(second.object.metadata.resource_version, first.object.metadata.resource_version);
        assert_eq!(c.names(), vec!["t1"]);
        assert_eq!(c.get("t1").unwrap().metadata.labels["a"], "b");
    }

    #[tokio::test]
    async fn dry_run_does_not_persist() {
        let c = MemoryClient::new();
        let dry = vec![DRY_RUN_ALL.to_string()];
        let res = c.create_or_update(&trigger("t1"), &dry).await.unwrap();
        assert_eq!(res.outcome, Outcome::Created);
        assert!(c.names().is_empty());

        c.insert(trigger("t2"));
        c.delete("t2", &DeleteRequest { dry_run: dry, ..Default::default() }).await.unwrap();
        assert_eq!(c.names(), vec!["t2"]);
    }

    #[tokio::test]
    async fn list_filters_by_label_and_delete_reports_not_found() {
        let c = MemoryClient::new();
        c.insert(trigger("t1").with_label("functionUID", "abc"));
        c.insert(trigger("t2").with_label("functionUID", "other"));
        let got = c.list(&LabelSelector::single("functionUID", "abc")).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name(), "t1");

        let err = c.delete("missing", &DeleteRequest::default()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn injected_failures_surface() {
        let c = MemoryClient::new();
        c.fail_on(Call::Upsert, "t1", Error::Conflict("boom".into()));
        let err = c.create_or_update(&trigger("t1"), &[]).await.unwrap_err();
        assert_eq!(err, Error::Conflict("boom".into()));
        assert_eq!(c.calls(), vec![(Call::Upsert, "t1".to_string())]);
    }
}
