//! Reconciliation operator: sequential apply/delete over a desired set with
//! pre/post interceptor chains and orphan pruning for dependent kinds.
//!
//! The operator owns its working copies for the whole call and refreshes
//! each one with the store's representation after a successful upsert.
//! Nothing is retried and nothing is rolled back automatically.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use hydro_core::{Error, LabelSelector, OwnerReference, Propagation, Resource, ResourceKind, Result, StatusEntry};
use hydro_kubehub::{DeleteRequest, ResourceClient};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::callbacks::{fire, Chain};

#[derive(Clone, Default)]
pub struct ApplyOptions {
    pub dry_run: Vec<String>,
    pub owner_references: Vec<OwnerReference>,
    pub pre: Chain,
    pub post: Chain,
}

#[derive(Clone, Default)]
pub struct DeleteOptions {
    pub dry_run: Vec<String>,
    pub propagation: Propagation,
    pub pre: Chain,
    pub post: Chain,
}

pub struct Operator {
    kind: ResourceKind,
    client: Arc<dyn ResourceClient>,
    items: Vec<Resource>,
}

impl Operator {
    pub fn new(kind: ResourceKind, client: Arc<dyn ResourceClient>, items: Vec<Resource>) -> Self {
        Self { kind, client, items }
    }

    pub fn functions(client: Arc<dyn ResourceClient>, items: Vec<Resource>) -> Self {
        Self::new(ResourceKind::functions(), client, items)
    }

    pub fn triggers(client: Arc<dyn ResourceClient>, items: Vec<Resource>) -> Self {
        Self::new(ResourceKind::triggers(), client, items)
    }

    pub fn kind(&self) -> &ResourceKind { &self.kind }

    /// Working copies; after `apply` these reflect the store's answers.
    pub fn items(&self) -> &[Resource] { &self.items }

    /// UID of the first owner reference of the parent kind.
    fn owner_uid(&self, refs: &[OwnerReference]) -> Result<Option<String>> {
        let Some(parent) = self.kind.parent_kind.as_deref() else { return Ok(None) };
        refs.iter()
            .find(|r| r.kind == parent)
            .map(|r| Some(r.uid.clone()))
            .ok_or_else(|| Error::MissingOwner { kind: parent.to_string() })
    }

    pub async fn apply(&mut self, opts: &ApplyOptions) -> Result<()> {
        let t0 = Instant::now();
        let owner_uid = self.owner_uid(&opts.owner_references)?;
        let mut dependent_labels = BTreeMap::new();
        if let (true, Some(label), Some(uid)) = (self.kind.prunes(), &self.kind.dependent_label, &owner_uid) {
            self.prune(label, uid, opts).await?;
            dependent_labels.insert(label.clone(), uid.clone());
        }

        let client = Arc::clone(&self.client);
        for item in self.items.iter_mut() {
            let mut stamped = item.clone();
            if !opts.owner_references.is_empty() {
                stamped.metadata.owner_references = opts.owner_references.clone();
            }
            stamped.merge_labels(&dependent_labels);

            fire(&StatusEntry::pending(&stamped), Ok(()), &opts.pre)?;
            *item = stamped;

            let (status, prior, fresh) = match client.create_or_update(item, &opts.dry_run).await {
                Ok(up) => (StatusEntry::new(&up.object, up.outcome), Ok(()), Some(up.object)),
                Err(e) => {
                    warn!(kind = %self.kind.kind, name = %item.name(), error = %e, "create-or-update failed");
                    counter!("apply_err", 1u64);
                    (StatusEntry::failed(item), Err(e), None)
                }
            };
            fire(&status, prior, &opts.post)?;

            if let Some(obj) = fresh {
                debug!(kind = %self.kind.kind, name = %obj.name(), outcome = %status.outcome, "applied");
                counter!("apply_ok", 1u64);
                *item = obj;
            }
        }
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(kind = %self.kind.kind, count = self.items.len(), dry_run = ?opts.dry_run, "apply finished");
        Ok(())
    }

    /// Delete existing children labeled with the owner UID that are absent
    /// from the desired set. A failed delete is handed to the post chain;
    /// with no post interceptors it is only logged and pruning continues.
    async fn prune(&self, label: &str, owner_uid: &str, opts: &ApplyOptions) -> Result<()> {
        let existing = self.client.list(&LabelSelector::single(label, owner_uid)).await?;
        let desired: HashSet<&str> = self.items.iter().map(Resource::name).collect();
        let req = DeleteRequest { dry_run: opts.dry_run.clone(), propagation: Propagation::Background };

        for orphan in existing.iter().filter(|o| !desired.contains(o.name())) {
            fire(&StatusEntry::pending(orphan), Ok(()), &opts.pre)?;
            match self.client.delete(orphan.name(), &req).await {
                Ok(()) => {
                    counter!("prune_deleted", 1u64);
                    info!(kind = %self.kind.kind, name = %orphan.name(), owner = %owner_uid, "orphan deleted");
                    fire(&StatusEntry::deleted(orphan), Ok(()), &opts.post)?;
                }
                Err(e) => {
                    counter!("prune_failed", 1u64);
                    warn!(kind = %self.kind.kind, name = %orphan.name(), error = %e, "orphan delete failed");
                    if !opts.post.is_empty() {
                        fire(&StatusEntry::failed(orphan), Err(e), &opts.post)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn delete(&self, opts: &DeleteOptions) -> Result<()> {
        let req = DeleteRequest { dry_run: opts.dry_run.clone(), propagation: opts.propagation };
        for item in &self.items {
            fire(&StatusEntry::pending(item), Ok(()), &opts.pre)?;
            let (status, prior) = match self.client.delete(item.name(), &req).await {
                Ok(()) => {
                    counter!("delete_ok", 1u64);
                    (StatusEntry::deleted(item), Ok(()))
                }
                Err(e) => {
                    counter!("delete_err", 1u64);
                    (StatusEntry::failed(item), Err(e))
                }
            };
            fire(&status, prior, &opts.post)?;
        }
        info!(kind = %self.kind.kind, count = self.items.len(), propagation = ?opts.propagation, "delete finished");
        Ok(())
    }
}
