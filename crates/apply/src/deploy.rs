//! Function + triggers deployment with manual rollback.

use std::sync::Arc;

use hydro_core::{Error, Propagation, Resource, Result, StatusEntry};
use hydro_kubehub::ResourceClient;
use tracing::{error, info};

use crate::callbacks::{Chain, Interceptor, IgnoreNotFound, LogStatus, StatusSlot};
use crate::operator::{ApplyOptions, DeleteOptions, Operator};

/// Roll back by deleting the operator's objects with foreground propagation.
/// NotFound is treated as success; any other error is logged, not returned.
pub async fn safe_delete(op: &Operator, dry_run: &[String]) {
    let opts = DeleteOptions {
        dry_run: dry_run.to_vec(),
        propagation: Propagation::Foreground,
        pre: Vec::new(),
        post: vec![Arc::new(IgnoreNotFound)],
    };
    if let Err(e) = op.delete(&opts).await {
        error!(kind = %op.kind().kind, error = %e, "rollback failed");
    }
}

/// Apply one function and its triggers.
///
/// The function's status is captured and its identity becomes the owner
/// reference of every trigger. If either step fails the function is rolled
/// back; triggers then go away through cascading deletion.
pub async fn deploy(
    functions: Arc<dyn ResourceClient>,
    triggers: Arc<dyn ResourceClient>,
    function: Resource,
    trigger_items: Vec<Resource>,
    dry_run: Vec<String>,
) -> Result<StatusEntry> {
    let log: Arc<dyn Interceptor> = Arc::new(LogStatus::scoped("deploy"));
    let slot = StatusSlot::new();

    let mut fn_op = Operator::functions(functions, vec![function]);
    let fn_opts = ApplyOptions {
        dry_run: dry_run.clone(),
        post: vec![log.clone(), Arc::new(slot.interceptor())],
        ..Default::default()
    };
    if let Err(e) = fn_op.apply(&fn_opts).await {
        safe_delete(&fn_op, &dry_run).await;
        return Err(e);
    }

    let status = slot.get().ok_or_else(|| Error::MissingOwner { kind: fn_op.kind().kind.clone() })?;
    let owner = match status.owner_reference() {
        Some(o) => o,
        None => {
            safe_delete(&fn_op, &dry_run).await;
            return Err(Error::MissingOwner { kind: status.kind.clone() });
        }
    };
    info!(function = %status.name, uid = %owner.uid, outcome = %status.outcome, "function applied");

    let pre: Chain = vec![log.clone()];
    let mut tr_op = Operator::triggers(triggers, trigger_items);
    let tr_opts = ApplyOptions { dry_run: dry_run.clone(), owner_references: vec![owner], pre, post: vec![log] };
    if let Err(e) = tr_op.apply(&tr_opts).await {
        safe_delete(&fn_op, &dry_run).await;
        return Err(e);
    }
    Ok(status)
}
