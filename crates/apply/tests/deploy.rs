#![forbid(unsafe_code)]

use std::sync::Arc;

use hydro_apply::{deploy, safe_delete, Operator};
use hydro_core::{Error, Outcome, Resource};
use hydro_kubehub::{memory::Call, MemoryClient, ResourceClient};

fn function() -> Resource {
    Resource::new("serverless.kyma-project.io/v1alpha1", "Function", "hello")
        .with_namespace("default")
        .with_spec(serde_json::json!({ "runtime": "nodejs12", "source": "module.exports = {}" }))
}

fn trigger(name: &str) -> Resource {
    Resource::new("eventing.knative.dev/v1alpha1", "Trigger", name).with_namespace("default")
}

#[tokio::test]
async fn triggers_inherit_the_function_identity() {
    let fns = Arc::new(MemoryClient::new());
    let trs = Arc::new(MemoryClient::new());
    let status = deploy(fns.clone(), trs.clone(), function(), vec![trigger("t1"), trigger("t2")], vec![])
        .await
        .unwrap();

    assert_eq!(status.outcome, Outcome::Created);
    let fn_uid = fns.get("hello").unwrap().metadata.uid.unwrap();
    assert_eq!(status.uid.as_deref(), Some(fn_uid.as_str()));
    for name in ["t1", "t2"] {
        let t = trs.get(name).unwrap();
        assert_eq!(t.metadata.labels["functionUID"], fn_uid);
        assert_eq!(t.metadata.owner_references.len(), 1);
        assert_eq!(t.metadata.owner_references[0].name, "hello");
        assert_eq!(t.metadata.owner_references[0].uid, fn_uid);
    }
}

#[tokio::test]
async fn trigger_failure_rolls_back_the_function() {
    let fns = Arc::new(MemoryClient::new());
    let trs = Arc::new(MemoryClient::new());
    trs.fail_on(Call::Upsert, "t2", Error::Invalid("bad broker".into()));

    let err = deploy(fns.clone(), trs.clone(), function(), vec![trigger("t1"), trigger("t2")], vec![])
        .await
        .unwrap_err();
    assert_eq!(err, Error::Invalid("bad broker".into()));
    assert!(fns.names().is_empty());
    assert!(fns.calls().iter().any(|(c, n)| *c == Call::Delete && n == "hello"));
}

#[tokio::test]
async fn function_failure_rolls_back_and_skips_triggers() {
    let fns = Arc::new(MemoryClient::new());
    let trs = Arc::new(MemoryClient::new());
    fns.fail_on(Call::Upsert, "hello", Error::Conflict("busy".into()));

    let err = deploy(fns.clone(), trs.clone(), function(), vec![trigger("t1")], vec![]).await.unwrap_err();
    assert_eq!(err, Error::Conflict("busy".into()));
    assert!(trs.calls().is_empty());
}

#[tokio::test]
async fn safe_delete_swallows_secondary_errors() {
    let mem = Arc::new(MemoryClient::new());
    mem.insert(function());
    mem.fail_on(Call::Delete, "hello", Error::Transport("timeout".into()));
    let client: Arc<dyn ResourceClient> = mem.clone();
    let op = Operator::functions(client, vec![function()]);
    safe_delete(&op, &[]).await;
    assert_eq!(mem.names(), vec!["hello"]);
}
