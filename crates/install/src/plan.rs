//! Install plan: serial prerequisites, a settle pause, then the pooled rest.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tracing::{info, warn};

use crate::{Catalog, Component, DispatchConfig, DispatchReport, Dispatcher, Installer, Release};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct InstallPlan {
    /// Installed one at a time, in order, before anything else.
    pub prerequisites: Vec<Component>,
    pub components: Vec<Component>,
    pub settle_secs: u64,
    pub overrides: Json,
}

fn comps(list: &[(&str, &str)]) -> Vec<Component> {
    list.iter().map(|(n, ns)| Component::new(*n, *ns)).collect()
}

impl Default for InstallPlan {
    fn default() -> Self {
        Self {
            prerequisites: comps(&[
                ("cluster-essentials", "kyma-system"),
                ("testing", "kyma-system"),
                ("istio", "istio-system"),
            ]),
            components: comps(&[
                ("istio-kyma-patch", "istio-system"),
                ("knative-serving", "knative-serving"),
                ("knative-eventing", "knative-eventing"),
                ("dex", "kyma-system"),
                ("ory", "kyma-system"),
                ("api-gateway", "kyma-system"),
                ("rafter", "kyma-system"),
                ("service-catalog", "kyma-system"),
                ("service-catalog-addons", "kyma-system"),
                ("nats-streaming", "natss"),
                ("core", "kyma-system"),
                ("cluster-users", "kyma-system"),
                ("permission-controller", "kyma-system"),
                ("apiserver-proxy", "kyma-system"),
                ("iam-kubeconfig-service", "kyma-system"),
                ("serverless", "kyma-system"),
                ("knative-provisioner-natss", "knative-eventing"),
                ("event-sources", "kyma-system"),
                ("application-connector", "kyma-integration"),
                ("console", "kyma-system"),
            ]),
            settle_secs: std::env::var("HYDRO_INSTALL_SETTLE_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(60),
            overrides: json!({
                "global": {
                    "isLocalEnv": true,
                    "domainName": "kyma.local",
                    "minikubeIP": "192.168.64.3",
                    "ingress": { "domainName": "kyma.local" },
                    "environment": { "gardener": false }
                }
            }),
        }
    }
}

impl InstallPlan {
    /// Read a plan from YAML. Missing fields fall back to the built-in plan.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading plan {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing plan {}", path.display()))
    }

    pub fn settle(&self) -> Duration { Duration::from_secs(self.settle_secs) }
}

#[derive(Debug)]
pub struct PlanReport {
    /// Prerequisite outcomes in install order; failures do not stop the plan.
    pub prerequisites: Vec<(Component, Result<Release, String>)>,
    pub dispatch: DispatchReport,
    pub elapsed: Duration,
}

/// Install `plan` with charts from `root`. Every component gets the plan's overrides.
pub async fn run_plan(
    root: impl Into<PathBuf>,
    installer: Arc<dyn Installer>,
    plan: &InstallPlan,
    cfg: DispatchConfig,
) -> Result<PlanReport> {
    cfg.validate()?;
    let t0 = Instant::now();
    let catalog = Arc::new(Catalog::new(root, plan.overrides.clone(), installer));

    let mut prerequisites = Vec::with_capacity(plan.prerequisites.len());
    for c in &plan.prerequisites {
        let res = catalog.install(c).await.map_err(|e| format!("{e:#}"));
        prerequisites.push((c.clone(), res));
    }

    if !plan.settle().is_zero() {
        info!(settle = ?plan.settle(), "waiting for prerequisites to settle");
        tokio::time::sleep(plan.settle()).await;
    }

    let dispatch = Dispatcher::new(catalog, cfg).run(plan.components.clone()).await?;
    let elapsed = t0.elapsed();
    if dispatch.timed_out {
        warn!(elapsed = ?elapsed, "installation stopped waiting at the deadline");
    }
    info!(elapsed = ?elapsed, "installation took");
    Ok(PlanReport { prerequisites, dispatch, elapsed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Journal(Mutex<Vec<String>>);

    #[async_trait::async_trait]
    impl Installer for Journal {
        async fn install(&self, _chart: &Path, target: &Component, overrides: &Json) -> Result<Release> {
            self.0.lock().unwrap().push(target.name.clone());
            anyhow::ensure!(overrides["global"]["domainName"] == "plan.local", "plan overrides not forwarded");
            anyhow::ensure!(target.name != "testing", "chart missing");
            Ok(Release { name: target.name.clone(), namespace: target.namespace.clone(), revision: 1, status: "deployed".into() })
        }
        async fn list_releases(&self) -> Result<Vec<Release>> { Ok(vec![]) }
    }

    #[test]
    fn built_in_plan_has_three_prerequisites_and_twenty_components() {
        let p = InstallPlan::default();
        assert_eq!(p.prerequisites.len(), 3);
        assert_eq!(p.prerequisites[0].name, "cluster-essentials");
        assert_eq!(p.components.len(), 20);
        assert_eq!(p.overrides["global"]["domainName"], "kyma.local");
    }

    #[test]
    fn load_fills_missing_fields_from_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "settleSecs: 0\ncomponents:\n  - name: dex\n    namespace: kyma-system\n").unwrap();
        let p = InstallPlan::load(f.path()).unwrap();
        assert_eq!(p.settle_secs, 0);
        assert_eq!(p.components, vec![Component::new("dex", "kyma-system")]);
        assert_eq!(p.prerequisites.len(), 3);
    }

    #[tokio::test]
    async fn prerequisites_run_serially_before_the_pool() {
        let journal = Arc::new(Journal::default());
        let plan = InstallPlan {
            prerequisites: comps(&[("cluster-essentials", "kyma-system"), ("testing", "kyma-system")]),
            components: comps(&[("dex", "kyma-system"), ("ory", "kyma-system")]),
            settle_secs: 0,
            overrides: json!({ "global": { "domainName": "plan.local" } }),
        };
        let cfg = DispatchConfig { workers: 1, ..Default::default() };
        let report = run_plan("/charts", journal.clone(), &plan, cfg).await.unwrap();

        let order = journal.0.lock().unwrap().clone();
        assert_eq!(order, vec!["cluster-essentials", "testing", "dex", "ory"]);
        assert!(report.prerequisites[0].1.is_ok());
        assert!(report.prerequisites[1].1.is_err());
        assert_eq!(report.dispatch.succeeded().count(), 2);
    }

    #[tokio::test]
    async fn components_receive_the_plan_overrides() {
        let journal = Arc::new(Journal::default());
        let plan = InstallPlan {
            prerequisites: Vec::new(),
            components: comps(&[("dex", "kyma-system")]),
            settle_secs: 0,
            overrides: json!({ "global": { "domainName": "other.local" } }),
        };
        let report = run_plan("/charts", journal, &plan, DispatchConfig::default()).await.unwrap();
        let err = report.dispatch.failed().next().and_then(|j| j.result.clone().err()).unwrap();
        assert!(err.contains("plan overrides not forwarded"), "{err}");
    }
}
