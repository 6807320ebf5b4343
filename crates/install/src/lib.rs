//! Hydro install: installs a catalog of named components through an external
//! installer with a fixed worker pool, a bounded drop-on-full queue and a
//! wall-clock deadline on how long the caller waits.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{info, warn};

pub mod dispatcher;
pub mod helm;
pub mod plan;

pub use dispatcher::{DispatchConfig, DispatchReport, Dispatcher, JobResult};
pub use helm::HelmCli;
pub use plan::{run_plan, InstallPlan, PlanReport};

/// Installation unit. Stateless; its chart is looked up by name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Component {
    pub name: String,
    pub namespace: String,
}

impl Component {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: namespace.into() }
    }
}

/// Release as reported by the installer backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    pub revision: u64,
    pub status: String,
}

/// External installer contract.
#[async_trait::async_trait]
pub trait Installer: Send + Sync {
    async fn install(&self, chart: &Path, target: &Component, overrides: &Json) -> Result<Release>;
    async fn list_releases(&self) -> Result<Vec<Release>>;
}

/// Binds an installer to a chart root and the overrides every install gets.
pub struct Catalog {
    root: PathBuf,
    overrides: Json,
    installer: Arc<dyn Installer>,
}

impl Catalog {
    pub fn new(root: impl Into<PathBuf>, overrides: Json, installer: Arc<dyn Installer>) -> Self {
        Self { root: root.into(), overrides, installer }
    }

    pub fn chart_path(&self, component: &Component) -> PathBuf {
        self.root.join(&component.name)
    }

    /// Install one component. The outcome is logged here; callers decide
    /// what a failure means for them.
    pub async fn install(&self, component: &Component) -> Result<Release> {
        let chart = self.chart_path(component);
        match self.installer.install(&chart, component, &self.overrides).await {
            Ok(release) => {
                counter!("install_ok", 1u64);
                info!(component = %component.name, namespace = %component.namespace, revision = release.revision, "installation successful");
                Ok(release)
            }
            Err(e) => {
                counter!("install_err", 1u64);
                warn!(component = %component.name, namespace = %component.namespace, error = %format!("{e:#}"), "component installation failed");
                Err(e)
            }
        }
    }
}
