//! Installer backend driving the `helm` binary.

use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value as Json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::{Component, Installer, Release};

pub struct HelmCli {
    bin: String,
}

impl Default for HelmCli {
    fn default() -> Self {
        Self { bin: std::env::var("HYDRO_HELM_BIN").unwrap_or_else(|_| "helm".to_string()) }
    }
}

impl HelmCli {
    pub fn new(bin: impl Into<String>) -> Self { Self { bin: bin.into() } }

    async fn run(&self, args: &[String], stdin: Option<String>) -> Result<Vec<u8>> {
        debug!(bin = %self.bin, args = ?args, "running helm");
        let mut child = Command::new(&self.bin)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning {}", self.bin))?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await.context("writing values to helm stdin")?;
            // Dropping the pipe closes stdin so helm stops reading.
        }
        let out = child.wait_with_output().await.context("waiting for helm")?;
        if !out.status.success() {
            return Err(anyhow!(
                "{} {} failed ({}): {}",
                self.bin,
                args.first().map(String::as_str).unwrap_or(""),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(out.stdout)
    }
}

#[derive(Deserialize)]
struct UpgradeOutput {
    name: String,
    namespace: String,
    version: u64,
    info: UpgradeInfo,
}

#[derive(Deserialize)]
struct UpgradeInfo {
    status: String,
}

#[derive(Deserialize)]
struct ListEntry {
    name: String,
    namespace: String,
    revision: String,
    status: String,
}

fn parse_upgrade(bytes: &[u8]) -> Result<Release> {
    let o: UpgradeOutput = serde_json::from_slice(bytes).context("decoding helm upgrade output")?;
    Ok(Release { name: o.name, namespace: o.namespace, revision: o.version, status: o.info.status })
}

fn parse_list(bytes: &[u8]) -> Result<Vec<Release>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let rows: Vec<ListEntry> = serde_json::from_slice(bytes).context("decoding helm list output")?;
    Ok(rows
        .into_iter()
        .map(|r| Release { name: r.name, namespace: r.namespace, revision: r.revision.parse().unwrap_or(0), status: r.status })
        .collect())
}

#[async_trait::async_trait]
impl Installer for HelmCli {
    async fn install(&self, chart: &Path, target: &Component, overrides: &Json) -> Result<Release> {
        let values = serde_yaml::to_string(overrides).context("rendering overrides as YAML")?;
        let args: Vec<String> = vec![
            "upgrade".into(),
            "--install".into(),
            target.name.clone(),
            chart.display().to_string(),
            "--namespace".into(),
            target.namespace.clone(),
            "--create-namespace".into(),
            "--values".into(),
            "-".into(),
            "--output".into(),
            "json".into(),
        ];
        let out = self.run(&args, Some(values)).await?;
        parse_upgrade(&out).with_context(|| format!("release {}", target.name))
    }

    async fn list_releases(&self) -> Result<Vec<Release>> {
        let args: Vec<String> = vec!["list".into(), "--all-namespaces".into(), "--output".into(), "json".into()];
        parse_list(&self.run(&args, None).await?)
    }
}
