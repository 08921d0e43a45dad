use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use tokio::process::Command as TokioCommand;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::model::{InstanceRecord, InstanceStatus, OsKind, ProjectMetadata};

/// Backend contract for the resource tree. One metadata lookup per project,
/// one flat instance listing per project; zones are never fetched on their
/// own.
#[async_trait]
pub trait ComputeInventory: Send + Sync {
    async fn project_metadata(&self, project: &str) -> Result<ProjectMetadata, FetchError>;
    async fn list_instances(&self, project: &str) -> Result<Vec<InstanceRecord>, FetchError>;
}

/// Inventory adapter that shells out to the `gcloud` CLI and parses its JSON
/// output. Authentication and endpoint selection stay with the CLI config.
#[derive(Debug, Clone)]
pub struct GcloudInventory {
    binary: String,
}

impl GcloudInventory {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run_json(&self, args: &[&str], project: &str) -> Result<Vec<u8>, FetchError> {
        debug!("gcloud {}", args.join(" "));
        let output = TokioCommand::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|error| FetchError::backend(format!("failed to run {}: {error}", self.binary)))?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_failure(&stderr, project))
        }
    }
}

#[async_trait]
impl ComputeInventory for GcloudInventory {
    async fn project_metadata(&self, project: &str) -> Result<ProjectMetadata, FetchError> {
        let stdout = self
            .run_json(&["projects", "describe", project, "--format=json"], project)
            .await?;
        parse_project(&stdout, project)
    }

    async fn list_instances(&self, project: &str) -> Result<Vec<InstanceRecord>, FetchError> {
        let stdout = self
            .run_json(
                &[
                    "compute",
                    "instances",
                    "list",
                    "--project",
                    project,
                    "--format=json",
                ],
                project,
            )
            .await?;
        parse_instances(&stdout, project)
    }
}

fn classify_failure(stderr: &str, project: &str) -> FetchError {
    let trimmed = stderr.trim();
    if trimmed.contains("PERMISSION_DENIED")
        || trimmed.contains("does not have permission")
        || trimmed.contains("HttpError 403")
    {
        return FetchError::AccessDenied(project.to_string());
    }
    let first_line = trimmed.lines().next().unwrap_or("gcloud exited with failure");
    FetchError::backend(first_line.to_string())
}

#[derive(Debug, Deserialize)]
struct ProjectDescribe {
    name: Option<String>,
    #[serde(rename = "projectId")]
    project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceEntry {
    id: Option<String>,
    name: String,
    zone: Option<String>,
    status: Option<String>,
    #[serde(default)]
    disks: Vec<DiskEntry>,
}

#[derive(Debug, Deserialize, Default)]
struct DiskEntry {
    #[serde(rename = "guestOsFeatures", default)]
    guest_os_features: Vec<GuestOsFeature>,
}

#[derive(Debug, Deserialize)]
struct GuestOsFeature {
    #[serde(rename = "type")]
    kind: Option<String>,
}

fn parse_project(raw: &[u8], project: &str) -> Result<ProjectMetadata, FetchError> {
    let describe: ProjectDescribe = serde_json::from_slice(raw).map_err(|error| {
        FetchError::backend(format!("failed to parse project metadata for {project}: {error}"))
    })?;
    let display_name = describe
        .name
        .or(describe.project_id)
        .unwrap_or_else(|| project.to_string());
    Ok(ProjectMetadata { display_name })
}

fn parse_instances(raw: &[u8], project: &str) -> Result<Vec<InstanceRecord>, FetchError> {
    let entries: Vec<InstanceEntry> = serde_json::from_slice(raw).map_err(|error| {
        FetchError::backend(format!("failed to parse instance listing for {project}: {error}"))
    })?;

    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(zone) = entry.zone.as_deref().map(zone_short_name) else {
            warn!("instance {} in {project} has no zone, skipping", entry.name);
            continue;
        };
        let status = entry
            .status
            .as_deref()
            .map(InstanceStatus::from_backend)
            .unwrap_or_else(|| InstanceStatus::Other("UNKNOWN".to_string()));
        records.push(InstanceRecord {
            id: entry.id.unwrap_or_else(|| entry.name.clone()),
            name: entry.name,
            zone,
            os: os_from_disks(&entry.disks),
            status,
        });
    }
    Ok(records)
}

fn zone_short_name(zone: &str) -> String {
    zone.rsplit('/').next().unwrap_or(zone).to_string()
}

/// Windows if any attached disk advertises a Windows guest-OS feature, Linux
/// otherwise.
fn os_from_disks(disks: &[DiskEntry]) -> OsKind {
    let windows = disks.iter().any(|disk| {
        disk.guest_os_features
            .iter()
            .any(|feature| feature.kind.as_deref().is_some_and(|kind| kind.starts_with("WINDOWS")))
    });
    if windows { OsKind::Windows } else { OsKind::Linux }
}
