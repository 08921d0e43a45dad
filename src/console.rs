use std::process::Stdio;
use tokio::process::Command as TokioCommand;
use tracing::{debug, warn};

use crate::model::InstanceLocator;

pub const DEFAULT_CONSOLE_BASE: &str = "https://console.cloud.google.com";

/// Opens cloud console pages for the current selection. Fire and forget;
/// failures are logged and never block the UI.
pub trait ConsoleLauncher: Send + Sync {
    fn open_instance_list(&self, project: &str);
    fn open_instance_details(&self, locator: &InstanceLocator);
    fn open_access_config(&self, project: &str);
}

pub struct BrowserConsole {
    base: String,
}

impl BrowserConsole {
    pub fn new(base: Option<String>) -> Self {
        let base = base.unwrap_or_else(|| DEFAULT_CONSOLE_BASE.to_string());
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    fn instance_list_url(&self, project: &str) -> String {
        format!("{}/compute/instances?project={project}", self.base)
    }

    fn instance_details_url(&self, locator: &InstanceLocator) -> String {
        format!(
            "{}/compute/instancesDetail/zones/{}/instances/{}?project={}",
            self.base, locator.zone, locator.name, locator.project
        )
    }

    fn access_config_url(&self, project: &str) -> String {
        format!("{}/iam-admin/iam?project={project}", self.base)
    }

    fn open(&self, url: String) {
        let Some((program, prefix_args)) = opener_for_os(std::env::consts::OS) else {
            warn!(
                "no URL opener for platform {}, wanted {url}",
                std::env::consts::OS
            );
            return;
        };
        let mut cmd = TokioCommand::new(program);
        cmd.args(prefix_args)
            .arg(&url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match cmd.spawn() {
            Ok(_child) => debug!("opened console page {url}"),
            Err(error) => warn!("failed to open {url}: {error}"),
        }
    }
}

impl ConsoleLauncher for BrowserConsole {
    fn open_instance_list(&self, project: &str) {
        self.open(self.instance_list_url(project));
    }

    fn open_instance_details(&self, locator: &InstanceLocator) {
        self.open(self.instance_details_url(locator));
    }

    fn open_access_config(&self, project: &str) {
        self.open(self.access_config_url(project));
    }
}

fn opener_for_os(target_os: &str) -> Option<(&'static str, &'static [&'static str])> {
    match target_os {
        "linux" => Some(("xdg-open", &[])),
        "macos" => Some(("open", &[])),
        "windows" => Some(("cmd", &["/C", "start", ""])),
        _ => None,
    }
}
