//! The loading phase: five independent checks and fetches that must all
//! succeed before any unit work starts.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use recipes_core::inventory::{parse_unit_names, UNIT_GROUP};
use recipes_core::CoreError;
use recipes_docker::{CredentialError, CredentialStore, EngineError, ImageEngine, RegistryAuth};
use recipes_events::TaskSignals;
use tokio_util::sync::CancellationToken;

use crate::config::BuildConfig;
use crate::license::{read_license_archive, LicenseError, LicenseMaterial};
use crate::pool::{Job, JobHandler};
use crate::probe::{probe_url, InsecureUrl, ProbeError, UrlProbe};
use crate::secrets::{detect_host_ip, SecretMaterial, SecretServer};
use crate::tool::{ExternalTool, Invocation, ToolError};

/// Name of the orchestration tool inside the util directory.
pub const ORCHESTRATION_TOOL: &str = "sas-orchestration";

/// Where the orchestration tool is downloaded from when missing.
pub const ORCHESTRATION_TOOL_URL: &str =
    "https://support.sas.com/installation/viya/34/sas-orchestration-cli/lax/sas-orchestration-linux.tgz";

/// Archive written by the orchestration tool.
pub const PLAYBOOK_ARCHIVE: &str = "sas_viya_playbook.tgz";

/// Directory the playbook archive extracts to.
pub const PLAYBOOK_DIR: &str = "sas_viya_playbook";

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    License(#[from] LicenseError),

    #[error("Unable to start the license and entitlement endpoint: {0}")]
    SecretEndpoint(std::io::Error),

    #[error("Unable to connect to the image engine. Ensure Docker is installed and the service is started. {0}")]
    EngineUnavailable(EngineError),

    #[error("Unable to pull base image '{image}': {source}")]
    Pull { image: String, source: EngineError },

    #[error(transparent)]
    Insecure(#[from] InsecureUrl),

    #[error("Invalid {setting} {url}: {source}")]
    Unreachable {
        setting: &'static str,
        url: String,
        source: ProbeError,
    },

    #[error("Invalid {setting} {url}: http status code {status}")]
    BadStatus {
        setting: &'static str,
        url: String,
        status: u16,
    },

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error("Failed to install the sas-orchestration tool. {0}")]
    ToolInstall(String),

    #[error("Unable to generate the playbook. A Java Runtime Environment (1.8.x) must be installed. {0}")]
    Playbook(ToolError),

    #[error("The package `ansible` must be installed in order to generate Kubernetes manifests. {0}")]
    AnsibleMissing(ToolError),

    #[error("Unable to untar playbook. {0}")]
    Extract(String),

    #[error("cannot read inventory {path}: {source}")]
    InventoryRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Inventory(#[from] CoreError),

    #[error("loading task panicked: {0}")]
    Join(String),

    #[error("cancelled")]
    Cancelled,
}

/// The five loading tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadTask {
    /// Generate the playbook and read the unit names from its inventory.
    Descriptor,
    /// Read the licensing archive and start the secret endpoint.
    License,
    /// Reach the image engine and pull the base image.
    Engine,
    Mirror,
    /// Probe the registry and resolve its saved credentials.
    Registry,
}

impl LoadTask {
    pub const ALL: [LoadTask; 5] = [
        LoadTask::Descriptor,
        LoadTask::License,
        LoadTask::Engine,
        LoadTask::Mirror,
        LoadTask::Registry,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Self::Descriptor => "descriptor",
            Self::License => "license",
            Self::Engine => "engine",
            Self::Mirror => "mirror",
            Self::Registry => "registry",
        }
    }

    pub fn jobs() -> Vec<Job<LoadTask>> {
        Self::ALL.iter().map(|t| Job::new(t.id(), *t)).collect()
    }
}

/// Outputs of the loading phase, each written once by its task.
#[derive(Debug, Default)]
pub struct LoadContext {
    pub license: OnceLock<LicenseMaterial>,
    pub cert_base_url: OnceLock<String>,
    pub registry_auth: OnceLock<RegistryAuth>,
    /// Unit names from the inventory, in file order.
    pub unit_names: OnceLock<Vec<String>>,
    pub secret_server: std::sync::Mutex<Option<SecretServer>>,
}

impl LoadContext {
    /// Take the secret server handle for shutdown.
    pub fn take_secret_server(&self) -> Option<SecretServer> {
        self.secret_server.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Executes [`LoadTask`]s.
pub struct Loader {
    pub config: Arc<BuildConfig>,
    pub engine: Arc<dyn ImageEngine>,
    pub tool: Arc<dyn ExternalTool>,
    pub probe: Arc<dyn UrlProbe>,
    pub credentials: CredentialStore,
    pub context: Arc<LoadContext>,
    /// Lifetime of the secret endpoint.
    pub batch_cancel: CancellationToken,
}

#[async_trait]
impl JobHandler<LoadTask> for Loader {
    async fn handle(&self, task: LoadTask, signals: TaskSignals, cancel: CancellationToken) {
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(LoadError::Cancelled),
            result = self.run_task(task, &signals) => result,
        };
        signals.finish(result.map(|()| None).map_err(|e| e.to_string()));
    }
}

impl Loader {
    async fn run_task(&self, task: LoadTask, signals: &TaskSignals) -> Result<(), LoadError> {
        match task {
            LoadTask::Descriptor => self.load_descriptor(signals).await,
            LoadTask::License => self.load_license(signals).await,
            LoadTask::Engine => self.load_engine(signals).await,
            LoadTask::Mirror => self.check_mirror(signals).await,
            LoadTask::Registry => self.check_registry(signals).await,
        }
    }

    async fn load_license(&self, signals: &TaskSignals) -> Result<(), LoadError> {
        signals.progress("Reading licensing archive ...");
        let path = self.config.zip_path.clone();
        let material = tokio::task::spawn_blocking(move || read_license_archive(&path))
            .await
            .map_err(|e| LoadError::Join(e.to_string()))??;

        let host = match &self.config.advertise_host {
            Some(host) => host.clone(),
            None => detect_host_ip().map_err(LoadError::SecretEndpoint)?.to_string(),
        };
        let secrets = SecretMaterial {
            ca_certificate: material.ca_certificate.clone(),
            entitlement: material.entitlement.clone(),
        };
        let server = SecretServer::start(secrets, &host, self.batch_cancel.clone())
            .await
            .map_err(LoadError::SecretEndpoint)?;

        let _ = self.context.cert_base_url.set(server.base_url.clone());
        let _ = self.context.license.set(material);
        if let Ok(mut slot) = self.context.secret_server.lock() {
            *slot = Some(server);
        }

        signals.progress("Finished reading licensing archive");
        Ok(())
    }

    async fn load_engine(&self, signals: &TaskSignals) -> Result<(), LoadError> {
        signals.progress("Connecting to the image engine ...");
        self.engine.ping().await.map_err(LoadError::EngineUnavailable)?;
        signals.progress("Finished connecting to the image engine");

        let image = &self.config.base_image;
        signals.progress(format!("Pulling base container image '{image}' ..."));
        self.engine.pull(image).await.map_err(|source| LoadError::Pull {
            image: image.clone(),
            source,
        })?;
        signals.progress(format!("Finished pulling base container image '{image}'"));
        Ok(())
    }

    async fn check_mirror(&self, signals: &TaskSignals) -> Result<(), LoadError> {
        if self.config.mirror_url.is_empty() {
            return Ok(());
        }
        self.check_url(&self.config.mirror_url, "mirror URL", signals).await
    }

    async fn check_registry(&self, signals: &TaskSignals) -> Result<(), LoadError> {
        if self.config.deployment_type.is_single() {
            return Ok(());
        }
        self.check_url(&self.config.registry_url, "Docker registry URL", signals)
            .await?;

        let auth = self.credentials.lookup(&self.config.registry_url).await?;
        tracing::debug!(registry = %auth.registry, "Resolved registry credentials");
        let _ = self.context.registry_auth.set(auth);
        Ok(())
    }

    async fn check_url(&self, raw: &str, setting: &'static str, signals: &TaskSignals) -> Result<(), LoadError> {
        let url = probe_url(raw, setting)?;
        signals.progress(format!("Checking the {setting} for validity ... {url}"));
        let status = self
            .probe
            .status(&url)
            .await
            .map_err(|source| LoadError::Unreachable {
                setting,
                url: url.clone(),
                source,
            })?;
        if status != 200 {
            return Err(LoadError::BadStatus {
                setting,
                url,
                status,
            });
        }
        signals.progress(format!(
            "Finished checking the {setting} for validity: http status code {status}"
        ));
        Ok(())
    }

    async fn load_descriptor(&self, signals: &TaskSignals) -> Result<(), LoadError> {
        if self.config.deployment_type.is_single() {
            return Ok(());
        }
        let build_dir = self.config.build_dir();
        let util_dir = &self.config.util_dir;

        signals.progress("Fetching orchestration tool ...");
        self.ensure_orchestration_tool(util_dir).await?;
        signals.progress("Finished fetching orchestration tool");

        signals.progress("Generating playbook for order ...");
        let archive = build_dir.join(PLAYBOOK_ARCHIVE);
        let generate = Invocation::new(
            util_dir.join(ORCHESTRATION_TOOL).display().to_string(),
            [
                "build".to_string(),
                "--input".to_string(),
                self.config.zip_path.display().to_string(),
                "--output".to_string(),
                archive.display().to_string(),
            ],
        );
        self.tool.execute(&generate).await.map_err(LoadError::Playbook)?;

        self.tool
            .execute(&Invocation::new("ansible", ["--version"]))
            .await
            .map_err(LoadError::AnsibleMissing)?;

        signals.progress("Extracting generated playbook content ...");
        let extract = Invocation::new(
            "tar",
            [
                "--extract".to_string(),
                "--file".to_string(),
                archive.display().to_string(),
                "-C".to_string(),
                build_dir.display().to_string(),
            ],
        );
        self.tool
            .execute(&extract)
            .await
            .map_err(|e| LoadError::Extract(e.to_string()))?;
        if let Err(e) = tokio::fs::remove_file(&archive).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(LoadError::Extract(e.to_string()));
            }
        }
        signals.progress("Finished extracting and generating playbook for order");

        signals.progress("Fetching the list of units in the order ...");
        let inventory_path = build_dir.join(PLAYBOOK_DIR).join("inventory.ini");
        let inventory = tokio::fs::read_to_string(&inventory_path)
            .await
            .map_err(|source| LoadError::InventoryRead {
                path: inventory_path.clone(),
                source,
            })?;
        let names = parse_unit_names(&inventory, UNIT_GROUP)?;
        signals.progress(format!("Finished fetching the unit list: {} units", names.len()));
        let _ = self.context.unit_names.set(names);
        Ok(())
    }

    /// Download and unpack the orchestration tool unless it is present.
    async fn ensure_orchestration_tool(&self, util_dir: &Path) -> Result<(), LoadError> {
        if tokio::fs::try_exists(util_dir.join(ORCHESTRATION_TOOL))
            .await
            .unwrap_or(false)
        {
            return Ok(());
        }

        tracing::info!(url = ORCHESTRATION_TOOL_URL, "Downloading orchestration tool");
        let archive = util_dir.join(format!("{ORCHESTRATION_TOOL}.tgz"));
        self.probe
            .download(ORCHESTRATION_TOOL_URL, &archive)
            .await
            .map_err(|e| LoadError::ToolInstall(format!("support.sas.com must be accessible, {e}")))?;

        let untar = Invocation::new(
            "tar",
            [
                "-xf".to_string(),
                archive.display().to_string(),
                "-C".to_string(),
                util_dir.display().to_string(),
            ],
        );
        self.tool
            .execute(&untar)
            .await
            .map_err(|e| LoadError::ToolInstall(e.to_string()))?;
        let _ = tokio::fs::remove_file(&archive).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_load_jobs_with_distinct_ids() {
        let jobs = LoadTask::jobs();
        assert_eq!(jobs.len(), 5);
        let mut ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn status_error_names_url_and_code() {
        let err = LoadError::BadStatus {
            setting: "mirror URL",
            url: "https://mirror.example.com".into(),
            status: 500,
        };
        assert_eq!(
            err.to_string(),
            "Invalid mirror URL https://mirror.example.com: http status code 500"
        );
    }
}
