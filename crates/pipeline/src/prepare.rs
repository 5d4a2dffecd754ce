//! The preparing phase: per-unit prebuild and manifest generation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use recipes_core::catalog::{UnitCatalog, UnitConfig};
use recipes_core::manifest::{self, ManifestContext, ENTRYPOINT_FILE, VARS_FILE};
use recipes_core::naming::RECIPE_VERSION;
use recipes_core::{CoreError, Status, UnitEvent, UnitRegistry};
use recipes_events::TaskSignals;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::{BuildConfig, FailurePolicy};
use crate::pool::JobHandler;
use crate::tool::{ExternalTool, Invocation};

/// Subdirectory of the build directory holding one build context per unit.
pub const CONTEXTS_DIR: &str = "contexts";

pub const DOCKERFILE: &str = "Dockerfile";

#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cancelled")]
    Cancelled,

    /// The manifest playbook failed. `output` is what it printed.
    #[error("{output}\nGenerate Manifests playbook failed.\nTo debug use `cd {} ; ansible-playbook generate_manifests.yml`", .build_dir.display())]
    Manifests { output: String, build_dir: PathBuf },
}

/// Build context directory for a unit.
pub fn context_dir(build_dir: &Path, unit: &str) -> PathBuf {
    build_dir.join(CONTEXTS_DIR).join(unit)
}

/// Build arguments every unit image receives.
pub fn build_args(config: &BuildConfig, unit: &str, cert_base_url: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("BASE_IMAGE".to_string(), config.base_image.clone()),
        ("PLATFORM".to_string(), config.platform().to_string()),
        ("CERT_BASE_URL".to_string(), cert_base_url.to_string()),
        ("HOST_GROUP".to_string(), unit.to_string()),
        ("ADDONS".to_string(), config.addons.join(" ")),
    ])
}

/// Dockerfile for one unit.
///
/// Certificates are fetched from `CERT_BASE_URL` and removed in the same
/// layer, so they never persist in the image.
pub fn render_dockerfile(unit: &str, config: &UnitConfig) -> String {
    let mut roles = String::new();
    for role in &config.roles {
        roles.push_str(&format!(" \\\n    && ansible-playbook /ansible/roles.yml -e role={role}"));
    }
    format!(
        "\
ARG BASE_IMAGE
FROM ${{BASE_IMAGE}}

ARG PLATFORM
ARG CERT_BASE_URL
ARG HOST_GROUP
ARG ADDONS

LABEL sas.recipe.version=\"{RECIPE_VERSION}\" sas.recipe.host-group=\"{unit}\"

RUN mkdir -p /etc/pki/sas \\
    && curl --fail --silent --show-error ${{CERT_BASE_URL}}/cacert/ -o /etc/pki/sas/SAS_CA_Certificate.pem \\
    && curl --fail --silent --show-error ${{CERT_BASE_URL}}/entitlement/ -o /etc/pki/sas/entitlement_certificate.pem \\
    && ansible-playbook /ansible/site.yml -e platform=${{PLATFORM}} -e host_group=${{HOST_GROUP}} -e \"addons='${{ADDONS}}'\"{roles} \\
    && rm -rf /etc/pki/sas
"
    )
}

/// Prebuild handler: resolves each unit's configuration and writes its
/// build context.
pub struct Prebuilder {
    pub config: Arc<BuildConfig>,
    pub catalog: Arc<UnitCatalog>,
    pub registry: Arc<RwLock<UnitRegistry>>,
    pub cert_base_url: String,
}

#[async_trait]
impl JobHandler<String> for Prebuilder {
    async fn handle(&self, unit: String, signals: TaskSignals, cancel: CancellationToken) {
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(PrepareError::Cancelled),
            result = self.prebuild(&unit, &signals) => result,
        };

        let error = match result {
            Ok(()) => {
                signals.done();
                return;
            }
            Err(e) => format!("{unit} prebuild {e}"),
        };

        if let Some(u) = self.registry.write().await.get_mut(&unit) {
            u.mark_failed();
        }
        match self.config.failure_policy {
            FailurePolicy::Abort => signals.finish(Err(error)),
            FailurePolicy::Isolate => signals.finish(Ok(Some(error))),
        }
    }
}

impl Prebuilder {
    async fn prebuild(&self, unit: &str, signals: &TaskSignals) -> Result<(), PrepareError> {
        self.registry.write().await.apply(unit, UnitEvent::PrebuildStarted)?;

        let config = self.catalog.resolve(unit);
        let args = build_args(&self.config, unit, &self.cert_base_url);

        let dir = context_dir(&self.config.build_dir(), unit);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| PrepareError::Write {
                path: dir.clone(),
                source,
            })?;
        let dockerfile = dir.join(DOCKERFILE);
        tokio::fs::write(&dockerfile, render_dockerfile(unit, &config))
            .await
            .map_err(|source| PrepareError::Write {
                path: dockerfile,
                source,
            })?;

        let mut registry = self.registry.write().await;
        let entry = registry
            .get_mut(unit)
            .ok_or_else(|| CoreError::UnitNotFound(unit.to_string()))?;
        entry.config = config;
        entry.build_args = args;
        entry.apply(UnitEvent::PrebuildFinished)?;
        drop(registry);

        signals.progress(format!("{unit}: finished prebuild"));
        Ok(())
    }
}

/// Write the manifest generator's inputs and run it.
///
/// Only units that finished prebuild are described.
pub async fn generate_manifests(
    config: &BuildConfig,
    registry: &UnitRegistry,
    license: &str,
    tool: &dyn ExternalTool,
) -> Result<(), PrepareError> {
    let build_dir = config.build_dir();
    let ctx = ManifestContext {
        namespace: config.namespace.clone(),
        virtual_host: config.virtual_host.clone(),
        tag: config.tag.clone(),
        base_image: config.base_image.clone(),
        registry_url: config.registry_url.clone(),
        license: license.to_string(),
    };

    let vars = manifest::render_vars(
        &ctx,
        registry
            .units()
            .filter(|u| u.status() == Status::Loaded)
            .map(|u| (u.name.as_str(), &u.config)),
    );
    write_file(&build_dir.join(VARS_FILE), vars).await?;

    let util_dir = std::path::absolute(&config.util_dir).map_err(|source| PrepareError::Write {
        path: config.util_dir.clone(),
        source,
    })?;
    let entrypoint = manifest::render_entrypoint(
        &util_dir.display().to_string(),
        config.deployment_type.as_str(),
    );
    write_file(&build_dir.join(ENTRYPOINT_FILE), entrypoint).await?;

    tracing::info!(build_dir = %build_dir.display(), "Generating deployment manifests");
    let playbook = Invocation::new("ansible-playbook", ["-vvv", ENTRYPOINT_FILE]).in_dir(&build_dir);
    tool.execute(&playbook)
        .await
        .map_err(|e| PrepareError::Manifests {
            output: e.to_string(),
            build_dir: build_dir.clone(),
        })?;
    Ok(())
}

async fn write_file(path: &Path, contents: String) -> Result<(), PrepareError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| PrepareError::Write {
            path: path.to_path_buf(),
            source,
        })
}
