//! Phase sequencing for one batch.
//!
//! `Loading -> Preparing -> Building -> Finished`, with `Aborted` reachable
//! from any phase. Each phase runs through a [`WorkerPool`] and the next one
//! only starts once its predecessor fully resolved.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use recipes_core::catalog::UnitCatalog;
use recipes_core::{Status, UnitRegistry};
use recipes_docker::{CredentialStore, ImageEngine};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::build::Builder;
use crate::config::BuildConfig;
use crate::load::{LoadContext, LoadTask, Loader};
use crate::pool::{Job, PhaseError, WorkerPool};
use crate::prepare::{generate_manifests, Prebuilder};
use crate::probe::UrlProbe;
use crate::solo::{build_solo, solo_image, SoloError};
use crate::summary::BatchSummary;
use crate::tool::ExternalTool;

/// Stage of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Loading,
    Preparing,
    Building,
    Finished,
    Aborted,
}

impl BatchPhase {
    /// The phase that follows a successful one.
    pub fn next(self) -> Self {
        match self {
            Self::Loading => Self::Preparing,
            Self::Preparing => Self::Building,
            Self::Building | Self::Finished => Self::Finished,
            Self::Aborted => Self::Aborted,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Aborted)
    }

    /// Whether a batch in this phase may move to `to`.
    ///
    /// Single batches go straight from loading to building.
    pub fn can_enter(self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (_, Self::Aborted) | (Self::Loading, Self::Building) => true,
            (from, to) => from.next() == to,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Preparing => "preparing",
            Self::Building => "building",
            Self::Finished => "finished",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// The first fatal message of the failing phase, verbatim.
    #[error("{message}")]
    Fatal { phase: BatchPhase, message: String },

    #[error("The number of builds are set to zero. An error in pre-build tasks may have occurred or the order entitlement does not match the deployment type.")]
    NoBuilds,

    /// Every unit ran but some failed under the isolate policy.
    #[error("{} of {} units failed", .0.failed_count(), .0.units.len())]
    PartialFailure(Box<BatchSummary>),

    #[error("batch cancelled")]
    Cancelled,
}

impl BatchError {
    fn fatal(phase: BatchPhase, message: impl Into<String>) -> Self {
        Self::Fatal {
            phase,
            message: message.into(),
        }
    }

    fn from_phase(phase: BatchPhase, err: PhaseError) -> Self {
        match err {
            PhaseError::Cancelled => Self::Cancelled,
            other => Self::fatal(phase, other.to_string()),
        }
    }
}

/// Owns the unit registry and the batch aggregates and runs the phases.
pub struct Coordinator {
    config: Arc<BuildConfig>,
    engine: Arc<dyn ImageEngine>,
    tool: Arc<dyn ExternalTool>,
    probe: Arc<dyn UrlProbe>,
    credentials: CredentialStore,
    registry: Arc<RwLock<UnitRegistry>>,
    total_size: Arc<AtomicU64>,
    /// Every phase entered so far; the last one is current.
    phases: std::sync::Mutex<Vec<BatchPhase>>,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        config: BuildConfig,
        engine: Arc<dyn ImageEngine>,
        tool: Arc<dyn ExternalTool>,
        probe: Arc<dyn UrlProbe>,
        credentials: CredentialStore,
    ) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            tool,
            probe,
            credentials,
            registry: Arc::new(RwLock::new(UnitRegistry::default())),
            total_size: Arc::new(AtomicU64::new(0)),
            phases: std::sync::Mutex::new(vec![BatchPhase::Loading]),
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops the batch (for example on Ctrl-C).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> BatchPhase {
        self.phases().last().copied().unwrap_or(BatchPhase::Aborted)
    }

    /// Copy of the registry as it stands.
    pub async fn registry_snapshot(&self) -> UnitRegistry {
        self.registry.read().await.clone()
    }

    /// Sum of every image size measured so far.
    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }

    /// Phases entered so far, in order.
    pub fn phases(&self) -> Vec<BatchPhase> {
        self.phases.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Move to the phase after the current one.
    fn advance(&self) {
        self.set_phase(self.phase().next());
    }

    fn set_phase(&self, phase: BatchPhase) {
        let Ok(mut phases) = self.phases.lock() else {
            return;
        };
        let current = phases.last().copied().unwrap_or(BatchPhase::Loading);
        if !current.can_enter(phase) {
            tracing::error!(from = %current, to = %phase, "Ignoring illegal batch phase change");
            return;
        }
        tracing::debug!(from = %current, to = %phase, "Batch phase changed");
        phases.push(phase);
    }

    fn pool(&self, name: &'static str, workers: usize) -> WorkerPool {
        WorkerPool::new(name, workers).with_drain_timeout(self.config.drain_timeout)
    }

    /// Run the batch to completion.
    pub async fn run(&self) -> Result<BatchSummary, BatchError> {
        let started = Instant::now();
        // Keeps the secret endpoint up until every build has fetched from it.
        let server_cancel = self.cancel.child_token();
        let context = Arc::new(LoadContext::default());

        let result = self.run_phases(started, &context, &server_cancel).await;

        server_cancel.cancel();
        if let Some(server) = context.take_secret_server() {
            server.join().await;
        }

        match &result {
            Ok(_) | Err(BatchError::PartialFailure(_)) => self.advance(),
            Err(e) => {
                tracing::error!(phase = %self.phase(), error = %e, "Batch aborted");
                self.set_phase(BatchPhase::Aborted);
            }
        }
        result
    }

    async fn run_phases(
        &self,
        started: Instant,
        context: &Arc<LoadContext>,
        server_cancel: &CancellationToken,
    ) -> Result<BatchSummary, BatchError> {
        self.load(context, server_cancel).await?;

        let cert_base_url = context.cert_base_url.get().cloned().unwrap_or_default();
        if self.config.deployment_type.is_single() {
            return self.run_solo(started, &cert_base_url).await;
        }

        self.advance();
        self.prepare(context, cert_base_url).await?;

        self.advance();
        self.build(context).await?;

        let summary = BatchSummary::from_registry(
            &self.config,
            &*self.registry.read().await,
            started.elapsed(),
            self.total_size(),
        );
        if summary.failed_count() > 0 {
            return Err(BatchError::PartialFailure(Box::new(summary)));
        }
        Ok(summary)
    }

    async fn load(&self, context: &Arc<LoadContext>, server_cancel: &CancellationToken) -> Result<(), BatchError> {
        let loader = Arc::new(Loader {
            config: Arc::clone(&self.config),
            engine: Arc::clone(&self.engine),
            tool: Arc::clone(&self.tool),
            probe: Arc::clone(&self.probe),
            credentials: self.credentials.clone(),
            context: Arc::clone(context),
            batch_cancel: server_cancel.clone(),
        });
        let jobs = LoadTask::jobs();
        self.pool("loading", jobs.len())
            .run(jobs, loader, &self.cancel)
            .await
            .map_err(|e| BatchError::from_phase(BatchPhase::Loading, e))?;
        Ok(())
    }

    async fn prepare(&self, context: &LoadContext, cert_base_url: String) -> Result<(), BatchError> {
        let phase = BatchPhase::Preparing;
        let names = context
            .unit_names
            .get()
            .ok_or_else(|| BatchError::fatal(phase, "The unit list was not loaded"))?;

        {
            let mut registry = UnitRegistry::from_names(names, &self.config.base_image, &self.config.tag);
            registry
                .apply_filter(&self.config.build_only)
                .map_err(|e| BatchError::fatal(phase, e.to_string()))?;
            *self.registry.write().await = registry;
        }
        let selected = self.registry.read().await.selected_names();
        tracing::info!(units = selected.len(), "Starting prebuild tasks");

        let catalog =
            UnitCatalog::load(&self.config.config_file).map_err(|e| BatchError::fatal(phase, e.to_string()))?;
        let prebuilder = Arc::new(Prebuilder {
            config: Arc::clone(&self.config),
            catalog: Arc::new(catalog),
            registry: Arc::clone(&self.registry),
            cert_base_url,
        });
        let jobs = selected.into_iter().map(|name| Job::new(name.clone(), name)).collect();
        self.pool("preparing", self.config.prepare_workers)
            .run(jobs, prebuilder, &self.cancel)
            .await
            .map_err(|e| BatchError::from_phase(phase, e))?;

        let license = context
            .license
            .get()
            .map(|l| l.license_text())
            .unwrap_or_default();
        let registry = self.registry.read().await;
        generate_manifests(&self.config, &registry, &license, self.tool.as_ref())
            .await
            .map_err(|e| BatchError::fatal(phase, e.to_string()))
    }

    async fn build(&self, context: &LoadContext) -> Result<(), BatchError> {
        let phase = BatchPhase::Building;
        let loaded = self.registry.read().await.names_with(Status::Loaded);
        if loaded.is_empty() {
            return Err(BatchError::NoBuilds);
        }
        let auth = context
            .registry_auth
            .get()
            .cloned()
            .ok_or_else(|| BatchError::fatal(phase, "Registry credentials were not resolved"))?;

        let count = loaded.len();
        tracing::info!(
            builds = count,
            workers = self.config.workers,
            "Starting {count} build process{} ... (this may take several minutes)",
            if count == 1 { "" } else { "es" }
        );

        let builder = Arc::new(Builder {
            config: Arc::clone(&self.config),
            engine: Arc::clone(&self.engine),
            registry: Arc::clone(&self.registry),
            auth,
            total_size: Arc::clone(&self.total_size),
        });
        let jobs = loaded.into_iter().map(|name| Job::new(name.clone(), name)).collect();
        let report = self
            .pool("building", self.config.workers)
            .with_queue_capacity(self.config.queue_capacity)
            .run(jobs, builder, &self.cancel)
            .await
            .map_err(|e| BatchError::from_phase(phase, e))?;

        for (unit, error) in &report.failed {
            tracing::warn!(unit = %unit, error = %error, "Unit failed");
        }
        Ok(())
    }

    async fn run_solo(&self, started: Instant, cert_base_url: &str) -> Result<BatchSummary, BatchError> {
        self.set_phase(BatchPhase::Building);
        let unit = build_solo(&self.config, self.engine.as_ref(), cert_base_url, &self.cancel)
            .await
            .map_err(|e| match e {
                SoloError::Cancelled => BatchError::Cancelled,
                other => BatchError::fatal(BatchPhase::Building, other.to_string()),
            })?;
        self.total_size.fetch_add(unit.image_size, Ordering::Relaxed);
        Ok(BatchSummary::solo(&unit, solo_image(&self.config), started.elapsed()))
    }
}
