//! The building phase: build, measure and push each loaded unit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use recipes_core::{CoreError, Status, UnitEvent, UnitRegistry, WorkUnit};
use recipes_docker::{is_step_line, BuildRequest, ImageEngine, RegistryAuth};
use recipes_events::TaskSignals;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::{BuildConfig, FailurePolicy};
use crate::pool::JobHandler;
use crate::prepare::{context_dir, DOCKERFILE};

/// Per-unit build and publish handler run by the build pool.
pub struct Builder {
    pub config: Arc<BuildConfig>,
    pub engine: Arc<dyn ImageEngine>,
    pub registry: Arc<RwLock<UnitRegistry>>,
    pub auth: RegistryAuth,
    /// Batch-wide sum of measured image sizes.
    pub total_size: Arc<AtomicU64>,
}

/// How a unit's job ended.
enum Outcome {
    Pushed,
    /// Not `Loaded` when dequeued; left untouched.
    Skipped(Status),
    /// The unit's build or push failed.
    UnitFailed(String),
    /// Status bookkeeping went wrong.
    Fatal(String),
}

#[async_trait]
impl JobHandler<String> for Builder {
    async fn handle(&self, unit: String, signals: TaskSignals, cancel: CancellationToken) {
        match self.build_and_push(&unit, &signals, &cancel).await {
            Outcome::Pushed => signals.done(),
            Outcome::Skipped(status) => {
                tracing::debug!(unit = %unit, status = %status, "Skipping unit that is not loaded");
                signals.done();
            }
            Outcome::UnitFailed(message) => {
                if let Some(u) = self.registry.write().await.get_mut(&unit) {
                    u.mark_failed();
                }
                match self.config.failure_policy {
                    FailurePolicy::Abort => signals.finish(Err(message)),
                    FailurePolicy::Isolate => signals.finish(Ok(Some(message))),
                }
            }
            Outcome::Fatal(message) => signals.finish(Err(message)),
        }
    }
}

impl Builder {
    async fn build_and_push(&self, name: &str, signals: &TaskSignals, cancel: &CancellationToken) -> Outcome {
        let (request, tag) = {
            let registry = self.registry.read().await;
            let Some(unit) = registry.get(name) else {
                return Outcome::Fatal(CoreError::UnitNotFound(name.to_string()).to_string());
            };
            if unit.status() != Status::Loaded {
                return Outcome::Skipped(unit.status());
            }
            let request = BuildRequest {
                context_dir: context_dir(&self.config.build_dir(), name),
                dockerfile: DOCKERFILE.to_string(),
                image: self.config.image_reference(name, &unit.tag),
                build_args: unit.build_args.clone(),
            };
            (request, unit.tag.clone())
        };
        let image = request.image.clone();

        if let Err(e) = self
            .update(name, |u| {
                u.apply(UnitEvent::BuildStarted)?;
                u.timings.build_start = Some(chrono::Utc::now());
                Ok(())
            })
            .await
        {
            return Outcome::Fatal(e.to_string());
        }
        signals.progress(format!("{name}: starting build"));

        let verbose = self.config.verbose;
        let log = |line: String| {
            if verbose || is_step_line(&line) {
                signals.progress(format!("{name}: {line}"));
            }
        };
        let built = tokio::select! {
            _ = cancel.cancelled() => Err("cancelled".to_string()),
            result = self.engine.build(&request, &log) => result.map_err(|e| e.to_string()),
        };
        if let Err(e) = built {
            return Outcome::UnitFailed(format!("{name}:{tag} container build {e}"));
        }

        if let Err(e) = self
            .update(name, |u| {
                u.timings.build_end = Some(chrono::Utc::now());
                u.apply(UnitEvent::BuildFinished).map(|_| ())
            })
            .await
        {
            return Outcome::Fatal(e.to_string());
        }

        // Size is informational; a failed query never fails the unit.
        let size = match self.engine.image_size(&image).await {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!(unit = %name, error = %e, "Unable to query image size");
                0
            }
        };
        self.total_size.fetch_add(size, Ordering::Relaxed);

        if let Err(e) = self
            .update(name, |u| {
                u.image_size = size;
                u.timings.push_start = Some(chrono::Utc::now());
                Ok(())
            })
            .await
        {
            return Outcome::Fatal(e.to_string());
        }

        let pushed = tokio::select! {
            _ = cancel.cancelled() => Err("cancelled".to_string()),
            result = self.engine.push(&image, &self.auth) => result.map_err(|e| e.to_string()),
        };
        if let Err(e) = pushed {
            return Outcome::UnitFailed(format!("{image} container push {e}"));
        }

        if let Err(e) = self
            .update(name, |u| {
                u.timings.push_end = Some(chrono::Utc::now());
                u.apply(UnitEvent::PushFinished).map(|_| ())
            })
            .await
        {
            return Outcome::Fatal(e.to_string());
        }

        signals.progress(format!("{image}: finished pushing image to registry"));
        if let Some(progress) = self.registry.read().await.progress() {
            signals.progress(progress.to_string());
        }
        Outcome::Pushed
    }

    /// Mutate one unit under the registry write lock.
    async fn update<F>(&self, name: &str, f: F) -> Result<(), CoreError>
    where
        F: FnOnce(&mut WorkUnit) -> Result<(), CoreError>,
    {
        let mut registry = self.registry.write().await;
        let unit = registry
            .get_mut(name)
            .ok_or_else(|| CoreError::UnitNotFound(name.to_string()))?;
        f(unit)
    }
}
