//! Single-image batches.
//!
//! A `single` deployment builds one programming-only image directly: no
//! registry, no inclusion filter, no manifests, no push.

use std::path::{Path, PathBuf};

use recipes_core::{CoreError, UnitEvent, WorkUnit};
use recipes_docker::{is_step_line, BuildRequest, EngineError, ImageEngine};
use tokio_util::sync::CancellationToken;

use crate::config::BuildConfig;
use crate::prepare::{build_args, context_dir, DOCKERFILE};

/// Name of the single image.
pub const SOLO_UNIT: &str = "single-programming-only";

/// Resource directory inside the util directory.
pub const SOLO_RESOURCES: &str = "programming-only-single";

/// Files copied from the resource directory into the build context.
const RESOURCE_FILES: [&str; 3] = ["vars_usermods.yml", "entrypoint", DOCKERFILE];

/// Name the licensing archive gets inside the build context.
const CONTEXT_ARCHIVE: &str = "SAS_Viya_deployment_data.zip";

#[derive(Debug, thiserror::Error)]
pub enum SoloError {
    #[error("cannot copy {from} into the build context: {source}")]
    Copy {
        from: PathBuf,
        source: std::io::Error,
    },

    #[error("{image} container build {source}")]
    Build { image: String, source: EngineError },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("cancelled")]
    Cancelled,
}

/// Reference the single image is tagged with.
pub fn solo_image(config: &BuildConfig) -> String {
    format!("{SOLO_UNIT}:{}", config.tag)
}

/// Prepare the context, build the image and measure it.
///
/// Returns the unit in `Built` status with its size and timings recorded.
pub async fn build_solo(
    config: &BuildConfig,
    engine: &dyn ImageEngine,
    cert_base_url: &str,
    cancel: &CancellationToken,
) -> Result<WorkUnit, SoloError> {
    let mut unit = WorkUnit::new(SOLO_UNIT, &config.base_image, &config.tag);
    unit.apply(UnitEvent::PrebuildStarted)?;

    let dir = context_dir(&config.build_dir(), SOLO_UNIT);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|source| SoloError::Copy {
            from: dir.clone(),
            source,
        })?;
    let resources = config.util_dir.join(SOLO_RESOURCES);
    for file in RESOURCE_FILES {
        copy_into(&resources.join(file), &dir.join(file)).await?;
    }
    copy_into(&config.zip_path, &dir.join(CONTEXT_ARCHIVE)).await?;

    unit.build_args = build_args(config, SOLO_UNIT, cert_base_url);
    unit.apply(UnitEvent::PrebuildFinished)?;

    let image = solo_image(config);
    let request = BuildRequest {
        context_dir: dir,
        dockerfile: DOCKERFILE.to_string(),
        image: image.clone(),
        build_args: unit.build_args.clone(),
    };

    unit.apply(UnitEvent::BuildStarted)?;
    unit.timings.build_start = Some(chrono::Utc::now());
    tracing::info!(image = %image, "Starting single image build ... (this may take several minutes)");

    let verbose = config.verbose;
    let log = |line: String| {
        if verbose || is_step_line(&line) {
            tracing::info!(unit = SOLO_UNIT, "{line}");
        }
    };
    let built = tokio::select! {
        _ = cancel.cancelled() => Err(SoloError::Cancelled),
        result = engine.build(&request, &log) => result.map_err(|source| SoloError::Build {
            image: image.clone(),
            source,
        }),
    };
    if let Err(e) = built {
        unit.mark_failed();
        return Err(e);
    }
    unit.timings.build_end = Some(chrono::Utc::now());
    unit.apply(UnitEvent::BuildFinished)?;

    unit.image_size = match engine.image_size(&image).await {
        Ok(size) => size,
        Err(e) => {
            tracing::warn!(image = %image, error = %e, "Unable to query image size");
            0
        }
    };
    Ok(unit)
}

async fn copy_into(from: &Path, to: &Path) -> Result<(), SoloError> {
    tokio::fs::copy(from, to)
        .await
        .map(|_| ())
        .map_err(|source| SoloError::Copy {
            from: from.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use recipes_docker::{LogSink, RegistryAuth};

    use super::*;

    struct NoEngine;

    #[async_trait]
    impl ImageEngine for NoEngine {
        async fn ping(&self) -> Result<(), EngineError> {
            Ok(())
        }
        async fn pull(&self, _: &str) -> Result<(), EngineError> {
            Ok(())
        }
        async fn build(&self, _: &BuildRequest, _: LogSink<'_>) -> Result<(), EngineError> {
            panic!("build must not run without a context");
        }
        async fn image_size(&self, _: &str) -> Result<u64, EngineError> {
            Ok(0)
        }
        async fn push(&self, _: &str, _: &RegistryAuth) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn config(root: &Path) -> BuildConfig {
        let env = HashMap::from([
            ("RECIPES_ZIP", root.join("order.zip").display().to_string()),
            ("RECIPES_TAG", "t1".to_string()),
            ("RECIPES_BUILDS_DIR", root.join("builds").display().to_string()),
            ("RECIPES_UTIL_DIR", root.join("util").display().to_string()),
        ]);
        BuildConfig::from_lookup(|key| env.get(key).cloned(), chrono::Utc::now()).expect("config")
    }

    #[test]
    fn image_is_tagged_with_batch_tag() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(solo_image(&config(dir.path())), "single-programming-only:t1");
    }

    #[tokio::test]
    async fn missing_resources_fail_before_building() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = build_solo(&config(dir.path()), &NoEngine, "http://h:1", &CancellationToken::new()).await;
        assert_matches!(result, Err(SoloError::Copy { from, .. }) if from.ends_with("vars_usermods.yml"));
    }
}
