//! End-of-batch report.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use recipes_core::naming::bytes_to_gb;
use recipes_core::{Status, UnitRegistry, WorkUnit};

use crate::config::{BuildConfig, DeploymentType};

const HEADER_RULE: usize = 23;
const FOOTER_RULE: usize = 79;

/// Final state of one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub name: String,
    pub image: String,
    pub status: Status,
    pub size: u64,
    pub build_time: Option<Duration>,
    pub push_time: Option<Duration>,
}

impl UnitReport {
    fn from_unit(unit: &WorkUnit, image: String) -> Self {
        Self {
            name: unit.name.clone(),
            image,
            status: unit.status(),
            size: unit.image_size,
            build_time: unit.timings.build_duration(),
            push_time: unit.timings.push_duration(),
        }
    }
}

/// What one batch produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub deployment_type: DeploymentType,
    pub elapsed: Duration,
    /// Sum of every measured image size, in bytes.
    pub total_size: u64,
    /// Every unit that was not excluded, in name order.
    pub units: Vec<UnitReport>,
    pub manifests_dir: Option<PathBuf>,
}

impl BatchSummary {
    pub fn from_registry(
        config: &BuildConfig,
        registry: &UnitRegistry,
        elapsed: Duration,
        total_size: u64,
    ) -> Self {
        let units = registry
            .units()
            .filter(|u| u.status() != Status::DoNotBuild)
            .map(|u| UnitReport::from_unit(u, config.image_reference(&u.name, &u.tag)))
            .collect();
        Self {
            deployment_type: config.deployment_type,
            elapsed,
            total_size,
            units,
            manifests_dir: Some(config.manifests_dir()),
        }
    }

    /// Summary of a single-image batch.
    pub fn solo(unit: &WorkUnit, image: String, elapsed: Duration) -> Self {
        Self {
            deployment_type: DeploymentType::Single,
            elapsed,
            total_size: unit.image_size,
            units: vec![UnitReport::from_unit(unit, image)],
            manifests_dir: None,
        }
    }

    pub fn with_status(&self, status: Status) -> impl Iterator<Item = &UnitReport> {
        self.units.iter().filter(move |u| u.status == status)
    }

    pub fn pushed_count(&self) -> usize {
        self.with_status(Status::Pushed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.with_status(Status::Failed).count()
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.deployment_type.is_single() {
            writeln!(f, "\nTotal Elapsed Time: {}", format_duration(self.elapsed))?;
            for unit in &self.units {
                writeln!(f, "Image: {}  Size: {}", unit.image, bytes_to_gb(unit.size))?;
            }
            return Ok(());
        }

        let rule = "-".repeat(HEADER_RULE);
        writeln!(
            f,
            "\n{rule}  Summary  ( {}, {} ) {rule}",
            format_duration(self.elapsed),
            bytes_to_gb(self.total_size)
        )?;
        for unit in self.with_status(Status::Pushed) {
            writeln!(
                f,
                "{}\n\tSize: {}\tBuild Time: {}\tPush Time: {}",
                unit.image,
                bytes_to_gb(unit.size),
                format_optional(unit.build_time),
                format_optional(unit.push_time),
            )?;
        }
        let failed: Vec<&str> = self
            .with_status(Status::Failed)
            .map(|u| u.name.as_str())
            .collect();
        if !failed.is_empty() {
            writeln!(f, "Failed: {}", failed.join(", "))?;
        }
        writeln!(f, "{}", "-".repeat(FOOTER_RULE))?;

        if let Some(dir) = &self.manifests_dir {
            writeln!(
                f,
                "\nKubernetes manifests have been created: `{}/`\n\
                 Use `kubectl create -f <directory>` or `kubectl replace -f <directory>` to deploy.",
                dir.display()
            )?;
        }
        Ok(())
    }
}

fn format_optional(duration: Option<Duration>) -> String {
    duration.map(format_duration).unwrap_or_else(|| "-".into())
}

/// Round to whole seconds and render as `1h2m3s`, `4m0s` or `5s`.
pub fn format_duration(duration: Duration) -> String {
    let total = (duration.as_millis() + 500) / 1000;
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}
