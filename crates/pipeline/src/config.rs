//! Batch configuration loaded from the environment.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use recipes_core::naming::{self, platform_for_base_image, split_list};
use recipes_core::types::Timestamp;

/// Built-in inclusion filter for `multiple` deployments.
pub const MULTIPLE_DEFAULT_BUILD_ONLY: &str = "programming httpproxy sas-casserver-primary";

const DEFAULT_BASE_IMAGE: &str = "centos:7";
const DEFAULT_VIRTUAL_HOST: &str = "myvirtualhost.mycompany.com";
const DEFAULT_QUEUE_CAPACITY: usize = 100;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} is invalid: {message}")]
    Invalid { var: &'static str, message: String },
}

/// Shape of the deployment being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeploymentType {
    /// One programming-only image, built without a registry.
    Single,
    Multiple,
    Full,
}

impl DeploymentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Multiple => "multiple",
            Self::Full => "full",
        }
    }

    pub fn is_single(self) -> bool {
        self == Self::Single
    }
}

impl fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "multiple" => Ok(Self::Multiple),
            "full" => Ok(Self::Full),
            other => Err(format!("'{other}' is not one of single, multiple, full")),
        }
    }
}

/// What a single unit's build or push failure does to the rest of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// The first unit failure aborts the batch and cancels its siblings.
    #[default]
    Abort,
    /// The unit is marked failed; siblings finish and the batch reports a
    /// partial result.
    Isolate,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "isolate" => Ok(Self::Isolate),
            other => Err(format!("'{other}' is not one of abort, isolate")),
        }
    }
}

/// Everything one invocation needs to know.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Licensing archive.
    pub zip_path: PathBuf,
    pub deployment_type: DeploymentType,
    pub base_image: String,
    /// Optional package mirror; empty skips the mirror check.
    pub mirror_url: String,
    pub registry_url: String,
    pub namespace: String,
    pub virtual_host: String,
    pub addons: Vec<String>,
    /// Inclusion filter; empty builds every unit.
    pub build_only: Vec<String>,
    pub tag: String,
    pub workers: usize,
    pub prepare_workers: usize,
    pub queue_capacity: usize,
    pub failure_policy: FailurePolicy,
    /// How long a failed phase waits for its remaining tasks.
    pub drain_timeout: Duration,
    /// Forward every build-log line instead of only step headers.
    pub verbose: bool,
    pub builds_dir: PathBuf,
    /// Orchestration tool, static roles and single-image resources.
    pub util_dir: PathBuf,
    /// Per-unit configuration catalog.
    pub config_file: PathBuf,
    /// Host put into the secret endpoint URL; detected when unset.
    pub advertise_host: Option<String>,
    pub started_at: Timestamp,
}

impl BuildConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default                                 |
    /// |-------------------------------|-----------------------------------------|
    /// | `RECIPES_ZIP`                 | required                                |
    /// | `RECIPES_TYPE`                | `single`                                |
    /// | `RECIPES_BASE_IMAGE`          | `centos:7`                              |
    /// | `RECIPES_MIRROR_URL`          | empty                                   |
    /// | `RECIPES_DOCKER_REGISTRY_URL` | required unless `single`                |
    /// | `RECIPES_DOCKER_NAMESPACE`    | required unless `single`                |
    /// | `RECIPES_VIRTUAL_HOST`        | `myvirtualhost.mycompany.com`           |
    /// | `RECIPES_ADDONS`              | empty                                   |
    /// | `RECIPES_BUILD_ONLY`          | empty (`multiple`: a built-in subset)   |
    /// | `RECIPES_TAG`                 | `<recipe version>-<timestamp>`          |
    /// | `RECIPES_WORKERS`             | available parallelism                   |
    /// | `RECIPES_PREPARE_WORKERS`     | available parallelism                   |
    /// | `RECIPES_QUEUE_CAPACITY`      | `100`                                   |
    /// | `RECIPES_FAILURE_POLICY`      | `abort`                                 |
    /// | `RECIPES_DRAIN_TIMEOUT_SECS`  | `30`                                    |
    /// | `RECIPES_VERBOSE`             | `false`                                 |
    /// | `RECIPES_BUILDS_DIR`          | `builds`                                |
    /// | `RECIPES_UTIL_DIR`            | `util`                                  |
    /// | `RECIPES_CONFIG_FILE`         | `config-<type>.json`                    |
    /// | `RECIPES_ADVERTISE_HOST`      | detected                                |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok(), chrono::Utc::now())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F, started_at: Timestamp) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let zip_path = PathBuf::from(get("RECIPES_ZIP").ok_or(ConfigError::Missing("RECIPES_ZIP"))?);

        let deployment_type: DeploymentType = get("RECIPES_TYPE")
            .unwrap_or_else(|| "single".into())
            .parse()
            .map_err(|message| ConfigError::Invalid {
                var: "RECIPES_TYPE",
                message,
            })?;

        let registry_url = get("RECIPES_DOCKER_REGISTRY_URL").unwrap_or_default();
        let namespace = get("RECIPES_DOCKER_NAMESPACE").unwrap_or_default();
        if !deployment_type.is_single() {
            if namespace.is_empty() {
                return Err(ConfigError::Missing("RECIPES_DOCKER_NAMESPACE"));
            }
            if registry_url.is_empty() {
                return Err(ConfigError::Missing("RECIPES_DOCKER_REGISTRY_URL"));
            }
        }

        let tag = match get("RECIPES_TAG") {
            Some(tag) => {
                naming::validate_tag(&tag).map_err(|e| ConfigError::Invalid {
                    var: "RECIPES_TAG",
                    message: e.to_string(),
                })?;
                tag
            }
            None => naming::default_tag(started_at),
        };

        let build_only = match get("RECIPES_BUILD_ONLY") {
            Some(list) => split_list(&list),
            None if deployment_type == DeploymentType::Multiple => {
                split_list(MULTIPLE_DEFAULT_BUILD_ONLY)
            }
            None => Vec::new(),
        };

        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let workers = parse_workers(get("RECIPES_WORKERS"), "RECIPES_WORKERS", available)?;
        let prepare_workers =
            parse_workers(get("RECIPES_PREPARE_WORKERS"), "RECIPES_PREPARE_WORKERS", available)?;

        let queue_capacity: usize = parse_or("RECIPES_QUEUE_CAPACITY", get("RECIPES_QUEUE_CAPACITY"), DEFAULT_QUEUE_CAPACITY)?;
        if queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                var: "RECIPES_QUEUE_CAPACITY",
                message: "must be at least 1".into(),
            });
        }

        let failure_policy = match get("RECIPES_FAILURE_POLICY") {
            Some(value) => value.parse().map_err(|message| ConfigError::Invalid {
                var: "RECIPES_FAILURE_POLICY",
                message,
            })?,
            None => FailurePolicy::default(),
        };

        let drain_timeout = Duration::from_secs(parse_or(
            "RECIPES_DRAIN_TIMEOUT_SECS",
            get("RECIPES_DRAIN_TIMEOUT_SECS"),
            DEFAULT_DRAIN_TIMEOUT_SECS,
        )?);

        let verbose = parse_or("RECIPES_VERBOSE", get("RECIPES_VERBOSE"), false)?;

        let config_file = get("RECIPES_CONFIG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("config-{deployment_type}.json")));

        Ok(Self {
            zip_path,
            deployment_type,
            base_image: get("RECIPES_BASE_IMAGE").unwrap_or_else(|| DEFAULT_BASE_IMAGE.into()),
            mirror_url: get("RECIPES_MIRROR_URL").unwrap_or_default(),
            registry_url,
            namespace,
            virtual_host: get("RECIPES_VIRTUAL_HOST").unwrap_or_else(|| DEFAULT_VIRTUAL_HOST.into()),
            addons: get("RECIPES_ADDONS").map(|v| split_list(&v)).unwrap_or_default(),
            build_only,
            tag,
            workers,
            prepare_workers,
            queue_capacity,
            failure_policy,
            drain_timeout,
            verbose,
            builds_dir: get("RECIPES_BUILDS_DIR").map(PathBuf::from).unwrap_or_else(|| "builds".into()),
            util_dir: get("RECIPES_UTIL_DIR").map(PathBuf::from).unwrap_or_else(|| "util".into()),
            config_file,
            advertise_host: get("RECIPES_ADVERTISE_HOST"),
            started_at,
        })
    }

    /// `<builds dir>/<type>-<timestamp>/`.
    pub fn build_dir(&self) -> PathBuf {
        self.builds_dir.join(format!(
            "{}-{}",
            self.deployment_type,
            naming::timestamp_tag(self.started_at)
        ))
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.build_dir().join("manifests")
    }

    pub fn log_path(&self) -> PathBuf {
        self.build_dir().join("build.log")
    }

    pub fn platform(&self) -> &'static str {
        platform_for_base_image(&self.base_image)
    }

    /// Full registry reference for a unit.
    pub fn image_reference(&self, unit: &str, tag: &str) -> String {
        naming::image_reference(&self.registry_url, &self.namespace, unit, tag)
    }
}

fn parse_or<T: FromStr>(var: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
            var,
            message: format!("cannot parse '{v}'"),
        }),
        None => Ok(default),
    }
}

/// Worker counts default to the available parallelism and are not capped by it.
fn parse_workers(value: Option<String>, var: &'static str, default: usize) -> Result<usize, ConfigError> {
    let workers = parse_or(var, value, default)?;
    if workers == 0 {
        return Err(ConfigError::Invalid {
            var,
            message: "must be at least 1".into(),
        });
    }
    Ok(workers)
}
