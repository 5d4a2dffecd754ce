//! Shared fakes and fixtures for the pipeline integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeZone;
use recipes_docker::{BuildRequest, CredentialStore, EngineError, ImageEngine, LogSink, RegistryAuth};
use recipes_pipeline::load::{ORCHESTRATION_TOOL, PLAYBOOK_DIR};
use recipes_pipeline::probe::ProbeError;
use recipes_pipeline::solo::SOLO_RESOURCES;
use recipes_pipeline::{BuildConfig, Coordinator, ExternalTool, Invocation, ToolError, ToolOutput, UrlProbe};
use tempfile::TempDir;

pub const REGISTRY: &str = "docker.example.com";
pub const NAMESPACE: &str = "viya";
pub const TAG: &str = "test-tag";

// ---------------------------------------------------------------------------
// Fake image engine
// ---------------------------------------------------------------------------

/// Records builds and pushes; sizes, failures and delays are scripted per
/// unit name (matched against the image reference).
#[derive(Default)]
pub struct FakeEngine {
    pub sizes: HashMap<String, u64>,
    pub failing_builds: HashSet<String>,
    pub failing_pushes: HashSet<String>,
    pub build_delays: HashMap<String, Duration>,
    pub unavailable: bool,
    /// Images whose build began, in start order.
    pub started: Mutex<Vec<String>>,
    pub built: Mutex<Vec<String>>,
    pub pushed: Mutex<Vec<String>>,
    pub pulled: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub fn with_sizes(sizes: &[(&str, u64)]) -> Self {
        Self {
            sizes: sizes.iter().map(|(n, s)| (n.to_string(), *s)).collect(),
            ..Self::default()
        }
    }

    pub fn started(&self) -> Vec<String> {
        let mut started = self.started.lock().expect("lock").clone();
        started.sort();
        started
    }

    pub fn built(&self) -> Vec<String> {
        let mut built = self.built.lock().expect("lock").clone();
        built.sort();
        built
    }

    pub fn pushed(&self) -> Vec<String> {
        let mut pushed = self.pushed.lock().expect("lock").clone();
        pushed.sort();
        pushed
    }

    fn lookup<'a, T>(map: &'a HashMap<String, T>, image: &str) -> Option<&'a T> {
        map.iter().find(|(name, _)| image_names(image, name)).map(|(_, v)| v)
    }
}

/// Whether `image` is the image of unit `name`.
fn image_names(image: &str, name: &str) -> bool {
    let repo = image.rsplit_once(':').map_or(image, |(repo, _)| repo);
    repo.ends_with(&format!("sas-viya-{name}")) || repo == name
}

#[async_trait]
impl ImageEngine for FakeEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        if self.unavailable {
            return Err(EngineError::Unavailable(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "docker not found",
            )));
        }
        Ok(())
    }

    async fn pull(&self, reference: &str) -> Result<(), EngineError> {
        self.pulled.lock().expect("lock").push(reference.to_string());
        Ok(())
    }

    async fn build(&self, request: &BuildRequest, log: LogSink<'_>) -> Result<(), EngineError> {
        self.started.lock().expect("lock").push(request.image.clone());
        log("Step 1/2 : FROM centos:7".to_string());
        log(" ---> 5182e96772bf".to_string());
        if let Some(delay) = Self::lookup(&self.build_delays, &request.image) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing_builds.iter().any(|n| image_names(&request.image, n)) {
            return Err(EngineError::CommandFailed {
                command: "docker build".into(),
                exit_code: Some(1),
                output: "boom".into(),
            });
        }
        self.built.lock().expect("lock").push(request.image.clone());
        Ok(())
    }

    async fn image_size(&self, reference: &str) -> Result<u64, EngineError> {
        Self::lookup(&self.sizes, reference)
            .copied()
            .ok_or_else(|| EngineError::Parse(format!("no size for {reference}")))
    }

    async fn push(&self, reference: &str, _auth: &RegistryAuth) -> Result<(), EngineError> {
        if self.failing_pushes.iter().any(|n| image_names(reference, n)) {
            return Err(EngineError::CommandFailed {
                command: "docker push".into(),
                exit_code: Some(1),
                output: "denied".into(),
            });
        }
        self.pushed.lock().expect("lock").push(reference.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fake external tool
// ---------------------------------------------------------------------------

/// Emulates the orchestration tool, `tar`, `ansible` and `ansible-playbook`.
///
/// Extracting the playbook writes an inventory listing `units`.
pub struct FakeTool {
    pub units: Vec<String>,
    /// Programs (matched by suffix) that exit non-zero.
    pub failing: HashSet<String>,
    pub calls: Mutex<Vec<Invocation>>,
}

impl FakeTool {
    pub fn new(units: &[&str]) -> Self {
        Self {
            units: units.iter().map(|u| u.to_string()).collect(),
            failing: HashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(mut self, program: &str) -> Self {
        self.failing.insert(program.to_string());
        self
    }

    pub fn ran(&self, program: &str) -> bool {
        self.calls
            .lock()
            .expect("lock")
            .iter()
            .any(|c| c.program.ends_with(program))
    }

    fn inventory(&self) -> String {
        let mut text = String::from("[all]\ndeployTarget\n\n[sas-all:children]\n");
        for unit in &self.units {
            text.push_str(unit);
            text.push('\n');
        }
        text.push_str("CommandLine\n\n[CommandLine]\ndeployTarget\n");
        text
    }
}

fn arg_after<'a>(invocation: &'a Invocation, flag: &str) -> Option<&'a str> {
    let pos = invocation.args.iter().position(|a| a == flag)?;
    invocation.args.get(pos + 1).map(String::as_str)
}

#[async_trait]
impl ExternalTool for FakeTool {
    async fn execute(&self, invocation: &Invocation) -> Result<ToolOutput, ToolError> {
        self.calls.lock().expect("lock").push(invocation.clone());

        if self.failing.iter().any(|p| invocation.program.ends_with(p.as_str())) {
            return Err(ToolError::Failed {
                command: invocation.command_line(),
                exit_code: 2,
                output: "scripted failure".into(),
            });
        }

        if invocation.program.ends_with(ORCHESTRATION_TOOL) {
            if let Some(output) = arg_after(invocation, "--output") {
                std::fs::write(output, b"archive").expect("write playbook archive");
            }
        } else if invocation.program == "tar" && invocation.args.iter().any(|a| a == "--extract") {
            let dir = arg_after(invocation, "-C").expect("extract target");
            let playbook = Path::new(dir).join(PLAYBOOK_DIR);
            std::fs::create_dir_all(&playbook).expect("create playbook dir");
            std::fs::write(playbook.join("inventory.ini"), self.inventory()).expect("write inventory");
        }

        Ok(ToolOutput {
            stdout: "ok".into(),
            stderr: String::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Fake URL probe
// ---------------------------------------------------------------------------

/// Answers 200 unless a status is scripted for the URL.
#[derive(Default)]
pub struct FakeProbe {
    pub statuses: HashMap<String, u16>,
    pub probed: Mutex<Vec<String>>,
}

impl FakeProbe {
    pub fn with_status(url: &str, status: u16) -> Self {
        Self {
            statuses: HashMap::from([(url.to_string(), status)]),
            ..Self::default()
        }
    }
}

#[async_trait]
impl UrlProbe for FakeProbe {
    async fn status(&self, url: &str) -> Result<u16, ProbeError> {
        self.probed.lock().expect("lock").push(url.to_string());
        Ok(self.statuses.get(url).copied().unwrap_or(200))
    }

    async fn download(&self, _url: &str, dest: &Path) -> Result<(), ProbeError> {
        std::fs::write(dest, b"tool").expect("write download");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A temporary workspace holding the licensing archive, util directory and
/// Docker credentials.
pub struct Workspace {
    pub dir: TempDir,
    pub config: BuildConfig,
}

impl Workspace {
    /// Workspace for a `full` deployment with `vars` overriding defaults.
    pub fn new(deployment_type: &str, vars: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();

        let zip = root.join("SAS_Viya_deployment_data.zip");
        write_license_archive(&zip);

        let util = root.join("util");
        std::fs::create_dir_all(&util).expect("create util");
        std::fs::write(util.join(ORCHESTRATION_TOOL), b"#!/bin/sh\n").expect("write tool");
        let resources = util.join(SOLO_RESOURCES);
        std::fs::create_dir_all(&resources).expect("create resources");
        for file in ["vars_usermods.yml", "entrypoint", "Dockerfile"] {
            std::fs::write(resources.join(file), file).expect("write resource");
        }

        let mut env: HashMap<String, String> = HashMap::from([
            ("RECIPES_ZIP".into(), zip.display().to_string()),
            ("RECIPES_TYPE".into(), deployment_type.into()),
            ("RECIPES_DOCKER_REGISTRY_URL".into(), REGISTRY.into()),
            ("RECIPES_DOCKER_NAMESPACE".into(), NAMESPACE.into()),
            ("RECIPES_TAG".into(), TAG.into()),
            ("RECIPES_BUILDS_DIR".into(), root.join("builds").display().to_string()),
            ("RECIPES_UTIL_DIR".into(), util.display().to_string()),
            ("RECIPES_CONFIG_FILE".into(), root.join("config.json").display().to_string()),
            ("RECIPES_ADVERTISE_HOST".into(), "127.0.0.1".into()),
            ("RECIPES_DRAIN_TIMEOUT_SECS".into(), "5".into()),
            ("RECIPES_WORKERS".into(), "3".into()),
            ("RECIPES_PREPARE_WORKERS".into(), "2".into()),
        ]);
        for (key, value) in vars {
            env.insert(key.to_string(), value.to_string());
        }

        let started = chrono::Utc
            .with_ymd_and_hms(2019, 5, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp");
        let config = BuildConfig::from_lookup(|key| env.get(key).cloned(), started).expect("valid config");
        std::fs::create_dir_all(config.manifests_dir()).expect("create build dir");

        Self { dir, config }
    }

    pub fn credentials(&self) -> CredentialStore {
        let path = self.dir.path().join("docker-config.json");
        let body = serde_json::json!({ "auths": { (REGISTRY): { "auth": "dXNlcjpwYXNz" } } });
        std::fs::write(&path, body.to_string()).expect("write docker config");
        CredentialStore::new(path)
    }

    pub fn coordinator(&self, engine: Arc<FakeEngine>, tool: Arc<FakeTool>, probe: Arc<FakeProbe>) -> Coordinator {
        Coordinator::new(self.config.clone(), engine, tool, probe, self.credentials())
    }

    pub fn build_dir(&self) -> PathBuf {
        self.config.build_dir()
    }
}

pub fn write_license_archive(path: &Path) {
    let entries = [
        ("SAS_Viya_deployment_data/license/SASViyaV0300_license.jwt", "LICENSE-TEXT"),
        ("SAS_Viya_deployment_data/entitlement-certificates/SAS_CA_Certificate.pem", "CA"),
        ("SAS_Viya_deployment_data/entitlement-certificates/entitlement_certificate.pem", "ENT"),
        (
            "SAS_Viya_deployment_data/order.oom",
            r#"{"oomFormatVersion":"1.0","metaRepo":{"url":"https://ses.example.com/","rpm":"meta","orderables":["x"]}}"#,
        ),
    ];
    let file = std::fs::File::create(path).expect("create archive");
    let mut writer = zip::ZipWriter::new(file);
    for (name, contents) in entries {
        writer
            .start_file(name, zip::write::SimpleFileOptions::default())
            .expect("start entry");
        writer.write_all(contents.as_bytes()).expect("write entry");
    }
    writer.finish().expect("finish archive");
}
