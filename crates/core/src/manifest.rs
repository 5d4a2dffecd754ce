//! Rendering of the manifest generator's inputs.
//!
//! The templating engine consumes two files written into the build
//! directory: a variables file describing the deployment and every unit,
//! and an entrypoint playbook that applies the manifest role to them.

use std::fmt::Write;

use crate::catalog::UnitConfig;

/// Name of the variables file inside the build directory.
pub const VARS_FILE: &str = "manifest-vars.yml";

/// Name of the entrypoint playbook inside the build directory.
pub const ENTRYPOINT_FILE: &str = "generate_manifests.yml";

/// Secret entries with this prefix carry the license text.
const LICENSE_SECRET_PREFIX: &str = "setinit_text_enc";

/// Deployment-wide values written into the variables file.
#[derive(Debug, Clone)]
pub struct ManifestContext {
    pub namespace: String,
    pub virtual_host: String,
    pub tag: String,
    pub base_image: String,
    pub registry_url: String,
    /// License text appended to license-bearing secret entries.
    pub license: String,
}

/// Render `manifest-vars.yml` for the given units.
pub fn render_vars<'a, I>(ctx: &ManifestContext, units: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a UnitConfig)>,
{
    let mut out = String::new();
    let _ = write!(
        out,
        "\
SECURE_CONSUL: false
TLS_ENABLED: false
SAS_K8S_NAMESPACE: {ns}
SAS_K8S_INGRESS_PATH: {host}
SAS_K8S_INGRESS_DOMAIN: {host}
CAS_VIRTUAL_HOST: {host}
docker_tag: {tag}
SAS_MANIFEST_DIR: manifests/
DEPLOYMENT_LABEL: sas-viya
DISABLE_CONSUL_HTTP_PORT: false
sas_cas_mode: \"{{{{ cas_mode | default('smp') }}}}\"
orchestration_root: /ansible/roles/
METAREPO_CERT_DIR: /ansible
SAS_CONFIG_ROOT: /opt/sas/viya/home/

settings:
  base: {base}
  project_name: sas-viya
  k8s_namespace:
    name: {ns}

services:
",
        ns = ctx.namespace,
        host = ctx.virtual_host,
        tag = ctx.tag,
        base = ctx.base_image,
    );

    for (name, config) in units {
        out.push_str(&render_unit(name, config, &ctx.license));
        out.push('\n');
    }

    let _ = write!(
        out,
        "registries:\n  docker-registry:\n    url: {}\n    namespace: {}\n",
        ctx.registry_url, ctx.namespace
    );
    out
}

fn render_unit(name: &str, config: &UnitConfig, license: &str) -> String {
    let mut out = format!("  {name}:\n");
    push_list(&mut out, "ports", config.ports.iter().cloned());
    push_list(&mut out, "environment", config.environment.iter().cloned());
    push_list(
        &mut out,
        "secrets",
        config.secrets.iter().map(|item| {
            if item.to_lowercase().starts_with(LICENSE_SECRET_PREFIX) {
                format!("{item}{license}")
            } else {
                item.clone()
            }
        }),
    );
    push_list(&mut out, "volumes", config.volumes.iter().cloned());

    if !config.resources.is_empty() {
        out.push_str("    resources:\n");
        push_list_indented(&mut out, "limits", &config.resources.limits);
        push_list_indented(&mut out, "requests", &config.resources.requests);
    }
    out
}

fn push_list(out: &mut String, key: &str, items: impl Iterator<Item = String>) {
    let items: Vec<String> = items.collect();
    if items.is_empty() {
        let _ = writeln!(out, "    {key}: []");
        return;
    }
    let _ = writeln!(out, "    {key}:");
    for item in items {
        let _ = writeln!(out, "    - {item}");
    }
}

fn push_list_indented(out: &mut String, key: &str, items: &[String]) {
    if items.is_empty() {
        let _ = writeln!(out, "      {key}: []");
        return;
    }
    let _ = writeln!(out, "      {key}:");
    for item in items {
        let _ = writeln!(out, "      - {item}");
    }
}

/// Render the entrypoint playbook that drives manifest generation.
///
/// `roles_dir` is the directory holding `static-roles-<type>/`, relative to
/// the build directory.
pub fn render_entrypoint(roles_dir: &str, deployment_type: &str) -> String {
    format!(
        "\
# Manifests can be re-generated without re-building:
# 1. Edit values in the '{VARS_FILE}' file.
# 2. Run 'ansible-playbook {ENTRYPOINT_FILE}'.
# 3. Navigate to 'manifests/kubernetes/' to find the new deployment files.
#
# DO NOT EDIT - This playbook is generated by the build.
---
- name: Generate manifests on the build machine
  hosts: 127.0.0.1
  connection: local

  vars:

  vars_files:
  - {VARS_FILE}

  roles:
  - {roles_dir}/static-roles-{deployment_type}/manifests
...
"
    )
}

#[cfg(test)]
mod tests {
    use crate::catalog::Resources;

    use super::*;

    fn ctx() -> ManifestContext {
        ManifestContext {
            namespace: "team".into(),
            virtual_host: "viya.example.com".into(),
            tag: "19.0.4-2019-03-18-09-49-38".into(),
            base_image: "centos:7".into(),
            registry_url: "registry.example.com".into(),
            license: "LICENSE".into(),
        }
    }

    #[test]
    fn vars_contain_deployment_values() {
        let vars = render_vars(&ctx(), std::iter::empty());
        assert!(vars.contains("SAS_K8S_NAMESPACE: team\n"));
        assert!(vars.contains("CAS_VIRTUAL_HOST: viya.example.com\n"));
        assert!(vars.contains("docker_tag: 19.0.4-2019-03-18-09-49-38\n"));
        assert!(vars.contains("sas_cas_mode: \"{{ cas_mode | default('smp') }}\""));
        assert!(vars.ends_with("    url: registry.example.com\n    namespace: team\n"));
    }

    #[test]
    fn unit_sections_list_declarations() {
        let config = UnitConfig {
            ports: vec!["80:80".into()],
            environment: vec![],
            secrets: vec!["SETINIT_TEXT_ENC=".into(), "OTHER=1".into()],
            roles: vec![],
            volumes: vec!["log:/var/log".into()],
            resources: Resources::default(),
        };
        let vars = render_vars(&ctx(), [("httpproxy", &config)]);
        assert!(vars.contains("  httpproxy:\n    ports:\n    - 80:80\n"));
        assert!(vars.contains("    environment: []\n"));
        assert!(vars.contains("    - SETINIT_TEXT_ENC=LICENSE\n"));
        assert!(vars.contains("    - OTHER=1\n"));
        assert!(vars.contains("    volumes:\n    - log:/var/log\n"));
        assert!(!vars.contains("resources:"));
    }

    #[test]
    fn resources_rendered_when_present() {
        let config = UnitConfig {
            resources: Resources {
                limits: vec!["memory: 2Gi".into()],
                requests: vec![],
            },
            ..UnitConfig::default()
        };
        let vars = render_vars(&ctx(), [("cas", &config)]);
        assert!(vars.contains("    resources:\n      limits:\n      - memory: 2Gi\n      requests: []\n"));
    }

    #[test]
    fn entrypoint_references_deployment_roles() {
        let playbook = render_entrypoint("../../util", "full");
        assert!(playbook.contains("  - ../../util/static-roles-full/manifests\n"));
        assert!(playbook.contains("  - manifest-vars.yml\n"));
    }
}
