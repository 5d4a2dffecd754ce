//! Reading the licensing archive.
//!
//! The archive holds the license text, the CA certificate, the entitlement
//! certificate and an order descriptor. The first three are required.

use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum LicenseError {
    #[error("cannot open licensing archive {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot read licensing archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("cannot read archive entry {name}: {source}")]
    Entry {
        name: String,
        source: std::io::Error,
    },

    #[error("invalid order descriptor in {name}: {source}")]
    Order {
        name: String,
        source: serde_json::Error,
    },

    #[error("Unable to parse all content from the licensing archive; missing: {}", .0.join(", "))]
    Incomplete(Vec<&'static str>),
}

/// Order metadata from `order.oom`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OrderMetadata {
    #[serde(rename = "oomFormatVersion", default)]
    pub format_version: String,
    #[serde(rename = "metaRepo", default)]
    pub meta_repo: MetaRepo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MetaRepo {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub rpm: String,
    #[serde(default)]
    pub orderables: Vec<String>,
}

/// Secret material extracted from the archive.
#[derive(Clone, Default)]
pub struct LicenseMaterial {
    pub license: Vec<u8>,
    pub ca_certificate: Vec<u8>,
    pub entitlement: Vec<u8>,
    pub order: Option<OrderMetadata>,
}

// Keeps certificate bytes out of logs.
impl std::fmt::Debug for LicenseMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicenseMaterial")
            .field("license", &format_args!("{} bytes", self.license.len()))
            .field("ca_certificate", &format_args!("{} bytes", self.ca_certificate.len()))
            .field("entitlement", &format_args!("{} bytes", self.entitlement.len()))
            .field("order", &self.order)
            .finish()
    }
}

impl LicenseMaterial {
    /// License text as a string, lossy on invalid UTF-8.
    pub fn license_text(&self) -> String {
        String::from_utf8_lossy(&self.license).trim().to_string()
    }
}

/// Read the archive at `path`.
///
/// Blocking; call from `spawn_blocking` inside async code.
pub fn read_license_archive(path: &Path) -> Result<LicenseMaterial, LicenseError> {
    let file = std::fs::File::open(path).map_err(|source| LicenseError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut material = LicenseMaterial::default();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .map_err(|source| LicenseError::Entry {
                name: name.clone(),
                source,
            })?;

        if name.contains("license") {
            material.license = bytes;
        } else if name.contains("SAS_CA_Certificate.pem") {
            material.ca_certificate = bytes;
        } else if name.contains("entitlement_certificate.pem") {
            material.entitlement = bytes;
        } else if name.contains("order.oom") {
            let order = serde_json::from_slice(&bytes)
                .map_err(|source| LicenseError::Order { name, source })?;
            material.order = Some(order);
        }
    }

    let mut missing = Vec::new();
    if material.license.is_empty() {
        missing.push("license");
    }
    if material.ca_certificate.is_empty() {
        missing.push("CA certificate");
    }
    if material.entitlement.is_empty() {
        missing.push("entitlement certificate");
    }
    if !missing.is_empty() {
        return Err(LicenseError::Incomplete(missing));
    }

    Ok(material)
}


#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::test_support::write_archive;
    use super::*;

    const ORDER: &str = r#"{
        "oomFormatVersion": "1.0",
        "metaRepo": { "url": "https://ses.sas.download/ses/", "rpm": "sas-meta-repo", "orderables": ["a", "b"] }
    }"#;

    #[test]
    fn reads_all_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("order.zip");
        write_archive(
            &path,
            &[
                ("SASViyaV0300_license/license.txt", "LICENSE-TEXT\n"),
                ("SASViyaV0300_certs/SAS_CA_Certificate.pem", "CA"),
                ("SASViyaV0300_certs/entitlement_certificate.pem", "ENT"),
                ("order.oom", ORDER),
            ],
        );

        let material = read_license_archive(&path).expect("read");
        assert_eq!(material.license_text(), "LICENSE-TEXT");
        assert_eq!(material.ca_certificate, b"CA");
        assert_eq!(material.entitlement, b"ENT");
        let order = material.order.expect("order metadata");
        assert_eq!(order.format_version, "1.0");
        assert_eq!(order.meta_repo.orderables, vec!["a", "b"]);
    }

    #[test]
    fn missing_certificates_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("order.zip");
        write_archive(&path, &[("license.txt", "LICENSE")]);

        let err = read_license_archive(&path).unwrap_err();
        assert_matches!(&err, LicenseError::Incomplete(missing) if missing.len() == 2);
        assert!(err.to_string().contains("entitlement certificate"));
    }

    #[test]
    fn missing_archive_is_open_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_matches!(
            read_license_archive(&dir.path().join("absent.zip")),
            Err(LicenseError::Open { .. })
        );
    }

    #[test]
    fn debug_hides_secret_bytes() {
        let material = LicenseMaterial {
            license: b"SECRET".to_vec(),
            ..Default::default()
        };
        let rendered = format!("{material:?}");
        assert!(!rendered.contains("SECRET"));
        assert!(rendered.contains("6 bytes"));
    }
}
