//! Image naming, tags, and list-argument parsing.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::CoreError;
use crate::types::Timestamp;

/// Recipe version, formatted `<year>.<week>.<month>`.
pub const RECIPE_VERSION: &str = "19.0.4";

/// Prefix applied to every unit name when forming an image name.
pub const IMAGE_NAME_PREFIX: &str = "sas-viya-";

/// Characters permitted in a tag override: letters, digits, `_`, `.` and `-`,
/// never ending on a separator.
const TAG_PATTERN: &str = r"^[_A-Za-z0-9]*((-|\.)*[_A-Za-z0-9])*$";

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(TAG_PATTERN).expect("valid regex"));

/// Timestamp component used in build directory names and default tags.
pub fn timestamp_tag(at: Timestamp) -> String {
    at.format("%Y-%m-%d-%H-%M-%S").to_string()
}

/// Default tag: `<recipe version>-<timestamp>`.
pub fn default_tag(at: Timestamp) -> String {
    format!("{RECIPE_VERSION}-{}", timestamp_tag(at))
}

/// Validate a user-supplied tag override.
pub fn validate_tag(tag: &str) -> Result<(), CoreError> {
    if tag.is_empty() || TAG_RE.is_match(tag) {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "Tag '{tag}' contains invalid characters. It may contain only A-Z, a-z, 0-9, _, ., or -"
        )))
    }
}

/// Full image reference for a unit: `<registry>/<namespace>/sas-viya-<name>:<tag>`.
pub fn image_reference(registry: &str, namespace: &str, unit: &str, tag: &str) -> String {
    let registry = registry
        .trim_start_matches("https://")
        .trim_end_matches('/');
    format!("{registry}/{namespace}/{IMAGE_NAME_PREFIX}{unit}:{tag}")
}

/// Package platform implied by the base image.
pub fn platform_for_base_image(base_image: &str) -> &'static str {
    if base_image.contains("opensuse") {
        "suse"
    } else {
        "redhat"
    }
}

/// Split a list argument on spaces or commas, whichever yields more items.
///
/// Blank items are dropped, so `"a, b"` and `"a  b"` both give two names.
pub fn split_list(input: &str) -> Vec<String> {
    let input = input.trim();
    if input.is_empty() {
        return Vec::new();
    }

    let by_space: Vec<&str> = input.split(' ').collect();
    let by_comma: Vec<&str> = input.split(',').collect();
    let chosen = if by_space.len() < by_comma.len() {
        by_comma
    } else {
        by_space
    };

    chosen
        .into_iter()
        .map(|s| s.trim().trim_matches(',').trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Human-readable image size, in decimal gigabytes.
pub fn bytes_to_gb(bytes: u64) -> String {
    format!("{:.2} GB", bytes as f64 / 1_000_000_000.0)
}
