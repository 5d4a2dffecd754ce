//! Inventory parsing.
//!
//! The descriptor generator writes an INI-style inventory whose
//! `[sas-all:children]` section lists one host group per line. Every
//! group except a few placeholders becomes one work unit.

use crate::error::CoreError;

/// Group whose children enumerate the buildable units.
pub const UNIT_GROUP: &str = "sas-all";

/// Group names that never become units.
pub const IGNORED_GROUPS: [&str; 5] = [
    "all",
    "sas-all",
    "CommandLine",
    "sas-casserver-secondary",
    "sas-casserver-worker",
];

/// Extract unit names from the children section of `group`.
///
/// The last matching section header wins. The section ends at the next
/// `[...]` header or at the end of the text. Names are trimmed and
/// lower-cased; duplicates keep their first position.
pub fn parse_unit_names(inventory: &str, group: &str) -> Result<Vec<String>, CoreError> {
    let header = format!("[{group}:children]");
    let lines: Vec<&str> = inventory.lines().collect();

    let start = lines
        .iter()
        .rposition(|line| line.trim() == header)
        .ok_or_else(|| {
            CoreError::Inventory(format!("cannot find inventory section {header} with unit names"))
        })?;

    let mut names: Vec<String> = Vec::new();
    for line in &lines[start + 1..] {
        let line = line.trim();
        if line.starts_with('[') {
            break;
        }
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if IGNORED_GROUPS.contains(&line) {
            continue;
        }
        let name = line.to_lowercase();
        if !names.contains(&name) {
            names.push(name);
        }
    }

    Ok(names)
}
