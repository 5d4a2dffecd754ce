//! The batch-wide unit registry and its inclusion filter.

use std::collections::BTreeMap;

use crate::error::CoreError;
use crate::progress::ProgressSummary;
use crate::status::{Status, UnitEvent};
use crate::unit::WorkUnit;

/// Every unit of one batch, keyed by name.
///
/// Built once from the inventory; no unit is added or removed afterwards.
#[derive(Debug, Clone, Default)]
pub struct UnitRegistry {
    units: BTreeMap<String, WorkUnit>,
}

impl UnitRegistry {
    /// Create one `Unknown` unit per name, all sharing `base_image` and `tag`.
    pub fn from_names<I, S>(names: I, base_image: &str, tag: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let units = names
            .into_iter()
            .map(|name| {
                let name = name.as_ref().trim().to_lowercase();
                (name.clone(), WorkUnit::new(name, base_image, tag))
            })
            .collect();
        Self { units }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&WorkUnit> {
        self.units.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut WorkUnit> {
        self.units.get_mut(name)
    }

    pub fn units(&self) -> impl Iterator<Item = &WorkUnit> {
        self.units.values()
    }

    /// Apply `event` to the named unit.
    pub fn apply(&mut self, name: &str, event: UnitEvent) -> Result<Status, CoreError> {
        self.units
            .get_mut(name)
            .ok_or_else(|| CoreError::UnitNotFound(name.to_string()))?
            .apply(event)
    }

    /// Restrict the batch to the names in `filter`.
    ///
    /// Matching is case-insensitive and ignores surrounding whitespace. Every
    /// unit not named is moved to `DoNotBuild`. A name that matches no unit
    /// is a configuration error, and in that case nothing is changed.
    ///
    /// Returns the number of units left to build. An empty filter keeps
    /// every unit.
    pub fn apply_filter<S: AsRef<str>>(&mut self, filter: &[S]) -> Result<usize, CoreError> {
        if filter.is_empty() {
            return Ok(self.len());
        }

        let mut wanted: Vec<String> = Vec::new();
        for name in filter {
            let name = name.as_ref().trim().to_lowercase();
            if !name.is_empty() && !wanted.contains(&name) {
                wanted.push(name);
            }
        }

        let missing: Vec<&str> = wanted
            .iter()
            .filter(|name| !self.units.contains_key(name.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(CoreError::Validation(format!(
                "One or more of the chosen build-only units do not exist: {}",
                missing.join(", ")
            )));
        }

        for unit in self.units.values_mut() {
            if !wanted.contains(&unit.name) {
                unit.apply(UnitEvent::Excluded)?;
            }
        }

        Ok(wanted.len())
    }

    /// Names of units currently in `status`, in name order.
    pub fn names_with(&self, status: Status) -> Vec<String> {
        self.units
            .values()
            .filter(|unit| unit.status() == status)
            .map(|unit| unit.name.clone())
            .collect()
    }

    pub fn count_with(&self, status: Status) -> usize {
        self.units.values().filter(|unit| unit.status() == status).count()
    }

    /// Names of every unit the filter kept.
    pub fn selected_names(&self) -> Vec<String> {
        self.units
            .values()
            .filter(|unit| unit.status() != Status::DoNotBuild)
            .map(|unit| unit.name.clone())
            .collect()
    }

    /// Intermediate progress across the selected units.
    pub fn progress(&self) -> Option<ProgressSummary> {
        ProgressSummary::compute(self.units.values().map(|u| (u.name.as_str(), u.status())))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn registry(names: &[&str]) -> UnitRegistry {
        UnitRegistry::from_names(names.iter().copied(), "centos:7", "t1")
    }

    #[test]
    fn names_are_normalised() {
        let reg = registry(&["Consul", " httpproxy "]);
        assert!(reg.get("consul").is_some());
        assert!(reg.get("httpproxy").is_some());
        assert_eq!(reg.count_with(Status::Unknown), 2);
    }

    #[test]
    fn empty_filter_keeps_everything() {
        let mut reg = registry(&["a", "b", "c"]);
        let empty: [&str; 0] = [];
        assert_eq!(reg.apply_filter(&empty).expect("filter"), 3);
        assert_eq!(reg.count_with(Status::DoNotBuild), 0);
    }

    #[test]
    fn filter_of_k_leaves_k_selected() {
        let mut reg = registry(&["a", "b", "c", "d", "e"]);
        let kept = reg.apply_filter(&["B", " d"]).expect("filter");
        assert_eq!(kept, 2);
        assert_eq!(reg.selected_names(), vec!["b", "d"]);
        assert_eq!(reg.count_with(Status::DoNotBuild), 3);
    }

    #[test]
    fn duplicate_filter_names_count_once() {
        let mut reg = registry(&["a", "b"]);
        assert_eq!(reg.apply_filter(&["a", "A"]).expect("filter"), 1);
        assert_eq!(reg.count_with(Status::DoNotBuild), 1);
    }

    #[test]
    fn unknown_filter_name_is_error_and_changes_nothing() {
        let mut reg = registry(&["a", "b"]);
        let err = reg.apply_filter(&["a", "zzz"]).unwrap_err();
        assert_matches!(err, CoreError::Validation(msg) if msg.contains("zzz"));
        assert_eq!(reg.count_with(Status::DoNotBuild), 0);
    }

    #[test]
    fn apply_unknown_unit_is_error() {
        let mut reg = registry(&["a"]);
        assert_matches!(
            reg.apply("nope", UnitEvent::PrebuildStarted),
            Err(CoreError::UnitNotFound(_))
        );
    }

    #[test]
    fn progress_ignores_excluded_units() {
        let mut reg = registry(&["a", "b", "c"]);
        reg.apply_filter(&["a", "b"]).expect("filter");
        let summary = reg.progress().expect("units remain");
        assert_eq!(summary.total(), 2);
    }
}
