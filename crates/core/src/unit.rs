//! A single buildable artifact and its metrics.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::catalog::UnitConfig;
use crate::error::CoreError;
use crate::status::{transition, Status, UnitEvent};
use crate::types::Timestamp;

/// Build and publish timings for one unit.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UnitTimings {
    pub build_start: Option<Timestamp>,
    pub build_end: Option<Timestamp>,
    pub push_start: Option<Timestamp>,
    pub push_end: Option<Timestamp>,
}

impl UnitTimings {
    pub fn build_duration(&self) -> Option<Duration> {
        span(self.build_start, self.build_end)
    }

    pub fn push_duration(&self) -> Option<Duration> {
        span(self.push_start, self.push_end)
    }
}

fn span(start: Option<Timestamp>, end: Option<Timestamp>) -> Option<Duration> {
    (end? - start?).to_std().ok()
}

/// One independently buildable and publishable image.
#[derive(Debug, Clone, Serialize)]
pub struct WorkUnit {
    pub name: String,
    pub tag: String,
    status: Status,
    pub base_image: String,
    pub config: UnitConfig,
    pub build_args: BTreeMap<String, String>,
    pub timings: UnitTimings,
    /// Size of the produced image in bytes; `0` when it could not be measured.
    pub image_size: u64,
}

impl WorkUnit {
    pub fn new(name: impl Into<String>, base_image: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
            status: Status::Unknown,
            base_image: base_image.into(),
            config: UnitConfig::default(),
            build_args: BTreeMap::new(),
            timings: UnitTimings::default(),
            image_size: 0,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Move the unit along its lifecycle.
    ///
    /// Illegal moves leave the status untouched and return
    /// [`CoreError::IllegalTransition`].
    pub fn apply(&mut self, event: UnitEvent) -> Result<Status, CoreError> {
        let next = transition(self.status, event).ok_or_else(|| CoreError::IllegalTransition {
            unit: self.name.clone(),
            from: self.status,
            event,
        })?;
        self.status = next;
        Ok(next)
    }

    /// Mark the unit failed unless it already reached a terminal status.
    ///
    /// Returns `true` when the status changed.
    pub fn mark_failed(&mut self) -> bool {
        self.apply(UnitEvent::Failed).is_ok()
    }
}
