//! Domain model for the container build coordinator.
//!
//! Everything in this crate is pure data and pure functions: the unit
//! lifecycle ([`status`]), the work unit itself ([`unit`]), the batch-wide
//! registry with its inclusion filter ([`registry`]), and the text formats
//! the coordinator reads or writes ([`inventory`], [`manifest`]).

pub mod catalog;
pub mod error;
pub mod inventory;
pub mod manifest;
pub mod naming;
pub mod progress;
pub mod registry;
pub mod status;
pub mod types;
pub mod unit;

pub use error::CoreError;
pub use registry::UnitRegistry;
pub use status::{transition, Status, UnitEvent};
pub use unit::WorkUnit;
