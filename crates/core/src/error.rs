use crate::status::{Status, UnitEvent};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Illegal status transition for '{unit}': {from} on {event}")]
    IllegalTransition {
        unit: String,
        from: Status,
        event: UnitEvent,
    },

    #[error("Unit not found: {0}")]
    UnitNotFound(String),

    #[error("Inventory error: {0}")]
    Inventory(String),

    #[error("Catalog error: {0}")]
    Catalog(String),
}
