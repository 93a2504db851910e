//! Domain helpers shared by the entity modules.

pub mod ids;
pub mod records;
