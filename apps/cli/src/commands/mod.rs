//! Command implementations for the Forge CLI.

pub mod defaults;
pub mod models;
pub mod train;
pub mod types;
