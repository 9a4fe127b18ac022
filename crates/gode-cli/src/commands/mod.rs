//! Command implementations

pub mod plugins;
pub mod resolve;
pub mod run;
