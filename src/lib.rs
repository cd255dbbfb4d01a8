// Public API - data types, probing and export functions
pub mod config;
pub mod error;
pub mod export;
pub mod logging;
pub mod lookup;
pub mod probe;
pub mod state;
pub mod trace;

pub mod cli;
