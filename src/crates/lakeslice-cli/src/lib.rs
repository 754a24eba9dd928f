//! # lakeslice-cli
//!
//! Command-line front end for lakeslice: layered TOML configuration, logging
//! setup, YAML fixture catalogs and a JSON / JSON-lines file writer around
//! the sync orchestrator.

pub mod app;
pub mod catalog;
pub mod config;
pub mod logging;
pub mod writer;

pub use app::App;
pub use catalog::Catalog;
pub use config::{ConfigLoader, LakesliceConfig};
pub use writer::FileWriter;
