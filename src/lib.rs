pub mod collaborators;
pub mod facts;
pub mod features;
pub mod fusion;
pub mod imaging;
pub mod orchestrator;
pub mod planner;
pub mod prompt;
pub mod routing;
pub mod runlog;
pub mod scoring;
pub mod settings;
pub mod worker;

use std::path::PathBuf;

/// App root used when `--app-root` is not given: the crate directory, which
/// holds `config/` and the optional `.env`.
pub fn default_app_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}
