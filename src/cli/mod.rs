pub mod capture;
pub mod doctor;
pub mod maintenance;
pub mod search;
pub mod serve;
pub mod session;
pub mod stats;

use anyhow::{Context, Result};
use cairn::config::CairnConfig;
use cairn::db::{OpenOptions, Store};

/// Open the configured store, creating and migrating it if needed.
pub fn open_store(config: &CairnConfig) -> Result<Store> {
    let db_path = config.resolved_db_path();
    Store::open(&db_path, &OpenOptions::from(&config.storage))
        .with_context(|| format!("failed to open database at {}", db_path.display()))
}
