use std::path::Path;

use anyhow::{Context, Result};
use switchboard::store::EnvironmentStore;

pub mod add;
pub mod list;
pub mod remove;
pub mod serve;
pub mod status;
pub mod switch;

/// File name inside the data directory. Kept from earlier releases so an
/// existing state file keeps working.
pub const DATA_FILE_NAME: &str = "targets.json";

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Run the forwarding proxy and the admin UI/API
    Serve(serve::Args),

    /// Show the active selection
    Status(status::Args),

    /// List saved environments
    List(list::Args),

    /// Add a new environment
    Add(add::Args),

    /// Delete an environment
    Remove(remove::Args),

    /// Switch the forwarding target by environment id or ad-hoc URL
    Switch(switch::Args),
}

pub(crate) async fn open_store(data_dir: &Path) -> Result<EnvironmentStore> {
    let store = EnvironmentStore::new(data_dir.join(DATA_FILE_NAME));
    store
        .init()
        .await
        .context("Failed to load environment state")?;
    Ok(store)
}
