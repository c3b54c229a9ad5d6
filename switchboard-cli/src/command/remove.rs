use std::path::Path;

use anyhow::Result;

use crate::command::open_store;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Id of the environment to delete
    id: String,
}

pub async fn execute(args: &Args, data_dir: &Path) -> Result<()> {
    let store = open_store(data_dir).await?;
    let was_active =
        store.active_selection().environment_id.as_deref() == Some(args.id.as_str());
    store.delete_environment(&args.id).await?;
    println!("Deleted environment {}", args.id);
    if was_active {
        println!("The deleted environment was active; the proxy now answers 503.");
    }
    Ok(())
}
