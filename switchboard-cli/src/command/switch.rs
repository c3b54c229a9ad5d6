use std::path::Path;

use anyhow::Result;

use crate::command::open_store;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Environment id, or an ad-hoc URL to forward to
    target: String,
}

pub async fn execute(args: &Args, data_dir: &Path) -> Result<()> {
    let store = open_store(data_dir).await?;

    if store.environment(&args.target).is_some() {
        let record = store.set_active_environment_by_id(&args.target).await?;
        println!("Switched to '{}' ({})", record.label, record.url);
    } else {
        let url = store.set_active_environment_url(&args.target).await?;
        println!("Switched to ad-hoc URL {url}");
    }
    Ok(())
}
