use std::path::Path;

use anyhow::Result;

use crate::command::open_store;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Display name for the environment
    label: String,

    /// Backend URL, e.g. http://localhost:4000 or https://staging.example.com/app
    url: String,
}

pub async fn execute(args: &Args, data_dir: &Path) -> Result<()> {
    let store = open_store(data_dir).await?;
    let record = store.add_environment(&args.label, &args.url).await?;
    println!("Added environment '{}' ({})", record.label, record.id);
    println!("  URL: {}", record.url);
    Ok(())
}
