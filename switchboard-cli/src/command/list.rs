use std::path::Path;

use anyhow::Result;

use crate::command::open_store;

#[derive(Debug, clap::Args)]
pub struct Args {}

pub async fn execute(_args: &Args, data_dir: &Path) -> Result<()> {
    let store = open_store(data_dir).await?;
    let environments = store.environments();
    if environments.is_empty() {
        println!("No environments saved yet. Add one with 'switchboard add <label> <url>'.");
        return Ok(());
    }

    let active_id = store.active_selection().environment_id;
    for record in environments {
        let marker = if active_id.as_deref() == Some(record.id.as_str()) {
            "*"
        } else {
            " "
        };
        println!("{marker} {}  {}  {}", record.id, record.label, record.url);
    }
    Ok(())
}
