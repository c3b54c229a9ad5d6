use std::path::Path;

use anyhow::Result;

use crate::command::{DATA_FILE_NAME, open_store};

#[derive(Debug, clap::Args)]
pub struct Args {}

pub async fn execute(_args: &Args, data_dir: &Path) -> Result<()> {
    let store = open_store(data_dir).await?;
    let selection = store.active_selection();

    match selection.url {
        Some(url) => {
            println!("Forwarding to: {url}");
            match selection.environment_id.and_then(|id| store.environment(&id)) {
                Some(record) => println!("Environment:   {} ({})", record.label, record.id),
                None => println!("Environment:   ad-hoc URL (no saved record)"),
            }
        }
        None => {
            println!("No environment selected; the proxy answers 503.");
            println!();
            println!("Run 'switchboard switch <id-or-url>' or open the admin UI.");
        }
    }

    println!();
    println!("Environments: {}", store.environments().len());
    println!("State file:   {}", data_dir.join(DATA_FILE_NAME).display());
    Ok(())
}
