use std::path::Path;

use crate::commands::common::{format_run_summary, open_service};
use crate::error::CliError;

pub async fn run_sync(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let service = open_service(db_path).await?;
    let log = service.orchestrator().perform_sync().await;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&log)?);
    } else {
        println!("{}", format_run_summary(&log));
        for error in &log.errors {
            let table = error.table.as_deref().unwrap_or("-");
            println!("  {table}: {}", error.message);
        }
    }
    Ok(())
}
