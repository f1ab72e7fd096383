use std::path::Path;

use crate::commands::common::{format_log_lines, load_recent_logs, run_log_to_item, RunLogItem};
use crate::error::CliError;

pub async fn run_logs(limit: usize, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let logs = load_recent_logs(limit, db_path).await?;

    if as_json {
        let json_items = logs.iter().map(run_log_to_item).collect::<Vec<RunLogItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if logs.is_empty() {
        println!("No sync runs recorded.");
        return Ok(());
    }

    for line in format_log_lines(&logs) {
        println!("{line}");
    }
    Ok(())
}
