use std::path::Path;

use crate::commands::common::{format_review_lines, load_recent_logs, pending_review_items};
use crate::error::CliError;

pub async fn run_conflicts(limit: usize, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let logs = load_recent_logs(limit, db_path).await?;
    let items = pending_review_items(&logs);

    if as_json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if items.is_empty() {
        println!("No conflicts awaiting review.");
        return Ok(());
    }

    for line in format_review_lines(&items) {
        println!("{line}");
    }
    Ok(())
}
