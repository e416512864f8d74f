//! `runwright run --mode status`.

use chrono::Utc;
use runwright::errors::{RunError, StateError};
use runwright::layout::RunLayout;
use runwright::lock::LockSettings;
use runwright::status;

pub fn cmd_status(
    layout: &RunLayout,
    run_id: &str,
    lock_settings: LockSettings,
    json: bool,
) -> Result<(), RunError> {
    let report = status::collect(layout, run_id, lock_settings, Utc::now())?;

    if json {
        let encoded = serde_json::to_string_pretty(&report).map_err(|e| StateError::Corrupt {
            path: layout.root().to_path_buf(),
            line: 0,
            reason: format!("cannot encode status: {e}"),
        })?;
        println!("{encoded}");
        return Ok(());
    }

    println!("{}", console::style("Run Status").bold().cyan());
    print!("{}", report.render());
    Ok(())
}
