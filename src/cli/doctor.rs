//! CLI `doctor` command: run database diagnostics and print a health report.

use anyhow::{Context, Result};

use cairn::config::CairnConfig;

/// Run database diagnostics and print a health report.
pub fn doctor(config: &CairnConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Run `cairn capture` or `cairn serve` to initialize.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    let store = super::open_store(config).context("failed to open database (may be corrupt)")?;
    let report = store.health().context("failed to run health check")?;
    let migration = store.migration_report().clone();
    store.close();

    println!("Cairn Health Report");
    println!("===================");
    println!();
    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Journal mode:      {}", report.journal_mode);
    println!("Applied versions:  {:?}", report.applied_versions);
    if !report.pending_versions.is_empty() {
        println!("Pending versions:  {:?}", report.pending_versions);
    }
    if !migration.applied.is_empty() {
        println!("Applied this open: {:?}", migration.applied);
    }
    match &report.capabilities.vector_version {
        Some(version) => println!("sqlite-vec:        {version}"),
        None if config.storage.vector_extension => {
            println!("sqlite-vec:        unavailable (keyword-only search)")
        }
        None => println!("sqlite-vec:        disabled by config"),
    }
    println!();
    println!("Row counts:");
    println!("  Observations:    {}", report.observation_count);
    println!("  Tools:           {}", report.tool_count);
    println!();
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED ({})", report.integrity_details);
        println!();
        println!("Recovery steps:");
        println!("  1. Stop `cairn serve` and restore from a backup copy of the database.");
        println!("  2. If only the search index is damaged, run `cairn rebuild-index`.");
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
