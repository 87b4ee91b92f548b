use anyhow::Result;

use cairn::config::CairnConfig;

/// Display store statistics in the terminal.
pub fn stats(config: &CairnConfig, partition: Option<&str>, json: bool) -> Result<()> {
    let db_path = config.resolved_db_path();
    let store = super::open_store(config)?;
    let response = cairn::memory::stats::store_stats(store.conn(), partition, Some(&db_path))?;
    store.close();

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    println!("Store Statistics");
    println!("{}", "=".repeat(40));
    if let Some(partition) = partition {
        println!("  Partition:           {partition}");
    }
    println!("  Total observations:  {}", response.total_observations);
    println!("  Live:                {}", response.live_observations);
    println!("  Deleted:             {}", response.deleted_observations);
    println!("  Awaiting vectors:    {}", response.unvectorized);
    if response.embed_failed > 0 {
        println!("  Embedding failed:    {}", response.embed_failed);
    }
    println!();

    println!("By Classification:");
    for (label, count) in &response.by_classification {
        println!("  {:<14} {}", label, count);
    }
    println!();

    println!("Tools by Status:");
    for (status, count) in &response.tools_by_status {
        println!("  {:<14} {}", status, count);
    }
    println!();

    println!("Sessions:              {} ({} open)", response.sessions, response.open_sessions);
    println!("Threshold checkpoints: {}", response.threshold_checkpoints);
    println!("Database size:         {} bytes", response.db_size_bytes);

    if let Some(ref oldest) = response.oldest_observation {
        println!("Oldest observation:    {oldest}");
    }
    if let Some(ref newest) = response.newest_observation {
        println!("Newest observation:    {newest}");
    }

    Ok(())
}
