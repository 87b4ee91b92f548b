//! CLI maintenance commands: `checkpoint`, `purge`, and `rebuild-index`.

use anyhow::Result;

use cairn::config::CairnConfig;
use cairn::memory::observations;

/// Passive WAL checkpoint. Never waits on other processes.
pub fn checkpoint(config: &CairnConfig) -> Result<()> {
    let store = super::open_store(config)?;
    let stats = store.checkpoint()?;
    store.close();

    println!(
        "Checkpointed {} of {} WAL frames.",
        stats.checkpointed_frames, stats.log_frames
    );
    if stats.busy {
        println!("Another connection was active; run again later to finish.");
    }
    Ok(())
}

/// Hard-delete observations soft-deleted at least `older_than_days` ago.
pub fn purge(config: &CairnConfig, older_than_days: u64) -> Result<()> {
    let store = super::open_store(config)?;
    let purged = observations::purge_deleted(&store, older_than_days)?;
    store.close();

    if purged == 0 {
        println!("No deleted observations older than {older_than_days} day(s).");
    } else {
        println!("Purged {purged} observation(s).");
    }
    Ok(())
}

pub fn rebuild_index(config: &CairnConfig) -> Result<()> {
    let store = super::open_store(config)?;
    store.rebuild_text_index()?;
    store.close();
    println!("Full-text indexes rebuilt.");
    Ok(())
}
