use anyhow::Result;

use cairn::config::CairnConfig;
use cairn::memory::sessions;

pub fn start(config: &CairnConfig, partition: &str) -> Result<()> {
    let store = super::open_store(config)?;
    let session = sessions::start(store.conn(), partition)?;
    store.close();
    println!("{}", session.id);
    Ok(())
}

/// End a session. Ending an unknown or already-ended session is reported,
/// not treated as failure.
pub fn end(config: &CairnConfig, id: &str, summary: Option<&str>) -> Result<()> {
    let store = super::open_store(config)?;
    let ended = sessions::end(store.conn(), id, summary)?;
    store.close();
    if ended {
        println!("Session {id} ended.");
    } else {
        println!("Session {id} is unknown or already ended.");
    }
    Ok(())
}
