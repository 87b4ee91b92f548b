//! CLI `capture` command: one event from stdin, one observation out.

use anyhow::{Context, Result};
use std::io::Read;

use cairn::capture::{capture, CaptureEvent};
use cairn::config::CairnConfig;

/// Read a JSON [`CaptureEvent`] from stdin and store it.
///
/// Returns `Err` (and so a non-zero exit) only when the event is unreadable or
/// the observation itself could not be written. Side-effect failures are
/// printed as warnings in the JSON outcome.
pub fn capture_stdin(config: &CairnConfig) -> Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("failed to read event from stdin")?;
    let event: CaptureEvent =
        serde_json::from_str(&input).context("stdin is not a valid capture event")?;

    let store = super::open_store(config)?;
    let result = capture(store.conn(), &event);
    store.close();

    let outcome = result.context("observation was not stored")?;
    println!("{}", serde_json::to_string(&outcome)?);
    Ok(())
}
