use anyhow::Result;

use cairn::config::CairnConfig;
use cairn::memory::{observations, registry};
use cairn::search::SearchOptions;

pub struct SearchArgs<'a> {
    pub query: &'a str,
    pub partition: &'a str,
    pub limit: Option<usize>,
    pub tools: bool,
    pub json: bool,
}

/// Run a keyword search from the terminal.
///
/// The binary has no embedding provider, so results come from the text index
/// only; vector ranking is available to library callers that supply one.
pub fn search(config: &CairnConfig, args: &SearchArgs<'_>) -> Result<()> {
    let store = super::open_store(config)?;
    let mut options = SearchOptions::from(&config.retrieval);
    if let Some(limit) = args.limit {
        options = options.limit(limit);
    }

    if args.tools {
        let hits = registry::search(&store, args.query, args.partition, &options, None)?;
        store.close();
        if args.json {
            println!("{}", serde_json::to_string_pretty(&hits)?);
            return Ok(());
        }
        if hits.is_empty() {
            println!("No tools found.");
            return Ok(());
        }
        for (i, hit) in hits.iter().enumerate() {
            println!(
                "  {}. {} [{}/{}] uses: {} (score: {:.4})",
                i + 1,
                hit.entry.name,
                hit.entry.scope,
                hit.entry.status,
                hit.entry.usage_count,
                hit.score,
            );
            if let Some(description) = &hit.entry.description {
                println!("     {description}");
            }
        }
        return Ok(());
    }

    let hits = observations::search(&store, args.query, args.partition, &options, None)?;
    store.close();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }
    if hits.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    println!("Found {} result(s)\n", hits.len());
    for (i, hit) in hits.iter().enumerate() {
        let o = &hit.observation;
        println!(
            "  {}. {} [{}] {} (score: {:.4})",
            i + 1,
            o.id,
            hit.match_type,
            o.title.as_deref().unwrap_or("(untitled)"),
            hit.score,
        );
        println!("     {}", hit.snippet);
        println!();
    }

    Ok(())
}
