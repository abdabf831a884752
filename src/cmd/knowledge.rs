//! Healing knowledge listing (`genforge knowledge`).

use anyhow::Result;
use console::style;
use genforge::client::ApiClient;
use genforge::config::GenforgeConfig;
use genforge::healing::knowledge::KnowledgeBase;
use genforge_common::KnowledgeEntry;

/// List known repairs. `local` reads the knowledge file directly instead of asking the server.
pub async fn cmd_knowledge(
    client: &ApiClient,
    config: &GenforgeConfig,
    local: bool,
) -> Result<()> {
    let mut entries = if local {
        KnowledgeBase::load(&config.knowledge_file())?.entries()
    } else {
        client.knowledge().await?
    };
    entries.sort_by(|a, b| b.successes.cmp(&a.successes));

    let threshold = config.toml.healing.confidence_threshold;
    print_entries(&entries, threshold);
    Ok(())
}

fn print_entries(entries: &[KnowledgeEntry], threshold: f64) {
    println!();
    if entries.is_empty() {
        println!("No repairs learned yet.");
        println!();
        return;
    }

    println!(
        "{:<18} {:<18} {:>9} {:>10}  Last success",
        "Signature", "Strategy", "Successes", "Confidence"
    );
    for entry in entries {
        let signature: String = entry.signature.as_str().chars().take(16).collect();
        let confidence = format!("{:.2}", entry.confidence);
        let confidence = if entry.confidence >= threshold {
            style(confidence).green()
        } else {
            style(confidence).dim()
        };
        println!(
            "{:<18} {:<18} {:>9} {:>10}  {}",
            signature,
            entry.strategy.as_str(),
            entry.successes,
            confidence,
            entry.last_success_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!();
    println!(
        "Repairs at or above {:.2} confidence are replayed first by pattern match.",
        threshold
    );
    println!();
}
