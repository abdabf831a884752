//! Knowledge base of repairs that worked before.
//!
//! Keyed by error signature, upsert-only. Confidence grows with the number
//! of recorded successes and saturates at [`MAX_CONFIDENCE_SAMPLES`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use genforge_common::{KnowledgeEntry, Signature, StrategyKind};
use tracing::{debug, warn};

/// Number of successes at which confidence reaches 1.0.
const MAX_CONFIDENCE_SAMPLES: f64 = 5.0;

pub fn confidence_for(successes: u32) -> f64 {
    (successes as f64 / MAX_CONFIDENCE_SAMPLES).min(1.0)
}

#[derive(Default)]
pub struct KnowledgeBase {
    entries: DashMap<Signature, KnowledgeEntry>,
    path: Option<PathBuf>,
}

impl KnowledgeBase {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from a JSON file. A missing file is an empty knowledge base.
    pub fn load(path: &Path) -> Result<Self> {
        let kb = Self {
            entries: DashMap::new(),
            path: Some(path.to_path_buf()),
        };
        if !path.exists() {
            return Ok(kb);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read knowledge base: {}", path.display()))?;
        let entries: Vec<KnowledgeEntry> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse knowledge base: {}", path.display()))?;
        for entry in entries {
            kb.entries.insert(entry.signature.clone(), entry);
        }
        debug!(path = %path.display(), entries = kb.entries.len(), "knowledge base loaded");
        Ok(kb)
    }

    pub fn get(&self, signature: &Signature) -> Option<KnowledgeEntry> {
        self.entries.get(signature).map(|e| e.clone())
    }

    /// The entry for `signature` if its confidence is at least `threshold`.
    pub fn confident(&self, signature: &Signature, threshold: f64) -> Option<KnowledgeEntry> {
        self.get(signature).filter(|e| e.confidence >= threshold)
    }

    /// Record a successful repair. The most recent winning strategy is kept.
    pub fn record_success(&self, signature: &Signature, strategy: StrategyKind) -> KnowledgeEntry {
        let mut entry = self
            .entries
            .entry(signature.clone())
            .or_insert_with(|| KnowledgeEntry {
                signature: signature.clone(),
                strategy,
                confidence: 0.0,
                successes: 0,
                last_success_at: Utc::now(),
            });
        entry.successes = entry.successes.saturating_add(1);
        entry.confidence = confidence_for(entry.successes);
        entry.strategy = strategy;
        entry.last_success_at = Utc::now();
        entry.clone()
    }

    /// All entries, most confident first.
    pub fn entries(&self) -> Vec<KnowledgeEntry> {
        let mut entries: Vec<KnowledgeEntry> = self.entries.iter().map(|e| e.clone()).collect();
        entries.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.signature.cmp(&b.signature))
        });
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write to the backing file, if any, via a temp file and rename.
    pub fn persist(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.entries())?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Persist, logging instead of failing.
    pub fn persist_or_warn(&self) {
        if let Err(e) = self.persist() {
            warn!(error = %e, "failed to persist knowledge base");
        }
    }
}
