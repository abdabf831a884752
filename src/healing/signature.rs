//! Error signatures: stable identifiers for "the same failure".

use genforge_common::{QualityReport, Signature};
use sha2::{Digest, Sha256};

/// Hex characters kept from the digest.
const SIGNATURE_LEN: usize = 16;

/// Lowercase, collapse whitespace, and mask digits so that line numbers,
/// ports and timestamps do not split one failure into many.
pub fn normalize_message(message: &str) -> String {
    let masked: String = message
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_digit() { '#' } else { c })
        .collect();
    masked.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn signature_for(message: &str) -> Signature {
    let digest = Sha256::digest(normalize_message(message).as_bytes());
    let hex = hex::encode(digest);
    Signature::from_hex(&hex[..SIGNATURE_LEN])
}

/// A rejected report is identified by which checks failed, not by its score.
pub fn quality_signature(report: &QualityReport) -> Signature {
    let categories: Vec<&str> = report.categories().iter().map(|c| c.as_str()).collect();
    signature_for(&format!("quality:{}", categories.join(",")))
}
