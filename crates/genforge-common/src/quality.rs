use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl IssueSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueCategory {
    RequiredFiles,
    RecommendedFiles,
    Structure,
    EntryPoint,
}

impl IssueCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequiredFiles => "required-files",
            Self::RecommendedFiles => "recommended-files",
            Self::Structure => "structure",
            Self::EntryPoint => "entry-point",
        }
    }
}

impl fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QualityIssue {
    pub severity: IssueSeverity,
    pub category: IssueCategory,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_items: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
}

impl QualityIssue {
    pub fn new(severity: IssueSeverity, category: IssueCategory, description: impl Into<String>) -> Self {
        Self {
            severity,
            category,
            description: description.into(),
            missing_items: None,
            suggested_fix: None,
        }
    }

    pub fn with_missing(mut self, items: Vec<String>) -> Self {
        self.missing_items = Some(items);
        self
    }

    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.suggested_fix = Some(fix.into());
        self
    }
}

/// Result of running the quality gate over one job's artifacts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    pub passed: bool,
    pub quality_score: u8,
    pub issues: Vec<QualityIssue>,
    pub framework_complete: bool,
    pub preview_renderable: bool,
    pub file_tree_complete: bool,
    pub required_missing: Vec<String>,
    pub optional_missing: Vec<String>,
}

impl QualityReport {
    /// Distinct issue categories, sorted. Used to derive the failure signature.
    pub fn categories(&self) -> Vec<IssueCategory> {
        let mut categories: Vec<IssueCategory> = self.issues.iter().map(|i| i.category).collect();
        categories.sort();
        categories.dedup();
        categories
    }

    /// One-line summary suitable for `error_message`.
    pub fn summary(&self) -> String {
        let categories: Vec<&str> = self.categories().iter().map(|c| c.as_str()).collect();
        format!(
            "quality gate failed (score {}): {}",
            self.quality_score,
            if categories.is_empty() {
                "no issues recorded".to_string()
            } else {
                categories.join(", ")
            }
        )
    }
}
