//! Quality gate: scores a finished artifact set before a job may complete.
//!
//! Four checks, each deducting from a score of 100:
//!
//! | check              | severity | deduction | flag                 |
//! |--------------------|----------|-----------|----------------------|
//! | required files     | critical | 40        | `frameworkComplete`  |
//! | recommended files  | medium   | 10        |                      |
//! | tree structure     | high     | 20        | `fileTreeComplete`   |
//! | entry point        | critical | 30        | `previewRenderable`  |
//!
//! A report passes only when the score clears the threshold and both
//! critical flags are up.

pub mod platforms;

use genforge_common::{
    ArtifactSet, IssueCategory, IssueSeverity, QualityIssue, QualityReport,
};
use genforge_common::artifact::normalize_path;
use regex::Regex;
use tracing::debug;

use crate::errors::QualityError;
use platforms::{PlatformRequirements, alternatives, requirements_for};

/// Default passing score.
pub const PASS_THRESHOLD: u8 = 70;

const REQUIRED_DEDUCTION: u8 = 40;
const RECOMMENDED_DEDUCTION: u8 = 10;
const STRUCTURE_DEDUCTION: u8 = 20;
const ENTRY_POINT_DEDUCTION: u8 = 30;

/// Anything that can judge an artifact set.
///
/// An `Err` means the check itself could not run, which callers treat like a
/// phase failure rather than a rejected report.
pub trait QualityCheck: Send + Sync {
    fn evaluate(&self, platform: &str, artifacts: &ArtifactSet)
    -> Result<QualityReport, QualityError>;
}

pub struct QualityGate {
    min_score: u8,
    reference_patterns: Vec<Regex>,
}

impl QualityGate {
    pub fn new(min_score: u8) -> Result<Self, QualityError> {
        let patterns = [
            r#"(?i)<script[^>]*\bsrc\s*=\s*["']([^"']+)["']"#,
            r#"(?i)<link[^>]*\bhref\s*=\s*["']([^"']+)["']"#,
            r#"\bimport\s+(?:[^'"]*?\s+from\s+)?["']([^"']+)["']"#,
            r#"\bimport\s*\(\s*["']([^"']+)["']\s*\)"#,
        ];
        let reference_patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|source| QualityError::Pattern {
                    platform: "*".to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            min_score,
            reference_patterns,
        })
    }

    fn missing(requirements: &[&str], artifacts: &ArtifactSet) -> Vec<String> {
        requirements
            .iter()
            .filter(|req| !alternatives(req).any(|path| artifacts.contains(path)))
            .map(|req| alternatives(req).collect::<Vec<_>>().join(" or "))
            .collect()
    }

    fn structure_problems(reqs: &PlatformRequirements, artifacts: &ArtifactSet) -> Vec<String> {
        let mut problems = Vec::new();
        if artifacts.len() < reqs.min_artifacts {
            problems.push(format!(
                "expected at least {} files, found {}",
                reqs.min_artifacts,
                artifacts.len()
            ));
        }
        if !reqs.source_dirs.is_empty() {
            let nested = artifacts.iter().any(|a| {
                let path = a.normalized_path().to_lowercase();
                reqs.source_dirs
                    .iter()
                    .any(|dir| path.starts_with(&format!("{}/", dir)))
            });
            if !nested {
                problems.push(format!(
                    "no files under {}",
                    reqs.source_dirs.join(" or ")
                ));
            }
        }
        for artifact in artifacts.iter() {
            let path = artifact.normalized_path();
            if path.is_empty() || path.split('/').any(|segment| segment == "..") {
                problems.push(format!("invalid path '{}'", artifact.path));
            }
        }
        problems
    }

    /// References found in a document, normalized to artifact paths.
    fn references(&self, content: &str) -> Vec<String> {
        self.reference_patterns
            .iter()
            .flat_map(|re| re.captures_iter(content))
            .filter_map(|caps| caps.get(1))
            .map(|m| {
                let raw = m.as_str().split(['?', '#']).next().unwrap_or_default();
                normalize_path(raw).to_lowercase()
            })
            .collect()
    }

    fn entry_point_problem(
        &self,
        reqs: &PlatformRequirements,
        artifacts: &ArtifactSet,
    ) -> Option<String> {
        let Some(entry) = reqs.entry_documents.iter().find_map(|p| artifacts.find(p)) else {
            return Some(format!(
                "entry document missing (expected {})",
                reqs.entry_documents.join(" or ")
            ));
        };
        if reqs.bootstrap.is_empty() {
            return None;
        }

        let refs = self.references(&entry.content);
        // An extension-less reference like `/src/main` matches every candidate sharing the stem.
        let referenced: Vec<&str> = reqs
            .bootstrap
            .iter()
            .copied()
            .filter(|candidate| {
                let candidate = candidate.to_lowercase();
                let stem = candidate
                    .rsplit_once('.')
                    .map(|(stem, _)| stem.to_string())
                    .unwrap_or_else(|| candidate.clone());
                refs.iter().any(|r| *r == candidate || *r == stem)
            })
            .collect();

        if referenced.iter().any(|bootstrap| artifacts.contains(bootstrap)) {
            return None;
        }
        match referenced.first() {
            None => Some(format!(
                "{} does not reference {}",
                entry.path,
                reqs.bootstrap.join(" or ")
            )),
            Some(bootstrap) => Some(format!(
                "{} references {} which does not exist",
                entry.path, bootstrap
            )),
        }
    }
}

impl QualityCheck for QualityGate {
    fn evaluate(
        &self,
        platform: &str,
        artifacts: &ArtifactSet,
    ) -> Result<QualityReport, QualityError> {
        let reqs = requirements_for(platform)
            .ok_or_else(|| QualityError::UnknownPlatform(platform.to_string()))?;

        let mut score: u8 = 100;
        let mut issues = Vec::new();
        let mut framework_complete = true;
        let mut preview_renderable = true;
        let mut file_tree_complete = true;

        let required_missing = Self::missing(reqs.required, artifacts);
        if !required_missing.is_empty() {
            framework_complete = false;
            score = score.saturating_sub(REQUIRED_DEDUCTION);
            issues.push(
                QualityIssue::new(
                    IssueSeverity::Critical,
                    IssueCategory::RequiredFiles,
                    format!("{} required file(s) missing for {}", required_missing.len(), reqs.name),
                )
                .with_missing(required_missing.clone())
                .with_fix(format!("Generate {}", required_missing.join(", "))),
            );
        }

        let optional_missing = Self::missing(reqs.recommended, artifacts);
        if !optional_missing.is_empty() {
            score = score.saturating_sub(RECOMMENDED_DEDUCTION);
            issues.push(
                QualityIssue::new(
                    IssueSeverity::Medium,
                    IssueCategory::RecommendedFiles,
                    format!("{} recommended file(s) missing", optional_missing.len()),
                )
                .with_missing(optional_missing.clone()),
            );
        }

        let problems = Self::structure_problems(reqs, artifacts);
        if !problems.is_empty() {
            file_tree_complete = false;
            score = score.saturating_sub(STRUCTURE_DEDUCTION);
            issues.push(QualityIssue::new(
                IssueSeverity::High,
                IssueCategory::Structure,
                problems.join("; "),
            ));
        }

        if let Some(problem) = self.entry_point_problem(reqs, artifacts) {
            preview_renderable = false;
            score = score.saturating_sub(ENTRY_POINT_DEDUCTION);
            issues.push(
                QualityIssue::new(IssueSeverity::Critical, IssueCategory::EntryPoint, problem)
                    .with_fix("Make the entry document load the bootstrap module"),
            );
        }

        let passed = score >= self.min_score && framework_complete && preview_renderable;
        debug!(platform = reqs.name, score, passed, issues = issues.len(), "quality gate evaluated");

        Ok(QualityReport {
            passed,
            quality_score: score,
            issues,
            framework_complete,
            preview_renderable,
            file_tree_complete,
            required_missing,
            optional_missing,
        })
    }
}
