//! Unified configuration for genforge.
//!
//! Settings are read from `.genforge/genforge.toml`, then environment variables
//! (`GENFORGE_*`), then CLI flags, each layer overriding the previous one.
//!
//! # Configuration File Format
//!
//! ```toml
//! [pipeline]
//! phases = ["plan", "generate", "validate", "refine"]
//! executor_cmd = "my-phase-runner"
//! default_platform = "react"
//! phase_estimate_secs = 60
//! max_resumes = 1
//!
//! [observer]
//! fallback_ms = 5000
//! poll_interval_ms = 2000
//! transport_retry_budget = 3
//!
//! [healing]
//! max_attempts = 4
//! confidence_threshold = 0.6
//! repair_cmd = "my-repair-tool"
//!
//! [quality]
//! min_score = 70
//!
//! [jobs]
//! db_path = ".genforge/jobs.db"
//! stale_after_secs = 600
//!
//! [server]
//! host = "127.0.0.1"
//! port = 3142
//!
//! [logging]
//! level = "info"
//! format = "compact"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::quality::platforms;

/// Name of the per-project state directory.
pub const GENFORGE_DIR: &str = ".genforge";

/// Number of repair strategies; the attempt cap can never exceed it.
pub const MAX_STRATEGIES: u32 = 4;

/// Phase pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Ordered phase names run for every job that does not override them
    #[serde(default = "default_phases")]
    pub phases: Vec<String>,
    /// External command invoked once per phase
    #[serde(default)]
    pub executor_cmd: Option<String>,
    /// Platform assumed when a job does not name one
    #[serde(default = "default_platform")]
    pub default_platform: String,
    /// Advisory per-phase duration used for `estimated_completion_at`
    #[serde(default = "default_phase_estimate_secs")]
    pub phase_estimate_secs: u64,
    /// How many times a run may resume after a healed phase failure
    #[serde(default = "default_max_resumes")]
    pub max_resumes: u32,
    /// Kill executor and repair commands after this many seconds (0 = no limit)
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_phases() -> Vec<String> {
    ["plan", "generate", "validate", "refine"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_platform() -> String {
    "react".to_string()
}

fn default_phase_estimate_secs() -> u64 {
    60
}

fn default_max_resumes() -> u32 {
    1
}

fn default_command_timeout_secs() -> u64 {
    600
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            phases: default_phases(),
            executor_cmd: None,
            default_platform: default_platform(),
            phase_estimate_secs: default_phase_estimate_secs(),
            max_resumes: default_max_resumes(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

/// Reliable status observer timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverSection {
    #[serde(default = "default_fallback_ms")]
    pub fallback_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Consecutive poll failures tolerated before a transport error is reported
    #[serde(default = "default_transport_retry_budget")]
    pub transport_retry_budget: u32,
}

fn default_fallback_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_transport_retry_budget() -> u32 {
    3
}

impl Default for ObserverSection {
    fn default() -> Self {
        Self {
            fallback_ms: default_fallback_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            transport_retry_budget: default_transport_retry_budget(),
        }
    }
}

/// Healing engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Minimum knowledge-base confidence for the pattern-match strategy
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// External command invoked for model-driven, context and rollback strategies
    #[serde(default)]
    pub repair_cmd: Option<String>,
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    #[serde(default)]
    pub knowledge_file: Option<PathBuf>,
}

fn default_max_attempts() -> u32 {
    MAX_STRATEGIES
}

/// Default confidence threshold for pattern-match repairs.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.6;

fn default_confidence_threshold() -> f64 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

impl Default for HealingSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            confidence_threshold: default_confidence_threshold(),
            repair_cmd: None,
            checkpoint_dir: None,
            knowledge_file: None,
        }
    }
}

/// Quality gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualitySection {
    /// Lowest score that may pass, provided no critical flag is down
    #[serde(default = "default_min_score")]
    pub min_score: u8,
}

fn default_min_score() -> u8 {
    crate::quality::PASS_THRESHOLD
}

impl Default for QualitySection {
    fn default() -> Self {
        Self {
            min_score: default_min_score(),
        }
    }
}

/// Job store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsSection {
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// Processing jobs idle longer than this are force-failed by the reaper
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_stale_after_secs() -> u64 {
    600
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            db_path: None,
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Buffered messages per channel topic before slow subscribers lag
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3142
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `compact` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Directory for daily-rolling log files; console only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            dir: None,
        }
    }
}

/// The complete genforge.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GenforgeToml {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub observer: ObserverSection,
    #[serde(default)]
    pub healing: HealingSection,
    #[serde(default)]
    pub quality: QualitySection,
    #[serde(default)]
    pub jobs: JobsSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl GenforgeToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse genforge.toml")
    }

    /// Load `genforge.toml` from the state directory, or defaults if it doesn't exist.
    pub fn load_or_default(genforge_dir: &Path) -> Result<Self> {
        let config_path = genforge_dir.join("genforge.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize genforge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.pipeline.phases.is_empty() {
            warnings.push("pipeline.phases is empty: jobs will go straight to the quality gate".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for phase in &self.pipeline.phases {
            if !seen.insert(phase.to_lowercase()) {
                warnings.push(format!("Duplicate phase name '{}' in pipeline.phases", phase));
            }
        }
        if platforms::requirements_for(&self.pipeline.default_platform).is_none() {
            warnings.push(format!(
                "Unknown default_platform '{}'. Known platforms: {}",
                self.pipeline.default_platform,
                platforms::known_platforms().join(", ")
            ));
        }
        if self.healing.max_attempts == 0 {
            warnings.push("healing.max_attempts is 0: failures will never be repaired".to_string());
        } else if self.healing.max_attempts > MAX_STRATEGIES {
            warnings.push(format!(
                "healing.max_attempts = {} exceeds the {} available strategies and will be capped",
                self.healing.max_attempts, MAX_STRATEGIES
            ));
        }
        if !(0.0..=1.0).contains(&self.healing.confidence_threshold) {
            warnings.push(format!(
                "healing.confidence_threshold = {} should be between 0.0 and 1.0",
                self.healing.confidence_threshold
            ));
        }
        if self.quality.min_score > 100 {
            warnings.push(format!(
                "quality.min_score = {} is above 100: no job can pass the gate",
                self.quality.min_score
            ));
        } else if self.quality.min_score < crate::quality::PASS_THRESHOLD {
            warnings.push(format!(
                "quality.min_score = {} is below the recommended {}",
                self.quality.min_score,
                crate::quality::PASS_THRESHOLD
            ));
        }
        if self.observer.poll_interval_ms == 0 {
            warnings.push("observer.poll_interval_ms must be greater than 0".to_string());
        }
        if self.observer.fallback_ms == 0 {
            warnings.push(
                "observer.fallback_ms is 0: observers will start polling immediately".to_string(),
            );
        }
        if self.jobs.stale_after_secs == 0 {
            warnings.push("jobs.stale_after_secs is 0: the stale-job reaper is disabled".to_string());
        }
        if !matches!(self.logging.format.as_str(), "compact" | "json") {
            warnings.push(format!(
                "Invalid logging.format '{}': expected 'compact' or 'json'",
                self.logging.format
            ));
        }

        warnings
    }
}

/// Configuration with environment and CLI overrides applied.
#[derive(Debug, Clone)]
pub struct GenforgeConfig {
    pub project_dir: PathBuf,
    pub genforge_dir: PathBuf,
    pub toml: GenforgeToml,
    pub verbose: bool,
    pub cli_port: Option<u16>,
    pub cli_db_path: Option<PathBuf>,
}

impl GenforgeConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let genforge_dir = project_dir.join(GENFORGE_DIR);
        let toml = GenforgeToml::load_or_default(&genforge_dir)?;

        Ok(Self {
            project_dir,
            genforge_dir,
            toml,
            verbose: false,
            cli_port: None,
            cli_db_path: None,
        })
    }

    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        port: Option<u16>,
        db_path: Option<PathBuf>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.cli_port = port;
        config.cli_db_path = db_path;
        Ok(config)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.genforge_dir)
            .context("Failed to create .genforge directory")?;
        std::fs::create_dir_all(self.checkpoint_dir())
            .context("Failed to create checkpoint directory")?;
        Ok(())
    }

    pub fn config_file(&self) -> PathBuf {
        self.genforge_dir.join("genforge.toml")
    }

    /// Job database path (CLI → env → file → default).
    pub fn db_path(&self) -> PathBuf {
        self.cli_db_path
            .clone()
            .or_else(|| std::env::var("GENFORGE_DB").ok().map(PathBuf::from))
            .or_else(|| self.toml.jobs.db_path.clone())
            .unwrap_or_else(|| self.genforge_dir.join("jobs.db"))
    }

    pub fn port(&self) -> u16 {
        self.cli_port
            .or_else(|| {
                std::env::var("GENFORGE_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
            })
            .unwrap_or(self.toml.server.port)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.toml.server.host, self.port())
    }

    pub fn executor_cmd(&self) -> Option<String> {
        std::env::var("GENFORGE_EXECUTOR_CMD")
            .ok()
            .or_else(|| self.toml.pipeline.executor_cmd.clone())
    }

    pub fn repair_cmd(&self) -> Option<String> {
        std::env::var("GENFORGE_REPAIR_CMD")
            .ok()
            .or_else(|| self.toml.healing.repair_cmd.clone())
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.toml
            .healing
            .checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.genforge_dir.join("checkpoints"))
    }

    pub fn knowledge_file(&self) -> PathBuf {
        self.toml
            .healing
            .knowledge_file
            .clone()
            .unwrap_or_else(|| self.genforge_dir.join("knowledge.json"))
    }

    /// Log level, bumped to `debug` by `--verbose`.
    pub fn log_level(&self) -> String {
        if self.verbose {
            "debug".to_string()
        } else {
            self.toml.logging.level.clone()
        }
    }

    pub fn observer_settings(&self) -> crate::observer::ObserverSettings {
        crate::observer::ObserverSettings {
            fallback_after: Duration::from_millis(self.toml.observer.fallback_ms),
            poll_interval: Duration::from_millis(self.toml.observer.poll_interval_ms.max(1)),
            transport_retry_budget: self.toml.observer.transport_retry_budget,
        }
    }

    pub fn healing_settings(&self) -> crate::healing::HealingSettings {
        crate::healing::HealingSettings {
            max_attempts: self.toml.healing.max_attempts.min(MAX_STRATEGIES),
            confidence_threshold: self.toml.healing.confidence_threshold,
        }
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        match self.toml.pipeline.command_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn stale_after(&self) -> Option<Duration> {
        match self.toml.jobs.stale_after_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
