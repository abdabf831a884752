use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    #[default]
    File,
    Config,
    Asset,
}

/// One generated output file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub kind: ArtifactKind,
}

impl Artifact {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            kind: ArtifactKind::File,
        }
    }

    pub fn with_kind(mut self, kind: ArtifactKind) -> Self {
        self.kind = kind;
        self
    }

    /// Path with leading `./` or `/` removed and separators normalized.
    pub fn normalized_path(&self) -> String {
        normalize_path(&self.path)
    }
}

pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
        .trim_start_matches("./")
        .trim_start_matches('/')
        .to_string()
}

/// Ordered artifact set keyed by normalized, case-folded path; a later write to the same path replaces the earlier one.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ArtifactSet {
    artifacts: Vec<Artifact>,
}

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, artifact: Artifact) {
        let key = artifact.normalized_path().to_lowercase();
        match self
            .artifacts
            .iter_mut()
            .find(|a| a.normalized_path().to_lowercase() == key)
        {
            Some(existing) => *existing = artifact,
            None => self.artifacts.push(artifact),
        }
    }

    pub fn extend<I: IntoIterator<Item = Artifact>>(&mut self, artifacts: I) {
        for artifact in artifacts {
            self.upsert(artifact);
        }
    }

    /// Case-insensitive lookup by path.
    pub fn find(&self, path: &str) -> Option<&Artifact> {
        let wanted = normalize_path(path).to_lowercase();
        self.artifacts
            .iter()
            .find(|a| a.normalized_path().to_lowercase() == wanted)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.find(path).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.iter()
    }

    pub fn paths(&self) -> Vec<String> {
        self.artifacts.iter().map(|a| a.path.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

impl FromIterator<Artifact> for ArtifactSet {
    fn from_iter<I: IntoIterator<Item = Artifact>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}
