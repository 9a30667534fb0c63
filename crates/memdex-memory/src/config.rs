use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Which embedding backend the memory service should initialise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Deterministic hashed bag-of-words, no external dependency.
    Local,
    /// OpenAI-compatible `/v1/embeddings` endpoint (feature `http-embeddings`).
    Http,
    /// Lexical-only mode.
    None,
}

/// The `[embedding]` table of `memdex.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Backend to initialise.
    #[serde(default = "default_backend")]
    pub backend: EmbeddingBackend,
    /// Vector dimension the backend produces.
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    /// Model identifier sent to the HTTP backend.
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL of the HTTP backend, e.g. `http://localhost:11434/v1`.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            dimension: default_dimension(),
            model: None,
            base_url: None,
            api_key_env: None,
        }
    }
}

/// Configuration for the memory subsystem.
///
/// Every field has a default so a partial `memdex.toml` is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Directory tree holding the memory files (sole source of truth).
    #[serde(default = "default_memory_root")]
    pub memory_root: PathBuf,
    /// Directory holding one SQLite store per project.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Project identifier; sanitised into the store file name.
    #[serde(default = "default_project")]
    pub project: String,
    /// Recognised file extensions (without the dot, case-insensitive).
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Upper bound on the characters of one chunk.
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    /// Chunk text is truncated to this many characters before embedding.
    #[serde(default = "default_max_embed_chars")]
    pub max_embed_chars: usize,
    /// Embedding backend settings.
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Weight of the vector leg in rank fusion.
    #[serde(default = "default_leg_weight")]
    pub vector_weight: f32,
    /// Weight of the lexical leg in rank fusion.
    #[serde(default = "default_leg_weight")]
    pub keyword_weight: f32,
    /// Reciprocal rank fusion constant. Higher values smooth out rank differences.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f32,
    /// Quiet period before a burst of filesystem events is indexed.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            memory_root: default_memory_root(),
            data_dir: default_data_dir(),
            project: default_project(),
            extensions: default_extensions(),
            max_chunk_chars: default_max_chunk_chars(),
            max_embed_chars: default_max_embed_chars(),
            embedding: EmbeddingConfig::default(),
            vector_weight: default_leg_weight(),
            keyword_weight: default_leg_weight(),
            rrf_k: default_rrf_k(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl MemoryConfig {
    /// Whether `path` carries one of the recognised extensions.
    pub fn is_recognized(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                self.extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
    }

    /// Whether `rel`, relative to the memory root, names a memory file: a
    /// recognised extension and no hidden segment.
    pub fn is_memory_file(&self, rel: &Path) -> bool {
        !has_hidden_segment(rel) && self.is_recognized(rel)
    }

    /// Watcher debounce window.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Location of the SQLite store for the configured project.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir
            .join(format!("{}.sqlite", sanitize_project_id(&self.project)))
    }
}

/// Whether any component of `rel` starts with a dot.
pub fn has_hidden_segment(rel: &Path) -> bool {
    rel.components().any(|c| match c {
        Component::Normal(part) => part.to_str().is_some_and(|s| s.starts_with('.')),
        _ => false,
    })
}

/// Turn an arbitrary project identifier into a file-name-safe slug.
///
/// ASCII alphanumerics are lowercased and kept; every run of other
/// characters collapses to a single `-`. An empty result becomes `default`.
pub fn sanitize_project_id(project: &str) -> String {
    let mut slug = String::with_capacity(project.len());
    for c in project.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "default".to_string()
    } else {
        slug.to_string()
    }
}

fn default_backend() -> EmbeddingBackend {
    EmbeddingBackend::Local
}
fn default_dimension() -> usize {
    384
}
fn default_memory_root() -> PathBuf {
    PathBuf::from("memory")
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(".memdex")
}
fn default_project() -> String {
    "default".to_string()
}
fn default_extensions() -> Vec<String> {
    vec!["md".to_string(), "markdown".to_string(), "txt".to_string()]
}
fn default_max_chunk_chars() -> usize {
    1600
}
fn default_max_embed_chars() -> usize {
    8000
}
fn default_leg_weight() -> f32 {
    0.5
}
fn default_rrf_k() -> f32 {
    60.0
}
fn default_debounce_ms() -> u64 {
    500
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_project_id() {
        assert_eq!(sanitize_project_id("My Project"), "my-project");
        assert_eq!(sanitize_project_id("/home/me/code/app"), "home-me-code-app");
        assert_eq!(sanitize_project_id("a__b--c"), "a-b-c");
        assert_eq!(sanitize_project_id("///"), "default");
        assert_eq!(sanitize_project_id("Ünïcode"), "n-code");
    }

    #[test]
    fn test_store_path_uses_slug() {
        let config = MemoryConfig {
            data_dir: PathBuf::from("/tmp/data"),
            project: "Team/Notes".into(),
            ..MemoryConfig::default()
        };
        assert_eq!(config.store_path(), PathBuf::from("/tmp/data/team-notes.sqlite"));
    }

    #[test]
    fn test_is_recognized() {
        let config = MemoryConfig::default();
        assert!(config.is_recognized(Path::new("notes/a.md")));
        assert!(config.is_recognized(Path::new("notes/A.MD")));
        assert!(config.is_recognized(Path::new("log.txt")));
        assert!(!config.is_recognized(Path::new("image.png")));
        assert!(!config.is_recognized(Path::new("Makefile")));
    }

    #[test]
    fn test_is_memory_file_rejects_hidden_segments() {
        let config = MemoryConfig::default();
        assert!(config.is_memory_file(Path::new("notes/a.md")));
        assert!(!config.is_memory_file(Path::new(".drafts/c.md")));
        assert!(!config.is_memory_file(Path::new("notes/.hidden.md")));
        assert!(!config.is_memory_file(Path::new("notes/a.png")));
        assert!(has_hidden_segment(Path::new("a/.git/b")));
        assert!(!has_hidden_segment(Path::new("./a/b.md")));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: MemoryConfig = toml::from_str(
            r#"
project = "demo"
debounce_ms = 50

[embedding]
backend = "none"
"#,
        )
        .unwrap();
        assert_eq!(config.project, "demo");
        assert_eq!(config.debounce(), Duration::from_millis(50));
        assert_eq!(config.embedding.backend, EmbeddingBackend::None);
        assert_eq!(config.embedding.dimension, 384);
        assert_eq!(config.max_chunk_chars, 1600);
        assert!((config.rrf_k - 60.0).abs() < f32::EPSILON);
    }
}
