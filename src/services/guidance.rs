//! Retrieval of nutrition guidance snippets from a local document corpus.
//!
//! The corpus (`.md` / `.txt` files in one directory) and its embeddings are
//! built on first query and shared read-only afterwards. Concurrent first
//! queries wait on the same build; `reset` drops the index so the next query
//! rebuilds it.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use walkdir::WalkDir;

const EMPTY_SOURCE: &str = "empty";
const EMPTY_TEXT: &str = "No nutrition guidance documents found.";

/// Text embedding service.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Embeddings from an Ollama server (`/api/embed`).
pub struct OllamaEmbedder {
    host: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(host: String, model: String) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        log::debug!("🧮 Embedding {} texts with {}", texts.len(), self.model);
        let response = self
            .client
            .post(format!("{}/api/embed", self.host))
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await?;
            log::error!("❌ Embedding API error response: {}", error_text);
            anyhow::bail!("Embedding API error ({}): {}", status, error_text);
        }

        let body: EmbedResponse = response.json().await?;
        if body.embeddings.len() != texts.len() {
            anyhow::bail!(
                "Embedding count ({}) does not match input count ({})",
                body.embeddings.len(),
                texts.len()
            );
        }
        Ok(body.embeddings)
    }
}

/// A retrieved guidance document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuidanceSnippet {
    pub source: String,
    pub text: String,
    pub score: f32,
}

struct IndexState {
    documents: Vec<(String, String)>,
    embeddings: Vec<Vec<f32>>,
}

pub struct GuidanceIndex {
    docs_dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    state: OnceCell<IndexState>,
}

impl GuidanceIndex {
    pub fn new(docs_dir: impl Into<PathBuf>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            docs_dir: docs_dir.into(),
            embedder,
            state: OnceCell::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state.initialized()
    }

    /// Drop the built index; the next query reloads corpus and embeddings.
    pub fn reset(&mut self) {
        self.state = OnceCell::new();
    }

    /// Top `top_k` documents by cosine similarity to `text`.
    pub async fn query(&self, text: &str, top_k: usize) -> Result<Vec<GuidanceSnippet>> {
        let state = self.state.get_or_try_init(|| self.build()).await?;

        let query = self
            .embedder
            .embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Embedder returned no vector for the query"))?;
        let query = normalize(query);

        let mut scored: Vec<(usize, f32)> = state
            .embeddings
            .iter()
            .enumerate()
            .map(|(i, doc)| (i, dot(&query, doc)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(i, score)| {
                let (source, text) = &state.documents[i];
                GuidanceSnippet {
                    source: source.clone(),
                    text: text.clone(),
                    score,
                }
            })
            .collect())
    }

    async fn build(&self) -> Result<IndexState> {
        let mut documents = load_corpus(&self.docs_dir);
        if documents.is_empty() {
            log::warn!("⚠️ No guidance documents in {}", self.docs_dir.display());
            documents.push((EMPTY_SOURCE.to_string(), EMPTY_TEXT.to_string()));
        }

        let texts: Vec<String> = documents.iter().map(|(_, text)| text.clone()).collect();
        let embeddings: Vec<Vec<f32>> = self
            .embedder
            .embed(&texts)
            .await?
            .into_iter()
            .map(normalize)
            .collect();
        if embeddings.len() != documents.len() {
            anyhow::bail!(
                "Embedding count ({}) does not match document count ({})",
                embeddings.len(),
                documents.len()
            );
        }

        log::info!("📚 Guidance index built with {} documents", documents.len());
        Ok(IndexState {
            documents,
            embeddings,
        })
    }
}

/// Non-empty `.md` / `.txt` files directly inside `dir`, as (file name, text).
/// Unreadable files are skipped.
fn load_corpus(dir: &Path) -> Vec<(String, String)> {
    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| matches!(p.extension().and_then(|x| x.to_str()), Some("md") | Some("txt")))
        .collect();
    paths.sort();

    paths
        .into_iter()
        .filter_map(|path| {
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text.trim().to_string(),
                Err(e) => {
                    log::warn!("⚠️ Skipping {}: {}", path.display(), e);
                    return None;
                }
            };
            let name = path.file_name()?.to_string_lossy().to_string();
            (!text.is_empty()).then_some((name, text))
        })
        .collect()
}

fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}


#[cfg(test)]
mod tests {
    use super::testing::KeywordEmbedder;
    use super::*;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn corpus() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sodium.md"), "Cut sodium: rinse canned beans, skip extra salt. Sodium adds up.").unwrap();
        std::fs::write(dir.path().join("fiber.txt"), "Add fiber with vegetables and whole grains.").unwrap();
        std::fs::write(dir.path().join("protein.md"), "Protein at every meal keeps you full.").unwrap();
        std::fs::write(dir.path().join("empty.md"), "   \n").unwrap();
        std::fs::write(dir.path().join("notes.json"), "{\"sodium\": 1}").unwrap();
        dir
    }

    #[test]
    fn test_load_corpus_filters_files() {
        let dir = corpus();
        let docs = load_corpus(dir.path());
        let names: Vec<&str> = docs.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["fiber.txt", "protein.md", "sodium.md"]);
    }

    #[tokio::test]
    async fn test_query_ranks_by_similarity() {
        let dir = corpus();
        let index = GuidanceIndex::new(dir.path(), Arc::new(KeywordEmbedder::default()));
        let results = index.query("too much sodium", 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].source, "sodium.md");
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn test_empty_corpus_returns_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let index = GuidanceIndex::new(dir.path(), Arc::new(KeywordEmbedder::default()));
        let results = index.query("anything", 3).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, "empty");
        assert_eq!(results[0].text, "No nutrition guidance documents found.");
    }

    #[tokio::test]
    async fn test_concurrent_first_queries_build_once() {
        let dir = corpus();
        let embedder = Arc::new(KeywordEmbedder::default());
        let index = Arc::new(GuidanceIndex::new(dir.path(), embedder.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let index = index.clone();
                tokio::spawn(async move { index.query("fiber", 1).await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap()[0].source, "fiber.txt");
        }

        // one corpus embedding plus one per query
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1 + 8);
        assert!(index.is_loaded());
    }

    #[tokio::test]
    async fn test_reset_reloads_corpus() {
        let dir = corpus();
        let mut index = GuidanceIndex::new(dir.path(), Arc::new(KeywordEmbedder::default()));
        assert_eq!(index.query("water", 5).await.unwrap().len(), 3);

        std::fs::write(dir.path().join("water.md"), "Drink water with meals.").unwrap();
        assert_eq!(index.query("water", 5).await.unwrap().len(), 3);

        index.reset();
        assert!(!index.is_loaded());
        let results = index.query("water", 5).await.unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].source, "water.md");
    }

    #[tokio::test]
    async fn test_failed_build_is_retried_on_next_query() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "all-minilm",
                "embeddings": [[1.0, 0.0]]
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let embedder = Arc::new(OllamaEmbedder::new(server.uri(), "all-minilm".to_string()));
        let index = GuidanceIndex::new(dir.path(), embedder);

        assert!(index.query("salad", 3).await.is_err());
        assert!(!index.is_loaded());

        let results = index.query("salad", 3).await.unwrap();
        assert_eq!(results[0].source, "empty");
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }
}
