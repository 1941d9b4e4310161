use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{AppConfig, FdcConfig, MissingCredential};
use crate::models::{FoodRecord, NutrientProfile};
use crate::services::guidance::{GuidanceIndex, GuidanceSnippet, OllamaEmbedder};
use crate::services::{food_match, image_prep, nutrients, tips, vlm_response};
use crate::services::{FdcClient, VisionDispatcher};

const SEARCH_PAGE_SIZE: u32 = 15;
const FALLBACK_PAGE_SIZE: u32 = 10;

/// A failed pipeline stage. The message names the stage.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("Invalid image")]
    InvalidImage,
    #[error("configuration error: {0}")]
    Config(MissingCredential),
    #[error("VLM error: {0:#}")]
    Vision(anyhow::Error),
    #[error("USDA lookup failed: {0:#}")]
    Lookup(anyhow::Error),
    #[error("USDA details fetch failed: {0:#}")]
    Details(anyhow::Error),
}

impl StageError {
    /// Missing credentials are configuration errors whatever stage hit them.
    fn classify(err: anyhow::Error, stage: fn(anyhow::Error) -> StageError) -> StageError {
        match err.downcast_ref::<MissingCredential>() {
            Some(missing) => StageError::Config(missing.clone()),
            None => stage(err),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FdcMatch {
    #[serde(rename = "fdcId")]
    pub fdc_id: i64,
    pub description: Option<String>,
    #[serde(rename = "dataType")]
    pub data_type: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Timings {
    pub vlm: f64,
    pub fdc: f64,
}

/// Full analysis result. Nutrition fields are absent when no database match was found.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub label: String,
    pub portion_g: f64,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serving_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nutrition: Option<NutrientProfile>,
    pub tips: Vec<String>,
    pub fdc_match: Option<FdcMatch>,
    pub timings_s: Timings,
    pub trace: Value,
    pub requested_backend: String,
    pub requested_model: Option<String>,
}

/// Image → label/portion → FDC match → scaled nutrition → tips.
pub struct NutritionAgent {
    vision: VisionDispatcher,
    fdc: FdcConfig,
    guidance: Arc<GuidanceIndex>,
    guidance_top_k: usize,
}

impl NutritionAgent {
    pub fn new(
        vision: VisionDispatcher,
        fdc: FdcConfig,
        guidance: Arc<GuidanceIndex>,
        guidance_top_k: usize,
    ) -> Self {
        Self {
            vision,
            fdc,
            guidance,
            guidance_top_k,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let embedder = Arc::new(OllamaEmbedder::new(
            config.embed_host.clone(),
            config.embed_model.clone(),
        ));
        Self::new(
            VisionDispatcher::from_config(config),
            config.fdc.clone(),
            Arc::new(GuidanceIndex::new(config.rag_docs_dir.clone(), embedder)),
            config.rag_top_k,
        )
    }

    pub fn fdc_client(&self) -> Result<FdcClient, StageError> {
        FdcClient::new(&self.fdc).map_err(|e| StageError::classify(e, StageError::Lookup))
    }

    /// VLM stage only: decode and classify.
    pub async fn classify(
        &self,
        image_bytes: &[u8],
        backend: &str,
        model: Option<&str>,
    ) -> Result<crate::models::ClassificationResult, StageError> {
        let image = image_prep::decode(image_bytes).map_err(|e| {
            log::warn!("⚠️ Rejected upload: {:#}", e);
            StageError::InvalidImage
        })?;
        self.vision
            .classify(&image, backend, model)
            .await
            .map_err(|e| StageError::classify(e, StageError::Vision))
    }

    pub async fn analyze(
        &self,
        image_bytes: &[u8],
        backend: &str,
        model: Option<&str>,
    ) -> Result<AnalysisReport, StageError> {
        log::info!("📸 Analyzing image ({} bytes) with backend '{}'", image_bytes.len(), backend);

        let t0 = Instant::now();
        let classification = self.classify(image_bytes, backend, model).await?;
        let t_vlm = t0.elapsed().as_secs_f64();

        let label = classification.label.clone();
        let portion_g = classification.portion_grams;
        let safe_query = vlm_response::clean_query(&label);

        let client = self.fdc_client()?;
        let t1 = Instant::now();
        let candidates = match client.search(&safe_query, SEARCH_PAGE_SIZE).await {
            Ok(candidates) => candidates,
            Err(e) => {
                let fallback = safe_query.split_whitespace().next().unwrap_or(&safe_query);
                log::warn!(
                    "⚠️ FDC search for '{}' failed ({:#}), retrying with '{}'",
                    safe_query,
                    e,
                    fallback
                );
                client
                    .search(fallback, FALLBACK_PAGE_SIZE)
                    .await
                    .map_err(StageError::Lookup)?
            }
        };

        let mut report = AnalysisReport {
            label: label.clone(),
            portion_g,
            confidence: classification.confidence,
            serving_used: None,
            nutrition: None,
            tips: Vec::new(),
            fdc_match: None,
            timings_s: Timings {
                vlm: round3(t_vlm),
                fdc: 0.0,
            },
            trace: json!({ "vlm": classification.backend_trace }),
            requested_backend: backend.to_string(),
            requested_model: model.map(str::to_string),
        };

        let Some(best) = food_match::pick_best(&candidates) else {
            log::info!("🤷 No FDC match for '{}'", safe_query);
            return Ok(report);
        };
        log::info!("✅ Best FDC match: {} ({})", best.description, best.data_type);

        let fdc_id = best
            .id
            .ok_or_else(|| StageError::Details(anyhow::anyhow!("best match has no fdcId")))?;
        let record = client.details(fdc_id).await.map_err(StageError::Details)?;
        report.timings_s.fdc = round3(t1.elapsed().as_secs_f64());

        let serving = nutrients::extract_serving(&record);
        let profile = nutrients::summarize_macros(&record);
        let scaled = nutrients::scale(&profile, &serving, portion_g);
        log::debug!("🍽️ Serving {:?}, scaled: {}", serving, scaled.serving_used);

        let mut all_tips = tips::tips_from_profile(&scaled.profile);
        let guidance = self.guidance_for(&label, &scaled.profile).await;
        all_tips.extend(guidance.iter().map(|s| s.text.clone()));

        report.fdc_match = Some(fdc_match(fdc_id, &record));
        report.serving_used = Some(scaled.serving_used);
        report.nutrition = Some(scaled.profile);
        report.tips = all_tips;
        report.trace["rag"] = json!(guidance);
        Ok(report)
    }

    /// Retrieval tips; failures are logged and yield none.
    async fn guidance_for(&self, label: &str, profile: &NutrientProfile) -> Vec<GuidanceSnippet> {
        let query = tips::build_guidance_query(label, profile);
        match self.guidance.query(&query, self.guidance_top_k).await {
            Ok(snippets) => snippets,
            Err(e) => {
                log::warn!("⚠️ Guidance retrieval failed: {:#}", e);
                Vec::new()
            }
        }
    }
}

fn fdc_match(fdc_id: i64, record: &FoodRecord) -> FdcMatch {
    FdcMatch {
        fdc_id,
        description: record.description().map(str::to_string),
        data_type: record.data_type().map(str::to_string),
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::services::fdc::test_config;
    use crate::services::guidance::testing::KeywordEmbedder;
    use crate::services::vision::{OllamaVision, OpenAiVision};
    use wiremock::MockServer;

    pub fn agent(server: &MockServer, docs_dir: &std::path::Path) -> NutritionAgent {
        let vision = VisionDispatcher::new(
            OllamaVision::new(server.uri(), "qwen3-vl:8b".to_string()),
            Some(OpenAiVision::with_base_url(
                "sk-test".to_string(),
                format!("{}/v1", server.uri()),
                "gpt-4o-mini".to_string(),
            )),
        );
        let guidance = GuidanceIndex::new(docs_dir, Arc::new(KeywordEmbedder::default()));
        NutritionAgent::new(vision, test_config(&server.uri()), Arc::new(guidance), 2)
    }
}
