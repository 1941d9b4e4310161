//! HTTP surface over the pipeline: health, debug, the two single-stage smoke
//! endpoints and the full analysis.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::AppConfig;
use crate::handlers::{AnalysisReport, NutritionAgent, StageError};

const USDA_SEARCH_PAGE_SIZE: u32 = 5;
const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

pub struct AppState {
    pub agent: NutritionAgent,
    pub config: AppConfig,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/debug_openai", get(debug_openai))
        .route("/api/vlm_smoke", post(vlm_smoke))
        .route("/api/usda_search", get(usda_search))
        .route("/api/analyze", post(analyze))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(state)
}

/// `{"error": message}` with a status.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<StageError> for ApiError {
    fn from(err: StageError) -> Self {
        let status = match err {
            StageError::InvalidImage => StatusCode::BAD_REQUEST,
            StageError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StageError::Vision(_) | StageError::Lookup(_) | StageError::Details(_) => {
                StatusCode::BAD_GATEWAY
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            log::error!("❌ {} {}", self.status, self.message);
        } else {
            log::warn!("⚠️ {} {}", self.status, self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

struct Upload {
    image: Vec<u8>,
    backend: String,
    model: Option<String>,
}

async fn read_upload(mut multipart: Multipart) -> Result<Upload, ApiError> {
    let mut image = None;
    let mut backend = None;
    let mut model = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid form data: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Invalid image upload: {}", e)))?;
                image = Some(bytes.to_vec());
            }
            "backend" | "model" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Invalid '{}' field: {}", name, e)))?;
                let text = text.trim().to_string();
                if name == "backend" {
                    backend = Some(text);
                } else {
                    model = Some(text);
                }
            }
            other => log::debug!("Ignoring form field '{}'", other),
        }
    }

    let image = image.ok_or_else(|| ApiError::bad_request("Missing image upload"))?;
    Ok(Upload {
        image,
        backend: backend.filter(|b| !b.is_empty()).unwrap_or_else(|| "ollama".to_string()),
        model: model.filter(|m| !m.is_empty()),
    })
}

async fn health_check() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn debug_openai(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "OPENAI_API_KEY_present": config.openai_api_key.is_some(),
        "OPENAI_BASE_URL": std::env::var("OPENAI_BASE_URL").ok(),
        "openai_model": config.openai_model,
        "ollama_host": config.ollama_host,
        "ollama_model": config.ollama_model,
        "embed_host": config.embed_host,
        "embed_model": config.embed_model,
    }))
}

async fn vlm_smoke(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let upload = read_upload(multipart).await?;
    let result = state
        .agent
        .classify(&upload.image, &upload.backend, upload.model.as_deref())
        .await?;

    Ok(Json(json!({
        "label": result.label,
        "portion_g": result.portion_grams,
        "confidence": result.confidence,
        "raw_text": result.backend_trace["raw_text"],
        "trace_backend": result.backend_trace["backend"],
        "requested_backend": upload.backend,
        "requested_model": upload.model,
    })))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: String,
}

async fn usda_search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Value>, ApiError> {
    let client = state.agent.fdc_client()?;
    let raw = client
        .search_raw(&params.q, USDA_SEARCH_PAGE_SIZE)
        .await
        .map_err(|e| ApiError {
            status: StatusCode::BAD_GATEWAY,
            message: format!("USDA error: {:#}", e),
        })?;
    Ok(Json(raw))
}

async fn analyze(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<AnalysisReport>, ApiError> {
    let upload = read_upload(multipart).await?;
    let report = state
        .agent
        .analyze(&upload.image, &upload.backend, upload.model.as_deref())
        .await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FdcConfig;
    use crate::handlers::analysis_handler::testing::agent;
    use crate::services::image_prep::sample_png;
    use axum::body::Body;
    use axum::http::Request;
    use std::path::PathBuf;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BOUNDARY: &str = "nutrition-test-boundary";

    fn app_config() -> AppConfig {
        AppConfig {
            server_addr: "127.0.0.1:0".to_string(),
            ollama_host: "http://ollama.test:11434".to_string(),
            ollama_model: "qwen3-vl:8b".to_string(),
            openai_api_key: None,
            openai_model: "gpt-4o-mini".to_string(),
            fdc: FdcConfig::default(),
            rag_docs_dir: PathBuf::from("rag_docs"),
            embed_host: "http://ollama.test:11434".to_string(),
            embed_model: "all-minilm".to_string(),
            rag_top_k: 3,
        }
    }

    fn app(server: &MockServer, docs: &tempfile::TempDir) -> Router {
        create_router(Arc::new(AppState {
            agent: agent(server, docs.path()),
            config: app_config(),
        }))
    }

    fn multipart_request(uri: &str, image: Option<&[u8]>, fields: &[(&str, &str)]) -> Request<Body> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    BOUNDARY, name, value
                )
                .as_bytes(),
            );
        }
        if let Some(image) = image {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"meal.png\"\r\nContent-Type: image/png\r\n\r\n",
                    BOUNDARY
                )
                .as_bytes(),
            );
            body.extend_from_slice(image);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn mount_vlm(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": {"role": "assistant", "content": "{\"label\": \"pad thai\", \"portion_grams\": 300, \"confidence\": 0.75}"}
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_health() {
        let server = MockServer::start().await;
        let docs = tempfile::tempdir().unwrap();
        let request = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(&server, &docs), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_debug_openai_reports_configuration() {
        let server = MockServer::start().await;
        let docs = tempfile::tempdir().unwrap();
        let request = Request::builder()
            .uri("/api/debug_openai")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(&server, &docs), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["OPENAI_API_KEY_present"], false);
        assert_eq!(body["openai_model"], "gpt-4o-mini");
        assert_eq!(body["ollama_model"], "qwen3-vl:8b");
    }

    #[tokio::test]
    async fn test_vlm_smoke_echoes_request() {
        let server = MockServer::start().await;
        mount_vlm(&server).await;
        let docs = tempfile::tempdir().unwrap();

        let png = sample_png(32, 32);
        let request = multipart_request(
            "/api/vlm_smoke",
            Some(&png),
            &[("backend", "ollama"), ("model", "llava:7b")],
        );
        let (status, body) = send(app(&server, &docs), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["label"], "pad thai");
        assert_eq!(body["portion_g"], 300.0);
        assert_eq!(body["trace_backend"], "ollama");
        assert_eq!(body["requested_backend"], "ollama");
        assert_eq!(body["requested_model"], "llava:7b");
        assert!(body["raw_text"].as_str().unwrap().contains("pad thai"));
    }

    #[tokio::test]
    async fn test_analyze_returns_report() {
        let server = MockServer::start().await;
        mount_vlm(&server).await;
        Mock::given(method("POST"))
            .and(path("/v1/foods/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "foods": [{"fdcId": 5, "description": "Pad thai", "dataType": "Survey (FNDDS)", "score": 300}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/food/5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "fdcId": 5,
                "description": "Pad thai",
                "dataType": "Survey (FNDDS)",
                "foodNutrients": [{"nutrient": {"id": 1003}, "amount": 6}]
            })))
            .mount(&server)
            .await;
        let docs = tempfile::tempdir().unwrap();

        let png = sample_png(32, 32);
        let request = multipart_request("/api/analyze", Some(&png), &[]);
        let (status, body) = send(app(&server, &docs), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["requested_backend"], "ollama");
        assert!(body["requested_model"].is_null());
        assert_eq!(body["fdc_match"]["fdcId"], 5);
        assert_eq!(body["serving_used"], "300 g (scaled from 100 g)");
        assert_eq!(body["nutrition"]["protein_g"], 18.0);
        // no docs on disk: the placeholder snippet is appended after the rule tips
        let tips = body["tips"].as_array().unwrap();
        assert_eq!(tips.last().unwrap(), "No nutrition guidance documents found.");
    }

    #[tokio::test]
    async fn test_upload_errors_are_bad_requests() {
        let server = MockServer::start().await;
        let docs = tempfile::tempdir().unwrap();

        let request = multipart_request("/api/analyze", None, &[("backend", "ollama")]);
        let (status, body) = send(app(&server, &docs), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing image upload");

        let request = multipart_request("/api/analyze", Some(b"definitely not a photo"), &[]);
        let (status, body) = send(app(&server, &docs), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid image");
    }

    #[tokio::test]
    async fn test_stage_failure_is_bad_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(500).set_body_string("out of memory"))
            .mount(&server)
            .await;
        let docs = tempfile::tempdir().unwrap();

        let png = sample_png(16, 16);
        let request = multipart_request("/api/analyze", Some(&png), &[]);
        let (status, body) = send(app(&server, &docs), request).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().starts_with("VLM error: "));
    }

    #[tokio::test]
    async fn test_usda_search_passes_raw_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/foods/search"))
            .and(query_param("api_key", "test_key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalHits": 1,
                "foods": [{"fdcId": 1, "description": "Apple"}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        let docs = tempfile::tempdir().unwrap();

        let request = Request::builder()
            .uri("/api/usda_search?q=apple")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(&server, &docs), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalHits"], 1);
    }

    #[tokio::test]
    async fn test_openai_without_key_is_server_error() {
        let state = AppState {
            agent: NutritionAgent::from_config(&app_config()),
            config: app_config(),
        };

        let png = sample_png(16, 16);
        let request = multipart_request("/api/vlm_smoke", Some(&png), &[("backend", "openai")]);
        let (status, body) = send(create_router(Arc::new(state)), request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body["error"],
            "configuration error: OPENAI_API_KEY is not set in this process"
        );
    }
}
