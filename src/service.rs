//! HTTP + WebSocket surface.
//!
//! Thin sequential handlers over the pipeline: extract → analyze →
//! persist → render. The WebSocket chat bridge forwards each inbound
//! message to a single completion call and appends the exchange to the
//! session's chat history before replying.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{DefaultBodyLimit, Multipart, Query, State, WebSocketUpgrade};
use axum::http::header;
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::analysis::{AnalysisClient, HEADLINE_TESTS, OpenRouterCompletion, build_report_summary};
use crate::config::Config;
use crate::error::{Result, ServiceError};
use crate::extraction::{self, ExtractionStrategy, PatternExtractor};
use crate::models::{AnalysisBundle, ChatEntry, LabResults, PatientInfo, SessionDocument};
use crate::prescription::PrescriptionRenderer;
use crate::store::SessionStore;

const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub extractor: Arc<dyn ExtractionStrategy>,
    pub analyzer: Arc<AnalysisClient>,
    pub renderer: Arc<PrescriptionRenderer>,
}

pub fn create_app(config: &Config) -> Router {
    let completion = Arc::new(OpenRouterCompletion::new(
        &config.openrouter_api_key,
        config.model.clone(),
    ));
    let state = AppState {
        store: Arc::new(SessionStore::new(&config.data_dir)),
        extractor: Arc::new(PatternExtractor::new()),
        analyzer: Arc::new(AnalysisClient::new(completion)),
        renderer: Arc::new(PrescriptionRenderer::new(
            config.output_dir.clone(),
            config.background_image.clone(),
        )),
    };
    build_router(state)
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/upload", post(upload))
        .route("/results", get(get_results))
        .route("/update_profile", post(update_profile))
        .route("/update_analysis", post(update_analysis))
        .route("/generate_prescription", post(generate_prescription))
        .route("/download", get(download))
        .route("/ws", get(chat_socket))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Pathology Report Analysis Service",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "POST /upload": "Upload a pathology report PDF and run the analysis pipeline",
            "GET /results": "Current session document",
            "POST /update_profile": "Shallow-merge patient profile fields",
            "POST /update_analysis": "Regenerate the analysis for selected tests",
            "POST /generate_prescription": "Render a prescription PDF (isUpdate selects the slot)",
            "GET /download": "Download a generated prescription",
            "GET /ws": "WebSocket chat about the current report",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// `POST /upload` — extract, analyze, persist, return the new session.
/// A new upload replaces the previous session wholesale.
async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> Result<Json<Value>> {
    let mut pdf_bytes: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::BadRequest(format!("malformed upload: {e}")))?
    {
        if field.name() == Some("file") {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ServiceError::BadRequest(format!("malformed upload: {e}")))?;
            pdf_bytes = Some(bytes.to_vec());
        }
    }
    let bytes = pdf_bytes
        .filter(|b| !b.is_empty())
        .ok_or_else(|| ServiceError::BadRequest("No file uploaded".to_string()))?;

    info!(bytes = bytes.len(), "processing uploaded report");
    let pages = extraction::extract_pages(bytes).await?;
    let patient = state.extractor.patient_info(&pages);
    let lab_results = state.extractor.lab_results(&pages);
    info!(tests = lab_results.len(), "report extracted");

    // First summary covers the headline panel only; the full result set
    // stays available for update_analysis.
    let panel: LabResults = HEADLINE_TESTS
        .iter()
        .filter_map(|test| {
            lab_results
                .get(*test)
                .map(|value| (test.to_string(), value.clone()))
        })
        .collect();
    let report = build_report_summary(&patient, &panel);
    let analysis = state.analyzer.analyze_report(&report).await?;

    let doc = SessionDocument::new(patient, lab_results, analysis);
    state.store.replace(&doc).await?;

    Ok(Json(json!({ "data": doc })))
}

/// `GET /results` — the session document verbatim.
async fn get_results(State(state): State<AppState>) -> Result<Json<SessionDocument>> {
    Ok(Json(state.store.load().await?))
}

/// `POST /update_profile` — shallow-merge into the stored patient info.
async fn update_profile(
    State(state): State<AppState>,
    Json(patch): Json<PatientInfo>,
) -> Result<Json<Value>> {
    state.store.update(|doc| doc.patient.merge(patch)).await?;
    Ok(Json(json!({ "message": "Profile updated successfully" })))
}

/// `POST /update_analysis` — regenerate the three-part analysis from all
/// stored results merged with the selected subset, into the updated slot.
async fn update_analysis(
    State(state): State<AppState>,
    Json(selected_tests): Json<Vec<String>>,
) -> Result<Json<Value>> {
    let doc = state.store.load().await?;

    let mut combined = doc.lab_results.clone();
    for name in &selected_tests {
        if let Some(value) = doc.lab_results.get(name) {
            combined.insert(name.clone(), value.clone());
        }
    }

    let report = build_report_summary(&doc.patient, &combined);
    let bundle = state.analyzer.analyze_report(&report).await?;

    let stored = state
        .store
        .update(move |doc| {
            doc.updated_analysis = Some(bundle.clone());
            bundle
        })
        .await?;

    Ok(Json(json!({ "data": stored })))
}

#[derive(Debug, Deserialize)]
pub struct GeneratePrescriptionParams {
    #[serde(rename = "isUpdate", default)]
    pub is_update: bool,
}

/// `POST /generate_prescription` — render the selected analysis bundle.
/// An unpopulated updated slot is a bad request, never a blank PDF.
async fn generate_prescription(
    State(state): State<AppState>,
    Query(params): Query<GeneratePrescriptionParams>,
) -> Result<Json<Value>> {
    let doc = state.store.load().await?;

    let bundle: AnalysisBundle = if params.is_update {
        doc.updated_analysis
            .filter(|b| !b.is_empty())
            .ok_or_else(|| ServiceError::BadRequest("Analysis data not found".to_string()))?
    } else if doc.analysis.is_empty() {
        return Err(ServiceError::BadRequest("Analysis data not found".to_string()));
    } else {
        doc.analysis
    };

    let renderer = state.renderer.clone();
    let patient = doc.patient;
    let path = tokio::task::spawn_blocking(move || renderer.render(&patient, &bundle))
        .await
        .map_err(|e| ServiceError::Pdf(format!("render task failed: {e}")))??;

    info!(path = %path.display(), "prescription rendered");
    Ok(Json(json!({ "file_path": path.display().to_string() })))
}

#[derive(Debug, Deserialize)]
pub struct DownloadParams {
    pub file_path: String,
}

/// `GET /download` — stream a generated prescription as an attachment.
/// Only paths resolving inside the output directory are served.
async fn download(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
) -> Result<Response> {
    let root = tokio::fs::canonicalize(state.renderer.output_dir())
        .await
        .map_err(|e| ServiceError::Storage(format!("output dir unavailable: {e}")))?;
    let requested = tokio::fs::canonicalize(PathBuf::from(&params.file_path))
        .await
        .map_err(|_| ServiceError::NotFound("File not found".to_string()))?;
    if !requested.starts_with(&root) {
        return Err(ServiceError::BadRequest(
            "file_path must point at a generated prescription".to_string(),
        ));
    }

    let bytes = tokio::fs::read(&requested)
        .await
        .map_err(|_| ServiceError::NotFound("File not found".to_string()))?;
    let file_name = requested
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "prescription.pdf".to_string());

    let headers = [
        (header::CONTENT_TYPE, "application/pdf".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        ),
    ];
    Ok(axum::response::IntoResponse::into_response((headers, bytes)))
}

/// `GET /ws` — the chat bridge. One completion and one history append per
/// inbound message; failures are reported in-band and the connection
/// stays open.
async fn chat_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| chat_loop(socket, state))
}

async fn chat_loop(mut socket: WebSocket, state: AppState) {
    info!("chat connection opened");
    while let Some(received) = socket.recv().await {
        let message = match received {
            Ok(message) => message,
            Err(_) => break,
        };
        match message {
            Message::Text(text) => {
                let reply = match chat_turn(&state, text.as_str()).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!("chat turn failed: {e}");
                        format!("Error: {e}")
                    }
                };
                if socket.send(Message::Text(reply.into())).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    info!("chat connection closed");
}

/// One chat exchange: completion first, then persist, then the caller
/// sends the reply. Durability of the history never depends on the
/// connection staying open.
pub(crate) async fn chat_turn(state: &AppState, message: &str) -> Result<String> {
    let reply = state.analyzer.chat_reply(message).await?;
    let entry = ChatEntry {
        user: message.to_string(),
        bot: reply.clone(),
    };
    state.store.update(move |doc| doc.chat_history.push(entry)).await?;
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Completion;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    /// Answers by prompt shape, so the three-call chain and chat replies
    /// are distinguishable in assertions.
    struct CannedCompletion;

    #[async_trait]
    impl Completion for CannedCompletion {
        async fn complete(&self, prompt: &str, _max_tokens: u64) -> Result<String> {
            let reply = if prompt.ends_with("Diagnostic Suggestions:") {
                "diagnosis text"
            } else if prompt.ends_with("Recommendations:") {
                "recommendations text"
            } else if prompt.ends_with("Medications:") {
                "medications text"
            } else {
                "chat reply"
            };
            Ok(reply.to_string())
        }
    }

    struct FailingCompletion;

    #[async_trait]
    impl Completion for FailingCompletion {
        async fn complete(&self, _prompt: &str, _max_tokens: u64) -> Result<String> {
            Err(ServiceError::Completion("backend down".to_string()))
        }
    }

    fn test_state_with(completion: Arc<dyn Completion>) -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState {
            store: Arc::new(SessionStore::new(dir.path().join("data"))),
            extractor: Arc::new(PatternExtractor::new()),
            analyzer: Arc::new(AnalysisClient::new(completion)),
            renderer: Arc::new(PrescriptionRenderer::new(
                dir.path().join("output"),
                dir.path().join("missing-bg.png"),
            )),
        };
        (state, dir)
    }

    fn test_state() -> (AppState, tempfile::TempDir) {
        test_state_with(Arc::new(CannedCompletion))
    }

    fn seeded_doc() -> SessionDocument {
        let mut results = LabResults::new();
        results.insert("HAEMOGLOBIN".to_string(), "13.5".to_string());
        results.insert("PCV".to_string(), "42".to_string());
        SessionDocument::new(
            PatientInfo {
                name: Some("John Doe".to_string()),
                age: Some("45/M".to_string()),
                weight: Some("Not found".to_string()),
                height: Some("Not found".to_string()),
            },
            results,
            AnalysisBundle {
                analysis: "a".to_string(),
                recommendations: "r".to_string(),
                medications: "m".to_string(),
            },
        )
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn root_and_health_respond() {
        let (state, _dir) = test_state();
        let router = build_router(state);
        for uri in ["/", "/health"] {
            let response = router.clone().oneshot(get(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn results_before_any_upload_is_not_found() {
        let (state, _dir) = test_state();
        let router = build_router(state);
        let response = router.oneshot(get("/results")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn results_are_idempotent_between_mutations() {
        let (state, _dir) = test_state();
        state.store.replace(&seeded_doc()).await.unwrap();
        let router = build_router(state);

        let first = body_json(router.clone().oneshot(get("/results")).await.unwrap()).await;
        let second = body_json(router.oneshot(get("/results")).await.unwrap()).await;
        assert_eq!(first, second);
        assert_eq!(first["Patient Information"]["name"], "John Doe");
    }

    #[tokio::test]
    async fn upload_without_file_is_bad_request() {
        let (state, _dir) = test_state();
        let router = build_router(state);
        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                "multipart/form-data; boundary=XBOUNDARY",
            )
            .body(Body::from("--XBOUNDARY--\r\n"))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn update_profile_merges_and_round_trips() {
        let (state, _dir) = test_state();
        state.store.replace(&seeded_doc()).await.unwrap();
        let router = build_router(state);

        let response = router
            .clone()
            .oneshot(post_json("/update_profile", &json!({ "age": "45" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let results = body_json(router.oneshot(get("/results")).await.unwrap()).await;
        let patient = &results["Patient Information"];
        assert_eq!(patient["age"], "45");
        assert_eq!(patient["name"], "John Doe");
        assert_eq!(patient["weight"], "Not found");
        assert_eq!(patient["height"], "Not found");
    }

    #[tokio::test]
    async fn update_profile_without_session_is_not_found() {
        let (state, _dir) = test_state();
        let router = build_router(state);
        let response = router
            .oneshot(post_json("/update_profile", &json!({ "age": "45" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn update_analysis_fills_the_updated_slot() {
        let (state, _dir) = test_state();
        state.store.replace(&seeded_doc()).await.unwrap();
        let router = build_router(state.clone());

        let response = router
            .oneshot(post_json("/update_analysis", &json!(["HAEMOGLOBIN"])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["Analysis"], "diagnosis text");

        let doc = state.store.load().await.unwrap();
        let updated = doc.updated_analysis.unwrap();
        assert_eq!(updated.analysis, "diagnosis text");
        assert_eq!(updated.recommendations, "recommendations text");
        assert_eq!(updated.medications, "medications text");
        // The original bundle is untouched.
        assert_eq!(doc.analysis.analysis, "a");
    }

    #[tokio::test]
    async fn update_analysis_upstream_failure_maps_to_bad_gateway() {
        let (state, _dir) = test_state_with(Arc::new(FailingCompletion));
        state.store.replace(&seeded_doc()).await.unwrap();
        let router = build_router(state);

        let response = router
            .oneshot(post_json("/update_analysis", &json!(["PCV"])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn prescription_from_empty_updated_slot_is_bad_request() {
        let (state, _dir) = test_state();
        state.store.replace(&seeded_doc()).await.unwrap();
        let router = build_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/generate_prescription?isUpdate=true")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn prescription_renders_and_downloads() {
        let (state, _dir) = test_state();
        state.store.replace(&seeded_doc()).await.unwrap();
        let router = build_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/generate_prescription")
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let file_path = body["file_path"].as_str().unwrap().to_string();
        assert!(file_path.ends_with("John_Doe_prescription.pdf"));

        let uri = format!(
            "/download?file_path={}",
            file_path.replace('/', "%2F")
        );
        let response = router.oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.contains("John_Doe_prescription.pdf"));
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(bytes.starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn download_outside_output_dir_is_rejected() {
        let (state, dir) = test_state();
        state.store.replace(&seeded_doc()).await.unwrap();
        // The output dir only exists once something rendered into it.
        std::fs::create_dir_all(state.renderer.output_dir()).unwrap();
        let secret = dir.path().join("secret.txt");
        std::fs::write(&secret, "keep out").unwrap();
        let router = build_router(state);

        let uri = format!(
            "/download?file_path={}",
            secret.display().to_string().replace('/', "%2F")
        );
        let response = router.oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn download_missing_file_is_not_found() {
        let (state, _dir) = test_state();
        std::fs::create_dir_all(state.renderer.output_dir()).unwrap();
        let missing = state.renderer.output_dir().join("nope.pdf");
        let router = build_router(state);

        let uri = format!(
            "/download?file_path={}",
            missing.display().to_string().replace('/', "%2F")
        );
        let response = router.oneshot(get(&uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn chat_turns_append_history_in_order() {
        let (state, _dir) = test_state();
        state.store.replace(&seeded_doc()).await.unwrap();

        let first = chat_turn(&state, "what does PCV mean?").await.unwrap();
        let second = chat_turn(&state, "and haemoglobin?").await.unwrap();
        assert_eq!(first, "chat reply");
        assert_eq!(second, "chat reply");

        let doc = state.store.load().await.unwrap();
        assert_eq!(doc.chat_history.len(), 2);
        assert_eq!(doc.chat_history[0].user, "what does PCV mean?");
        assert_eq!(doc.chat_history[0].bot, "chat reply");
        assert_eq!(doc.chat_history[1].user, "and haemoglobin?");
    }

    #[tokio::test]
    async fn chat_turn_persists_before_reply_and_fails_typed() {
        let (state, _dir) = test_state_with(Arc::new(FailingCompletion));
        state.store.replace(&seeded_doc()).await.unwrap();

        let err = chat_turn(&state, "hello").await.unwrap_err();
        assert!(matches!(err, ServiceError::Completion(_)));
        // Failed turns leave no partial history entry.
        let doc = state.store.load().await.unwrap();
        assert!(doc.chat_history.is_empty());
    }
}
