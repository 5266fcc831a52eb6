//! HTTP route handlers.

use std::path::{Component, Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Multipart, Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use tokio_util::io::ReaderStream;

use crate::artifacts::TaskResult;
use crate::health::HealthSnapshot;
use crate::pipeline::SceneModel;
use crate::service::{SceneService, ServiceError, validate_upload_name};
use crate::status::StatusSnapshot;

type AppState<M> = State<Arc<SceneService<M>>>;

/// Error body shared by every route: `{"error": "..."}`.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::Load(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Pipeline(_) | ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "Request failed");
        }
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

async fn health<M: SceneModel>(State(service): AppState<M>) -> Json<HealthSnapshot> {
    Json(service.health())
}

async fn gpu_status<M: SceneModel>(State(service): AppState<M>) -> Json<StatusSnapshot> {
    Json(service.status())
}

async fn gpu_offload<M: SceneModel>(State(service): AppState<M>) -> impl IntoResponse {
    let released = service.offload();
    tracing::info!(released, "Offload requested via HTTP");
    Json(serde_json::json!({ "status": "offloaded" }))
}

/// `render_video` is on only for a case-insensitive `"true"`; anything else turns it off.
fn render_requested(value: &str) -> bool {
    value.eq_ignore_ascii_case("true")
}

async fn predict<M: SceneModel>(
    State(service): AppState<M>,
    mut multipart: Multipart,
) -> Result<Json<TaskResult>, ApiError> {
    let mut upload = None;
    let mut render_video = true;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err(ApiError::new(e.status(), e.body_text())),
        };
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::new(e.status(), e.body_text()))?;
                upload = Some((filename, bytes));
            }
            Some("render_video") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::new(e.status(), e.body_text()))?;
                render_video = render_requested(&text);
            }
            _ => {}
        }
    }

    let Some((filename, bytes)) = upload else {
        return Err(ApiError::bad_request("No file provided"));
    };
    validate_upload_name(&filename)?;

    let staged = service
        .artifacts()
        .stage_upload(&filename, &bytes)
        .await
        .map_err(ServiceError::from)?;
    tracing::info!(
        task_id = %staged.task_id,
        filename = %filename,
        bytes = bytes.len(),
        render_video,
        "Prediction requested via HTTP"
    );

    let result = service.predict_upload(staged, render_video).await?;
    Ok(Json(result))
}

async fn download<M: SceneModel>(
    State(service): AppState<M>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    let path = service.artifact(&filename).await?;
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| ApiError::new(StatusCode::NOT_FOUND, "File not found"))?;
    let mime = mime_guess::from_path(&path).first_or_octet_stream();

    Ok((
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

async fn task_result<M: SceneModel>(
    State(service): AppState<M>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskResult>, ApiError> {
    Ok(Json(service.task_result(&task_id).await?))
}

async fn index(State(dir): State<Arc<PathBuf>>) -> Result<Response, ApiError> {
    static_file(&dir, "index.html").await
}

async fn static_asset(
    State(dir): State<Arc<PathBuf>>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    static_file(&dir, &path).await
}

/// Stream a file from the web UI directory. Only plain relative paths resolve.
async fn static_file(dir: &FsPath, relative: &str) -> Result<Response, ApiError> {
    let not_found = || ApiError::new(StatusCode::NOT_FOUND, "File not found");
    let relative = FsPath::new(relative);
    if !relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(not_found());
    }

    let path = dir.join(relative);
    let is_file = tokio::fs::metadata(&path)
        .await
        .is_ok_and(|meta| meta.is_file());
    if !is_file {
        return Err(not_found());
    }
    let file = tokio::fs::File::open(&path).await.map_err(|_| not_found())?;
    let mime = mime_guess::from_path(&path).first_or_octet_stream();

    Ok((
        [(header::CONTENT_TYPE, mime.to_string())],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// Browser front-end: `/` serves `index.html` and `/static/...` the assets
/// next to it.
pub fn web_ui(static_dir: impl Into<PathBuf>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/static/{*path}", get(static_asset))
        .with_state(Arc::new(static_dir.into()))
}

pub fn routes<M: SceneModel>(service: Arc<SceneService<M>>) -> Router {
    Router::new()
        .route("/health", get(health::<M>))
        .route("/api/gpu/status", get(gpu_status::<M>))
        .route("/api/gpu/offload", post(gpu_offload::<M>))
        .route("/api/predict", post(predict::<M>))
        .route("/api/files/{filename}", get(download::<M>))
        .route("/api/result/{task_id}", get(task_result::<M>))
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactStore;
    use crate::device::Device;
    use crate::service::testing::{FakeLoader, FakeModel, manager};
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "sharplet-test-boundary";

    fn service_with(device: Device, loader: FakeLoader) -> (Arc<SceneService<FakeModel>>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let service = SceneService::new(
            manager(device),
            Arc::new(loader),
            ArtifactStore::new(dir.path().join("output")),
        );
        (Arc::new(service), dir)
    }

    fn cuda_service() -> (Arc<SceneService<FakeModel>>, TempDir) {
        service_with(Device::Cuda, FakeLoader::new())
    }

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Multipart body with an optional file part and extra text fields.
    fn multipart(file: Option<(&str, &[u8])>, fields: &[(&str, &str)]) -> Request<Body> {
        let mut body = Vec::new();
        if let Some((filename, contents)) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(contents);
            body.extend_from_slice(b"\r\n");
        }
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::post("/api/predict")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_service_and_version() {
        let (service, _dir) = cuda_service();
        let app = routes(service);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], "sharp");
        assert!(json["version"]["sharplet"].is_string());
    }

    #[tokio::test]
    async fn status_starts_unloaded() {
        let (service, _dir) = cuda_service();
        let app = routes(service);

        let response = app
            .oneshot(Request::get("/api/gpu/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["model_loaded"], false);
        assert_eq!(json["state"], "empty");
        assert_eq!(json["idle_timeout"], 300);
    }

    #[tokio::test]
    async fn predict_upload_then_fetch_result_and_files() {
        let (service, _dir) = cuda_service();
        let app = routes(service.clone());

        let response = app
            .clone()
            .oneshot(multipart(Some(("room.jpg", b"jpeg")), &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        let task_id = json["task_id"].as_str().unwrap().to_string();
        assert_eq!(json["ply_url"], format!("/api/files/{task_id}.ply"));
        assert_eq!(json["video_url"], format!("/api/files/{task_id}.mp4"));

        let response = app
            .clone()
            .oneshot(Request::get("/api/gpu/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response_json(response).await;
        assert_eq!(status["model_loaded"], true);
        assert_eq!(status["device"], "cuda");

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/api/result/{task_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await, json);

        let response = app
            .oneshot(
                Request::get(format!("/api/files/{task_id}.ply"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let disposition = response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(disposition, format!("attachment; filename=\"{task_id}.ply\""));
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"ply\n");
    }

    #[tokio::test]
    async fn predict_respects_render_video_false() {
        let (service, _dir) = cuda_service();
        let app = routes(service);

        let response = app
            .oneshot(multipart(
                Some(("room.png", b"png")),
                &[("render_video", "false")],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert!(json["video_url"].is_null());
    }

    #[tokio::test]
    async fn predict_on_cpu_has_no_video() {
        let (service, _dir) = service_with(Device::Cpu, FakeLoader::new());
        let app = routes(service);

        let response = app
            .oneshot(multipart(Some(("room.png", b"png")), &[]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response_json(response).await["video_url"].is_null());
    }

    #[tokio::test]
    async fn predict_without_file_is_bad_request() {
        let (service, _dir) = cuda_service();
        let app = routes(service);

        let response = app
            .oneshot(multipart(None, &[("render_video", "true")]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        insta::assert_json_snapshot!(response_json(response).await, @r#"
        {
          "error": "No file provided"
        }
        "#);
    }

    #[tokio::test]
    async fn predict_with_empty_filename_is_bad_request() {
        let (service, _dir) = cuda_service();
        let app = routes(service);

        let response = app
            .oneshot(multipart(Some(("", b"jpeg")), &[]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_json(response).await["error"], "Empty filename");
    }

    #[tokio::test]
    async fn predict_rejects_unsupported_extension() {
        let (service, _dir) = cuda_service();
        let app = routes(service.clone());

        let response = app
            .oneshot(multipart(Some(("clip.gif", b"gif")), &[]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        insta::assert_json_snapshot!(response_json(response).await, @r#"
        {
          "error": "unsupported image format: .gif"
        }
        "#);
        assert!(!service.status().model_loaded, "rejected input must not load the model");
    }

    #[tokio::test]
    async fn render_video_other_than_true_skips_the_video() {
        let (service, _dir) = cuda_service();
        let app = routes(service);

        for value in ["maybe", "", "1", "TRUE"] {
            let response = app
                .clone()
                .oneshot(multipart(
                    Some(("room.jpg", b"jpeg")),
                    &[("render_video", value)],
                ))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK, "{value:?}");
            let json = response_json(response).await;
            assert_eq!(json["video_url"].is_null(), value != "TRUE", "{value:?}");
        }
    }

    #[tokio::test]
    async fn load_failure_is_service_unavailable() {
        let loader = FakeLoader {
            fail: true,
            ..FakeLoader::new()
        };
        let (service, _dir) = service_with(Device::Cuda, loader);
        let app = routes(service.clone());

        let response = app
            .oneshot(multipart(Some(("room.jpg", b"jpeg")), &[]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        insta::assert_json_snapshot!(response_json(response).await, @r#"
        {
          "error": "model load failed: checkpoint not found"
        }
        "#);
        assert!(!service.status().model_loaded);
    }

    #[tokio::test]
    async fn pipeline_failure_is_internal_error() {
        let (service, _dir) = cuda_service();
        let app = routes(service.clone());

        let response = app
            .oneshot(multipart(Some(("room.jpg", b"broken")), &[]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response_json(response).await["error"],
            "cannot identify image file"
        );
        assert!(service.status().model_loaded, "a bad input keeps the model resident");
    }

    #[tokio::test]
    async fn offload_always_reports_offloaded() {
        let (service, _dir) = cuda_service();
        let app = routes(service.clone());

        let response = app
            .clone()
            .oneshot(multipart(Some(("room.jpg", b"jpeg")), &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(service.status().model_loaded);

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(Request::post("/api/gpu/offload").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response_json(response).await,
                serde_json::json!({ "status": "offloaded" })
            );
        }
        assert!(!service.status().model_loaded);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let (service, _dir) = cuda_service();
        let app = routes(service);

        for uri in ["/api/files/nope.ply", "/api/files/..%2Fsecret"] {
            let response = app
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(response_json(response).await["error"], "File not found");
        }
    }

    #[tokio::test]
    async fn unknown_result_is_not_found() {
        let (service, _dir) = cuda_service();
        let app = routes(service);

        let response = app
            .oneshot(Request::get("/api/result/deadbeef").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        insta::assert_json_snapshot!(response_json(response).await, @r#"
        {
          "error": "Result not found"
        }
        "#);
    }

    #[test]
    fn render_flag_is_true_only_for_true() {
        assert!(render_requested("true"));
        assert!(render_requested("True"));
        assert!(!render_requested("false"));
        assert!(!render_requested("yes"));
        assert!(!render_requested(" true"));
    }

    fn web_ui_dir() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>sharp</html>").unwrap();
        std::fs::create_dir(dir.path().join("js")).unwrap();
        std::fs::write(dir.path().join("app.js"), "main();").unwrap();
        std::fs::write(dir.path().join("js").join("splat.js"), "splat();").unwrap();
        dir
    }

    #[tokio::test]
    async fn web_ui_serves_index_and_assets() {
        let dir = web_ui_dir();
        let app = web_ui(dir.path());

        let response = app
            .clone()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"<html>sharp</html>");

        for (uri, body) in [
            ("/static/app.js", &b"main();"[..]),
            ("/static/js/splat.js", &b"splat();"[..]),
        ] {
            let response = app
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
            let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
            assert!(content_type.ends_with("javascript"), "{uri}: {content_type}");
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&bytes[..], body, "{uri}");
        }
    }

    #[tokio::test]
    async fn web_ui_rejects_missing_and_escaping_paths() {
        let dir = web_ui_dir();
        let app = web_ui(dir.path());

        for uri in ["/static/nope.js", "/static/js", "/static/..%2Findex.html"] {
            let response = app
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(response_json(response).await["error"], "File not found");
        }
    }

    #[tokio::test]
    async fn web_ui_merges_with_the_api() {
        let dir = web_ui_dir();
        let (service, _out) = cuda_service();
        let app = routes(service).merge(web_ui(dir.path()));

        for uri in ["/", "/health"] {
            let response = app
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
        }
    }
}
