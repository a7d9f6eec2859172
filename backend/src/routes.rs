use actix_multipart::Multipart;
use actix_web::middleware::Condition;
use actix_web::{HttpResponse, web};
use actix_web_httpauth::middleware::HttpAuthentication;
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use shared::{HealthResponse, ModelDescriptor, ModelsResponse, SubmitResponse};
use std::path::Path;
use uuid::Uuid;

use crate::auth;
use crate::config::{ModelRegistry, Settings};
use crate::detect::cache::DetectorCache;
use crate::error::AnalysisError;
use crate::storage::results_store::ResultsStore;
use crate::task::registry::{NewTask, TaskRegistry};
use crate::task::worker::{AnalysisJob, WorkerPool};

pub fn configure_routes(cfg: &mut web::ServiceConfig, require_key: bool) {
    cfg.service(web::resource("/health").route(web::get().to(health)))
        .service(
            web::scope("/api")
                .wrap(Condition::new(
                    require_key,
                    HttpAuthentication::bearer(auth::validate_api_key),
                ))
                .service(web::resource("/videos").route(web::post().to(submit_video)))
                .service(web::resource("/tasks/{task_id}").route(web::get().to(task_status)))
                .service(
                    web::resource("/tasks/{task_id}/cancel").route(web::post().to(cancel_task)),
                )
                .service(web::resource("/results").route(web::get().to(list_results)))
                .service(web::resource("/results/{task_id}").route(web::delete().to(delete_result)))
                .service(web::resource("/models").route(web::get().to(list_models))),
        );
}

#[derive(Debug, Deserialize)]
pub struct SubmitQuery {
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Accept a video upload and schedule it for analysis. Validation and
/// capacity problems are rejected here, before any task record exists;
/// everything later surfaces through the task's terminal state.
async fn submit_video(
    mut payload: Multipart,
    query: web::Query<SubmitQuery>,
    settings: web::Data<Settings>,
    models: web::Data<ModelRegistry>,
    registry: web::Data<TaskRegistry>,
    pool: web::Data<WorkerPool>,
) -> Result<HttpResponse, AnalysisError> {
    let model_name = query.model.as_deref().unwrap_or(&models.default_model);
    let spec = models
        .get(model_name)
        .ok_or_else(|| AnalysisError::Validation(format!("unknown model '{model_name}'")))?
        .clone();

    let (filename, data) = read_video_field(&mut payload, settings.max_file_size).await?;
    let extension = Path::new(&filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| AnalysisError::Validation(format!("'{filename}' has no file extension")))?;
    if !settings.extension_allowed(&extension) {
        return Err(AnalysisError::Validation(format!(
            "unsupported file format '.{extension}'"
        )));
    }
    if data.is_empty() {
        return Err(AnalysisError::Validation(
            "uploaded file is empty".to_string(),
        ));
    }

    let digest = {
        let mut hasher = Sha256::new();
        hasher.update(&data);
        hex::encode(hasher.finalize())
    };

    let task_id = registry.submit(NewTask {
        filename: filename.clone(),
        model_name: spec.name.clone(),
        content_digest: digest,
    })?;

    let video_path = settings.upload_dir.join(format!("{task_id}.{extension}"));
    if let Err(e) = tokio::fs::write(&video_path, &data).await {
        registry.discard_unstarted(task_id);
        return Err(e.into());
    }

    if let Err(e) = pool.dispatch(AnalysisJob {
        task_id,
        video_path: video_path.clone(),
        model: spec.clone(),
    }) {
        // The queue is sized to the registry ceiling; losing this race
        // must not leave a task record or an orphaned upload behind.
        registry.discard_unstarted(task_id);
        if let Err(remove_err) = tokio::fs::remove_file(&video_path).await {
            log::warn!(
                "could not remove orphaned upload {}: {remove_err}",
                video_path.display()
            );
        }
        return Err(e);
    }

    log::info!(
        "accepted '{filename}' as task {task_id} (model {})",
        spec.name
    );
    Ok(HttpResponse::Accepted().json(SubmitResponse {
        task_id,
        filename,
        model: spec.name.clone(),
        status_url: format!("/api/tasks/{task_id}"),
    }))
}

async fn task_status(
    path: web::Path<String>,
    registry: web::Data<TaskRegistry>,
) -> Result<HttpResponse, AnalysisError> {
    let task_id = parse_task_id(&path)?;
    let snapshot = registry.snapshot(task_id)?;
    Ok(HttpResponse::Ok().json(snapshot))
}

async fn cancel_task(
    path: web::Path<String>,
    registry: web::Data<TaskRegistry>,
    store: web::Data<ResultsStore>,
) -> Result<HttpResponse, AnalysisError> {
    let task_id = parse_task_id(&path)?;
    // A task cancelled before any worker claimed it goes terminal here, so
    // its history record is written on this path.
    if let Some(snapshot) = registry.request_cancel(task_id)? {
        if let Some(record) = crate::storage::results_store::to_stored(&snapshot) {
            store.save(&record).await?;
        }
    }
    log::info!("cancel requested for task {task_id}");
    Ok(HttpResponse::Ok().json(json!({ "ok": true })))
}

async fn list_results(
    query: web::Query<PageQuery>,
    store: web::Data<ResultsStore>,
) -> Result<HttpResponse, AnalysisError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let offset = query.offset.unwrap_or(0);
    let page = store.list(limit, offset).await?;
    Ok(HttpResponse::Ok().json(page))
}

async fn delete_result(
    path: web::Path<String>,
    store: web::Data<ResultsStore>,
    registry: web::Data<TaskRegistry>,
) -> Result<HttpResponse, AnalysisError> {
    let task_id = parse_task_id(&path)?;
    let deleted = store.delete(task_id).await?;
    let evicted = registry.remove_terminal(task_id);
    if deleted || evicted {
        Ok(HttpResponse::Ok().json(json!({ "ok": true })))
    } else {
        Err(AnalysisError::NotFound(task_id))
    }
}

async fn list_models(
    settings: web::Data<Settings>,
    models: web::Data<ModelRegistry>,
) -> HttpResponse {
    let descriptors: Vec<ModelDescriptor> = models
        .models
        .iter()
        .map(|spec| ModelDescriptor {
            name: spec.name.clone(),
            display_name: spec.display_name.clone(),
            description: spec.description.clone(),
            input_size: spec.input_size,
            threshold: spec.threshold,
            available: settings.models_dir.join(&spec.file).exists(),
            is_default: spec.name == models.default_model,
        })
        .collect();
    HttpResponse::Ok().json(ModelsResponse {
        models: descriptors,
        default_model: models.default_model.clone(),
    })
}

async fn health(
    registry: web::Data<TaskRegistry>,
    detectors: web::Data<DetectorCache>,
) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        active_tasks: registry.active_count(),
        loaded_models: detectors.loaded(),
    })
}

fn parse_task_id(raw: &str) -> Result<Uuid, AnalysisError> {
    Uuid::parse_str(raw).map_err(|_| AnalysisError::Validation(format!("invalid task id '{raw}'")))
}

/// Pull the first file field out of the multipart payload, enforcing the
/// size cap while streaming.
async fn read_video_field(
    payload: &mut Multipart,
    max_size: usize,
) -> Result<(String, Vec<u8>), AnalysisError> {
    while let Ok(Some(mut field)) = payload.try_next().await {
        let raw_name = field
            .content_disposition()
            .and_then(|cd| cd.get_filename().map(str::to_string));
        let Some(raw_name) = raw_name else { continue };
        let filename = sanitize_filename(&raw_name)?;

        let mut data = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk =
                chunk.map_err(|e| AnalysisError::Validation(format!("malformed upload: {e}")))?;
            if data.len() + chunk.len() > max_size {
                return Err(AnalysisError::Validation(format!(
                    "file exceeds the {} MB limit",
                    max_size / (1024 * 1024)
                )));
            }
            data.extend_from_slice(&chunk);
        }
        return Ok((filename, data));
    }
    Err(AnalysisError::Validation(
        "no video file in request".to_string(),
    ))
}

/// Strip any path components; uploads only keep their base name.
fn sanitize_filename(raw: &str) -> Result<String, AnalysisError> {
    let name = Path::new(raw)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AnalysisError::Validation("invalid filename".to_string()))?;
    if name.len() > 255 {
        return Err(AnalysisError::Validation(
            "filename too long (max 255 characters)".to_string(),
        ));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::cache::TorchLoader;
    use crate::task::worker::WorkerContext;
    use actix_web::http::StatusCode;
    use actix_web::{App, test};
    use std::sync::Arc;

    struct TestState {
        settings: Arc<Settings>,
        models: Arc<ModelRegistry>,
        registry: Arc<TaskRegistry>,
        store: Arc<ResultsStore>,
        detectors: Arc<DetectorCache>,
        pool: WorkerPool,
        _root: tempfile::TempDir,
    }

    async fn state() -> TestState {
        let root = tempfile::tempdir().unwrap();
        let mut settings = Settings::from_env();
        settings.upload_dir = root.path().join("uploads");
        settings.results_dir = root.path().join("results");
        settings.models_dir = root.path().join("models");
        settings.max_concurrent_tasks = 2;
        settings.worker_count = 1;
        settings.ensure_directories().unwrap();

        let settings = Arc::new(settings);
        let models = Arc::new(ModelRegistry::builtin());
        let registry = Arc::new(TaskRegistry::new(settings.max_concurrent_tasks));
        let store = Arc::new(ResultsStore::open(&settings.results_dir).await.unwrap());
        let detectors = Arc::new(DetectorCache::new(Arc::new(TorchLoader::new(
            settings.models_dir.clone(),
        ))));
        let pool = WorkerPool::start(WorkerContext {
            settings: settings.clone(),
            registry: registry.clone(),
            detectors: detectors.clone(),
            store: store.clone(),
        });
        TestState {
            settings,
            models,
            registry,
            store,
            detectors,
            pool,
            _root: root,
        }
    }

    macro_rules! test_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::from($state.settings.clone()))
                    .app_data(web::Data::from($state.models.clone()))
                    .app_data(web::Data::from($state.registry.clone()))
                    .app_data(web::Data::from($state.store.clone()))
                    .app_data(web::Data::from($state.detectors.clone()))
                    .app_data(web::Data::new($state.pool.clone()))
                    .configure(|cfg| configure_routes(cfg, false)),
            )
            .await
        };
    }

    fn multipart_body(filename: &str, content: &[u8]) -> (String, Vec<u8>) {
        let boundary = "------------------------abcdef123456";
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n")
                .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        (format!("multipart/form-data; boundary={boundary}"), body)
    }

    #[actix_web::test]
    async fn unknown_model_is_rejected_without_a_task() {
        let state = state().await;
        let app = test_app!(state);

        let (content_type, body) = multipart_body("clip.mp4", b"fake video bytes");
        let req = test::TestRequest::post()
            .uri("/api/videos?model=nope")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.registry.active_count(), 0);
    }

    #[actix_web::test]
    async fn unsupported_extension_is_rejected() {
        let state = state().await;
        let app = test_app!(state);

        let (content_type, body) = multipart_body("notes.txt", b"plain text");
        let req = test::TestRequest::post()
            .uri("/api/videos")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.registry.active_count(), 0);
    }

    #[actix_web::test]
    async fn status_of_unknown_task_is_not_found() {
        let state = state().await;
        let app = test_app!(state);

        let req = test::TestRequest::get()
            .uri(&format!("/api/tasks/{}", Uuid::new_v4()))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get()
            .uri("/api/tasks/not-a-uuid")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn cancel_of_unknown_task_is_not_found() {
        let state = state().await;
        let app = test_app!(state);

        let req = test::TestRequest::post()
            .uri(&format!("/api/tasks/{}/cancel", Uuid::new_v4()))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn undecodable_video_fails_with_a_decode_error() {
        let state = state().await;
        let app = test_app!(state);

        let (content_type, body) = multipart_body("garbage.mp4", b"this is not an mp4 container");
        let req = test::TestRequest::post()
            .uri("/api/videos")
            .insert_header(("content-type", content_type))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let submitted: SubmitResponse = test::read_body_json(resp).await;

        let mut terminal = None;
        for _ in 0..100 {
            let req = test::TestRequest::get()
                .uri(&format!("/api/tasks/{}", submitted.task_id))
                .to_request();
            let current: shared::TaskSnapshot = test::call_and_read_body_json(&app, req).await;
            if current.status.is_terminal() {
                terminal = Some(current);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        let snapshot = terminal.expect("task never reached a terminal state");
        assert_eq!(snapshot.status, shared::TaskStatus::Failed);
        assert!(snapshot.result.is_none());
        assert_eq!(snapshot.error.unwrap().kind, shared::FailureKind::Decode);

        // The failure lands in the history shortly after the transition.
        let mut recorded = false;
        for _ in 0..100 {
            let req = test::TestRequest::get().uri("/api/results").to_request();
            let page: shared::ResultPage = test::call_and_read_body_json(&app, req).await;
            if page.results.len() == 1 {
                assert_eq!(page.results[0].task_id, submitted.task_id);
                assert_eq!(page.results[0].status, shared::TaskStatus::Failed);
                recorded = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(recorded, "failed task never reached the results store");
    }

    #[actix_web::test]
    async fn empty_history_and_delete_of_absent_record() {
        let state = state().await;
        let app = test_app!(state);

        let req = test::TestRequest::get().uri("/api/results").to_request();
        let page: shared::ResultPage = test::call_and_read_body_json(&app, req).await;
        assert!(page.results.is_empty());
        assert!(!page.has_more);

        let req = test::TestRequest::delete()
            .uri(&format!("/api/results/{}", Uuid::new_v4()))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn models_listing_marks_the_default() {
        let state = state().await;
        let app = test_app!(state);

        let req = test::TestRequest::get().uri("/api/models").to_request();
        let listed: ModelsResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(listed.default_model, "xception");
        assert_eq!(listed.models.len(), 2);
        let default = listed.models.iter().find(|m| m.is_default).unwrap();
        assert_eq!(default.name, "xception");
        // No weight files in the test models dir.
        assert!(listed.models.iter().all(|m| !m.available));
    }

    #[actix_web::test]
    async fn health_reports_active_tasks() {
        let state = state().await;
        let app = test_app!(state);

        state
            .registry
            .submit(NewTask {
                filename: "clip.mp4".to_string(),
                model_name: "xception".to_string(),
                content_digest: "digest".to_string(),
            })
            .unwrap();

        let req = test::TestRequest::get().uri("/health").to_request();
        let health: HealthResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.active_tasks, 1);
        assert!(health.loaded_models.is_empty());
    }

    #[::core::prelude::v1::test]
    fn filenames_are_reduced_to_their_base_name() {
        assert_eq!(
            sanitize_filename("../../etc/passwd.mp4").unwrap(),
            "passwd.mp4"
        );
        assert_eq!(sanitize_filename("clip.mp4").unwrap(), "clip.mp4");
        assert!(sanitize_filename(&"x".repeat(300)).is_err());
    }
}
