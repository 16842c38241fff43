use actix_cors::Cors;
use actix_multipart::Multipart;
use actix_web::{get, post, web, App, HttpResponse, HttpServer, Responder};
use futures::{StreamExt, TryStreamExt};
use log::{error, info};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use email_enricher_lib::{logger, EnricherConfig, LookupEngine, Pipeline, Record, RowStatus};

mod job_manager;
use job_manager::JobManager;

const UPLOAD_DIR: &str = "uploads";
const OUTPUT_DIR: &str = "outputs";
const STATIC_DIR: &str = "./frontend/dist";

struct AppState {
    job_manager: Arc<JobManager>,
    config: EnricherConfig,
}

#[derive(serde::Deserialize)]
struct VerifyRequest {
    name: String,
    domain: String,
    email: Option<String>,
}

fn output_path(job_id: &str) -> PathBuf {
    Path::new(OUTPUT_DIR).join(format!("results_{}.csv", job_id))
}

/// Extension the stored upload gets, so the loader picks the right reader.
fn upload_extension(original_name: Option<&str>) -> &'static str {
    let name = original_name.unwrap_or_default().to_lowercase();
    if name.ends_with(".xlsx") {
        "xlsx"
    } else if name.ends_with(".xls") {
        "xls"
    } else {
        "csv"
    }
}

#[get("/api/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json("Server is running")
}

#[post("/api/upload")]
async fn upload_file(mut payload: Multipart, data: web::Data<AppState>) -> impl Responder {
    if let Err(e) = std::fs::create_dir_all(UPLOAD_DIR).and_then(|_| std::fs::create_dir_all(OUTPUT_DIR)) {
        error!("Could not create working directories: {}", e);
        return HttpResponse::InternalServerError().json("Could not prepare storage");
    }

    let job_id = Uuid::new_v4().to_string();
    let mut saved: Option<PathBuf> = None;

    while let Ok(Some(mut field)) = payload.try_next().await {
        let disposition = field.content_disposition();
        if disposition.get_name().unwrap_or("") != "file" {
            continue;
        }
        let extension = upload_extension(disposition.get_filename());
        let file_path = Path::new(UPLOAD_DIR).join(format!("{}.{}", job_id, extension));

        let mut f = match std::fs::File::create(&file_path) {
            Ok(f) => f,
            Err(e) => {
                error!("Could not store upload {:?}: {}", file_path, e);
                return HttpResponse::InternalServerError().json("Could not store upload");
            }
        };
        while let Some(chunk) = field.next().await {
            let written = chunk
                .map_err(|e| e.to_string())
                .and_then(|bytes| f.write_all(&bytes).map_err(|e| e.to_string()));
            if let Err(e) = written {
                error!("Upload {} interrupted: {}", job_id, e);
                return HttpResponse::BadRequest().json("Upload interrupted");
            }
        }
        saved = Some(file_path);
    }

    let Some(file_path) = saved else {
        return HttpResponse::BadRequest().json("Missing multipart field 'file'");
    };

    data.job_manager.start_job(job_id.clone(), file_path, output_path(&job_id));
    info!("Queued job {}", job_id);

    HttpResponse::Ok().json(serde_json::json!({
        "status": "success",
        "job_id": job_id,
        "message": "File uploaded and job queued."
    }))
}

/// One-off lookup for a single person; answers with the finished row.
#[post("/api/verify")]
async fn verify_single(body: web::Json<VerifyRequest>, data: web::Data<AppState>) -> impl Responder {
    let request = body.into_inner();
    let mut record = Record::new(request.name.trim(), request.domain.trim());
    if let Some(hint) = request.email.filter(|e| !e.trim().is_empty()) {
        record = record.with_email_hint(hint.trim());
    }

    let engine = match LookupEngine::from_config(&data.config) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!("Could not build lookup engine: {}", e);
            return HttpResponse::InternalServerError().json(e.to_string());
        }
    };
    let row = Pipeline::new(&data.config).verify_one(record, engine).await;
    let status = row.status();
    info!("Single lookup for {:?} -> {}", row.record.name, status.as_str());

    let body = serde_json::json!({
        "status": status.as_str(),
        "email": row.email(),
        "result": &row,
    });
    if status == RowStatus::Skipped {
        HttpResponse::UnprocessableEntity().json(body)
    } else {
        HttpResponse::Ok().json(body)
    }
}

#[get("/api/status/{job_id}")]
async fn get_status(path: web::Path<String>, data: web::Data<AppState>) -> impl Responder {
    match data.job_manager.status(&path.into_inner()) {
        Some(job) => HttpResponse::Ok().json(job),
        None => HttpResponse::NotFound().json("Job not found"),
    }
}

#[get("/api/download/{job_id}")]
async fn download_result(path: web::Path<String>) -> impl Responder {
    let job_id = path.into_inner();
    // rows are flushed one by one, so a running job yields a partial file
    match std::fs::read(output_path(&job_id)) {
        Ok(content) => HttpResponse::Ok()
            .content_type("text/csv")
            .append_header((
                "Content-Disposition",
                format!("attachment; filename=\"results_{}.csv\"", job_id),
            ))
            .body(content),
        Err(_) => HttpResponse::NotFound().body("Result file not generated yet."),
    }
}

#[post("/api/stop/{job_id}")]
async fn stop_job(path: web::Path<String>, data: web::Data<AppState>) -> impl Responder {
    if data.job_manager.stop(&path.into_inner()) {
        HttpResponse::Ok().json("Job stopping")
    } else {
        HttpResponse::NotFound().json("Job not found")
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let config_path = std::env::var("ENRICHER_CONFIG").ok().map(PathBuf::from);
    let config = EnricherConfig::load(config_path.as_deref())
        .and_then(|c| c.validate().map(|_| c))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    logger::init(&config.log_level);

    let port = config.port;
    let job_manager = Arc::new(JobManager::new(config.clone()));
    let state = web::Data::new(AppState { job_manager, config });

    info!("Starting Web Server at http://0.0.0.0:{}", port);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header();

        let mut app = App::new()
            .wrap(cors)
            .app_data(state.clone())
            .service(health_check)
            .service(upload_file)
            .service(verify_single)
            .service(get_status)
            .service(download_result)
            .service(stop_job);
        if Path::new(STATIC_DIR).is_dir() {
            app = app.service(actix_files::Files::new("/", STATIC_DIR).index_file("index.html"));
        }
        app
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test};

    fn state() -> web::Data<AppState> {
        web::Data::new(AppState {
            job_manager: Arc::new(JobManager::new(EnricherConfig::default())),
            config: EnricherConfig::default(),
        })
    }

    #[test]
    fn keeps_spreadsheet_extensions() {
        assert_eq!(upload_extension(Some("People.XLSX")), "xlsx");
        assert_eq!(upload_extension(Some("old.xls")), "xls");
        assert_eq!(upload_extension(Some("list.txt")), "csv");
        assert_eq!(upload_extension(None), "csv");
    }

    #[actix_web::test]
    async fn health_and_unknown_jobs() {
        let app = test::init_service(
            App::new()
                .app_data(state())
                .service(health_check)
                .service(get_status)
                .service(stop_job),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/api/health").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = test::call_service(&app, test::TestRequest::get().uri("/api/status/nope").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = test::call_service(&app, test::TestRequest::post().uri("/api/stop/nope").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn verify_rejects_unusable_entries() {
        let app = test::init_service(App::new().app_data(state()).service(verify_single)).await;

        let req = test::TestRequest::post()
            .uri("/api/verify")
            .set_json(serde_json::json!({"name": "A Smith", "domain": "  "}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "skipped");
        assert_eq!(body["result"]["index"], 0);
        assert!(body["email"].is_null());

        let req = test::TestRequest::post()
            .uri("/api/verify")
            .set_json(serde_json::json!({"domain": "acme.com"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
