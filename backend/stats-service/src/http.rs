//! HTTP adapter: upload and average queries
use actix_multipart::{Field, Multipart};
use actix_web::http::header::{ContentDisposition, CONTENT_DISPOSITION};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use tracing::{error, info};

use crate::error::{AppError, Result};
use crate::ingest::IngestService;
use crate::metrics::metrics_handler;
use crate::services::StatsQuery;

const UPLOAD_FIELD: &str = "file";
const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub query: StatsQuery,
    pub ingest: IngestService,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/status", web::get().to(status))
        .route("/metrics", web::get().to(metrics_handler))
        .route("/upload", web::post().to(upload))
        .route("/{team}/{season}", web::get().to(team_average))
        .route("/{team}/{season}/{player}", web::get().to(player_average));
}

async fn status() -> HttpResponse {
    HttpResponse::Ok().body("ok")
}

async fn team_average(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse> {
    let (team, season) = path.into_inner();
    let average = state.query.team_average(&team, &season).await?;
    Ok(HttpResponse::Ok().json(average))
}

async fn player_average(
    state: web::Data<AppState>,
    path: web::Path<(String, String, String)>,
) -> Result<HttpResponse> {
    let (team, season, player) = path.into_inner();
    let average = state.query.player_average(&player, &team, &season).await?;
    Ok(HttpResponse::Ok().json(average))
}

async fn upload(state: web::Data<AppState>, mut payload: Multipart) -> Result<HttpResponse> {
    let mut file: Option<Vec<u8>> = None;

    while let Some(item) = payload.next().await {
        let field = item.map_err(|e| AppError::BadRequest(format!("invalid multipart body: {e}")))?;

        let is_upload = field_name(&field).as_deref() == Some(UPLOAD_FIELD);
        let bytes = read_field(field).await?;
        if is_upload && file.is_none() {
            file = Some(bytes);
        }
    }

    let data = file.ok_or_else(|| {
        AppError::BadRequest(format!("missing form field '{UPLOAD_FIELD}'"))
    })?;

    info!(bytes = data.len(), "Received stats upload");
    let summary = state.ingest.ingest_csv(&data).await?;

    Ok(HttpResponse::Ok().json(summary))
}

fn field_name(field: &Field) -> Option<String> {
    let header = field.headers().get(CONTENT_DISPOSITION)?;
    let disposition = ContentDisposition::from_raw(header).ok()?;
    disposition.get_name().map(str::to_string)
}

async fn read_field(mut field: Field) -> Result<Vec<u8>> {
    let mut data = Vec::new();

    while let Some(chunk) = field.next().await {
        let bytes = chunk.map_err(|e| {
            error!("Error reading upload field: {}", e);
            AppError::BadRequest(format!("failed to read upload: {e}"))
        })?;

        if data.len() + bytes.len() > MAX_UPLOAD_BYTES {
            return Err(AppError::BadRequest("upload exceeds 50MB limit".into()));
        }
        data.extend_from_slice(&bytes);
    }

    Ok(data)
}
