use actix_cors::Cors;
use actix_multipart::{Field, Multipart};
use actix_web::{Error, HttpResponse, web};
use futures::{StreamExt, TryStreamExt};
use log::{error, info, warn};
use serde_json::json;
use shared::{ErrorResponse, HealthResponse};

use crate::config::ALLOWED_ORIGINS;
use crate::model::Classifier;
use crate::pipeline::{self, PredictError};

const UPLOAD_FIELD: &str = "file";

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/").route(web::get().to(health)))
        .service(web::resource("/predict").route(web::post().to(predict)));
}

pub fn cors() -> Cors {
    ALLOWED_ORIGINS
        .iter()
        .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
        .allow_any_method()
        .allow_any_header()
        .supports_credentials()
        .max_age(3600)
}

async fn health(classifier: web::Data<dyn Classifier>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse::healthy(classifier.name()))
}

enum Upload {
    Image(Vec<u8>),
    NotAnImage(Option<String>),
    Missing,
}

async fn drain(field: &mut Field) -> Result<(), Error> {
    while let Some(chunk) = field.next().await {
        chunk?;
    }
    Ok(())
}

/// Pulls the `file` part out of the form. A part's declared content type is
/// checked before any of its bytes are read; when several `file` parts are
/// sent the last one decides. Other parts are drained.
async fn read_upload(payload: &mut Multipart) -> Result<Upload, Error> {
    let mut upload = Upload::Missing;
    loop {
        let mut field = match payload.try_next().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) if matches!(upload, Upload::Missing) => {
                // Not a multipart form at all; same outcome as an absent field.
                warn!("Unreadable multipart body: {}", e);
                break;
            }
            Err(e) => return Err(e.into()),
        };

        if field.name() != Some(UPLOAD_FIELD) {
            drain(&mut field).await?;
            continue;
        }

        let content_type = field
            .content_type()
            .map(|mime| mime.essence_str().to_string());
        if !content_type.as_deref().is_some_and(|ct| ct.starts_with("image/")) {
            drain(&mut field).await?;
            upload = Upload::NotAnImage(content_type);
            continue;
        }

        let mut image_data = Vec::new();
        while let Some(chunk) = field.next().await {
            image_data.extend_from_slice(&chunk?);
        }
        upload = Upload::Image(image_data);
    }
    Ok(upload)
}

fn missing_file() -> HttpResponse {
    HttpResponse::UnprocessableEntity().json(json!({
        "detail": [{
            "type": "missing",
            "loc": ["body", UPLOAD_FIELD],
            "msg": "Field required"
        }]
    }))
}

async fn predict(
    classifier: web::Data<dyn Classifier>,
    mut payload: Multipart,
) -> Result<HttpResponse, Error> {
    let image_data = match read_upload(&mut payload).await? {
        Upload::Image(image_data) => image_data,
        Upload::NotAnImage(content_type) => {
            warn!("Rejected upload with content type {:?}", content_type);
            return Ok(HttpResponse::BadRequest().json(ErrorResponse {
                detail: "File must be an image".into(),
            }));
        }
        Upload::Missing => {
            warn!("Prediction request without a '{}' field", UPLOAD_FIELD);
            return Ok(missing_file());
        }
    };

    let upload_size = image_data.len();
    let result = web::block(move || pipeline::predict(classifier.get_ref(), &image_data))
        .await
        .unwrap_or_else(|e| Err(PredictError::Worker(e.to_string())));

    match result {
        Ok(response) => {
            info!(
                "Predicted {} ({:.3}) for {} byte upload",
                response.top_label, response.top_score, upload_size
            );
            Ok(HttpResponse::Ok().json(response))
        }
        Err(e) => {
            error!("Prediction failed for {} byte upload: {:?}", upload_size, e);
            Ok(HttpResponse::InternalServerError().json(ErrorResponse {
                detail: format!("Prediction failed: {}", e),
            }))
        }
    }
}
