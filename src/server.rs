use log::{error, info, warn};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::{Arc, Mutex as StdMutex};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::annotate::Annotator;
use crate::config::ModelsConfig;
use crate::fetch::{fetch_image, FetchError, FetchOptions};
use crate::mission::{match_target, PredictRequest, PredictResponse, TargetMatch};
use crate::registry::ModelRegistry;

/// Largest accepted `/predict` body.
pub const MAX_BODY_BYTES: u64 = 64 * 1024;

pub struct AppState {
    config: ModelsConfig,
    registry: ModelRegistry,
    fetch: FetchOptions,
    annotator: Option<Arc<StdMutex<Annotator>>>,
}

impl AppState {
    pub fn new(
        config: ModelsConfig,
        registry: ModelRegistry,
        fetch: FetchOptions,
        annotator: Option<Annotator>,
    ) -> Self {
        Self {
            config,
            registry,
            fetch,
            annotator: annotator.map(|a| Arc::new(StdMutex::new(a))),
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl warp::reject::Reject for ApiError {}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: json!({ "error": message.into() }),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: json!({ "error": message.into() }),
        }
    }

    /// Failures nobody planned for: transport errors, bad images, inference.
    fn unexpected(e: impl std::fmt::Display) -> Self {
        error!("Unexpected error while handling request: {e}");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: json!({ "success": false, "error": format!("error occurred :{e}") }),
        }
    }
}

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let with_state = warp::any().map(move || Arc::clone(&state));

    let predict = warp::path!("predict")
        .and(warp::post())
        .and(with_state.clone())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and_then(|state: Arc<AppState>, request: PredictRequest| async move {
            predict(state, request).await.map_err(Rejection::from)
        });

    let health = warp::path!("health")
        .and(warp::get())
        .and(with_state)
        .map(|state: Arc<AppState>| {
            warp::reply::json(&json!({ "status": "OK", "models": state.registry.len() }))
        });

    predict.or(health).recover(handle_rejection)
}

async fn predict(
    state: Arc<AppState>,
    request: PredictRequest,
) -> Result<warp::reply::Json, ApiError> {
    let mission = request
        .validate()
        .map_err(|_| ApiError::bad_request("Missing data in request."))?;
    let challenge_id = mission.challenge_id.as_str();

    let model = state.registry.get(challenge_id).ok_or_else(|| {
        ApiError::internal(format!(
            "Model for challengeId \"{challenge_id}\" is not loaded or available."
        ))
    })?;
    let challenge = state.config.get(challenge_id).ok_or_else(|| {
        ApiError::internal(format!(
            "Configuration for challengeId \"{challenge_id}\" not found in {}.",
            state.config.source().display()
        ))
    })?;
    let target = challenge
        .target_class(&mission.mission_id)
        .ok_or_else(|| {
            ApiError::bad_request(format!(
                "Invalid missionId \"{}\" for challengeId \"{challenge_id}\". No corresponding class mapping found.",
                mission.mission_id
            ))
        })?
        .to_string();

    let url = mission.image_url.clone();
    let options = state.fetch.clone();
    let image = tokio::task::spawn_blocking(move || fetch_image(&url, &options))
        .await
        .map_err(ApiError::unexpected)?
        .map_err(|e| match e {
            FetchError::Status(code) => ApiError::bad_request(format!(
                "Could not download image from the provided URL. Status Code: {code}"
            )),
            e => ApiError::unexpected(e),
        })?;

    let detector = model.lock_owned().await;
    let annotator = state.annotator.clone();
    let tag = format!("{}_{}", mission.challenge_id, value_tag(&mission.temp_image_id));
    let found = tokio::task::spawn_blocking(move || -> anyhow::Result<TargetMatch> {
        let mut detector = detector;
        let boxes = detector.detect(&image)?;
        let found = match_target(&boxes, detector.names(), &target);
        if let Some(annotator) = annotator {
            match annotator.lock() {
                Ok(mut annotator) => {
                    if let Err(e) = annotator.save(&image, &boxes, detector.names(), &tag) {
                        warn!("Failed to save annotated image: {e:#}");
                    }
                }
                Err(_) => warn!("Annotator lock poisoned, skipping"),
            }
        }
        Ok(found)
    })
    .await
    .map_err(ApiError::unexpected)?
    .map_err(|e| ApiError::unexpected(format!("{e:#}")))?;

    let response = PredictResponse::new(mission, found);
    info!("Prediction: {response:?}");
    Ok(warp::reply::json(&response))
}

fn value_tag(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, body) = if let Some(e) = err.find::<ApiError>() {
        (e.status, e.body.clone())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, json!({ "error": "Not Found" }))
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (
            StatusCode::BAD_REQUEST,
            json!({ "error": format!("Invalid JSON body: {e}") }),
        )
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            json!({ "error": "Expected a JSON body" }),
        )
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            json!({ "error": "Request body too large" }),
        )
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        (
            StatusCode::LENGTH_REQUIRED,
            json!({ "error": "Content-Length required" }),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            json!({ "error": "Method Not Allowed" }),
        )
    } else {
        error!("Unhandled rejection: {err:?}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": "Internal Server Error" }),
        )
    };
    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}
