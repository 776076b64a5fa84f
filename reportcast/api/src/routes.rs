//! HTTP routes over [`ForecastService`].

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use reportcast_forecast::{
    example_record, CachedPrediction, Document, ForecastError, ForecastService, ServiceStatus,
};
use serde_json::{json, Value};

/// Builds the router.
pub fn router(service: Arc<ForecastService>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/daily_prediction", get(daily_prediction))
        .route("/train", post(train))
        .route("/predict", post(predict))
        .with_state(service)
}

/// Failure returned to HTTP clients as `{"detail": ...}`.
#[derive(Debug)]
pub enum ApiError {
    /// The request body is not a JSON object.
    MalformedBody(String),
    /// A service operation failed.
    Forecast(ForecastError),
}

impl From<ForecastError> for ApiError {
    fn from(err: ForecastError) -> Self {
        Self::Forecast(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::MalformedBody(_) => StatusCode::BAD_REQUEST,
            Self::Forecast(ForecastError::NotAvailable) => StatusCode::NOT_FOUND,
            Self::Forecast(err) if err.is_client_error() => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Forecast(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self {
            Self::MalformedBody(msg) => format!("request body must be a JSON object: {msg}"),
            Self::Forecast(err) => err.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(%status, %detail, "request failed");
        } else {
            tracing::debug!(%status, %detail, "request rejected");
        }
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

async fn root(State(service): State<Arc<ForecastService>>) -> Json<ServiceStatus> {
    Json(service.status())
}

async fn daily_prediction(
    State(service): State<Arc<ForecastService>>,
) -> Result<Json<CachedPrediction>, ApiError> {
    Ok(Json(service.daily_prediction()?))
}

async fn train(State(service): State<Arc<ForecastService>>) -> Result<Json<Value>, ApiError> {
    let summary = service.retrain().await?;
    Ok(Json(json!({
        "message": "Model trained successfully",
        "summary": summary,
    })))
}

async fn predict(
    State(service): State<Arc<ForecastService>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let record = parse_record(&body)?;
    let result = service.predict(record.as_ref())?;
    Ok(Json(json!({
        "input_data": record.unwrap_or_else(example_record),
        "predicted_output": [result.value],
        "schema_version": result.schema_version,
        "message": "Prediction generated successfully",
    })))
}

/// Empty bodies select the example record.
fn parse_record(body: &[u8]) -> Result<Option<Document>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    match serde_json::from_slice(body) {
        Ok(Value::Object(doc)) => Ok(Some(doc)),
        Ok(other) => Err(ApiError::MalformedBody(format!("got {other}"))),
        Err(err) => Err(ApiError::MalformedBody(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reportcast_forecast::{
        storage::MemoryReportStore, ForecastTelemetry, ServiceConfig,
    };

    fn service(store: Arc<MemoryReportStore>) -> Arc<ForecastService> {
        let mut config = ServiceConfig::default();
        config.model.trees = 5;
        config.model.seed = Some(8);
        Arc::new(ForecastService::new(
            config,
            store,
            ForecastTelemetry::tracing_only("forecast"),
        ))
    }

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[tokio::test]
    async fn root_never_fails() {
        let service = service(Arc::new(MemoryReportStore::new()));
        let Json(status) = root(State(service)).await;
        assert!(status.latest_prediction.is_none());
        assert!(status.links["train_endpoint"]
            .as_str()
            .unwrap()
            .ends_with("/train"));
    }

    #[tokio::test]
    async fn daily_prediction_is_404_before_first_cycle() {
        let service = service(Arc::new(MemoryReportStore::new()));
        let err = daily_prediction(State(service)).await.unwrap_err();
        assert_eq!(status_of(err), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn train_then_predict_with_empty_body() {
        let service = service(Arc::new(MemoryReportStore::new()));
        let Json(trained) = train(State(service.clone())).await.unwrap();
        assert_eq!(trained["summary"]["used_example"], true);

        let Json(body) = predict(State(service), Bytes::new()).await.unwrap();
        let output = body["predicted_output"].as_array().unwrap();
        assert_eq!(output.len(), 1);
        assert!((output[0].as_f64().unwrap() - 90.0).abs() < 1e-9);
        assert_eq!(body["input_data"]["projectName"], "Project Alpha");
    }

    #[tokio::test]
    async fn predict_maps_errors_to_statuses() {
        let service = service(Arc::new(MemoryReportStore::new()));
        let err = predict(State(service.clone()), Bytes::new()).await.unwrap_err();
        assert_eq!(status_of(err), StatusCode::INTERNAL_SERVER_ERROR);

        train(State(service.clone())).await.unwrap();
        let err = predict(State(service.clone()), Bytes::from_static(b"{ nope"))
            .await
            .unwrap_err();
        assert_eq!(status_of(err), StatusCode::BAD_REQUEST);

        let err = predict(State(service.clone()), Bytes::from_static(b"[1, 2]"))
            .await
            .unwrap_err();
        assert_eq!(status_of(err), StatusCode::BAD_REQUEST);

        let err = predict(
            State(service),
            Bytes::from_static(br#"{"storyTests": 5, "mysteryCount": 3}"#),
        )
        .await
        .unwrap_err();
        assert_eq!(status_of(err), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn statuses_follow_client_error_split() {
        assert_eq!(
            status_of(ForecastError::InvalidRecord("storyTests must be numeric".into()).into()),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        for err in [
            ForecastError::NotTrained,
            ForecastError::CorruptArtifact("models/forecast.json".into()),
            ForecastError::TrainingFailed("no rows".into()),
        ] {
            assert!(!err.is_client_error());
            assert_eq!(status_of(err.into()), StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    #[tokio::test]
    async fn train_failure_is_500() {
        let store = Arc::new(MemoryReportStore::new());
        store.set_offline(true);
        let err = train(State(service(store))).await.unwrap_err();
        assert_eq!(status_of(err), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
