use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use copilot_core::conversation::TurnOutcome;
use copilot_core::store::PipelineRun;
use copilot_core::{
    IncidentError, IncidentRecord, IncidentService, IncidentSummary, Report, ReportFormat,
};
use incident_schema::{ChatMessageV1, NewIncidentV1, StatusUpdateV1};
use serde::Deserialize;

pub fn router(service: IncidentService) -> Router {
    Router::new()
        .route("/incidents", post(create_incident).get(list_incidents))
        .route("/incidents/:id", get(get_record))
        .route("/incidents/:id/messages", post(post_message))
        .route("/incidents/:id/voice", post(post_voice_message))
        .route("/incidents/:id/status", post(update_status))
        .route("/incidents/:id/report", get(get_report))
        .route("/incidents/:id/pipeline", get(pipeline_state))
        .with_state(service)
}

/// Maps the core error taxonomy onto HTTP.
#[derive(Debug)]
pub struct ApiError(IncidentError);

impl From<IncidentError> for ApiError {
    fn from(err: IncidentError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            IncidentError::Validation(_) => StatusCode::BAD_REQUEST,
            IncidentError::NotFound { .. } => StatusCode::NOT_FOUND,
            IncidentError::Service(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn create_incident(
    State(service): State<IncidentService>,
    Json(request): Json<NewIncidentV1>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let incident_id = service.create_incident(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "incident_id": incident_id })),
    ))
}

async fn list_incidents(State(service): State<IncidentService>) -> ApiResult<Json<Vec<IncidentSummary>>> {
    Ok(Json(service.list_incidents()?))
}

async fn get_record(
    State(service): State<IncidentService>,
    Path(id): Path<String>,
) -> ApiResult<Json<IncidentRecord>> {
    Ok(Json(service.get_record(&id).await?))
}

async fn post_message(
    State(service): State<IncidentService>,
    Path(id): Path<String>,
    Json(body): Json<ChatMessageV1>,
) -> ApiResult<Json<TurnOutcome>> {
    Ok(Json(service.post_message(&id, &body.message).await?))
}

async fn post_voice_message(
    State(service): State<IncidentService>,
    Path(id): Path<String>,
    audio: Bytes,
) -> ApiResult<Response> {
    match service.post_voice_message(&id, &audio).await? {
        Some(outcome) => Ok(Json(outcome).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn update_status(
    State(service): State<IncidentService>,
    Path(id): Path<String>,
    Json(body): Json<StatusUpdateV1>,
) -> ApiResult<Json<IncidentRecord>> {
    Ok(Json(service.update_status(&id, body).await?))
}

#[derive(Debug, Default, Deserialize)]
struct ReportQuery {
    format: Option<String>,
}

impl ReportQuery {
    fn format(&self) -> Result<ReportFormat, IncidentError> {
        self.format
            .as_deref()
            .map(str::parse)
            .transpose()
            .map(Option::unwrap_or_default)
    }
}

async fn get_report(
    State(service): State<IncidentService>,
    Path(id): Path<String>,
    Query(query): Query<ReportQuery>,
) -> ApiResult<Response> {
    let report = service.get_report(&id, query.format()?).await?;
    let content_type = report.content_type();
    Ok(match report {
        Report::Markdown(doc) => ([(header::CONTENT_TYPE, content_type)], doc).into_response(),
        Report::Json(report) => Json(report).into_response(),
    })
}

async fn pipeline_state(
    State(service): State<IncidentService>,
    Path(id): Path<String>,
) -> ApiResult<Json<Option<PipelineRun>>> {
    Ok(Json(service.pipeline_state(&id)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_http_status() {
        let status = |err: IncidentError| ApiError::from(err).into_response().status();
        assert_eq!(status(IncidentError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(IncidentError::not_found("inc-1")), StatusCode::NOT_FOUND);
        assert_eq!(status(IncidentError::Service("down".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status(IncidentError::InvalidState("bad row".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn report_format_defaults_to_markdown() {
        assert_eq!(ReportQuery::default().format().expect("default"), ReportFormat::Markdown);
        let json = ReportQuery {
            format: Some("json".into()),
        };
        assert_eq!(json.format().expect("json"), ReportFormat::Json);
        let bogus = ReportQuery {
            format: Some("pdf".into()),
        };
        assert!(matches!(bogus.format(), Err(IncidentError::Validation(_))));
    }
}
