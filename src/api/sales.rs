//! Sale ingestion endpoint

use axum::{extract::rejection::JsonRejection, extract::State, Json};
use serde::Serialize;
use uuid::Uuid;

use crate::api::AppState;
use crate::error::{Error, Result};
use crate::models::RawSaleEvent;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub message: &'static str,
    pub record_id: Uuid,
    pub sequence_id: u64,
}

/// `POST /sales`
///
/// Malformed JSON is reported as invalid input, the same as a field that
/// fails validation.
pub async fn ingest_sale(
    State(state): State<AppState>,
    payload: std::result::Result<Json<RawSaleEvent>, JsonRejection>,
) -> Result<Json<IngestResponse>> {
    let Json(raw) = payload.map_err(|rejection| Error::invalid(rejection.body_text()))?;
    let accepted = state.pipeline.ingest().submit(raw)?;

    Ok(Json(IngestResponse {
        message: "Data ingested successfully",
        record_id: accepted.record_id,
        sequence_id: accepted.sequence_id,
    }))
}
