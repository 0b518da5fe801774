//! Analytics query endpoint

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::analytics::QueryResult;
use crate::api::AppState;
use crate::error::{Error, Result};

/// Optional RFC 3339 window bounds
#[derive(Debug, Default, Deserialize)]
pub struct WindowParams {
    pub from: Option<String>,
    pub to: Option<String>,
}

/// `GET /analytics/:kind?from=&to=`
pub async fn get_analytics(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    params: std::result::Result<Query<WindowParams>, QueryRejection>,
) -> Result<Json<QueryResult>> {
    let Query(params) = params.map_err(|rejection| Error::invalid(rejection.body_text()))?;
    let result = state
        .pipeline
        .analytics()
        .query(&kind, params.from.as_deref(), params.to.as_deref())
        .await?;
    Ok(Json(result))
}
