//! Query Routes
//!
//! Expression queries, accepted as GET query strings or POST form bodies.
//!
//! - GET/POST /api/v1/query - Instant query
//! - GET/POST /api/v1/query_range - Range query

use axum::{
    extract::{rejection::FormRejection, State},
    http::HeaderMap,
    Form, Json,
};
use std::sync::Arc;

use super::origin;
use crate::api::dto::{Params, QueryData, SuccessResponse};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;

/// GET/POST /api/v1/query
pub async fn instant_query(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    form: Result<Form<Params>, FormRejection>,
) -> ApiResult<Json<SuccessResponse<QueryData>>> {
    state.api.check_origin(origin(&headers))?;
    let Form(params) = form.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let data = state.api.instant_query(&params).await?;
    Ok(Json(SuccessResponse::new(data)))
}

/// GET/POST /api/v1/query_range
pub async fn range_query(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    form: Result<Form<Params>, FormRejection>,
) -> ApiResult<Json<SuccessResponse<QueryData>>> {
    state.api.check_origin(origin(&headers))?;
    let Form(params) = form.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let data = state.api.range_query(&params).await?;
    Ok(Json(SuccessResponse::new(data)))
}
