//! Metadata Routes
//!
//! - GET/POST /api/v1/series - Label sets of matching series
//! - GET /api/v1/labels - Label names
//! - GET /api/v1/label/:name/values - Values of one label

use axum::{
    extract::{rejection::FormRejection, Path, State},
    http::HeaderMap,
    Form, Json,
};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::origin;
use crate::api::dto::{Params, SuccessResponse};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;

fn params(form: Result<Form<Params>, FormRejection>) -> ApiResult<Params> {
    form.map(|Form(params)| params)
        .map_err(|e| ApiError::bad_request(e.body_text()))
}

/// GET/POST /api/v1/series
pub async fn series(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    form: Result<Form<Params>, FormRejection>,
) -> ApiResult<Json<SuccessResponse<Vec<BTreeMap<String, String>>>>> {
    state.api.check_origin(origin(&headers))?;
    let params = params(form)?;
    Ok(Json(SuccessResponse::new(state.api.series(&params).await?)))
}

/// GET /api/v1/labels
pub async fn label_names(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    form: Result<Form<Params>, FormRejection>,
) -> ApiResult<Json<SuccessResponse<Vec<String>>>> {
    state.api.check_origin(origin(&headers))?;
    let params = params(form)?;
    Ok(Json(SuccessResponse::new(
        state.api.label_names(&params).await?,
    )))
}

/// GET /api/v1/label/:name/values
pub async fn label_values(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    form: Result<Form<Params>, FormRejection>,
) -> ApiResult<Json<SuccessResponse<Vec<String>>>> {
    state.api.check_origin(origin(&headers))?;
    let params = params(form)?;
    Ok(Json(SuccessResponse::new(
        state.api.label_values(&name, &params).await?,
    )))
}
