use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::switcher::SwitchError;

pub mod switcher;

pub type ApiResult<T> = Result<T, ApiError>;
pub type ApiJsonResult<T> = ApiResult<Json<T>>;

pub struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Some(e) = self.0.downcast_ref::<SwitchError>() {
            match e {
                SwitchError::SourceUnavailable(_) | SwitchError::FadeTooLong(_) => {
                    return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
                }
                SwitchError::Closed => {
                    return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
                }
            }
        }
        log::error!("ApiError: {:?}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "switcher internal error".to_string(),
        )
            .into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
