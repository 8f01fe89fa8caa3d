use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use tracing::warn;

use crate::db::{get_session, get_user};
use crate::error::AppError;
use crate::models::User;
use crate::AppState;

pub const API_KEY_HEADER: &str = "apikey";

/// Request carries the project's API key.
pub struct ApiKey;

/// Request carries the API key and a live session's access token.
pub struct AuthUser {
    pub user: User,
    pub access_token: String,
}

impl FromRequestParts<AppState> for ApiKey {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|h| h.to_str().ok());
        if key == Some(state.anon_key.as_str()) {
            return Ok(ApiKey);
        }
        warn!("Request without a valid API key");
        Err(AppError::Unauthorized)
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        ApiKey::from_request_parts(parts, state).await?;

        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::Unauthorized)?;
        let access_token = bearer.token().to_string();

        let Some(session) = get_session(&state.db, &access_token)? else {
            warn!("Unknown or expired access token");
            return Err(AppError::Unauthorized);
        };
        let user = get_user(&state.db, &session.user_id)?.ok_or(AppError::Unauthorized)?;

        Ok(AuthUser {
            user: user.public(),
            access_token,
        })
    }
}
