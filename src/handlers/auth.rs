use axum::extract::{Query, State};
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::auth::{generate_token, hash_password, verify_password, MIN_PASSWORD_LEN, SESSION_TTL};
use crate::db::{create_session, create_user, delete_session, get_user, get_user_by_email, take_session_by_refresh};
use crate::error::AppError;
use crate::middleware::{ApiKey, AuthUser};
use crate::models::{
    new_id, now_millis, AuthSession, Credentials, RefreshRequest, SignUpResponse, StoredSession,
    StoredUser, User,
};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TokenParams {
    pub grant_type: String,
}

fn issue_session(state: &AppState, user: User) -> Result<AuthSession, AppError> {
    let session = StoredSession {
        access_token: generate_token(),
        refresh_token: generate_token(),
        user_id: user.id.clone(),
        expires_at: now_millis() / 1000 + SESSION_TTL,
    };
    create_session(&state.db, &session)?;
    Ok(AuthSession {
        access_token: session.access_token,
        refresh_token: session.refresh_token,
        token_type: "bearer".to_string(),
        expires_in: SESSION_TTL,
        user,
    })
}

fn parse_body<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, AppError> {
    serde_json::from_value(body).map_err(|e| AppError::BadRequest(format!("invalid body: {e}")))
}

pub async fn signup(
    _key: ApiKey,
    State(state): State<AppState>,
    Json(req): Json<Credentials>,
) -> Result<(StatusCode, Json<SignUpResponse>), AppError> {
    let email = req.email.trim().to_lowercase();
    if email.is_empty() {
        return Err(AppError::BadRequest("Email cannot be empty".to_string()));
    }
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::BadRequest(format!(
            "Password should be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    if get_user_by_email(&state.db, &email)?.is_some() {
        return Err(AppError::Conflict("User already registered"));
    }

    let user = StoredUser {
        id: new_id(),
        email,
        password_hash: hash_password(&req.password)?,
        created_at: now_millis(),
    };
    create_user(&state.db, &user)?;
    info!(user_id = %user.id, "User signed up");

    let session = if state.confirm_email {
        None
    } else {
        Some(issue_session(&state, user.public())?)
    };
    Ok((
        StatusCode::CREATED,
        Json(SignUpResponse {
            user: user.public(),
            session,
        }),
    ))
}

pub async fn token(
    _key: ApiKey,
    State(state): State<AppState>,
    Query(params): Query<TokenParams>,
    Json(body): Json<Value>,
) -> Result<Json<AuthSession>, AppError> {
    match params.grant_type.as_str() {
        "password" => {
            let req: Credentials = parse_body(body)?;
            let user = get_user_by_email(&state.db, req.email.trim())?
                .filter(|u| verify_password(&req.password, &u.password_hash))
                .ok_or_else(|| AppError::BadRequest("Invalid login credentials".to_string()))?;
            info!(user_id = %user.id, "User logged in");
            Ok(Json(issue_session(&state, user.public())?))
        }
        "refresh_token" => {
            let req: RefreshRequest = parse_body(body)?;
            let Some(old) = take_session_by_refresh(&state.db, &req.refresh_token)? else {
                return Err(AppError::BadRequest("Invalid refresh token".to_string()));
            };
            let user = get_user(&state.db, &old.user_id)?.ok_or(AppError::Unauthorized)?;
            info!(user_id = %user.id, "Session refreshed");
            Ok(Json(issue_session(&state, user.public())?))
        }
        other => Err(AppError::BadRequest(format!("unsupported grant_type {other}"))),
    }
}

pub async fn user(auth: AuthUser) -> Json<User> {
    Json(auth.user)
}

pub async fn logout(
    auth: AuthUser,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    delete_session(&state.db, &auth.access_token)?;
    info!(user_id = %auth.user.id, "User logged out");
    Ok(StatusCode::NO_CONTENT)
}
