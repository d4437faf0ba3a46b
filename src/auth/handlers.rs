use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use tracing::instrument;

use super::dto::{
    ActivateRequest, AuthTokenResponse, LoginRequest, MessageResponse, RegisterRequest,
    ResendActivationRequest, UpdateProfileRequest, UserResponse,
};
use super::extractors::ActivatedUser;
use super::services::{self, LoginOutcome};
use crate::error::AppError;
use crate::state::AppState;

pub const ACTIVATION_REQUIRED: &str =
    "Account needs activation. Check your email for the activation token.";

pub fn token_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/tokens/authentication",
            post(create_authentication_token).delete(delete_authentication_tokens),
        )
        .route("/tokens/activation", post(create_activation_token))
}

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/users", post(register_user))
        .route("/users/activated", put(activate_user))
        .route("/users/me", get(get_me).patch(update_me).delete(delete_me))
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(p)| p)
        .map_err(|e| AppError::BadRequest(e.body_text()))
}

#[instrument(skip(state, payload))]
pub async fn create_authentication_token(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let payload = body(payload)?;
    let res = match services::login(&state, &payload.email, &payload.password).await? {
        LoginOutcome::ActivationRequired => (
            StatusCode::CREATED,
            Json(MessageResponse::new(ACTIVATION_REQUIRED)),
        )
            .into_response(),
        LoginOutcome::Authenticated(token) => (
            StatusCode::CREATED,
            Json(AuthTokenResponse {
                authentication_token: token,
            }),
        )
            .into_response(),
    };
    Ok(res)
}

#[instrument(skip(state, user), fields(user_id = %user.id))]
pub async fn delete_authentication_tokens(
    State(state): State<AppState>,
    ActivatedUser(user): ActivatedUser,
) -> Result<Json<MessageResponse>, AppError> {
    services::logout(&state, &user).await?;
    Ok(Json(MessageResponse::new("authentication tokens revoked")))
}

#[instrument(skip(state, payload))]
pub async fn create_activation_token(
    State(state): State<AppState>,
    payload: Result<Json<ResendActivationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<MessageResponse>), AppError> {
    let payload = body(payload)?;
    services::resend_activation(&state, &payload.email).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new(
            "an email will be sent to you containing activation instructions",
        )),
    ))
}

#[instrument(skip(state, payload))]
pub async fn register_user(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<UserResponse>), AppError> {
    let p = body(payload)?;
    let user = services::register(&state, &p.name, &p.surname, &p.email, &p.password).await?;
    Ok((StatusCode::ACCEPTED, Json(UserResponse { user })))
}

#[instrument(skip(state, payload))]
pub async fn activate_user(
    State(state): State<AppState>,
    payload: Result<Json<ActivateRequest>, JsonRejection>,
) -> Result<Json<UserResponse>, AppError> {
    let payload = body(payload)?;
    let user = services::activate(&state, &payload.token).await?;
    Ok(Json(UserResponse { user }))
}

#[instrument(skip(user), fields(user_id = %user.id))]
pub async fn get_me(ActivatedUser(user): ActivatedUser) -> Json<UserResponse> {
    Json(UserResponse { user })
}

#[instrument(skip(state, user, payload), fields(user_id = %user.id))]
pub async fn update_me(
    State(state): State<AppState>,
    ActivatedUser(user): ActivatedUser,
    payload: Result<Json<UpdateProfileRequest>, JsonRejection>,
) -> Result<Json<UserResponse>, AppError> {
    let p = body(payload)?;
    let user = services::update_profile(
        &state,
        user,
        p.name.as_deref(),
        p.surname.as_deref(),
        p.version,
    )
    .await?;
    Ok(Json(UserResponse { user }))
}

#[instrument(skip(state, user), fields(user_id = %user.id))]
pub async fn delete_me(
    State(state): State<AppState>,
    ActivatedUser(user): ActivatedUser,
) -> Result<Json<MessageResponse>, AppError> {
    services::delete_account(&state, &user).await?;
    Ok(Json(MessageResponse::new("user successfully deleted")))
}
