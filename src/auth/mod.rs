use crate::state::AppState;
use axum::Router;

mod dto;
pub mod extractors;
pub mod handlers;
pub mod password;
pub mod repo;
pub mod repo_types;
pub mod services;
pub mod tokens;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::token_routes())
        .merge(handlers::user_routes())
}
