//! Local-first to-do lists with optional sync to a hosted table store.
//!
//! The client core is [`sync::TodoApp`]. The rest of the crate is the small
//! self-hostable backend the remote variant talks to.

pub mod auth;
pub mod auth_client;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod kv;
pub mod middleware;
pub mod models;
pub mod ordering;
pub mod persistence;
pub mod session;
pub mod store;
pub mod sync;
pub mod table_client;
pub mod view;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use db::DbPool;

pub use sync::TodoApp;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub anon_key: Arc<String>,
    pub base_path: Arc<String>,
    pub confirm_email: bool,
}

pub fn create_app(state: AppState) -> Router {
    let base_path = state.base_path.clone();

    let app_routes = Router::new()
        .route("/auth/v1/signup", post(handlers::auth::signup))
        .route("/auth/v1/token", post(handlers::auth::token))
        .route("/auth/v1/user", get(handlers::auth::user))
        .route("/auth/v1/logout", post(handlers::auth::logout))
        .route(
            "/rest/v1/{table}",
            get(handlers::rest::select)
                .post(handlers::rest::insert)
                .patch(handlers::rest::update)
                .delete(handlers::rest::delete),
        )
        .layer(
            tower::ServiceBuilder::new()
                .layer(tower_http::trace::TraceLayer::new_for_http())
                .layer(tower_http::compression::CompressionLayer::new()),
        )
        .with_state(state);

    tracing::info!("base_path: {base_path:?}");

    if base_path.is_empty() {
        app_routes
    } else {
        Router::new().nest(&*base_path, app_routes)
    }
}
