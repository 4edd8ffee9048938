pub mod authentication;
pub mod config;
pub mod crud_ops;
pub mod db;
pub mod entities;
pub mod error;
pub mod flash;
pub mod sharing;
pub mod statistics;

use std::sync::Arc;

use axum::{
    extract::Extension,
    routing::{get, post},
    Router,
};
use axum_login::{login_required, AuthManagerLayerBuilder};
use sqlx::SqlitePool;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tower_sessions::{cookie::SameSite, Expiry, SessionManagerLayer};
use tower_sessions_sqlx_store::SqliteStore;

use crate::{authentication::Backend, config::Config, error::StartupError};

/// Builds the full application. Sessions live in the same database as the data.
pub async fn build_app(pool: SqlitePool, config: Config) -> Result<Router, StartupError> {
    let session_store = SqliteStore::new(pool.clone());
    session_store.migrate().await?;

    let session_layer = SessionManagerLayer::new(session_store)
        .with_secure(config.secure_cookies)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnSessionEnd)
        .with_signed(config.session_key()?);
    let auth_layer = AuthManagerLayerBuilder::new(Backend::new(pool.clone()), session_layer).build();

    let protected = Router::new()
        .route("/tasks", get(crud_ops::get_tasks))
        .route("/tasks/", get(crud_ops::get_tasks))
        .route("/tasks/create", post(crud_ops::create_task))
        .route("/tasks/{id}", get(crud_ops::view_task))
        .route(
            "/tasks/{id}/edit",
            get(crud_ops::edit_task_form).post(crud_ops::update_task),
        )
        .route("/tasks/{id}/delete", post(crud_ops::delete_task))
        .route("/tasks/{id}/toggle", post(crud_ops::toggle_task))
        .route(
            "/tasks/{id}/share",
            get(sharing::share_form).post(sharing::share_task),
        )
        .route("/tasks/{id}/unshare", post(sharing::unshare_task))
        .route("/statistics", get(statistics::statistics_page))
        .route("/statistics/", get(statistics::statistics_page))
        .route("/statistics/dashboard", get(statistics::dashboard_page))
        .route("/statistics/api/daily-stats", get(statistics::api_daily_stats))
        .route("/statistics/api/weekly-stats", get(statistics::api_weekly_stats))
        .route_layer(login_required!(Backend, login_url = "/auth/login"));

    let public = Router::new()
        .route("/", get(authentication::index))
        .route(
            "/auth/register",
            get(authentication::register_page).post(authentication::register),
        )
        .route(
            "/auth/login",
            get(authentication::login_page).post(authentication::login),
        )
        .route("/auth/logout", get(authentication::logout))
        .route("/shared/task/{token}", get(sharing::view_shared_task));

    Ok(protected
        .merge(public)
        .layer(Extension(pool))
        .layer(Extension(Arc::new(config)))
        .layer(auth_layer)
        .layer(TraceLayer::new_for_http()))
}

pub async fn run_server(config: Config) -> Result<(), StartupError> {
    let pool = db::connect(&config.database_url).await?;
    let listener = TcpListener::bind(&config.listen_addr).await?;
    let app = build_app(pool, config).await?;

    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
