//! Public read-only links to single tasks.
//!
//! A task has at most one link. Issuing a new one overwrites the old row,
//! so a previously handed-out token stops resolving immediately. Expired
//! links are kept but refuse to resolve.

use std::sync::Arc;

use axum::{
    extract::{Extension, Form, Path},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tower_sessions::Session;

use crate::{
    authentication::{current_user, is_email, AuthSession},
    config::Config,
    crud_ops::fetch_owned_task,
    entities::{Priority, SharedTask, Task},
    error::{AppError, AppResult, Validator},
    flash::{self, Level},
};

/// Random bytes behind each token; encodes to 32 URL-safe characters.
pub const TOKEN_BYTES: usize = 24;

const MAX_EXPIRY_HOURS: i64 = 24 * 365;

pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub async fn find_for_task(
    conn: &mut SqliteConnection,
    task_id: i64,
) -> AppResult<Option<SharedTask>> {
    Ok(sqlx::query_as("SELECT * FROM shared_tasks WHERE task_id = ?")
        .bind(task_id)
        .fetch_optional(conn)
        .await?)
}

/// Returns whether a link existed.
pub async fn revoke(conn: &mut SqliteConnection, task_id: i64) -> AppResult<bool> {
    let result = sqlx::query("DELETE FROM shared_tasks WHERE task_id = ?")
        .bind(task_id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShareOptions {
    pub expires_in: Option<Duration>,
    pub allowed_email: Option<String>,
}

/// Replaces any existing link for `task` with a fresh token. The upsert keeps
/// the one-link-per-task replacement to a single statement.
pub async fn issue(
    conn: &mut SqliteConnection,
    task: &Task,
    options: ShareOptions,
    now: DateTime<Utc>,
) -> AppResult<SharedTask> {
    let share = sqlx::query_as(
        "INSERT INTO shared_tasks (token, task_id, user_id, allowed_email, created_at, expires_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(task_id) DO UPDATE SET
             token = excluded.token,
             user_id = excluded.user_id,
             allowed_email = excluded.allowed_email,
             created_at = excluded.created_at,
             expires_at = excluded.expires_at
         RETURNING *",
    )
    .bind(generate_token())
    .bind(task.id)
    .bind(task.user_id)
    .bind(options.allowed_email)
    .bind(now)
    .bind(options.expires_in.map(|d| now + d))
    .fetch_one(conn)
    .await?;
    Ok(share)
}

#[derive(Debug, Serialize)]
pub struct SharedTaskView {
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub owner: String,
    pub shared_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub enum Resolution {
    Active {
        share: SharedTask,
        view: SharedTaskView,
    },
    Expired,
    Missing,
}

pub async fn resolve(pool: &SqlitePool, token: &str, now: DateTime<Utc>) -> AppResult<Resolution> {
    let share: Option<SharedTask> = sqlx::query_as("SELECT * FROM shared_tasks WHERE token = ?")
        .bind(token)
        .fetch_optional(pool)
        .await?;
    let Some(share) = share else {
        return Ok(Resolution::Missing);
    };
    if share.is_expired_at(now) {
        return Ok(Resolution::Expired);
    }

    let task: Option<Task> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
        .bind(share.task_id)
        .fetch_optional(pool)
        .await?;
    let Some(task) = task else {
        return Ok(Resolution::Missing);
    };
    let owner: String = sqlx::query_scalar("SELECT username FROM users WHERE id = ?")
        .bind(task.user_id)
        .fetch_one(pool)
        .await?;

    let view = SharedTaskView {
        title: task.title,
        description: task.description,
        priority: task.priority,
        completed: task.completed,
        created_at: task.created_at,
        completed_at: task.completed_at,
        owner,
        shared_at: share.created_at,
        expires_at: share.expires_at,
    };
    Ok(Resolution::Active { share, view })
}

#[derive(Debug, Serialize)]
pub struct ShareInfo {
    pub url: String,
    pub token: String,
    pub allowed_email: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub expired: bool,
}

impl ShareInfo {
    pub fn new(config: &Config, share: SharedTask, now: DateTime<Utc>) -> Self {
        Self {
            url: config.share_url(&share.token),
            expired: share.is_expired_at(now),
            token: share.token,
            allowed_email: share.allowed_email,
            expires_at: share.expires_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ShareForm {
    #[serde(default)]
    pub expires_in_hours: Option<String>,
    #[serde(default)]
    pub allowed_email: Option<String>,
}

impl ShareForm {
    pub fn validate(self) -> AppResult<ShareOptions> {
        let mut v = Validator::default();

        let hours = self
            .expires_in_hours
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty());
        let expires_in = match hours.map(str::parse::<i64>) {
            None => None,
            Some(Ok(h)) if (1..=MAX_EXPIRY_HOURS).contains(&h) => Some(Duration::hours(h)),
            Some(_) => {
                v.add(
                    "expires_in_hours",
                    format!("Expiry must be between 1 and {MAX_EXPIRY_HOURS} hours"),
                );
                None
            }
        };

        let allowed_email = self
            .allowed_email
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty());
        if let Some(email) = &allowed_email {
            v.check(is_email(email), "allowed_email", "Enter a valid email address");
        }

        v.finish()?;
        Ok(ShareOptions {
            expires_in,
            allowed_email,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ShareView {
    pub task: Task,
    pub share: Option<ShareInfo>,
}

pub async fn share_form(
    auth_session: AuthSession,
    Extension(pool): Extension<SqlitePool>,
    Extension(config): Extension<Arc<Config>>,
    Path(task_id): Path<i64>,
) -> AppResult<Json<ShareView>> {
    let user_id = current_user(&auth_session)?.id;
    let mut conn = pool.acquire().await?;
    let task = fetch_owned_task(&mut conn, task_id, user_id).await?;
    let share = find_for_task(&mut conn, task.id).await?;
    Ok(Json(ShareView {
        task,
        share: share.map(|s| ShareInfo::new(&config, s, Utc::now())),
    }))
}

pub async fn share_task(
    auth_session: AuthSession,
    session: Session,
    Extension(pool): Extension<SqlitePool>,
    Extension(config): Extension<Arc<Config>>,
    Path(task_id): Path<i64>,
    Form(form): Form<ShareForm>,
) -> AppResult<Redirect> {
    let user_id = current_user(&auth_session)?.id;

    let mut tx = pool.begin().await?;
    let task = fetch_owned_task(&mut tx, task_id, user_id).await?;
    let options = form.validate()?;
    let share = issue(&mut tx, &task, options, Utc::now()).await?;
    tx.commit().await?;

    let url = config.share_url(&share.token);
    tracing::info!(user_id, task_id, expires_at = ?share.expires_at, "share link issued");
    flash::push(
        &session,
        Level::Success,
        format!("Share link created: {url}"),
    )
    .await?;
    Ok(Redirect::to(&format!("/tasks/{task_id}")))
}

pub async fn unshare_task(
    auth_session: AuthSession,
    session: Session,
    Extension(pool): Extension<SqlitePool>,
    Path(task_id): Path<i64>,
) -> AppResult<Redirect> {
    let user_id = current_user(&auth_session)?.id;

    let mut tx = pool.begin().await?;
    fetch_owned_task(&mut tx, task_id, user_id).await?;
    let removed = revoke(&mut tx, task_id).await?;
    tx.commit().await?;

    if removed {
        tracing::info!(user_id, task_id, "share link revoked");
        flash::push(&session, Level::Success, "Share link removed").await?;
    }
    Ok(Redirect::to(&format!("/tasks/{task_id}")))
}

/// Public endpoint; works with or without a signed-in viewer.
pub async fn view_shared_task(
    auth_session: AuthSession,
    session: Session,
    Extension(pool): Extension<SqlitePool>,
    Path(token): Path<String>,
) -> AppResult<Response> {
    match resolve(&pool, &token, Utc::now()).await? {
        Resolution::Missing => Err(AppError::NotFound),
        Resolution::Expired => {
            tracing::warn!("expired share link requested");
            flash::push(&session, Level::Danger, "This link has expired").await?;
            Ok(Redirect::to("/auth/login").into_response())
        }
        Resolution::Active { share, view } => {
            let viewer = auth_session.user.as_ref().map(|u| u.email.as_str());
            if !share.admits(viewer) {
                return Err(AppError::NotFound);
            }
            Ok(Json(view).into_response())
        }
    }
}
