use axum::{
    extract::{Extension, Form, Query},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tower_sessions::{Expiry, Session};

use crate::{
    config::Config,
    entities::User,
    error::{AppError, AppResult, FieldError, Validator},
    flash::{self, Flash, Level},
};

pub type AuthSession = axum_login::AuthSession<Backend>;

#[derive(Clone, Deserialize)]
pub struct Credentials {
    /// Username or email address.
    #[serde(alias = "email", alias = "login")]
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub remember: Option<String>,
    #[serde(default)]
    pub next: Option<String>,
}

impl Credentials {
    pub fn remember_me(&self) -> bool {
        matches!(
            self.remember.as_deref().map(str::trim),
            Some("on" | "true" | "1" | "yes")
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    TaskJoin(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct Backend {
    pub pool: SqlitePool,
}

impl Backend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl axum_login::AuthnBackend for Backend {
    type User = User;
    type Credentials = Credentials;
    type Error = BackendError;

    async fn authenticate(
        &self,
        creds: Self::Credentials,
    ) -> Result<Option<Self::User>, Self::Error> {
        let identifier = creds.username.trim().to_string();
        let user: Option<Self::User> =
            sqlx::query_as("SELECT * FROM users WHERE username = ? OR email = ?")
                .bind(&identifier)
                .bind(identifier.to_lowercase())
                .fetch_optional(&self.pool)
                .await?;

        // `password_auth::verify_password()` is blocking, hence using `tokio::task::spawn_blocking()`
        let password = creds.password;
        tokio::task::spawn_blocking(move || {
            Ok(user.filter(|user| {
                password_auth::verify_password(password, &user.password_hash).is_ok()
            }))
        })
        .await?
    }

    async fn get_user(
        &self,
        user_id: &axum_login::UserId<Self>,
    ) -> Result<Option<Self::User>, Self::Error> {
        let user = sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(user)
    }
}

/// The signed-in user; `login_required!` guarantees one on protected routes.
pub fn current_user(auth_session: &AuthSession) -> AppResult<&User> {
    auth_session.user.as_ref().ok_or(AppError::Unauthorized)
}

#[derive(Debug, Deserialize)]
pub struct RegisterForm {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(alias = "password_confirm")]
    pub confirm: String,
}

impl RegisterForm {
    fn validate(&self, v: &mut Validator) {
        let username_len = self.username.trim().chars().count();
        v.check(
            (3..=80).contains(&username_len),
            "username",
            "Username must be between 3 and 80 characters",
        );
        v.check(
            is_email(self.email.trim()),
            "email",
            "Enter a valid email address",
        );
        v.check(
            self.password.chars().count() >= 6,
            "password",
            "Password must be at least 6 characters",
        );
        v.check(
            self.password == self.confirm,
            "confirm",
            "Passwords must match",
        );
    }
}

pub fn is_email(email: &str) -> bool {
    if email.len() > 120 || email.chars().any(char::is_whitespace) {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain
                    .split_once('.')
                    .is_some_and(|(host, tld)| !host.is_empty() && tld.len() >= 2)
                && !domain.ends_with('.')
        }
        None => false,
    }
}

/// Accept only local paths so a crafted `next` cannot bounce users off-site.
pub fn safe_next(next: Option<&str>) -> &str {
    match next {
        Some(path) if path.starts_with('/') && !path.starts_with("//") && !path.contains('\\') => {
            path
        }
        _ => "/tasks",
    }
}

fn unique_violation_field(err: &sqlx::Error) -> Option<&'static str> {
    let db_err = err.as_database_error()?;
    if !db_err.is_unique_violation() {
        return None;
    }
    if db_err.message().contains("users.email") {
        Some("email")
    } else {
        Some("username")
    }
}

/// Inserts a user row. A unique violation (a concurrent registration got
/// there first) comes back as a field error; the caller's transaction is
/// rolled back when it is dropped.
async fn insert_user(
    conn: &mut SqliteConnection,
    username: &str,
    email: &str,
    password_hash: &str,
    now: DateTime<Utc>,
) -> AppResult<i64> {
    let inserted = sqlx::query_scalar::<_, i64>(
        "INSERT INTO users (username, email, password_hash, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(username)
    .bind(email)
    .bind(password_hash)
    .bind(now)
    .bind(now)
    .fetch_one(conn)
    .await;

    match inserted {
        Ok(id) => Ok(id),
        Err(err) => {
            let Some(field) = unique_violation_field(&err) else {
                return Err(err.into());
            };
            let message = if field == "email" {
                "This email is already registered"
            } else {
                "This username is already taken"
            };
            Err(AppError::Validation(vec![FieldError {
                field,
                message: message.to_string(),
            }]))
        }
    }
}

pub async fn register(
    auth_session: AuthSession,
    session: Session,
    Extension(pool): Extension<SqlitePool>,
    Form(form): Form<RegisterForm>,
) -> AppResult<Redirect> {
    if auth_session.user.is_some() {
        return Ok(Redirect::to("/tasks"));
    }

    let username = form.username.trim().to_string();
    let email = form.email.trim().to_lowercase();

    let mut v = Validator::default();
    form.validate(&mut v);
    if !v.has_errors() {
        let taken: Vec<(String, String)> =
            sqlx::query_as("SELECT username, email FROM users WHERE username = ? OR email = ?")
                .bind(&username)
                .bind(&email)
                .fetch_all(&pool)
                .await?;
        v.check(
            !taken.iter().any(|(u, _)| *u == username),
            "username",
            "This username is already taken",
        );
        v.check(
            !taken.iter().any(|(_, e)| *e == email),
            "email",
            "This email is already registered",
        );
    }
    v.finish()?;

    let password = form.password;
    let password_hash =
        tokio::task::spawn_blocking(move || password_auth::generate_hash(password)).await?;

    let mut tx = pool.begin().await?;
    let user_id = insert_user(&mut tx, &username, &email, &password_hash, Utc::now()).await?;
    tx.commit().await?;

    tracing::info!(user_id, %username, "registered new user");
    flash::push(
        &session,
        Level::Success,
        "Account created! You can sign in now",
    )
    .await?;
    Ok(Redirect::to("/auth/login"))
}

#[derive(Debug, Deserialize)]
pub struct NextQuery {
    pub next: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuthPage {
    /// Where a successful sign-in will land.
    pub next: String,
    pub messages: Vec<Flash>,
}

async fn auth_page(
    auth_session: &AuthSession,
    session: &Session,
    next: Option<&str>,
) -> AppResult<Response> {
    if auth_session.user.is_some() {
        return Ok(Redirect::to("/tasks").into_response());
    }
    let page = AuthPage {
        next: safe_next(next).to_string(),
        messages: flash::take(session).await?,
    };
    Ok(Json(page).into_response())
}

pub async fn login_page(
    auth_session: AuthSession,
    session: Session,
    Query(query): Query<NextQuery>,
) -> AppResult<Response> {
    auth_page(&auth_session, &session, query.next.as_deref()).await
}

pub async fn register_page(auth_session: AuthSession, session: Session) -> AppResult<Response> {
    auth_page(&auth_session, &session, None).await
}

pub async fn login(
    mut auth_session: AuthSession,
    session: Session,
    Extension(config): Extension<Arc<Config>>,
    Query(query): Query<NextQuery>,
    Form(creds): Form<Credentials>,
) -> AppResult<Redirect> {
    let remember = creds.remember_me();
    // the form field wins; `login_required!` passes it in the query string
    let next = creds
        .next
        .as_deref()
        .filter(|n| !n.trim().is_empty())
        .or(query.next.as_deref());
    let next = safe_next(next).to_string();

    let user = match auth_session.authenticate(creds).await? {
        Some(user) => user,
        None => {
            tracing::warn!("rejected sign-in attempt");
            return Err(AppError::InvalidCredentials);
        }
    };

    auth_session.login(&user).await?;
    if remember {
        session
            .set_expiry(Some(Expiry::OnInactivity(time::Duration::days(
                config.remember_days,
            ))));
    }

    tracing::info!(user_id = user.id, remember, "user signed in");
    flash::push(
        &session,
        Level::Success,
        format!("Welcome, {}!", user.username),
    )
    .await?;
    Ok(Redirect::to(&next))
}

pub async fn logout(mut auth_session: AuthSession, session: Session) -> AppResult<Redirect> {
    if let Some(user) = auth_session.logout().await? {
        tracing::info!(user_id = user.id, "user signed out");
    }
    flash::push(&session, Level::Info, "You have been signed out").await?;
    Ok(Redirect::to("/auth/login"))
}

pub async fn index(auth_session: AuthSession) -> Redirect {
    if auth_session.user.is_some() {
        Redirect::to("/tasks")
    } else {
        Redirect::to("/auth/login")
    }
}

/// Removes an account together with everything it owns.
pub async fn delete_user(pool: &SqlitePool, user_id: i64) -> AppResult<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM shared_tasks WHERE user_id = ?")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM tasks WHERE user_id = ?")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }
    tx.commit().await?;
    tracing::info!(user_id, "deleted user and owned records");
    Ok(())
}
