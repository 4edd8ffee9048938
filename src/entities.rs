use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Clone, FromRow, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// keep the hash out of logs
impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("email", &self.email)
            .field("password_hash", &"[redacted]")
            .finish()
    }
}

impl axum_login::AuthUser for User {
    type Id = i64;

    fn id(&self) -> Self::Id {
        self.id
    }

    // when user changes password, auth session becomes invalid
    fn session_auth_hash(&self) -> &[u8] {
        self.password_hash.as_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::Low, Priority::Medium, Priority::High];

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    /// Sort weight, higher sorts first.
    pub fn rank(self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Task {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub completed: bool,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Flips the completion flag, keeping `completed_at` in step with it.
    pub fn toggled(mut self, now: DateTime<Utc>) -> Self {
        self.completed = !self.completed;
        self.completed_at = self.completed.then_some(now);
        self.updated_at = now;
        self
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SharedTask {
    pub id: i64,
    pub token: String,
    pub task_id: i64,
    pub user_id: i64,
    pub allowed_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SharedTask {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Whether a viewer signed in as `viewer_email` (if anyone) may open the link.
    pub fn admits(&self, viewer_email: Option<&str>) -> bool {
        match (&self.allowed_email, viewer_email) {
            (None, _) => true,
            (Some(allowed), Some(viewer)) => allowed.eq_ignore_ascii_case(viewer.trim()),
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskFilter {
    #[default]
    All,
    Completed,
    Active,
}

impl TaskFilter {
    /// Unknown values fall back to `All`.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("completed") => TaskFilter::Completed,
            Some("active") => TaskFilter::Active,
            _ => TaskFilter::All,
        }
    }

    pub fn completed(self) -> Option<bool> {
        match self {
            TaskFilter::All => None,
            TaskFilter::Completed => Some(true),
            TaskFilter::Active => Some(false),
        }
    }
}
