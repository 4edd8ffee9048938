use std::sync::Arc;

use axum::{
    extract::{Extension, Form, Path, Query},
    response::Redirect,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tower_sessions::Session;

use crate::{
    authentication::{current_user, AuthSession},
    config::Config,
    entities::{Priority, Task, TaskFilter},
    error::{AppError, AppResult, Validator},
    flash::{self, Flash, Level},
    sharing::{self, ShareInfo},
};

#[derive(Debug, Deserialize)]
pub struct TaskForm {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

/// A task form that passed validation.
#[derive(Debug, PartialEq, Eq)]
pub struct TaskInput {
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
}

impl TaskForm {
    pub fn validate(self) -> AppResult<TaskInput> {
        let mut v = Validator::default();

        let title = self.title.trim().to_string();
        let title_len = title.chars().count();
        v.check(
            (3..=255).contains(&title_len),
            "title",
            "Title must be between 3 and 255 characters",
        );

        let description = self
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        v.check(
            description
                .as_ref()
                .map_or(true, |d| d.chars().count() <= 1000),
            "description",
            "Description must be at most 1000 characters",
        );

        let priority = match self.priority.as_deref().map(str::trim) {
            None | Some("") => Some(Priority::default()),
            Some(value) => Priority::parse(value),
        };
        v.check(
            priority.is_some(),
            "priority",
            "Priority must be one of low, medium, high",
        );

        v.finish()?;
        Ok(TaskInput {
            title,
            description,
            priority: priority.unwrap_or_default(),
        })
    }
}

/// Loads a task only if it belongs to `user_id`. Someone else's task looks
/// exactly like a missing one.
pub async fn fetch_owned_task(
    conn: &mut SqliteConnection,
    task_id: i64,
    user_id: i64,
) -> AppResult<Task> {
    sqlx::query_as("SELECT * FROM tasks WHERE id = ? AND user_id = ?")
        .bind(task_id)
        .bind(user_id)
        .fetch_optional(conn)
        .await?
        .ok_or(AppError::NotFound)
}

fn priority_rank_sql() -> String {
    let arms: String = Priority::ALL
        .iter()
        .map(|p| format!(" WHEN '{}' THEN {}", p.as_str(), p.rank()))
        .collect();
    format!("CASE priority{arms} ELSE 0 END")
}

#[derive(Debug, Serialize)]
pub struct TaskCounts {
    pub total: i64,
    pub completed: i64,
    pub active: i64,
}

pub async fn task_counts(pool: &SqlitePool, user_id: i64) -> AppResult<TaskCounts> {
    let (total, completed): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(completed), 0) FROM tasks WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;
    Ok(TaskCounts {
        total,
        completed,
        active: total - completed,
    })
}

#[derive(Debug, Serialize)]
pub struct TaskPage {
    pub filter: TaskFilter,
    pub page: i64,
    pub per_page: i64,
    pub total_items: i64,
    pub total_pages: i64,
    pub has_prev: bool,
    pub has_next: bool,
    pub tasks: Vec<Task>,
}

/// Active before completed, then high priority first, then newest first.
pub async fn list_tasks(
    pool: &SqlitePool,
    user_id: i64,
    filter: TaskFilter,
    page: i64,
    per_page: i64,
) -> AppResult<TaskPage> {
    let page = page.max(1);
    let per_page = per_page.max(1);
    let condition = match filter.completed() {
        Some(true) => " AND completed = 1",
        Some(false) => " AND completed = 0",
        None => "",
    };

    let total_items: i64 =
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM tasks WHERE user_id = ?{condition}"))
            .bind(user_id)
            .fetch_one(pool)
            .await?;

    let sql = format!(
        "SELECT * FROM tasks WHERE user_id = ?{condition}
         ORDER BY completed ASC, {} DESC, created_at DESC, id DESC
         LIMIT ? OFFSET ?",
        priority_rank_sql()
    );
    let tasks: Vec<Task> = sqlx::query_as(&sql)
        .bind(user_id)
        .bind(per_page)
        .bind((page - 1).saturating_mul(per_page))
        .fetch_all(pool)
        .await?;

    let total_pages = total_items / per_page + i64::from(total_items % per_page != 0);
    Ok(TaskPage {
        filter,
        page,
        per_page,
        total_items,
        total_pages,
        has_prev: page > 1,
        has_next: page < total_pages,
        tasks,
    })
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub filter: Option<String>,
    pub page: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TaskListView {
    #[serde(flatten)]
    pub page: TaskPage,
    pub counts: TaskCounts,
    pub messages: Vec<Flash>,
}

pub async fn get_tasks(
    auth_session: AuthSession,
    session: Session,
    Extension(pool): Extension<SqlitePool>,
    Extension(config): Extension<Arc<Config>>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<TaskListView>> {
    let user_id = current_user(&auth_session)?.id;
    let filter = TaskFilter::parse(query.filter.as_deref());
    let page = list_tasks(
        &pool,
        user_id,
        filter,
        query.page.unwrap_or(1),
        config.items_per_page,
    )
    .await?;
    let counts = task_counts(&pool, user_id).await?;
    let messages = flash::take(&session).await?;

    Ok(Json(TaskListView {
        page,
        counts,
        messages,
    }))
}

#[derive(Debug, Serialize)]
pub struct TaskDetail {
    pub task: Task,
    pub share: Option<ShareInfo>,
    pub messages: Vec<Flash>,
}

pub async fn view_task(
    auth_session: AuthSession,
    session: Session,
    Extension(pool): Extension<SqlitePool>,
    Extension(config): Extension<Arc<Config>>,
    Path(task_id): Path<i64>,
) -> AppResult<Json<TaskDetail>> {
    let user_id = current_user(&auth_session)?.id;
    let mut conn = pool.acquire().await?;
    let task = fetch_owned_task(&mut conn, task_id, user_id).await?;
    let share = sharing::find_for_task(&mut conn, task.id).await?;
    drop(conn);

    let messages = flash::take(&session).await?;
    Ok(Json(TaskDetail {
        task,
        share: share.map(|s| ShareInfo::new(&config, s, Utc::now())),
        messages,
    }))
}

pub async fn create_task(
    auth_session: AuthSession,
    session: Session,
    Extension(pool): Extension<SqlitePool>,
    Form(form): Form<TaskForm>,
) -> AppResult<Redirect> {
    let user_id = current_user(&auth_session)?.id;
    let input = form.validate()?;

    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let task_id: i64 = sqlx::query_scalar(
        "INSERT INTO tasks (user_id, title, description, completed, priority, created_at, updated_at)
         VALUES (?, ?, ?, 0, ?, ?, ?) RETURNING id",
    )
    .bind(user_id)
    .bind(&input.title)
    .bind(&input.description)
    .bind(input.priority)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::info!(user_id, task_id, priority = input.priority.as_str(), "task created");
    flash::push(&session, Level::Success, "Task created!").await?;
    Ok(Redirect::to("/tasks"))
}

#[derive(Debug, Serialize)]
pub struct EditView {
    pub task: Task,
    pub priorities: [Priority; 3],
}

pub async fn edit_task_form(
    auth_session: AuthSession,
    Extension(pool): Extension<SqlitePool>,
    Path(task_id): Path<i64>,
) -> AppResult<Json<EditView>> {
    let user_id = current_user(&auth_session)?.id;
    let mut conn = pool.acquire().await?;
    let task = fetch_owned_task(&mut conn, task_id, user_id).await?;
    Ok(Json(EditView {
        task,
        priorities: Priority::ALL,
    }))
}

pub async fn update_task(
    auth_session: AuthSession,
    session: Session,
    Extension(pool): Extension<SqlitePool>,
    Path(task_id): Path<i64>,
    Form(form): Form<TaskForm>,
) -> AppResult<Redirect> {
    let user_id = current_user(&auth_session)?.id;

    let mut tx = pool.begin().await?;
    // ownership is checked before validation so foreign ids stay opaque
    fetch_owned_task(&mut tx, task_id, user_id).await?;
    let input = form.validate()?;

    sqlx::query(
        "UPDATE tasks SET title = ?, description = ?, priority = ?, updated_at = ?
         WHERE id = ? AND user_id = ?",
    )
    .bind(&input.title)
    .bind(&input.description)
    .bind(input.priority)
    .bind(Utc::now())
    .bind(task_id)
    .bind(user_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::info!(user_id, task_id, "task updated");
    flash::push(&session, Level::Success, "Task updated!").await?;
    Ok(Redirect::to(&format!("/tasks/{task_id}")))
}

pub async fn delete_task(
    auth_session: AuthSession,
    session: Session,
    Extension(pool): Extension<SqlitePool>,
    Path(task_id): Path<i64>,
) -> AppResult<Redirect> {
    let user_id = current_user(&auth_session)?.id;

    let mut tx = pool.begin().await?;
    fetch_owned_task(&mut tx, task_id, user_id).await?;
    sharing::revoke(&mut tx, task_id).await?;
    sqlx::query("DELETE FROM tasks WHERE id = ? AND user_id = ?")
        .bind(task_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    tracing::info!(user_id, task_id, "task deleted");
    flash::push(&session, Level::Success, "Task deleted!").await?;
    Ok(Redirect::to("/tasks"))
}

#[derive(Debug, Serialize)]
pub struct ToggleResponse {
    pub success: bool,
    pub completed: bool,
    pub message: &'static str,
}

/// Flips completion; the flag and `completed_at` are written by one statement.
pub async fn toggle_task_in(
    conn: &mut SqliteConnection,
    task_id: i64,
    user_id: i64,
    now: DateTime<Utc>,
) -> AppResult<Task> {
    let task = fetch_owned_task(&mut *conn, task_id, user_id)
        .await?
        .toggled(now);
    sqlx::query(
        "UPDATE tasks SET completed = ?, completed_at = ?, updated_at = ?
         WHERE id = ? AND user_id = ?",
    )
    .bind(task.completed)
    .bind(task.completed_at)
    .bind(task.updated_at)
    .bind(task.id)
    .bind(user_id)
    .execute(conn)
    .await?;
    Ok(task)
}

pub async fn toggle_task(
    auth_session: AuthSession,
    Extension(pool): Extension<SqlitePool>,
    Path(task_id): Path<i64>,
) -> AppResult<Json<ToggleResponse>> {
    let user_id = current_user(&auth_session)?.id;

    let mut tx = pool.begin().await?;
    let task = toggle_task_in(&mut tx, task_id, user_id, Utc::now()).await?;
    tx.commit().await?;

    tracing::debug!(user_id, task_id, completed = task.completed, "task toggled");
    Ok(Json(ToggleResponse {
        success: true,
        completed: task.completed,
        message: if task.completed {
            "Task completed!"
        } else {
            "Task reopened!"
        },
    }))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::db::testing;

    fn form(title: &str, description: Option<&str>, priority: Option<&str>) -> TaskForm {
        TaskForm {
            title: title.into(),
            description: description.map(Into::into),
            priority: priority.map(Into::into),
        }
    }

    fn invalid_fields(result: AppResult<TaskInput>) -> Vec<&'static str> {
        match result {
            Err(AppError::Validation(errors)) => errors.into_iter().map(|e| e.field).collect(),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn task_form_validation() {
        let input = form("  Buy milk ", Some("   "), None).validate().unwrap();
        assert_eq!(
            input,
            TaskInput {
                title: "Buy milk".into(),
                description: None,
                priority: Priority::Medium,
            }
        );

        assert_eq!(invalid_fields(form("ab", None, None).validate()), ["title"]);
        assert_eq!(
            invalid_fields(form(&"x".repeat(256), None, Some("urgent")).validate()),
            ["title", "priority"]
        );
        assert_eq!(
            invalid_fields(form("Read", Some(&"d".repeat(1001)), Some("low")).validate()),
            ["description"]
        );
    }

    #[tokio::test]
    async fn listing_sorts_and_scopes_to_owner() {
        let pool = testing::pool().await;
        let alice = testing::user(&pool, "alice").await;
        let bob = testing::user(&pool, "bob").await;
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();

        let low = testing::task(&pool, alice, "Low", Priority::Low, t0, None).await;
        let medium_old = testing::task(&pool, alice, "Medium old", Priority::Medium, t0, None).await;
        let medium_new = testing::task(
            &pool,
            alice,
            "Medium new",
            Priority::Medium,
            t0 + Duration::hours(1),
            None,
        )
        .await;
        let high = testing::task(&pool, alice, "High", Priority::High, t0, None).await;
        let done = testing::task(
            &pool,
            alice,
            "Done high",
            Priority::High,
            t0 + Duration::hours(3),
            Some(t0 + Duration::hours(4)),
        )
        .await;
        testing::task(&pool, bob, "Bob's", Priority::High, t0, None).await;

        let page = list_tasks(&pool, alice, TaskFilter::All, 1, 10).await.unwrap();
        let ids: Vec<i64> = page.tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, [high, medium_new, medium_old, low, done]);
        assert!(page.tasks.iter().all(|t| t.user_id == alice));

        let completed = list_tasks(&pool, alice, TaskFilter::Completed, 1, 10)
            .await
            .unwrap();
        assert_eq!(completed.total_items, 1);
        assert!(completed.tasks[0].completed_at.is_some());

        let active = list_tasks(&pool, alice, TaskFilter::Active, 1, 10).await.unwrap();
        assert_eq!(active.total_items, 4);
    }

    #[tokio::test]
    async fn pagination_bounds() {
        let pool = testing::pool().await;
        let alice = testing::user(&pool, "alice").await;
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        for i in 0..5 {
            testing::task(
                &pool,
                alice,
                &format!("Task {i}"),
                Priority::Medium,
                t0 + Duration::minutes(i),
                None,
            )
            .await;
        }

        let first = list_tasks(&pool, alice, TaskFilter::All, 0, 2).await.unwrap();
        assert_eq!(first.page, 1);
        assert_eq!(first.total_pages, 3);
        assert!(first.has_next && !first.has_prev);
        assert_eq!(first.tasks.len(), 2);

        let last = list_tasks(&pool, alice, TaskFilter::All, 3, 2).await.unwrap();
        assert_eq!(last.tasks.len(), 1);
        assert!(!last.has_next && last.has_prev);

        let beyond = list_tasks(&pool, alice, TaskFilter::All, 9, 2).await.unwrap();
        assert!(beyond.tasks.is_empty());
    }

    #[tokio::test]
    async fn huge_page_numbers_give_an_empty_page() {
        let pool = testing::pool().await;
        let alice = testing::user(&pool, "alice").await;
        testing::task(&pool, alice, "Buy milk", Priority::High, Utc::now(), None).await;

        let far = list_tasks(&pool, alice, TaskFilter::All, i64::MAX, 10).await.unwrap();
        assert!(far.tasks.is_empty());
        assert_eq!(far.total_items, 1);
        assert!(!far.has_next);

        let wide = list_tasks(&pool, alice, TaskFilter::All, 1, i64::MAX).await.unwrap();
        assert_eq!(wide.tasks.len(), 1);
        assert_eq!(wide.total_pages, 1);
    }

    #[tokio::test]
    async fn toggle_round_trip_keeps_invariant() {
        let pool = testing::pool().await;
        let alice = testing::user(&pool, "alice").await;
        let bob = testing::user(&pool, "bob").await;
        let task = testing::task(&pool, alice, "Buy milk", Priority::High, Utc::now(), None).await;
        let mut conn = pool.acquire().await.unwrap();

        let done = toggle_task_in(&mut conn, task, alice, Utc::now()).await.unwrap();
        assert!(done.completed && done.completed_at.is_some());
        let stored = fetch_owned_task(&mut conn, task, alice).await.unwrap();
        assert_eq!(stored.completed, stored.completed_at.is_some());

        let reopened = toggle_task_in(&mut conn, task, alice, Utc::now()).await.unwrap();
        assert!(!reopened.completed && reopened.completed_at.is_none());

        assert!(matches!(
            toggle_task_in(&mut conn, task, bob, Utc::now()).await,
            Err(AppError::NotFound)
        ));
    }

    #[tokio::test]
    async fn counts_split_active_and_completed() {
        let pool = testing::pool().await;
        let alice = testing::user(&pool, "alice").await;
        let now = Utc::now();
        testing::task(&pool, alice, "One", Priority::Low, now, None).await;
        testing::task(&pool, alice, "Two", Priority::Low, now, Some(now)).await;

        let counts = task_counts(&pool, alice).await.unwrap();
        assert_eq!((counts.total, counts.completed, counts.active), (2, 1, 1));

        let empty = task_counts(&pool, 999).await.unwrap();
        assert_eq!(empty.total, 0);
    }
}
