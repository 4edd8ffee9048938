//! Read-only aggregates over one user's tasks.
//!
//! Every "day" is a calendar day in the time zone of the `now` passed in
//! (handlers pass the server's local time). A day becomes the UTC range
//! `[midnight, next midnight)` and is compared against the stored UTC
//! timestamps. The week is the seven days ending today.

use std::fmt::Display;

use axum::{extract::Extension, Json};
use chrono::{DateTime, Datelike, Days, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::{
    authentication::{current_user, AuthSession},
    crud_ops::{task_counts, TaskCounts},
    entities::Priority,
    error::AppResult,
};

pub const WEEK_DAYS: u64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayRange {
    pub date: NaiveDate,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// UTC instant of local midnight at the start of `date`. When a DST jump
/// skips midnight the naive time is read as UTC.
pub fn local_midnight<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

pub fn day_range<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> DayRange {
    let next = date.succ_opt().unwrap_or(date);
    DayRange {
        date,
        start: local_midnight(tz, date),
        end: local_midnight(tz, next),
    }
}

/// The seven days ending `today`, oldest first.
pub fn week_ranges<Tz: TimeZone>(tz: &Tz, today: NaiveDate) -> Vec<DayRange> {
    (0..WEEK_DAYS)
        .rev()
        .map(|back| today.checked_sub_days(Days::new(back)).unwrap_or(today))
        .map(|date| day_range(tz, date))
        .collect()
}

fn short_date(date: NaiveDate) -> String {
    date.format("%d.%m").to_string()
}

fn weekday_label(date: NaiveDate) -> String {
    date.weekday().to_string()
}

fn calculated_at<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: Display,
{
    now.format("%d.%m.%Y %H:%M:%S").to_string()
}

async fn created_between(pool: &SqlitePool, user_id: i64, range: &DayRange) -> AppResult<i64> {
    Ok(sqlx::query_scalar(
        "SELECT COUNT(*) FROM tasks WHERE user_id = ? AND created_at >= ? AND created_at < ?",
    )
    .bind(user_id)
    .bind(range.start)
    .bind(range.end)
    .fetch_one(pool)
    .await?)
}

async fn completed_between(pool: &SqlitePool, user_id: i64, range: &DayRange) -> AppResult<i64> {
    Ok(sqlx::query_scalar(
        "SELECT COUNT(*) FROM tasks
         WHERE user_id = ? AND completed = 1 AND completed_at >= ? AND completed_at < ?",
    )
    .bind(user_id)
    .bind(range.start)
    .bind(range.end)
    .fetch_one(pool)
    .await?)
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PriorityCounts {
    pub low: i64,
    pub medium: i64,
    pub high: i64,
}

impl PriorityCounts {
    fn from_rows(rows: Vec<(Priority, i64)>) -> Self {
        rows.into_iter()
            .fold(Self::default(), |mut acc, (priority, n)| {
                match priority {
                    Priority::Low => acc.low += n,
                    Priority::Medium => acc.medium += n,
                    Priority::High => acc.high += n,
                }
                acc
            })
    }
}

/// Buckets by priority, optionally only tasks created at or after `since`.
async fn priority_counts(
    pool: &SqlitePool,
    user_id: i64,
    since: Option<DateTime<Utc>>,
) -> AppResult<PriorityCounts> {
    let rows: Vec<(Priority, i64)> = match since {
        Some(since) => {
            sqlx::query_as(
                "SELECT priority, COUNT(*) FROM tasks
                 WHERE user_id = ? AND created_at >= ? GROUP BY priority",
            )
            .bind(user_id)
            .bind(since)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as(
                "SELECT priority, COUNT(*) FROM tasks WHERE user_id = ? GROUP BY priority",
            )
            .bind(user_id)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(PriorityCounts::from_rows(rows))
}

#[derive(Debug, Serialize)]
pub struct DailyStats {
    pub total: i64,
    pub completed: i64,
    pub active: i64,
    pub today_created: i64,
    pub today_completed: i64,
    pub calculated_at: String,
}

pub async fn daily_stats<Tz: TimeZone>(
    pool: &SqlitePool,
    user_id: i64,
    now: &DateTime<Tz>,
) -> AppResult<DailyStats>
where
    Tz::Offset: Display,
{
    let today = day_range(&now.timezone(), now.date_naive());
    let TaskCounts {
        total,
        completed,
        active,
    } = task_counts(pool, user_id).await?;
    Ok(DailyStats {
        total,
        completed,
        active,
        today_created: created_between(pool, user_id, &today).await?,
        today_completed: completed_between(pool, user_id, &today).await?,
        calculated_at: calculated_at(now),
    })
}

#[derive(Debug, Serialize)]
pub struct WeekDay {
    pub date: String,
    pub iso_date: NaiveDate,
    pub day: String,
    pub created: i64,
    pub completed: i64,
}

pub async fn weekly_stats<Tz: TimeZone>(
    pool: &SqlitePool,
    user_id: i64,
    now: &DateTime<Tz>,
) -> AppResult<Vec<WeekDay>> {
    let mut days = Vec::with_capacity(WEEK_DAYS as usize);
    for range in week_ranges(&now.timezone(), now.date_naive()) {
        days.push(WeekDay {
            date: short_date(range.date),
            iso_date: range.date,
            day: weekday_label(range.date),
            created: created_between(pool, user_id, &range).await?,
            completed: completed_between(pool, user_id, &range).await?,
        });
    }
    Ok(days)
}

#[derive(Debug, Serialize)]
pub struct DayCreated {
    pub date: String,
    pub iso_date: NaiveDate,
    pub created: i64,
}

#[derive(Debug, Serialize)]
pub struct Dashboard {
    pub today_tasks: i64,
    pub today_completed: i64,
    pub total_tasks: i64,
    pub total_completed: i64,
    pub total_active: i64,
    pub priority_stats: PriorityCounts,
    pub week_stats: Vec<DayCreated>,
    pub calculated_at: String,
}

pub async fn dashboard<Tz: TimeZone>(
    pool: &SqlitePool,
    user_id: i64,
    now: &DateTime<Tz>,
) -> AppResult<Dashboard>
where
    Tz::Offset: Display,
{
    let tz = now.timezone();
    let today = day_range(&tz, now.date_naive());
    let totals = task_counts(pool, user_id).await?;

    let mut week_stats = Vec::with_capacity(WEEK_DAYS as usize);
    for range in week_ranges(&tz, now.date_naive()) {
        week_stats.push(DayCreated {
            date: short_date(range.date),
            iso_date: range.date,
            created: created_between(pool, user_id, &range).await?,
        });
    }

    Ok(Dashboard {
        today_tasks: created_between(pool, user_id, &today).await?,
        today_completed: completed_between(pool, user_id, &today).await?,
        total_tasks: totals.total,
        total_completed: totals.completed,
        total_active: totals.active,
        priority_stats: priority_counts(pool, user_id, None).await?,
        week_stats,
        calculated_at: calculated_at(now),
    })
}

#[derive(Debug, Serialize)]
pub struct DayBreakdown {
    pub date: String,
    pub iso_date: NaiveDate,
    pub day_name: String,
    pub total: i64,
    pub completed: i64,
    pub active: i64,
}

#[derive(Debug, Serialize)]
pub struct Overview {
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub active_tasks: i64,
    pub last_7_days: TaskCounts,
    pub priority: PriorityCounts,
    pub last_7_days_priority: PriorityCounts,
    pub daily_stats: Vec<DayBreakdown>,
    pub calculated_at: String,
}

/// Created-in-range tasks, split by whether they are done now.
async fn created_breakdown(
    pool: &SqlitePool,
    user_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> AppResult<TaskCounts> {
    let (total, completed): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(completed), 0) FROM tasks
         WHERE user_id = ? AND created_at >= ? AND created_at < ?",
    )
    .bind(user_id)
    .bind(start)
    .bind(end)
    .fetch_one(pool)
    .await?;
    Ok(TaskCounts {
        total,
        completed,
        active: total - completed,
    })
}

pub async fn overview<Tz: TimeZone>(
    pool: &SqlitePool,
    user_id: i64,
    now: &DateTime<Tz>,
) -> AppResult<Overview>
where
    Tz::Offset: Display,
{
    let tz = now.timezone();
    let today = day_range(&tz, now.date_naive());
    let week = week_ranges(&tz, today.date);
    let window_start = week.first().map_or(today.start, |day| day.start);
    let window_end = today.end;

    let totals = task_counts(pool, user_id).await?;
    let mut daily_stats = Vec::with_capacity(week.len());
    for range in &week {
        let counts = created_breakdown(pool, user_id, range.start, range.end).await?;
        daily_stats.push(DayBreakdown {
            date: short_date(range.date),
            iso_date: range.date,
            day_name: weekday_label(range.date),
            total: counts.total,
            completed: counts.completed,
            active: counts.active,
        });
    }

    Ok(Overview {
        total_tasks: totals.total,
        completed_tasks: totals.completed,
        active_tasks: totals.active,
        last_7_days: created_breakdown(pool, user_id, window_start, window_end).await?,
        priority: priority_counts(pool, user_id, None).await?,
        last_7_days_priority: priority_counts(pool, user_id, Some(window_start)).await?,
        daily_stats,
        calculated_at: calculated_at(now),
    })
}

pub async fn statistics_page(
    auth_session: AuthSession,
    Extension(pool): Extension<SqlitePool>,
) -> AppResult<Json<Overview>> {
    let user_id = current_user(&auth_session)?.id;
    Ok(Json(overview(&pool, user_id, &Local::now()).await?))
}

pub async fn dashboard_page(
    auth_session: AuthSession,
    Extension(pool): Extension<SqlitePool>,
) -> AppResult<Json<Dashboard>> {
    let user_id = current_user(&auth_session)?.id;
    Ok(Json(dashboard(&pool, user_id, &Local::now()).await?))
}

pub async fn api_daily_stats(
    auth_session: AuthSession,
    Extension(pool): Extension<SqlitePool>,
) -> AppResult<Json<DailyStats>> {
    let user_id = current_user(&auth_session)?.id;
    Ok(Json(daily_stats(&pool, user_id, &Local::now()).await?))
}

pub async fn api_weekly_stats(
    auth_session: AuthSession,
    Extension(pool): Extension<SqlitePool>,
) -> AppResult<Json<Vec<WeekDay>>> {
    let user_id = current_user(&auth_session)?.id;
    Ok(Json(weekly_stats(&pool, user_id, &Local::now()).await?))
}
