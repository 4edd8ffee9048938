//! One-shot notices carried in the session from a form post to the next view.

use serde::{Deserialize, Serialize};
use tower_sessions::{session, Session};

const FLASH_KEY: &str = "_flash";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Success,
    Info,
    Danger,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flash {
    pub level: Level,
    pub message: String,
}

pub async fn push(
    session: &Session,
    level: Level,
    message: impl Into<String>,
) -> Result<(), session::Error> {
    let mut pending: Vec<Flash> = session.get(FLASH_KEY).await?.unwrap_or_default();
    pending.push(Flash {
        level,
        message: message.into(),
    });
    session.insert(FLASH_KEY, pending).await
}

pub async fn take(session: &Session) -> Result<Vec<Flash>, session::Error> {
    Ok(session
        .remove::<Vec<Flash>>(FLASH_KEY)
        .await?
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tower_sessions_sqlx_store::SqliteStore;

    use super::*;
    use crate::db::testing;

    #[tokio::test]
    async fn messages_are_drained_once() {
        let store = SqliteStore::new(testing::pool().await);
        store.migrate().await.unwrap();
        let session = Session::new(None, Arc::new(store), None);
        push(&session, Level::Success, "Task created").await.unwrap();
        push(&session, Level::Info, "Second").await.unwrap();

        let messages = take(&session).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message, "Task created");
        assert_eq!(messages[1].level, Level::Info);

        assert!(take(&session).await.unwrap().is_empty());
    }
}
