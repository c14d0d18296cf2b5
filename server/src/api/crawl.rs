use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AppError, AppState};

#[derive(Debug, Deserialize)]
pub struct FollowingQuery {
    #[serde(default)]
    pub id: String,
}

/// One account the target follows.
#[derive(Debug, Serialize)]
pub struct FollowingEntry {
    pub id: String,
    pub username: String,
    pub name: String,
}

/// GET /api/v1/following?id=<user id> — walk the target's following list
/// to exhaustion and return it in one response.
pub async fn following(
    State(state): State<AppState>,
    Query(query): Query<FollowingQuery>,
) -> Result<Json<Vec<FollowingEntry>>, AppError> {
    if query.id.is_empty() {
        return Err(AppError::Validation("invalid user id".to_string()));
    }

    let mut cursor = String::new();
    let mut results = Vec::new();
    loop {
        let (items, next_cursor) = state.crawler.following(&query.id, &cursor).await?;
        debug!(target = %query.id, page_items = items.len(), "crawled following page");
        results.extend(items.into_iter().map(|item| FollowingEntry {
            id: item.user_id,
            username: item.screen_name,
            name: item.name,
        }));
        if next_cursor.is_empty() {
            break;
        }
        cursor = next_cursor;
    }

    Ok(Json(results))
}
