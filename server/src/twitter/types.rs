//! Records produced by the crawl operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One platform account the fleet may impersonate.
///
/// An empty password means the session was built from pre-baked cookies and
/// cannot re-login.
#[derive(Debug, Clone, Deserialize)]
pub struct Credential {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// A reply to the crawled tweet, from the search timeline.
#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub tweet_id: String,
    pub user_id: String,
    pub text: String,
    pub normalized_text: String,
    pub created_at: DateTime<Utc>,
    pub hashtags: Vec<String>,
    pub lowered_hashtags: Vec<String>,
    pub symbols: Vec<String>,
    pub lowered_symbols: Vec<String>,
    pub sort: i64,
}

/// A tweet quoting the crawled tweet, from the search timeline.
#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub tweet_id: String,
    pub user_id: String,
    pub text: String,
    pub normalized_text: String,
    pub created_at: DateTime<Utc>,
    pub hashtags: Vec<String>,
    pub lowered_hashtags: Vec<String>,
    pub symbols: Vec<String>,
    pub lowered_symbols: Vec<String>,
    pub sort: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Retweet {
    pub tweet_id: String,
    pub user_id: String,
    pub sort: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Like {
    pub tweet_id: String,
    pub user_id: String,
    pub sort: i64,
}

/// One account followed by the crawled user.
#[derive(Debug, Clone, Serialize)]
pub struct Following {
    pub target_id: String,
    pub user_id: String,
    pub name: String,
    pub screen_name: String,
}

/// Engagement counters for one status of the crawled handle.
#[derive(Debug, Clone, Serialize)]
pub struct StatusStat {
    pub user_id: String,
    pub user_screen_name: String,
    pub user_name: String,
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub is_quote_status: bool,
    pub view_count: i64,
    pub quote_count: i64,
    pub reply_count: i64,
    pub retweet_count: i64,
    pub favorite_count: i64,
}
