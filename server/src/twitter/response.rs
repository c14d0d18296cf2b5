//! Wire types for the platform's GraphQL timeline responses.
//!
//! Every endpoint returns the same `Timeline → Instruction → Entry →
//! Content` shape and differs only in the leaf item content, so the
//! envelope here is generic over that leaf. Endpoints pick their leaf type
//! and the JSON-pointer path from the response's `data` object down to the
//! timeline.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};

/// `created_at` format used by the platform's legacy payloads,
/// e.g. `Wed Sep 13 17:29:05 +0000 2023`.
const LEGACY_TIME_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

/// Cursor types that terminate a page and seed the next one.
fn is_page_cursor(cursor_type: &str) -> bool {
    matches!(
        cursor_type,
        "Bottom" | "ShowMoreThreads" | "ShowMoreThreadsPrompt"
    )
}

// ── Envelope ────────────────────────────────────────────────────────

/// Server-side error entry carried in an otherwise-200 response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub code: i64,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    errors: Vec<ApiError>,
}

/// A decoded page: the server-side error list plus the timeline found at
/// the endpoint's data path (empty when the path is absent).
#[derive(Debug)]
pub struct GraphqlPage<C> {
    pub errors: Vec<ApiError>,
    pub timeline: Timeline<C>,
}

/// Decode a response body, digging the timeline out of the endpoint's
/// nested `data` wrapper via a JSON pointer.
pub fn parse_page<C: DeserializeOwned + Default>(
    body: &[u8],
    data_path: &str,
) -> Result<GraphqlPage<C>, serde_json::Error> {
    let envelope: Envelope = serde_json::from_slice(body)?;
    let timeline = match envelope.data.pointer(data_path) {
        Some(value) => serde_json::from_value(value.clone())?,
        None => Timeline::default(),
    };
    Ok(GraphqlPage {
        errors: envelope.errors,
        timeline,
    })
}

// ── Timeline ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Timeline<C> {
    #[serde(default)]
    pub instructions: Vec<Instruction<C>>,
}

impl<C> Default for Timeline<C> {
    fn default() -> Self {
        Self {
            instructions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Instruction<C> {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub entries: Vec<Entry<C>>,
    /// Present on `TimelineReplaceEntry` instructions.
    pub entry: Option<ReplacedEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplacedEntry {
    pub content: CursorContent,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CursorContent {
    #[serde(rename = "entryType", default)]
    pub entry_type: String,
    #[serde(rename = "cursorType", default)]
    pub cursor_type: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Entry<C> {
    #[serde(rename = "entryId", default)]
    pub entry_id: String,
    #[serde(rename = "sortIndex", default, deserialize_with = "i64_from_string")]
    pub sort_index: i64,
    pub content: EntryContent<C>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntryContent<C> {
    #[serde(rename = "entryType", default)]
    pub entry_type: String,
    #[serde(rename = "cursorType", default)]
    pub cursor_type: String,
    #[serde(default)]
    pub value: String,
    /// Non-null only for item entries (and inline cursors).
    #[serde(rename = "itemContent")]
    pub item_content: Option<C>,
}

// ── Leaf item contents ──────────────────────────────────────────────

/// Leaf for the search-timeline endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TweetItemContent {
    #[serde(rename = "itemType", default)]
    pub item_type: String,
    #[serde(default)]
    pub tweet_results: TweetResults,
}

/// Leaf for the retweeters / favoriters / following endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserItemContent {
    #[serde(rename = "itemType", default)]
    pub item_type: String,
    #[serde(default)]
    pub user_results: UserResults,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserResults {
    #[serde(default)]
    pub result: UserResult,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserResult {
    #[serde(default)]
    pub rest_id: String,
    #[serde(default)]
    pub legacy: UserLegacy,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserLegacy {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub screen_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TweetResults {
    #[serde(default)]
    pub result: TweetResult,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TweetResult {
    #[serde(default)]
    pub rest_id: String,
    #[serde(default)]
    pub core: TweetCore,
    #[serde(default)]
    pub legacy: TweetLegacy,
    #[serde(default)]
    pub views: TweetViews,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TweetCore {
    #[serde(default)]
    pub user_results: UserResults,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TweetViews {
    #[serde(default, deserialize_with = "i64_from_opt_string")]
    pub count: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TweetLegacy {
    #[serde(default = "epoch", deserialize_with = "legacy_time")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub entities: TweetEntities,
    #[serde(default)]
    pub full_text: String,
    #[serde(default)]
    pub in_reply_to_status_id_str: String,
    #[serde(default)]
    pub quoted_status_id_str: String,
    #[serde(default)]
    pub favorite_count: i64,
    #[serde(default)]
    pub quote_count: i64,
    #[serde(default)]
    pub reply_count: i64,
    #[serde(default)]
    pub retweet_count: i64,
    #[serde(default)]
    pub is_quote_status: bool,
}

impl Default for TweetLegacy {
    fn default() -> Self {
        Self {
            created_at: epoch(),
            entities: TweetEntities::default(),
            full_text: String::new(),
            in_reply_to_status_id_str: String::new(),
            quoted_status_id_str: String::new(),
            favorite_count: 0,
            quote_count: 0,
            reply_count: 0,
            retweet_count: 0,
            is_quote_status: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TweetEntities {
    // Singular key as observed in captured traffic; the platform documents
    // `user_mentions`. TODO: confirm against a live response before using
    // this field.
    #[serde(rename = "user_mention", default)]
    pub user_mentions: Vec<UserMention>,
    #[serde(default)]
    pub hashtags: Vec<Hashtag>,
    #[serde(default)]
    pub symbols: Vec<Symbol>,
    #[serde(default)]
    pub urls: Vec<UrlEntity>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserMention {
    #[serde(default)]
    pub id_str: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hashtag {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Symbol {
    #[serde(default)]
    pub text: String,
}

/// A URL entity spanning the half-open byte range `indices` of the tweet's
/// full text.
#[derive(Debug, Clone, Deserialize)]
pub struct UrlEntity {
    #[serde(default)]
    pub display_url: String,
    #[serde(default)]
    pub expanded_url: String,
    #[serde(default)]
    pub url: String,
    pub indices: [usize; 2],
}

// ── Page walking ────────────────────────────────────────────────────

/// One walked page of items plus the cursor that continues the stream
/// (empty means the stream is exhausted).
#[derive(Debug)]
pub struct PageItems<T> {
    pub items: Vec<T>,
    pub next_cursor: String,
}

/// Walk a timeline's instructions, mapping each item entry through `item`.
///
/// Only `TimelineAddEntries` instructions contribute items; a
/// `TimelineReplaceEntry` instruction may update the cursor. Inline cursor
/// entries of the page-terminating types seed `next_cursor`. A page with
/// zero item entries clears the cursor, terminating pagination even when
/// the server still offered one.
pub fn walk_timeline<C, T>(
    timeline: &Timeline<C>,
    mut item: impl FnMut(&Entry<C>, &C) -> Option<T>,
) -> PageItems<T> {
    let mut items = Vec::new();
    let mut next_cursor = String::new();
    let mut item_entries = 0usize;

    for instruction in &timeline.instructions {
        if instruction.kind == "TimelineReplaceEntry" {
            if let Some(replaced) = &instruction.entry {
                let content = &replaced.content;
                if content.entry_type == "TimelineTimelineCursor"
                    && is_page_cursor(&content.cursor_type)
                {
                    next_cursor = content.value.clone();
                }
            }
            continue;
        }

        if instruction.kind != "TimelineAddEntries" {
            continue;
        }

        for entry in &instruction.entries {
            if entry.content.entry_type == "TimelineTimelineCursor"
                && is_page_cursor(&entry.content.cursor_type)
            {
                next_cursor = entry.content.value.clone();
                continue;
            }

            let Some(content) = &entry.content.item_content else {
                continue;
            };

            item_entries += 1;
            if let Some(mapped) = item(entry, content) {
                items.push(mapped);
            }
        }
    }

    if item_entries == 0 {
        next_cursor.clear();
    }

    PageItems { items, next_cursor }
}

/// Rebuild a tweet's text with every URL entity replaced by its display
/// form. Entity indices are half-open `[start, end)` byte offsets into the
/// original text; a malformed range degrades to the unmodified text.
pub fn normalize_text(full_text: &str, urls: &[UrlEntity]) -> String {
    let mut normalized = String::with_capacity(full_text.len());
    let mut last = 0usize;

    for url in urls {
        let [start, end] = url.indices;
        let Some(head) = full_text.get(last..start) else {
            return full_text.to_string();
        };
        normalized.push_str(head);
        normalized.push_str(&url.display_url);
        last = end;
    }

    match full_text.get(last..) {
        Some(tail) => {
            normalized.push_str(tail);
            normalized
        }
        None => full_text.to_string(),
    }
}

// ── Deserializer helpers ────────────────────────────────────────────

fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// The platform encodes several 64-bit counters as JSON strings.
fn i64_from_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let raw = String::deserialize(deserializer)?;
    raw.parse::<i64>()
        .map_err(|_| serde::de::Error::custom(format!("cannot parse {raw:?} as an i64")))
}

/// Like [`i64_from_string`] but tolerates an absent or empty value (the
/// view counter is omitted for tweets without one).
fn i64_from_opt_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(0),
        Some(raw) if raw.is_empty() => Ok(0),
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| serde::de::Error::custom(format!("cannot parse {raw:?} as an i64"))),
    }
}

fn legacy_time<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    DateTime::parse_from_str(&raw, LEGACY_TIME_FORMAT)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| {
            serde::de::Error::custom(format!(
                "cannot parse {raw:?} as a timestamp ({LEGACY_TIME_FORMAT})"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_sort_index_parses_from_string() {
        let entry: Entry<UserItemContent> = serde_json::from_value(serde_json::json!({
            "entryId": "user-123",
            "sortIndex": "1866325",
            "content": {"entryType": "TimelineTimelineItem"}
        }))
        .unwrap();
        assert_eq!(entry.sort_index, 1_866_325);
    }

    #[test]
    fn entry_sort_index_rejects_garbage() {
        let result: Result<Entry<UserItemContent>, _> =
            serde_json::from_value(serde_json::json!({
                "entryId": "user-123",
                "sortIndex": "not-a-number",
                "content": {"entryType": "TimelineTimelineItem"}
            }));
        assert!(result.is_err());
    }

    #[test]
    fn view_count_parses_from_string_and_defaults() {
        let views: TweetViews =
            serde_json::from_value(serde_json::json!({"count": "4021", "state": "EnabledWithCount"}))
                .unwrap();
        assert_eq!(views.count, 4021);

        let views: TweetViews =
            serde_json::from_value(serde_json::json!({"state": "Enabled"})).unwrap();
        assert_eq!(views.count, 0);
    }

    #[test]
    fn legacy_created_at_parses_platform_format() {
        let legacy: TweetLegacy = serde_json::from_value(serde_json::json!({
            "created_at": "Wed Sep 13 17:29:05 +0000 2023",
            "full_text": "hello"
        }))
        .unwrap();
        assert_eq!(legacy.created_at.timestamp(), 1_694_626_145);
    }

    fn cursor_entry(value: &str) -> serde_json::Value {
        serde_json::json!({
            "entryId": "cursor-bottom-1",
            "sortIndex": "0",
            "content": {
                "entryType": "TimelineTimelineCursor",
                "cursorType": "Bottom",
                "value": value
            }
        })
    }

    fn user_entry(entry_id: &str, rest_id: &str) -> serde_json::Value {
        serde_json::json!({
            "entryId": entry_id,
            "sortIndex": "10",
            "content": {
                "entryType": "TimelineTimelineItem",
                "itemContent": {
                    "itemType": "TimelineUser",
                    "user_results": {"result": {"rest_id": rest_id, "legacy": {}}}
                }
            }
        })
    }

    fn timeline_of(entries: Vec<serde_json::Value>) -> Timeline<UserItemContent> {
        serde_json::from_value(serde_json::json!({
            "instructions": [{"type": "TimelineAddEntries", "entries": entries}]
        }))
        .unwrap()
    }

    #[test]
    fn walk_collects_items_and_cursor() {
        let timeline = timeline_of(vec![
            user_entry("user-1", "1"),
            user_entry("user-2", "2"),
            cursor_entry("next-page"),
        ]);
        let page = walk_timeline(&timeline, |_, content| {
            Some(content.user_results.result.rest_id.clone())
        });
        assert_eq!(page.items, vec!["1", "2"]);
        assert_eq!(page.next_cursor, "next-page");
    }

    #[test]
    fn walk_clears_cursor_on_item_free_page() {
        let timeline = timeline_of(vec![cursor_entry("next-page")]);
        let page = walk_timeline(&timeline, |_, content| {
            Some(content.user_results.result.rest_id.clone())
        });
        assert!(page.items.is_empty());
        assert_eq!(page.next_cursor, "");
    }

    #[test]
    fn walk_keeps_cursor_when_items_are_filtered_out() {
        // The search endpoints filter items after decoding; the page still
        // counts as non-empty for the cursor contract.
        let timeline = timeline_of(vec![user_entry("user-1", "1"), cursor_entry("next-page")]);
        let page = walk_timeline(&timeline, |_, _| Option::<String>::None);
        assert!(page.items.is_empty());
        assert_eq!(page.next_cursor, "next-page");
    }

    #[test]
    fn walk_honors_replace_entry_cursor() {
        let timeline: Timeline<UserItemContent> = serde_json::from_value(serde_json::json!({
            "instructions": [
                {
                    "type": "TimelineReplaceEntry",
                    "entry": {
                        "content": {
                            "entryType": "TimelineTimelineCursor",
                            "cursorType": "Bottom",
                            "value": "replaced-cursor"
                        }
                    }
                },
                {"type": "TimelineAddEntries", "entries": [user_entry("user-1", "1")]}
            ]
        }))
        .unwrap();
        let page = walk_timeline(&timeline, |_, content| {
            Some(content.user_results.result.rest_id.clone())
        });
        assert_eq!(page.items, vec!["1"]);
        assert_eq!(page.next_cursor, "replaced-cursor");
    }

    #[test]
    fn walk_ignores_unrelated_instructions() {
        let timeline: Timeline<UserItemContent> = serde_json::from_value(serde_json::json!({
            "instructions": [
                {"type": "TimelineClearCache"},
                {"type": "TimelineAddEntries", "entries": [user_entry("user-7", "7")]}
            ]
        }))
        .unwrap();
        let page = walk_timeline(&timeline, |_, content| {
            Some(content.user_results.result.rest_id.clone())
        });
        assert_eq!(page.items, vec!["7"]);
    }

    #[test]
    fn parse_page_missing_data_path_yields_empty_timeline() {
        let page: GraphqlPage<UserItemContent> =
            parse_page(br#"{"data":{}}"#, "/user/result/timeline/timeline").unwrap();
        assert!(page.errors.is_empty());
        assert!(page.timeline.instructions.is_empty());
    }

    #[test]
    fn parse_page_surfaces_server_errors() {
        let body = br#"{"errors":[{"message":"denied","name":"AuthorizationError"}]}"#;
        let page: GraphqlPage<UserItemContent> =
            parse_page(body, "/user/result/timeline/timeline").unwrap();
        assert_eq!(page.errors.len(), 1);
        assert_eq!(page.errors[0].name, "AuthorizationError");
    }

    fn url(display: &str, start: usize, end: usize) -> UrlEntity {
        UrlEntity {
            display_url: display.to_string(),
            expanded_url: String::new(),
            url: String::new(),
            indices: [start, end],
        }
    }

    #[test]
    fn normalize_replaces_url_slices_with_display_forms() {
        let text = "look https://t.co/abcd1234 and https://t.co/efgh5678 done";
        let urls = [url("example.com/a", 5, 26), url("example.com/b", 31, 53)];
        assert_eq!(
            normalize_text(text, &urls),
            "look example.com/a and example.com/b done"
        );
    }

    #[test]
    fn normalize_round_trips_display_substitution() {
        // Substituting the display forms back with the original slices
        // must reconstruct the input.
        let text = "a https://t.co/xyz b";
        let urls = [url("site.example", 2, 18)];
        let normalized = normalize_text(text, &urls);
        assert_eq!(normalized, "a site.example b");
        let reconstructed = normalized.replace("site.example", &text[2..18]);
        assert_eq!(reconstructed, text);
    }

    #[test]
    fn normalize_degrades_on_out_of_range_indices() {
        let text = "short";
        let urls = [url("x", 2, 99)];
        assert_eq!(normalize_text(text, &urls), "short");
    }

    #[test]
    fn normalize_without_entities_is_identity() {
        assert_eq!(normalize_text("plain text", &[]), "plain text");
    }
}
