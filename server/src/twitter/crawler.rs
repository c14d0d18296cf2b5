//! Fleet dispatcher: selects an available endpoint client per request,
//! executes it, and exposes the per-endpoint crawl operations.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use rand::seq::SliceRandom;
use regex::Regex;
use reqwest::{Method, Request, StatusCode, Url};
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::client::EndpointClient;
use super::error::CrawlError;
use super::response::{
    self, normalize_text, TweetItemContent, TweetLegacy, UserItemContent,
};
use super::session::Session;
use super::types::{Credential, Following, Like, Quote, Reply, Retweet, StatusStat};
use super::{endpoints, ApiKind, PlatformUrls};

/// Feature flags the platform's web client attaches to tweet queries.
const TWEET_FEATURES: &str = r#"{"responsive_web_graphql_exclude_directive_enabled":true,"verified_phone_label_enabled":false,"creator_subscriptions_tweet_preview_api_enabled":true,"responsive_web_graphql_timeline_navigation_enabled":true,"responsive_web_graphql_skip_user_profile_image_extensions_enabled":false,"tweetypie_unmention_optimization_enabled":true,"responsive_web_edit_tweet_api_enabled":true,"graphql_is_translatable_rweb_tweet_is_translatable_enabled":true,"view_counts_everywhere_api_enabled":true,"longform_notetweets_consumption_enabled":true,"responsive_web_twitter_article_tweet_consumption_enabled":false,"tweet_awards_web_tipping_enabled":false,"freedom_of_speech_not_reach_fetch_enabled":true,"standardized_nudges_misinfo":true,"tweet_with_visibility_results_prefer_gql_limited_actions_policy_enabled":true,"longform_notetweets_rich_text_read_enabled":true,"longform_notetweets_inline_media_enabled":true,"responsive_web_media_download_video_enabled":false,"responsive_web_enhance_cards_enabled":false}"#;

/// Feature flags for user queries; the web client adds one extra flag.
const USER_FEATURES: &str = r#"{"responsive_web_graphql_exclude_directive_enabled":true,"verified_phone_label_enabled":false,"creator_subscriptions_tweet_preview_api_enabled":true,"responsive_web_graphql_timeline_navigation_enabled":true,"responsive_web_graphql_skip_user_profile_image_extensions_enabled":false,"tweetypie_unmention_optimization_enabled":true,"responsive_web_edit_tweet_api_enabled":true,"graphql_is_translatable_rweb_tweet_is_translatable_enabled":true,"view_counts_everywhere_api_enabled":true,"longform_notetweets_consumption_enabled":true,"responsive_web_twitter_article_tweet_consumption_enabled":false,"tweet_awards_web_tipping_enabled":false,"freedom_of_speech_not_reach_fetch_enabled":true,"standardized_nudges_misinfo":true,"tweet_with_visibility_results_prefer_gql_limited_actions_policy_enabled":true,"longform_notetweets_rich_text_read_enabled":true,"longform_notetweets_inline_media_enabled":true,"responsive_web_media_download_video_enabled":false,"responsive_web_enhance_cards_enabled":false,"responsive_web_home_pinned_timelines_enabled":true}"#;

/// JSON-pointer paths from each endpoint's `data` object to its timeline.
const SEARCH_TIMELINE_PATH: &str = "/search_by_raw_query/search_timeline/timeline";
const RETWEETERS_PATH: &str = "/retweeters_timeline/timeline";
const FAVORITERS_PATH: &str = "/favoriters_timeline/timeline";
const FOLLOWING_PATH: &str = "/user/result/timeline/timeline";

static RE_USER_ENTRY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"user-(\d+)").expect("valid user entry-id regex"));

/// One crawler per process: a frozen `endpoint → username → client` map
/// built at startup, shared behind an `Arc` by any number of caller tasks.
pub struct Crawler {
    clients: HashMap<ApiKind, HashMap<String, Arc<EndpointClient>>>,
    endpoint_urls: HashMap<ApiKind, Url>,
}

impl Crawler {
    /// Build the fleet against the production platform hosts.
    pub async fn new(credentials: Vec<Credential>) -> Self {
        Self::with_urls(credentials, PlatformUrls::default()).await
    }

    /// Log in every credential and probe every endpoint, in parallel.
    ///
    /// Accounts that fail to log in, and account/endpoint pairs whose
    /// rate-limit probe fails, are skipped with a warning; the fleet
    /// starts with whatever survives.
    pub async fn with_urls(credentials: Vec<Credential>, urls: PlatformUrls) -> Self {
        let endpoint_urls: HashMap<ApiKind, Url> = endpoints(&urls)
            .into_iter()
            .map(|endpoint| (endpoint.kind, endpoint.url.clone()))
            .collect();

        let mut tasks = JoinSet::new();
        for credential in credentials {
            let urls = urls.clone();
            tasks.spawn(async move { init_account(credential, urls).await });
        }

        let mut clients: HashMap<ApiKind, HashMap<String, Arc<EndpointClient>>> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let Ok(batch) = joined else { continue };
            for (kind, username, client) in batch {
                clients.entry(kind).or_default().insert(username, client);
            }
        }

        Self {
            clients,
            endpoint_urls,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_clients(
        clients: HashMap<ApiKind, HashMap<String, Arc<EndpointClient>>>,
        urls: &PlatformUrls,
    ) -> Self {
        let endpoint_urls = endpoints(urls)
            .into_iter()
            .map(|endpoint| (endpoint.kind, endpoint.url.clone()))
            .collect();
        Self {
            clients,
            endpoint_urls,
        }
    }

    /// Number of live (account, endpoint) clients.
    pub fn client_count(&self) -> usize {
        self.clients.values().map(|accounts| accounts.len()).sum()
    }

    /// Replies to `tweet_id`, one page per call; an empty `next_cursor`
    /// ends the stream.
    pub async fn replies(
        &self,
        tweet_id: &str,
        cursor: &str,
    ) -> Result<(Vec<Reply>, String), CrawlError> {
        let variables = with_cursor(
            json!({
                "rawQuery": format!("filter:replies conversation_id:{tweet_id}"),
                "count": 20,
                "querySource": "tdqt",
                "product": "Latest",
            }),
            cursor,
        );
        let body = self
            .fetch_page(ApiKind::SearchTimeline, variables, TWEET_FEATURES)
            .await?;
        let page = response::parse_page::<TweetItemContent>(&body, SEARCH_TIMELINE_PATH)?;
        ensure_no_api_errors(&page.errors)?;

        let page = response::walk_timeline(&page.timeline, |entry, content| {
            let tweet = &content.tweet_results.result;
            if tweet.legacy.in_reply_to_status_id_str != tweet_id {
                return None;
            }
            Some(Reply {
                tweet_id: tweet_id.to_string(),
                user_id: tweet.core.user_results.result.rest_id.clone(),
                text: tweet.legacy.full_text.clone(),
                normalized_text: normalize_text(&tweet.legacy.full_text, &tweet.legacy.entities.urls),
                created_at: tweet.legacy.created_at,
                hashtags: hashtag_texts(&tweet.legacy, false),
                lowered_hashtags: hashtag_texts(&tweet.legacy, true),
                symbols: symbol_texts(&tweet.legacy, false),
                lowered_symbols: symbol_texts(&tweet.legacy, true),
                sort: entry.sort_index,
            })
        });
        Ok((page.items, page.next_cursor))
    }

    /// Tweets quoting `tweet_id`, one page per call.
    pub async fn quotes(
        &self,
        tweet_id: &str,
        cursor: &str,
    ) -> Result<(Vec<Quote>, String), CrawlError> {
        let variables = with_cursor(
            json!({
                "rawQuery": format!("quoted_tweet_id:{tweet_id}"),
                "count": 20,
                "querySource": "tdqt",
                "product": "Latest",
            }),
            cursor,
        );
        let body = self
            .fetch_page(ApiKind::SearchTimeline, variables, TWEET_FEATURES)
            .await?;
        let page = response::parse_page::<TweetItemContent>(&body, SEARCH_TIMELINE_PATH)?;
        ensure_no_api_errors(&page.errors)?;

        let page = response::walk_timeline(&page.timeline, |entry, content| {
            let tweet = &content.tweet_results.result;
            if tweet.legacy.quoted_status_id_str != tweet_id {
                return None;
            }
            Some(Quote {
                tweet_id: tweet_id.to_string(),
                user_id: tweet.core.user_results.result.rest_id.clone(),
                text: tweet.legacy.full_text.clone(),
                normalized_text: normalize_text(&tweet.legacy.full_text, &tweet.legacy.entities.urls),
                created_at: tweet.legacy.created_at,
                hashtags: hashtag_texts(&tweet.legacy, false),
                lowered_hashtags: hashtag_texts(&tweet.legacy, true),
                symbols: symbol_texts(&tweet.legacy, false),
                lowered_symbols: symbol_texts(&tweet.legacy, true),
                sort: entry.sort_index,
            })
        });
        Ok((page.items, page.next_cursor))
    }

    /// Accounts that retweeted `tweet_id`, one page per call.
    pub async fn retweets(
        &self,
        tweet_id: &str,
        cursor: &str,
    ) -> Result<(Vec<Retweet>, String), CrawlError> {
        let variables = with_cursor(
            json!({
                "tweetId": tweet_id,
                "count": 100,
                "includePromotedContent": true,
            }),
            cursor,
        );
        let body = self
            .fetch_page(ApiKind::Retweeters, variables, TWEET_FEATURES)
            .await?;
        let page = response::parse_page::<UserItemContent>(&body, RETWEETERS_PATH)?;
        ensure_no_api_errors(&page.errors)?;

        let page = response::walk_timeline(&page.timeline, |entry, content| {
            Some(Retweet {
                tweet_id: tweet_id.to_string(),
                user_id: user_id_of(&entry.entry_id, &content.user_results.result.rest_id),
                sort: entry.sort_index,
            })
        });
        Ok((page.items, page.next_cursor))
    }

    /// Accounts that liked `tweet_id`, one page per call.
    pub async fn likes(
        &self,
        tweet_id: &str,
        cursor: &str,
    ) -> Result<(Vec<Like>, String), CrawlError> {
        let variables = with_cursor(
            json!({
                "tweetId": tweet_id,
                "count": 100,
                "includePromotedContent": true,
            }),
            cursor,
        );
        let body = self
            .fetch_page(ApiKind::Favoriters, variables, TWEET_FEATURES)
            .await?;
        let page = response::parse_page::<UserItemContent>(&body, FAVORITERS_PATH)?;
        ensure_no_api_errors(&page.errors)?;

        let page = response::walk_timeline(&page.timeline, |entry, content| {
            Some(Like {
                tweet_id: tweet_id.to_string(),
                user_id: user_id_of(&entry.entry_id, &content.user_results.result.rest_id),
                sort: entry.sort_index,
            })
        });
        Ok((page.items, page.next_cursor))
    }

    /// Accounts that `target_id` follows, one page per call.
    pub async fn following(
        &self,
        target_id: &str,
        cursor: &str,
    ) -> Result<(Vec<Following>, String), CrawlError> {
        let variables = with_cursor(
            json!({
                "userId": target_id,
                "count": 2,
                "includePromotedContent": false,
            }),
            cursor,
        );
        let body = self
            .fetch_page(ApiKind::Following, variables, USER_FEATURES)
            .await?;
        let page = response::parse_page::<UserItemContent>(&body, FOLLOWING_PATH)?;
        ensure_no_api_errors(&page.errors)?;

        let page = response::walk_timeline(&page.timeline, |entry, content| {
            let user = &content.user_results.result;
            Some(Following {
                target_id: target_id.to_string(),
                user_id: user_id_of(&entry.entry_id, &user.rest_id),
                name: user.legacy.name.clone(),
                screen_name: user.legacy.screen_name.clone(),
            })
        });
        Ok((page.items, page.next_cursor))
    }

    /// Engagement counters for `screen_name`'s own statuses, one page per
    /// call.
    pub async fn statuses_by_screen_name(
        &self,
        screen_name: &str,
        cursor: &str,
    ) -> Result<(Vec<StatusStat>, String), CrawlError> {
        let variables = with_cursor(
            json!({
                "rawQuery": format!("(from:{screen_name}) -filter:replies"),
                "count": 20,
                "querySource": "typed_query",
                "product": "Latest",
            }),
            cursor,
        );
        let body = self
            .fetch_page(ApiKind::SearchTimeline, variables, TWEET_FEATURES)
            .await?;
        let page = response::parse_page::<TweetItemContent>(&body, SEARCH_TIMELINE_PATH)?;
        ensure_no_api_errors(&page.errors)?;

        let page = response::walk_timeline(&page.timeline, |_, content| {
            let tweet = &content.tweet_results.result;
            let user = &tweet.core.user_results.result;
            if user.legacy.screen_name != screen_name {
                return None;
            }
            Some(StatusStat {
                user_id: user.rest_id.clone(),
                user_screen_name: user.legacy.screen_name.clone(),
                user_name: user.legacy.name.clone(),
                id: tweet.rest_id.clone(),
                created_at: tweet.legacy.created_at,
                is_quote_status: tweet.legacy.is_quote_status,
                view_count: tweet.views.count,
                favorite_count: tweet.legacy.favorite_count,
                quote_count: tweet.legacy.quote_count,
                reply_count: tweet.legacy.reply_count,
                retweet_count: tweet.legacy.retweet_count,
            })
        });
        Ok((page.items, page.next_cursor))
    }

    /// Build the endpoint request and dispatch it, returning the buffered
    /// body of a 200.
    async fn fetch_page(
        &self,
        kind: ApiKind,
        variables: serde_json::Value,
        features: &str,
    ) -> Result<Vec<u8>, CrawlError> {
        let mut url = self.endpoint_urls[&kind].clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("variables", &variables.to_string())
            .append_pair("features", features);

        let (status, body) = self.dispatch(kind, Request::new(Method::GET, url)).await?;
        if status != StatusCode::OK {
            return Err(CrawlError::UnexpectedStatus(status.as_u16()));
        }
        Ok(body)
    }

    /// Select an available client for `kind` and execute `req` through it.
    ///
    /// The response body is buffered fully into memory: the caller gets the
    /// buffer while a copy goes to accounting on a background task, so the
    /// caller never waits on bookkeeping and never sees a streaming body.
    /// The request itself is never retried.
    async fn dispatch(
        &self,
        kind: ApiKind,
        req: Request,
    ) -> Result<(StatusCode, Vec<u8>), CrawlError> {
        let empty = HashMap::new();
        let clients = self.clients.get(&kind).unwrap_or(&empty);

        let mut order: Vec<&String> = clients.keys().collect();
        order.shuffle(&mut rand::thread_rng());

        let mut req = Some(req);
        let mut earliest_reset = i64::MAX;
        for username in order {
            let client = &clients[username];
            match client.try_acquire() {
                Ok(()) => {}
                Err(Some(retry_at)) => {
                    if retry_at < earliest_reset {
                        earliest_reset = retry_at;
                    }
                    continue;
                }
                Err(None) => continue,
            }

            let req = req.take().expect("request dispatched once");
            let resp = client.session().do_authed(req).await?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let body = resp.bytes().await?.to_vec();

            let accounting = Arc::clone(client);
            let accounting_body = body.clone();
            tokio::spawn(async move {
                accounting.handle_response(status, &headers, &accounting_body);
            });

            return Ok((status, body));
        }

        Err(CrawlError::RateLimited {
            reset: earliest_reset,
        })
    }
}

/// Log in one account and probe every endpoint for it.
async fn init_account(
    credential: Credential,
    urls: PlatformUrls,
) -> Vec<(ApiKind, String, Arc<EndpointClient>)> {
    let username = credential.username.clone();
    let session = match Session::connect(credential, urls.clone()).await {
        Ok(session) => session,
        Err(err) => {
            warn!(
                username = %username,
                error = format!("{err:#}"),
                "skipping account: login failed"
            );
            return Vec::new();
        }
    };

    let mut clients = Vec::new();
    for endpoint in endpoints(&urls) {
        let kind = endpoint.kind;
        let client = EndpointClient::new(session.clone(), endpoint);
        if let Err(err) = client.fetch_limit().await {
            warn!(
                username = %username,
                endpoint = %kind,
                error = format!("{err:#}"),
                "skipping endpoint for account: rate-limit probe failed"
            );
            continue;
        }
        clients.push((kind, username.clone(), client));
    }

    info!(username = %username, endpoints = clients.len(), "account ready");
    clients
}

fn with_cursor(mut variables: serde_json::Value, cursor: &str) -> serde_json::Value {
    if !cursor.is_empty() {
        variables["cursor"] = json!(cursor);
    }
    variables
}

/// The nested user id, falling back to the `user-<id>` entry id when the
/// platform leaves it empty.
fn user_id_of(entry_id: &str, rest_id: &str) -> String {
    if !rest_id.is_empty() {
        return rest_id.to_string();
    }
    RE_USER_ENTRY_ID
        .captures(entry_id)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

fn hashtag_texts(legacy: &TweetLegacy, lowered: bool) -> Vec<String> {
    legacy
        .entities
        .hashtags
        .iter()
        .map(|hashtag| {
            if lowered {
                hashtag.text.to_lowercase()
            } else {
                hashtag.text.clone()
            }
        })
        .collect()
}

fn symbol_texts(legacy: &TweetLegacy, lowered: bool) -> Vec<String> {
    legacy
        .entities
        .symbols
        .iter()
        .map(|symbol| {
            if lowered {
                symbol.text.to_lowercase()
            } else {
                symbol.text.clone()
            }
        })
        .collect()
}

fn ensure_no_api_errors(errors: &[response::ApiError]) -> Result<(), CrawlError> {
    if errors.is_empty() {
        return Ok(());
    }
    let joined = errors
        .iter()
        .map(|error| error.message.as_str())
        .collect::<Vec<_>>()
        .join(";");
    Err(CrawlError::Api(joined))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twitter::Endpoint;
    use chrono::Utc;

    fn unreachable_endpoint(kind: ApiKind) -> Endpoint {
        // Port 9 (discard) is never served; a wrongly selected client
        // would fail the test with a transport error instead of the
        // expected RateLimited.
        Endpoint {
            kind,
            url: Url::parse("http://127.0.0.1:9/graphql").unwrap(),
            call_limit: 50,
        }
    }

    fn cookie_session(username: &str) -> Arc<Session> {
        Session::from_raw_cookies(username, "ct0=x; auth_token=y", PlatformUrls::default())
            .unwrap()
    }

    fn crawler_of(clients: Vec<(&str, Arc<EndpointClient>)>) -> Crawler {
        let mut map: HashMap<ApiKind, HashMap<String, Arc<EndpointClient>>> = HashMap::new();
        for (username, client) in clients {
            map.entry(ApiKind::Following)
                .or_default()
                .insert(username.to_string(), client);
        }
        Crawler::from_clients(map, &PlatformUrls::default())
    }

    fn probe_request() -> Request {
        Request::new(Method::GET, Url::parse("http://127.0.0.1:9/graphql").unwrap())
    }

    #[tokio::test]
    async fn forbidden_clients_are_never_selected() {
        let client = EndpointClient::new(
            cookie_session("acct"),
            unreachable_endpoint(ApiKind::Following),
        );
        client.force_state(0, 50, Utc::now().timestamp() + 100);
        client.force_forbidden();

        let crawler = crawler_of(vec![("acct", client)]);
        let err = crawler
            .dispatch(ApiKind::Following, probe_request())
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::RateLimited { reset: i64::MAX }));
    }

    #[tokio::test]
    async fn disconnected_clients_are_never_selected() {
        let session = cookie_session("acct");
        session.disconnect();
        let client = EndpointClient::new(session, unreachable_endpoint(ApiKind::Following));
        client.force_state(0, 50, Utc::now().timestamp() + 100);

        let crawler = crawler_of(vec![("acct", client)]);
        let err = crawler
            .dispatch(ApiKind::Following, probe_request())
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::RateLimited { reset: i64::MAX }));
    }

    #[tokio::test]
    async fn rate_limit_error_carries_the_minimum_reset() {
        let now = Utc::now().timestamp();

        let later = EndpointClient::new(
            cookie_session("later"),
            unreachable_endpoint(ApiKind::Following),
        );
        later.force_state(5, 5, now + 600);

        let sooner = EndpointClient::new(
            cookie_session("sooner"),
            unreachable_endpoint(ApiKind::Following),
        );
        sooner.force_state(5, 5, now + 120);

        let forbidden = EndpointClient::new(
            cookie_session("forbidden"),
            unreachable_endpoint(ApiKind::Following),
        );
        forbidden.force_forbidden();

        let crawler = crawler_of(vec![
            ("later", later),
            ("sooner", sooner),
            ("forbidden", forbidden),
        ]);
        let err = crawler
            .dispatch(ApiKind::Following, probe_request())
            .await
            .unwrap_err();
        match err {
            CrawlError::RateLimited { reset } => assert_eq!(reset, now + 120),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_endpoint_kind_is_rate_limited_with_no_hint() {
        let crawler = crawler_of(vec![]);
        let err = crawler
            .dispatch(ApiKind::Retweeters, probe_request())
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::RateLimited { reset: i64::MAX }));
    }

    #[test]
    fn user_id_falls_back_to_entry_id() {
        assert_eq!(user_id_of("user-4242", ""), "4242");
        assert_eq!(user_id_of("user-4242", "777"), "777");
        assert_eq!(user_id_of("cursor-bottom-1", ""), "");
    }

    #[test]
    fn cursor_is_only_attached_when_present() {
        let base = json!({"userId": "1"});
        assert_eq!(with_cursor(base.clone(), "").get("cursor"), None);
        assert_eq!(
            with_cursor(base, "abc").get("cursor"),
            Some(&json!("abc"))
        );
    }
}
