//! Session fleet and dispatch engine for the platform's internal GraphQL
//! surface.
//!
//! Three layers, leaves first: [`session::Session`] owns one credential's
//! cookie jar and login flow; [`client::EndpointClient`] wraps a session
//! with per-endpoint rate-limit accounting; [`crawler::Crawler`] maps each
//! logical request onto an available client.

use reqwest::Url;

pub mod client;
pub mod crawler;
pub mod error;
pub mod response;
pub mod session;
pub mod types;

pub use crawler::Crawler;
pub use error::CrawlError;
pub use session::Session;
pub use types::{Credential, Following, Like, Quote, Reply, Retweet, StatusStat};

/// The GraphQL endpoints the fleet multiplexes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiKind {
    SearchTimeline,
    Retweeters,
    Favoriters,
    Following,
}

impl ApiKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ApiKind::SearchTimeline => "search-timeline",
            ApiKind::Retweeters => "retweeters",
            ApiKind::Favoriters => "favoriters",
            ApiKind::Following => "following",
        }
    }
}

impl std::fmt::Display for ApiKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base URLs of the platform's web and api hosts.
///
/// Injectable so tests can point the whole fleet at a local mock; there is
/// no runtime configuration for this.
#[derive(Debug, Clone)]
pub struct PlatformUrls {
    pub web: Url,
    pub api: Url,
}

impl Default for PlatformUrls {
    fn default() -> Self {
        Self {
            web: Url::parse("https://twitter.com").expect("valid platform url"),
            api: Url::parse("https://api.twitter.com").expect("valid platform url"),
        }
    }
}

impl PlatformUrls {
    /// Point both hosts at one base, for tests that mock the platform.
    pub fn single_host(base: &str) -> anyhow::Result<Self> {
        let url = Url::parse(base)?;
        Ok(Self {
            web: url.clone(),
            api: url,
        })
    }
}

/// One GraphQL endpoint resolved against a web base: the full request
/// template (with the web client's default query) and the documented
/// per-15-minute ceiling used before rate-limit headers are known.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub kind: ApiKind,
    pub url: Url,
    pub call_limit: i64,
}

struct EndpointTemplate {
    kind: ApiKind,
    path: &'static str,
    call_limit: i64,
}

const ENDPOINT_TEMPLATES: [EndpointTemplate; 4] = [
    EndpointTemplate {
        kind: ApiKind::SearchTimeline,
        path: "/i/api/graphql/tOUz374Df84NaVVr3M1p6g/SearchTimeline?variables=%7B%22rawQuery%22%3A%22quoted_tweet_id%3A1701892872574996627%22%2C%22count%22%3A20%2C%22querySource%22%3A%22tdqt%22%2C%22product%22%3A%22Top%22%7D&features=%7B%22responsive_web_graphql_exclude_directive_enabled%22%3Atrue%2C%22verified_phone_label_enabled%22%3Afalse%2C%22responsive_web_home_pinned_timelines_enabled%22%3Atrue%2C%22creator_subscriptions_tweet_preview_api_enabled%22%3Atrue%2C%22responsive_web_graphql_timeline_navigation_enabled%22%3Atrue%2C%22responsive_web_graphql_skip_user_profile_image_extensions_enabled%22%3Afalse%2C%22c9s_tweet_anatomy_moderator_badge_enabled%22%3Atrue%2C%22tweetypie_unmention_optimization_enabled%22%3Atrue%2C%22responsive_web_edit_tweet_api_enabled%22%3Atrue%2C%22graphql_is_translatable_rweb_tweet_is_translatable_enabled%22%3Atrue%2C%22view_counts_everywhere_api_enabled%22%3Atrue%2C%22longform_notetweets_consumption_enabled%22%3Atrue%2C%22responsive_web_twitter_article_tweet_consumption_enabled%22%3Afalse%2C%22tweet_awards_web_tipping_enabled%22%3Afalse%2C%22freedom_of_speech_not_reach_fetch_enabled%22%3Atrue%2C%22standardized_nudges_misinfo%22%3Atrue%2C%22tweet_with_visibility_results_prefer_gql_limited_actions_policy_enabled%22%3Atrue%2C%22longform_notetweets_rich_text_read_enabled%22%3Atrue%2C%22longform_notetweets_inline_media_enabled%22%3Atrue%2C%22responsive_web_media_download_video_enabled%22%3Afalse%2C%22responsive_web_enhance_cards_enabled%22%3Afalse%7D",
        call_limit: 50,
    },
    EndpointTemplate {
        kind: ApiKind::Retweeters,
        path: "/i/api/graphql/FnXqVNJSKmqudpmIIEeUCQ/Retweeters?variables=%7B%22tweetId%22%3A%221701892872574996627%22%2C%22count%22%3A20%2C%22includePromotedContent%22%3Atrue%7D&features=%7B%22responsive_web_graphql_exclude_directive_enabled%22%3Atrue%2C%22verified_phone_label_enabled%22%3Afalse%2C%22responsive_web_home_pinned_timelines_enabled%22%3Atrue%2C%22creator_subscriptions_tweet_preview_api_enabled%22%3Atrue%2C%22responsive_web_graphql_timeline_navigation_enabled%22%3Atrue%2C%22responsive_web_graphql_skip_user_profile_image_extensions_enabled%22%3Afalse%2C%22c9s_tweet_anatomy_moderator_badge_enabled%22%3Atrue%2C%22tweetypie_unmention_optimization_enabled%22%3Atrue%2C%22responsive_web_edit_tweet_api_enabled%22%3Atrue%2C%22graphql_is_translatable_rweb_tweet_is_translatable_enabled%22%3Atrue%2C%22view_counts_everywhere_api_enabled%22%3Atrue%2C%22longform_notetweets_consumption_enabled%22%3Atrue%2C%22responsive_web_twitter_article_tweet_consumption_enabled%22%3Afalse%2C%22tweet_awards_web_tipping_enabled%22%3Afalse%2C%22freedom_of_speech_not_reach_fetch_enabled%22%3Atrue%2C%22standardized_nudges_misinfo%22%3Atrue%2C%22tweet_with_visibility_results_prefer_gql_limited_actions_policy_enabled%22%3Atrue%2C%22longform_notetweets_rich_text_read_enabled%22%3Atrue%2C%22longform_notetweets_inline_media_enabled%22%3Atrue%2C%22responsive_web_media_download_video_enabled%22%3Afalse%2C%22responsive_web_enhance_cards_enabled%22%3Afalse%7D",
        call_limit: 500,
    },
    EndpointTemplate {
        kind: ApiKind::Favoriters,
        path: "/i/api/graphql/zXD9lMy1-V_N1OcON9JtEQ/Favoriters?variables=%7B%22tweetId%22%3A%221701892872574996627%22%2C%22count%22%3A20%2C%22includePromotedContent%22%3Atrue%7D&features=%7B%22responsive_web_graphql_exclude_directive_enabled%22%3Atrue%2C%22verified_phone_label_enabled%22%3Afalse%2C%22responsive_web_home_pinned_timelines_enabled%22%3Atrue%2C%22creator_subscriptions_tweet_preview_api_enabled%22%3Atrue%2C%22responsive_web_graphql_timeline_navigation_enabled%22%3Atrue%2C%22responsive_web_graphql_skip_user_profile_image_extensions_enabled%22%3Afalse%2C%22c9s_tweet_anatomy_moderator_badge_enabled%22%3Atrue%2C%22tweetypie_unmention_optimization_enabled%22%3Atrue%2C%22responsive_web_edit_tweet_api_enabled%22%3Atrue%2C%22graphql_is_translatable_rweb_tweet_is_translatable_enabled%22%3Atrue%2C%22view_counts_everywhere_api_enabled%22%3Atrue%2C%22longform_notetweets_consumption_enabled%22%3Atrue%2C%22responsive_web_twitter_article_tweet_consumption_enabled%22%3Afalse%2C%22tweet_awards_web_tipping_enabled%22%3Afalse%2C%22freedom_of_speech_not_reach_fetch_enabled%22%3Atrue%2C%22standardized_nudges_misinfo%22%3Atrue%2C%22tweet_with_visibility_results_prefer_gql_limited_actions_policy_enabled%22%3Atrue%2C%22longform_notetweets_rich_text_read_enabled%22%3Atrue%2C%22longform_notetweets_inline_media_enabled%22%3Atrue%2C%22responsive_web_media_download_video_enabled%22%3Afalse%2C%22responsive_web_enhance_cards_enabled%22%3Afalse%7D",
        call_limit: 500,
    },
    EndpointTemplate {
        kind: ApiKind::Following,
        path: "/i/api/graphql/OueaMJOJ0r0lmGTxl2V4Mw/Following?variables=%7B%22userId%22%3A%221415522287126671363%22%2C%22count%22%3A20%2C%22includePromotedContent%22%3Afalse%7D&features=%7B%22responsive_web_graphql_exclude_directive_enabled%22%3Atrue%2C%22verified_phone_label_enabled%22%3Afalse%2C%22responsive_web_home_pinned_timelines_enabled%22%3Atrue%2C%22creator_subscriptions_tweet_preview_api_enabled%22%3Atrue%2C%22responsive_web_graphql_timeline_navigation_enabled%22%3Atrue%2C%22responsive_web_graphql_skip_user_profile_image_extensions_enabled%22%3Afalse%2C%22c9s_tweet_anatomy_moderator_badge_enabled%22%3Atrue%2C%22tweetypie_unmention_optimization_enabled%22%3Atrue%2C%22responsive_web_edit_tweet_api_enabled%22%3Atrue%2C%22graphql_is_translatable_rweb_tweet_is_translatable_enabled%22%3Atrue%2C%22view_counts_everywhere_api_enabled%22%3Atrue%2C%22longform_notetweets_consumption_enabled%22%3Atrue%2C%22responsive_web_twitter_article_tweet_consumption_enabled%22%3Afalse%2C%22tweet_awards_web_tipping_enabled%22%3Afalse%2C%22freedom_of_speech_not_reach_fetch_enabled%22%3Atrue%2C%22standardized_nudges_misinfo%22%3Atrue%2C%22tweet_with_visibility_results_prefer_gql_limited_actions_policy_enabled%22%3Atrue%2C%22longform_notetweets_rich_text_read_enabled%22%3Atrue%2C%22longform_notetweets_inline_media_enabled%22%3Atrue%2C%22responsive_web_media_download_video_enabled%22%3Afalse%2C%22responsive_web_enhance_cards_enabled%22%3Afalse%7D",
        call_limit: 500,
    },
];

/// Resolve every endpoint template against `urls`.
pub(crate) fn endpoints(urls: &PlatformUrls) -> Vec<Endpoint> {
    ENDPOINT_TEMPLATES
        .iter()
        .map(|template| Endpoint {
            kind: template.kind,
            url: urls
                .web
                .join(template.path)
                .expect("valid endpoint template"),
            call_limit: template.call_limit,
        })
        .collect()
}
