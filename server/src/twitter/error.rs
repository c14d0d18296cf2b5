use thiserror::Error;

/// Errors surfaced by the crawl engine to its callers.
///
/// Authorization loss and permanent endpoint refusal are handled inside the
/// fleet (disconnect + background reconnect, sticky forbidden flag) and do
/// not appear here; everything else is returned verbatim without internal
/// retries.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Every client for the endpoint is exhausted or unavailable. `reset`
    /// is the earliest known unix second at which a retry may succeed.
    #[error("rate limited, retry after unix second {reset}")]
    RateLimited { reset: i64 },

    /// The platform answered with a non-200 status.
    #[error("unexpected response code {0}")]
    UnexpectedStatus(u16),

    /// The platform answered 200 but the body carried an `errors` list.
    #[error("server returned errors: {0}")]
    Api(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
