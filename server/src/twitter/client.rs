//! Per-(session, endpoint) rate-limit accounting.
//!
//! An [`EndpointClient`] wraps one [`Session`] for one endpoint: it grants
//! or refuses dispatch slots, folds the platform's rate-limit headers back
//! into its window state, detects fatal account states, and self-heals
//! lost authorization through a background reconnect loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, DATE};
use reqwest::{Method, Request, StatusCode};
use serde::Deserialize;
use tracing::{info, warn};

use super::response::ApiError;
use super::session::Session;
use super::Endpoint;

/// Length of the platform's rate-limit window.
const WINDOW_SECS: i64 = 15 * 60;

/// Reconnect backoff doubles per attempt, capped at 2^10 seconds.
const MAX_BACKOFF_SHIFT: u32 = 10;

pub struct EndpointClient {
    session: Arc<Session>,
    endpoint: Endpoint,
    /// Sticky: the platform permanently refuses this (account, endpoint).
    forbidden: AtomicBool,
    state: Mutex<RateState>,
}

/// Window accounting per the last applied response.
#[derive(Debug, Default, Clone, Copy)]
struct RateState {
    /// Requests granted but not yet accounted.
    pending: i64,
    /// Requests left in the window, per the last response header.
    remaining: i64,
    /// Unix second at which the window expires.
    reset: i64,
}

impl EndpointClient {
    pub fn new(session: Arc<Session>, endpoint: Endpoint) -> Arc<Self> {
        Arc::new(Self {
            session,
            endpoint,
            forbidden: AtomicBool::new(false),
            state: Mutex::new(RateState::default()),
        })
    }

    pub(crate) fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Probe availability and, if granted, reserve one pending slot.
    ///
    /// `Err(None)` means the client cannot serve the endpoint at all right
    /// now (session disconnected or endpoint forbidden); `Err(Some(t))`
    /// means the window is exhausted until unix second `t`. Check and
    /// reservation happen under one lock so concurrent callers cannot
    /// over-grant.
    pub fn try_acquire(&self) -> Result<(), Option<i64>> {
        if !self.session.connected() || self.forbidden.load(Ordering::Relaxed) {
            return Err(None);
        }

        let mut state = self.state.lock().expect("rate state lock");
        let now = Utc::now().timestamp();
        if state.reset < now {
            // The window elapsed and no response of the new window has
            // reported headers yet; cap dispatch at the documented ceiling.
            if state.pending >= self.endpoint.call_limit {
                return Err(Some(now + WINDOW_SECS));
            }
        } else if state.pending >= state.remaining {
            return Err(Some(state.reset));
        }

        state.pending += 1;
        Ok(())
    }

    /// Fold one response back into the window state.
    ///
    /// Responses from a session that is no longer connected, or whose
    /// `Date` predates the last successful login, belong to a dead epoch:
    /// their accounting describes a jar that no longer exists and they are
    /// ignored wholesale.
    pub fn handle_response(self: Arc<Self>, status: StatusCode, headers: &HeaderMap, body: &[u8]) {
        if !self.session.connected() {
            return;
        }
        if response_time(headers) < self.session.last_synced_at() {
            return;
        }

        let mut state = self.state.lock().expect("rate state lock");
        state.pending -= 1;

        if status == StatusCode::UNAUTHORIZED {
            drop(state);
            self.session.disconnect();
            tokio::spawn(self.reconnect());
            return;
        }

        if status == StatusCode::FORBIDDEN {
            self.forbidden.store(true, Ordering::Relaxed);
            return;
        }

        if has_authorization_error(body) {
            drop(state);
            self.session.disconnect();
            tokio::spawn(self.reconnect());
            return;
        }

        let new_remaining = header_i64(headers, "x-rate-limit-remaining");
        let new_reset = header_i64(headers, "x-rate-limit-reset");

        if new_reset == state.reset {
            // Same window: concurrent responses may apply out of order, so
            // remaining must never rise.
            if new_remaining < state.remaining {
                state.remaining = new_remaining;
            }
        } else if new_reset > state.reset {
            state.reset = new_reset;
            state.remaining = new_remaining;
        }
        // new_reset < reset: stale response from an older window.
    }

    /// Background self-heal after an authorization loss.
    ///
    /// Coalesces concurrent triggers: if another task already restored the
    /// session this is a no-op, and sessions without a stored password stay
    /// disconnected. Retries indefinitely otherwise; `forbidden` and
    /// `pending` survive the re-login.
    pub async fn reconnect(self: Arc<Self>) {
        if self.session.connected() {
            return;
        }
        if !self.session.can_reconnect() {
            warn!(
                username = %self.session.username(),
                endpoint = %self.endpoint.kind,
                "session lost authorization but has no credential to reconnect with"
            );
            return;
        }

        let mut attempt = 0u32;
        loop {
            info!(username = %self.session.username(), "trying to reconnect");
            let result = async {
                self.session.login().await?;
                self.fetch_limit().await
            }
            .await;

            match result {
                Ok(()) => {
                    info!(username = %self.session.username(), "reconnected");
                    return;
                }
                Err(err) => {
                    let backoff =
                        Duration::from_secs(1 << attempt.min(MAX_BACKOFF_SHIFT));
                    attempt += 1;
                    warn!(
                        username = %self.session.username(),
                        error = format!("{err:#}"),
                        backoff_secs = backoff.as_secs(),
                        "failed to reconnect"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Probe the endpoint once to learn the current window.
    ///
    /// Both rate-limit headers must parse; a window with an unreadable
    /// reset is a failed probe, never inherited state. A 403 or an
    /// `AuthorizationError` body marks the client forbidden but the probe
    /// itself still succeeds.
    pub async fn fetch_limit(&self) -> Result<()> {
        let req = Request::new(Method::GET, self.endpoint.url.clone());
        let resp = self
            .session
            .do_authed(req)
            .await
            .context("rate-limit probe failed")?;

        let status = resp.status();
        let new_remaining = rate_limit_header(resp.headers(), "x-rate-limit-remaining")?;
        let new_reset = rate_limit_header(resp.headers(), "x-rate-limit-reset")?;

        {
            let mut state = self.state.lock().expect("rate state lock");
            state.remaining = new_remaining;
            state.reset = new_reset;
        }

        match status {
            StatusCode::OK => {
                let body = resp
                    .bytes()
                    .await
                    .context("failed to read rate-limit probe body")?;
                if has_authorization_error(&body) {
                    self.forbidden.store(true, Ordering::Relaxed);
                }
                Ok(())
            }
            StatusCode::FORBIDDEN => {
                self.forbidden.store(true, Ordering::Relaxed);
                Ok(())
            }
            other => bail!("unexpected response code {}", other.as_u16()),
        }
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, pending: i64, remaining: i64, reset: i64) {
        let mut state = self.state.lock().expect("rate state lock");
        state.pending = pending;
        state.remaining = remaining;
        state.reset = reset;
    }

    #[cfg(test)]
    pub(crate) fn force_forbidden(&self) {
        self.forbidden.store(true, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn state_snapshot(&self) -> (i64, i64, i64) {
        let state = self.state.lock().expect("rate state lock");
        (state.pending, state.remaining, state.reset)
    }
}

/// Timestamp of the response per its `Date` header; missing or unparsable
/// dates count as the epoch (and thus fail the freshness check once a
/// login has completed).
fn response_time(headers: &HeaderMap) -> DateTime<Utc> {
    headers
        .get(DATE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
        .map(|time| time.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn header_i64(headers: &HeaderMap, name: &str) -> i64 {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(0)
}

fn rate_limit_header(headers: &HeaderMap, name: &str) -> Result<i64> {
    let value = headers
        .get(name)
        .with_context(|| format!("missing {name} header"))?
        .to_str()
        .with_context(|| format!("unreadable {name} header"))?;
    value
        .parse::<i64>()
        .with_context(|| format!("cannot parse {name} header value {value:?}"))
}

/// The platform reports some authorization failures as a 200 with an
/// `errors` list instead of a status code.
fn has_authorization_error(body: &[u8]) -> bool {
    #[derive(Deserialize)]
    struct ErrorsOnly {
        #[serde(default)]
        errors: Vec<ApiError>,
    }

    match serde_json::from_slice::<ErrorsOnly>(body) {
        Ok(parsed) => parsed
            .errors
            .iter()
            .any(|error| error.name == "AuthorizationError"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twitter::{ApiKind, PlatformUrls};
    use reqwest::header::HeaderValue;
    use reqwest::Url;

    fn test_session() -> Arc<Session> {
        Session::from_raw_cookies(
            "tester",
            "ct0=csrf; auth_token=tok",
            PlatformUrls::default(),
        )
        .unwrap()
    }

    fn test_client(call_limit: i64) -> Arc<EndpointClient> {
        test_client_with_session(test_session(), call_limit)
    }

    fn test_client_with_session(session: Arc<Session>, call_limit: i64) -> Arc<EndpointClient> {
        let endpoint = Endpoint {
            kind: ApiKind::Following,
            url: Url::parse("https://twitter.com/i/api/graphql/x/Following").unwrap(),
            call_limit,
        };
        EndpointClient::new(session, endpoint)
    }

    fn headers_at(date: DateTime<Utc>, remaining: i64, reset: i64) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(DATE, HeaderValue::from_str(&date.to_rfc2822()).unwrap());
        headers.insert(
            "x-rate-limit-remaining",
            HeaderValue::from_str(&remaining.to_string()).unwrap(),
        );
        headers.insert(
            "x-rate-limit-reset",
            HeaderValue::from_str(&reset.to_string()).unwrap(),
        );
        headers
    }

    #[test]
    fn grant_increments_and_response_decrements_pending() {
        let client = test_client(50);
        let reset = Utc::now().timestamp() + 100;
        client.force_state(0, 10, reset);

        client.try_acquire().unwrap();
        assert_eq!(client.state_snapshot(), (1, 10, reset));

        client.clone().handle_response(StatusCode::OK, &headers_at(Utc::now(), 9, reset), b"{}");
        assert_eq!(client.state_snapshot(), (0, 9, reset));
    }

    #[test]
    fn unknown_window_is_capped_by_call_limit() {
        let client = test_client(2);

        client.try_acquire().unwrap();
        client.try_acquire().unwrap();

        let now = Utc::now().timestamp();
        let retry_at = client.try_acquire().unwrap_err().unwrap();
        assert!(retry_at >= now + WINDOW_SECS - 1);
        assert!(retry_at <= now + WINDOW_SECS + 1);
        assert_eq!(client.state_snapshot().0, 2);
    }

    #[test]
    fn exhausted_window_reports_its_reset() {
        let client = test_client(50);
        let reset = Utc::now().timestamp() + 100;
        client.force_state(0, 1, reset);

        client.try_acquire().unwrap();
        assert_eq!(client.try_acquire().unwrap_err(), Some(reset));
    }

    #[test]
    fn window_roll_adopts_both_values() {
        let client = test_client(50);
        let reset = Utc::now().timestamp() + 100;
        client.force_state(2, 10, reset);

        client.clone().handle_response(StatusCode::OK, &headers_at(Utc::now(), 48, reset), b"{}");
        client.clone().handle_response(
            StatusCode::OK,
            &headers_at(Utc::now(), 50, reset + 900),
            b"{}",
        );

        // Not the min: the rolled window starts from the newer pair.
        assert_eq!(client.state_snapshot(), (0, 50, reset + 900));
    }

    #[test]
    fn out_of_order_responses_within_a_window_take_the_min() {
        let client = test_client(50);
        let reset = Utc::now().timestamp() + 100;
        client.force_state(2, 50, reset);

        client.clone().handle_response(StatusCode::OK, &headers_at(Utc::now(), 48, reset), b"{}");
        client.clone().handle_response(StatusCode::OK, &headers_at(Utc::now(), 49, reset), b"{}");

        assert_eq!(client.state_snapshot(), (0, 48, reset));
    }

    #[test]
    fn stale_window_response_is_discarded() {
        let client = test_client(50);
        let reset = Utc::now().timestamp() + 100;
        client.force_state(1, 10, reset);

        client.clone().handle_response(
            StatusCode::OK,
            &headers_at(Utc::now(), 99, reset - 900),
            b"{}",
        );

        // pending is still accounted, the header pair is not.
        assert_eq!(client.state_snapshot(), (0, 10, reset));
    }

    #[test]
    fn responses_from_a_previous_epoch_change_nothing() {
        let session = test_session();
        let now = Utc::now();
        session.force_liveness(true, now);
        let client = test_client_with_session(session, 50);
        let reset = now.timestamp() + 100;
        client.force_state(1, 10, reset);

        client.clone().handle_response(
            StatusCode::OK,
            &headers_at(now - chrono::Duration::seconds(10), 3, reset),
            b"{}",
        );

        assert_eq!(client.state_snapshot(), (1, 10, reset));
    }

    #[test]
    fn responses_for_a_disconnected_session_change_nothing() {
        let client = test_client(50);
        let reset = Utc::now().timestamp() + 100;
        client.force_state(1, 10, reset);
        client.session().disconnect();

        client.clone().handle_response(StatusCode::OK, &headers_at(Utc::now(), 3, reset), b"{}");

        assert_eq!(client.state_snapshot(), (1, 10, reset));
    }

    #[tokio::test]
    async fn unauthorized_disconnects_the_session() {
        let client = test_client(50);
        let reset = Utc::now().timestamp() + 100;
        client.force_state(1, 10, reset);

        client.clone().handle_response(
            StatusCode::UNAUTHORIZED,
            &headers_at(Utc::now(), 0, reset),
            b"",
        );

        assert!(!client.session().connected());
        assert_eq!(client.state_snapshot().0, 0);
        // The spawned reconnect is a no-op: cookie sessions cannot re-login.
        tokio::task::yield_now().await;
        assert!(!client.session().connected());
    }

    #[tokio::test]
    async fn authorization_error_body_counts_as_unauthorized() {
        let client = test_client(50);
        let reset = Utc::now().timestamp() + 100;
        client.force_state(1, 10, reset);

        client.clone().handle_response(
            StatusCode::OK,
            &headers_at(Utc::now(), 9, reset),
            br#"{"errors":[{"message":"denied","name":"AuthorizationError"}]}"#,
        );

        assert!(!client.session().connected());
        // Header accounting is skipped for authorization failures.
        assert_eq!(client.state_snapshot(), (0, 10, reset));
    }

    #[test]
    fn forbidden_is_sticky_and_blocks_acquisition() {
        let client = test_client(50);
        let reset = Utc::now().timestamp() + 100;
        client.force_state(1, 10, reset);

        client.clone().handle_response(StatusCode::FORBIDDEN, &headers_at(Utc::now(), 9, reset), b"");

        assert_eq!(client.try_acquire().unwrap_err(), None);
        // A later healthy response does not clear it.
        client.force_state(1, 10, reset);
        client.clone().handle_response(StatusCode::OK, &headers_at(Utc::now(), 9, reset), b"{}");
        assert_eq!(client.try_acquire().unwrap_err(), None);
    }

    #[test]
    fn disconnected_session_blocks_acquisition() {
        let client = test_client(50);
        client.force_state(0, 10, Utc::now().timestamp() + 100);
        client.session().disconnect();

        assert_eq!(client.try_acquire().unwrap_err(), None);
    }

    #[test]
    fn pending_never_observably_negative_under_interleaving() {
        let client = test_client(50);
        let reset = Utc::now().timestamp() + 100;
        client.force_state(0, 40, reset);

        // Interleave grants and applications in every prefix order a single
        // client can produce: pending stays non-negative throughout.
        for round in 0..10 {
            client.try_acquire().unwrap();
            assert!(client.state_snapshot().0 >= 0);
            client.try_acquire().unwrap();
            assert!(client.state_snapshot().0 >= 0);
            client.clone().handle_response(
                StatusCode::OK,
                &headers_at(Utc::now(), 40 - round, reset),
                b"{}",
            );
            assert!(client.state_snapshot().0 >= 0);
            client.clone().handle_response(
                StatusCode::OK,
                &headers_at(Utc::now(), 40 - round, reset),
                b"{}",
            );
            assert!(client.state_snapshot().0 >= 0);
        }
        assert_eq!(client.state_snapshot().0, 0);
    }
}
