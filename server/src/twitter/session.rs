//! One authenticated platform session per credential.
//!
//! A session owns a cookie jar and the HTTP client bound to it. The jar is
//! guarded by a read/write lock: request decoration takes the read side,
//! a (re-)login swaps the whole jar under the write side, so in-flight
//! requests always observe a consistent jar and at most one login flow
//! runs at a time. The liveness pair (`connected`, `last_synced_at`) lives
//! behind a separate short-held lock so observing liveness never waits on
//! an in-progress login.

use std::sync::{Arc, LazyLock};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Body, Method, Request, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::warn;

use super::types::Credential;
use super::PlatformUrls;

/// Public bearer token the platform's own web client ships with.
const BEARER_AUTHORIZATION: &str = "Bearer AAAAAAAAAAAAAAAAAAAAANRILgAAAAAAnNwIzUejRCOuH5E6I8xnZz4puTs%3D1Zv7ttfk8LF81IUq16cHjhLTvJu4FA33AGWWjCpTnA";

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/104.0.0.0 Safari/537.36";

static RE_GUEST_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"gt=(\d+)").expect("valid guest-token regex"));
static RE_TWID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"u=(\d+)").expect("valid twid regex"));

/// An authenticated impersonation of one platform account.
pub struct Session {
    credential: Credential,
    urls: PlatformUrls,
    http: RwLock<AuthedHttp>,
    liveness: std::sync::RwLock<Liveness>,
}

struct AuthedHttp {
    client: reqwest::Client,
    jar: Arc<Jar>,
}

#[derive(Clone, Copy)]
struct Liveness {
    connected: bool,
    last_synced_at: DateTime<Utc>,
}

/// Fresh jar + client pair. No timeout is set: callers bound requests by
/// dropping the future.
fn fresh_http() -> Result<AuthedHttp> {
    let jar = Arc::new(Jar::default());
    let client = reqwest::Client::builder()
        .cookie_provider(jar.clone())
        .build()
        .context("failed to build http client")?;
    Ok(AuthedHttp { client, jar })
}

impl Session {
    fn with_liveness(
        credential: Credential,
        urls: PlatformUrls,
        http: AuthedHttp,
        connected: bool,
    ) -> Self {
        Self {
            credential,
            urls,
            http: RwLock::new(http),
            liveness: std::sync::RwLock::new(Liveness {
                connected,
                last_synced_at: DateTime::UNIX_EPOCH,
            }),
        }
    }

    /// Create a session for `credential` and run the login flow once.
    pub async fn connect(credential: Credential, urls: PlatformUrls) -> Result<Arc<Self>> {
        let session = Arc::new(Self::with_liveness(credential, urls, fresh_http()?, false));
        session.login().await?;
        Ok(session)
    }

    /// Build an already-connected session from a raw `Cookie` header value.
    ///
    /// Cookie-based sessions carry no password and therefore cannot
    /// re-login once the platform invalidates them.
    pub fn from_raw_cookies(username: &str, raw_cookies: &str, urls: PlatformUrls) -> Result<Arc<Self>> {
        let http = fresh_http()?;
        for cookie in raw_cookies.split(';') {
            let cookie = cookie.trim();
            if cookie.is_empty() {
                continue;
            }
            let cookie = format!("{cookie}; Path=/");
            http.jar.add_cookie_str(&cookie, &urls.web);
            http.jar.add_cookie_str(&cookie, &urls.api);
        }

        let credential = Credential {
            username: username.to_string(),
            password: String::new(),
        };
        Ok(Arc::new(Self::with_liveness(credential, urls, http, true)))
    }

    pub fn username(&self) -> &str {
        &self.credential.username
    }

    /// A session without a stored password cannot run the login flow again.
    pub fn can_reconnect(&self) -> bool {
        !self.credential.password.is_empty()
    }

    pub fn connected(&self) -> bool {
        self.liveness.read().expect("liveness lock").connected
    }

    /// Moment the most recent successful login finished. Responses dated
    /// earlier belong to a previous login epoch.
    pub fn last_synced_at(&self) -> DateTime<Utc> {
        self.liveness.read().expect("liveness lock").last_synced_at
    }

    pub fn disconnect(&self) {
        self.liveness.write().expect("liveness lock").connected = false;
    }

    #[cfg(test)]
    pub(crate) fn force_liveness(&self, connected: bool, last_synced_at: DateTime<Utc>) {
        let mut liveness = self.liveness.write().expect("liveness lock");
        liveness.connected = connected;
        liveness.last_synced_at = last_synced_at;
    }

    /// Execute `req` with the session's authenticated decoration.
    ///
    /// Holds the jar read lock across the round trip, so a concurrent
    /// re-login waits for in-flight requests instead of swapping the jar
    /// out from under them.
    pub async fn do_authed(&self, req: Request) -> reqwest::Result<Response> {
        let http = self.http.read().await;
        decorate_and_send(&http, req).await
    }

    /// Run the full onboarding login flow, replacing the cookie jar.
    ///
    /// Fails fatally when no password is stored; every other failure is
    /// transient and left to the caller (the reconnect loop retries with
    /// backoff). `connected` drops before the jar swap and rises, together
    /// with the `last_synced_at` stamp, only after every step succeeded.
    pub async fn login(&self) -> Result<()> {
        let mut http = self.http.write().await;

        if self.credential.password.is_empty() {
            bail!(
                "failed to login ({}): missing credential",
                self.credential.username
            );
        }

        self.liveness.write().expect("liveness lock").connected = false;
        *http = fresh_http()?;

        self.init_guest_token(&http).await?;

        let flow_token = self
            .onboarding_task(&http, None, flow_start_input())
            .await
            .context("failed to start login flow")?;

        let flow_token = self
            .onboarding_task(
                &http,
                Some(&flow_token),
                json!([{
                    "subtask_id": "LoginJsInstrumentationSubtask",
                    "js_instrumentation": {"response": "{}", "link": "next_link"},
                }]),
            )
            .await
            .context("LoginJsInstrumentationSubtask failed")?;

        let flow_token = self
            .onboarding_task(
                &http,
                Some(&flow_token),
                json!([{
                    "subtask_id": "LoginEnterUserIdentifierSSO",
                    "settings_list": {
                        "setting_responses": [{
                            "key": "user_identifier",
                            "response_data": {"text_data": {"result": self.credential.username}},
                        }],
                        "link": "next_link",
                    },
                }]),
            )
            .await
            .context("LoginEnterUserIdentifierSSO failed")?;

        let flow_token = self
            .onboarding_task(
                &http,
                Some(&flow_token),
                json!([{
                    "subtask_id": "LoginEnterPassword",
                    "enter_password": {"password": self.credential.password, "link": "next_link"},
                }]),
            )
            .await
            .context("LoginEnterPassword failed")?;

        let _ = self
            .onboarding_task(
                &http,
                Some(&flow_token),
                json!([{
                    "subtask_id": "AccountDuplicationCheck",
                    "check_logged_in_account": {"link": "AccountDuplicationCheck_false"},
                }]),
            )
            .await
            .context("AccountDuplicationCheck failed")?;

        if let Err(err) = self.ensure_search_safety(&http).await {
            warn!(
                username = %self.credential.username,
                error = format!("{err:#}"),
                "cannot enable search safety, however it is enabled by default anyway"
            );
        }

        let mut liveness = self.liveness.write().expect("liveness lock");
        liveness.connected = true;
        // The epoch check compares this against `Date` headers, which only
        // carry whole seconds; a sub-second stamp would discard responses
        // from the login second itself.
        let now = Utc::now();
        liveness.last_synced_at = DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now);

        Ok(())
    }

    /// Acquire a guest token: scrape the landing page, falling back to the
    /// guest-activation endpoint. A combined failure reports both errors.
    async fn init_guest_token(&self, http: &AuthedHttp) -> Result<()> {
        let scrape_err = match self.guest_token_from_landing_page(http).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        match self.guest_token_from_activation(http).await {
            Ok(()) => Ok(()),
            Err(activate_err) => {
                bail!("failed to init guest token: {scrape_err:#}; {activate_err:#}")
            }
        }
    }

    async fn guest_token_from_landing_page(&self, http: &AuthedHttp) -> Result<()> {
        let resp = http
            .client
            .get(self.urls.web.clone())
            .send()
            .await
            .context("landing page request failed")?;
        if resp.status() != StatusCode::OK {
            bail!("unexpected response code {}", resp.status().as_u16());
        }

        let body = resp.text().await.context("failed to read landing page")?;
        let token = RE_GUEST_TOKEN
            .captures(&body)
            .and_then(|captures| captures.get(1))
            .context("cannot extract guest token from landing page")?;

        self.store_guest_token(http, token.as_str());
        Ok(())
    }

    async fn guest_token_from_activation(&self, http: &AuthedHttp) -> Result<()> {
        let url = self
            .urls
            .api
            .join("/1.1/guest/activate.json")
            .context("invalid activation url")?;
        let resp = http
            .client
            .post(url)
            .header(CONTENT_TYPE, "x-www-form-urlencoded")
            .header(AUTHORIZATION, BEARER_AUTHORIZATION)
            .send()
            .await
            .context("guest activation request failed")?;
        if resp.status() != StatusCode::OK {
            bail!("unexpected response code {}", resp.status().as_u16());
        }

        #[derive(Deserialize)]
        struct Activation {
            guest_token: String,
        }
        let activation: Activation = resp
            .json()
            .await
            .context("failed to parse guest activation response")?;

        self.store_guest_token(http, &activation.guest_token);
        Ok(())
    }

    /// The guest token has to reach both the web and the api hosts.
    fn store_guest_token(&self, http: &AuthedHttp, token: &str) {
        for base in [&self.urls.web, &self.urls.api] {
            let secure = if base.scheme() == "https" { "; Secure" } else { "" };
            let cookie = format!("gt={token}; Path=/; Max-Age=10800{secure}");
            http.jar.add_cookie_str(&cookie, base);
        }
    }

    /// POST one onboarding step and return the next flow token.
    ///
    /// `flow_token` is `None` for the flow-start call, which targets the
    /// `flow_name=login` variant and sends the flow bootstrap payload
    /// instead of subtask inputs.
    async fn onboarding_task(
        &self,
        http: &AuthedHttp,
        flow_token: Option<&str>,
        input: serde_json::Value,
    ) -> Result<String> {
        let path = match flow_token {
            None => "/1.1/onboarding/task.json?flow_name=login",
            Some(_) => "/1.1/onboarding/task.json",
        };
        let url = self.urls.api.join(path).context("invalid onboarding url")?;
        let guest_token = cookie_value(&http.jar, &url, "gt");

        let body = match flow_token {
            None => input,
            Some(token) => json!({"flow_token": token, "subtask_inputs": input}),
        };

        let mut req = Request::new(Method::POST, url);
        let headers = req.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static(BEARER_AUTHORIZATION));
        if let Some(token) = guest_token {
            if let Ok(value) = HeaderValue::from_str(&token) {
                headers.insert("x-guest-token", value);
            }
        }
        *req.body_mut() = Some(Body::from(serde_json::to_vec(&body)?));

        let resp = http
            .client
            .execute(req)
            .await
            .context("onboarding request failed")?;
        if resp.status() != StatusCode::OK {
            bail!("unexpected response code {}", resp.status().as_u16());
        }

        #[derive(Deserialize)]
        struct FlowResponse {
            #[serde(default)]
            flow_token: String,
        }
        let flow: FlowResponse = resp
            .json()
            .await
            .context("failed to parse onboarding response")?;
        Ok(flow.flow_token)
    }

    /// Best-effort search-safety opt-in; the account id comes from the
    /// `twid` cookie the password step leaves behind.
    async fn ensure_search_safety(&self, http: &AuthedHttp) -> Result<()> {
        let twid = cookie_value(&http.jar, &self.urls.web, "twid")
            .and_then(|value| {
                RE_TWID
                    .captures(&value)
                    .and_then(|captures| captures.get(1))
                    .map(|m| m.as_str().to_string())
            })
            .context("failed to extract twid from cookies")?;

        let url = self
            .urls
            .web
            .join(&format!(
                "/i/api/1.1/strato/column/User/{twid}/search/searchSafety"
            ))
            .context("invalid search safety url")?;

        let mut req = Request::new(Method::POST, url);
        if let Some(guest_token) = cookie_value(&http.jar, req.url(), "gt") {
            if let Ok(value) = HeaderValue::from_str(&guest_token) {
                req.headers_mut().insert("x-guest-token", value);
            }
        }
        *req.body_mut() = Some(Body::from(serde_json::to_vec(&json!({
            "optInFiltering": true,
            "optInBlocking": true,
        }))?));

        let resp = decorate_and_send(http, req)
            .await
            .context("search safety request failed")?;
        if resp.status() != StatusCode::OK {
            bail!("unexpected response code {}", resp.status().as_u16());
        }
        Ok(())
    }
}

/// Decorate `req` like the platform's web client would and execute it:
/// bearer token, browser user-agent, plus the CSRF and auth-type headers
/// derived from the jar's `ct0` / `auth_token` cookies.
async fn decorate_and_send(http: &AuthedHttp, mut req: Request) -> reqwest::Result<Response> {
    let url = req.url().clone();
    let headers = req.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert("x-twitter-active-user", HeaderValue::from_static("yes"));
    headers.insert(AUTHORIZATION, HeaderValue::from_static(BEARER_AUTHORIZATION));

    if let Some(csrf) = cookie_value(&http.jar, &url, "ct0") {
        if let Ok(value) = HeaderValue::from_str(&csrf) {
            headers.insert("x-csrf-token", value);
        }
    }
    if cookie_value(&http.jar, &url, "auth_token").is_some() {
        headers.insert(
            "x-twitter-auth-type",
            HeaderValue::from_static("OAuth2Session"),
        );
    }

    http.client.execute(req).await
}

/// Read a single cookie's value for `url` out of the jar.
fn cookie_value(jar: &Jar, url: &Url, name: &str) -> Option<String> {
    let header = jar.cookies(url)?;
    let header = header.to_str().ok()?;
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// Flow bootstrap payload the web client sends when opening the login flow.
fn flow_start_input() -> serde_json::Value {
    json!({
        "input_flow_data": {
            "flow_context": {
                "debug_overrides": {},
                "start_location": {"location": "unknown"},
            },
        },
        "subtask_versions": {
            "action_list": 2,
            "alert_dialog": 1,
            "app_download_cta": 1,
            "check_logged_in_account": 1,
            "choice_selection": 3,
            "contacts_live_sync_permission_prompt": 0,
            "cta": 7,
            "email_verification": 2,
            "end_flow": 1,
            "enter_date": 1,
            "enter_email": 2,
            "enter_password": 5,
            "enter_phone": 2,
            "enter_recaptcha": 1,
            "enter_text": 5,
            "enter_username": 2,
            "generic_urt": 3,
            "in_app_notification": 1,
            "interest_picker": 3,
            "js_instrumentation": 1,
            "menu_dialog": 1,
            "notifications_permission_prompt": 2,
            "open_account": 2,
            "open_home_timeline": 1,
            "open_link": 1,
            "phone_verification": 4,
            "privacy_options": 1,
            "security_key": 3,
            "select_avatar": 4,
            "select_banner": 2,
            "settings_list": 7,
            "show_code": 1,
            "sign_up": 2,
            "sign_up_review": 4,
            "tweet_selection_urt": 1,
            "update_users": 1,
            "upload_media": 1,
            "user_recommendations_list": 4,
            "user_recommendations_urt": 1,
            "wait_spinner": 3,
            "web_modal": 1,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_cookie_session_is_connected_but_not_reconnectable() {
        let session = Session::from_raw_cookies(
            "tester",
            "ct0=csrf-token; auth_token=auth-value",
            PlatformUrls::default(),
        )
        .unwrap();

        assert!(session.connected());
        assert!(!session.can_reconnect());
        assert_eq!(session.last_synced_at(), DateTime::UNIX_EPOCH);

        session.disconnect();
        assert!(!session.connected());
    }

    #[tokio::test]
    async fn raw_cookies_are_readable_from_the_jar() {
        let session = Session::from_raw_cookies(
            "tester",
            "ct0=csrf-token; auth_token=auth-value",
            PlatformUrls::default(),
        )
        .unwrap();

        let http = session.http.read().await;
        assert_eq!(
            cookie_value(&http.jar, &session.urls.web, "ct0").as_deref(),
            Some("csrf-token")
        );
        assert_eq!(
            cookie_value(&http.jar, &session.urls.api, "auth_token").as_deref(),
            Some("auth-value")
        );
        assert_eq!(cookie_value(&http.jar, &session.urls.web, "missing"), None);
    }

    #[tokio::test]
    async fn login_without_password_is_fatal() {
        let session = Session::from_raw_cookies("tester", "ct0=x", PlatformUrls::default()).unwrap();
        let err = session.login().await.unwrap_err();
        assert!(err.to_string().contains("missing credential"));
    }
}
