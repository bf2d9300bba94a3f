//! Microsoft account OAuth: the token holder used by the Graph client and the
//! interactive first-time authorization.
//!
//! Handles:
//! - Authorization URL construction
//! - Authorization code redemption
//! - Refresh token grants shortly before the access token expires
//! - Receiving the redirect on a one-shot localhost listener, or from stdin

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use reqwest::header::AUTHORIZATION;
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com/common/oauth2/v2.0";
pub const REDIRECT_URI: &str = "http://localhost:8888/";
const LISTENER_ADDR: &str = "127.0.0.1:8888";
const SCOPES: &str = "Files.ReadWrite offline_access";
const CODE_PATTERN: &str = r"[?&]code=([^&#\s]+)";

/// Refresh this long before the access token runs out
const REFRESH_MARGIN_MINUTES: i64 = 5;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Not authorized, no account session available")]
    NotAuthorized,

    #[error("Account session cannot be refreshed (no refresh token, was offline_access granted?)")]
    NotRefreshable,

    #[error("Token endpoint returned {status}: {body}")]
    TokenEndpoint { status: u16, body: String },

    #[error("Token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid authorization URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("No authorization code in redirect URL: {0}")]
    MissingCode(String),

    #[error("Redirect listener failed: {0}")]
    Listener(#[from] std::io::Error),
}

/// Credentials of an authorized account, persisted in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSession {
    pub access_token: String,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl AccountSession {
    /// Whether the access token expires within the refresh margin.
    pub fn should_refresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::minutes(REFRESH_MARGIN_MINUTES) >= self.expires_at
    }

    /// Value of the `Authorization` header.
    pub fn authorization_header(&self) -> String {
        let token_type = if self.token_type.is_empty() {
            "Bearer"
        } else {
            &self.token_type
        };
        format!("{} {}", token_type, self.access_token)
    }
}

/// Successful token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

fn default_expires_in() -> i64 {
    3600
}

impl TokenResponse {
    fn into_session(self, now: DateTime<Utc>, previous_refresh: Option<String>) -> AccountSession {
        AccountSession {
            access_token: self.access_token,
            token_type: self.token_type,
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: now + Duration::seconds(self.expires_in),
        }
    }
}

/// Client registration and the token endpoint calls.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: Option<String>,
    authority: String,
    redirect_uri: String,
}

impl OAuthClient {
    pub fn new(http: reqwest::Client, client_id: impl Into<String>, client_secret: Option<String>) -> Self {
        Self {
            http,
            client_id: client_id.into(),
            client_secret: client_secret.filter(|s| !s.is_empty()),
            authority: DEFAULT_AUTHORITY.to_string(),
            redirect_uri: REDIRECT_URI.to_string(),
        }
    }

    /// Use a different authority base URL (tests, national clouds).
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into().trim_end_matches('/').to_string();
        self
    }

    /// URL the user opens to grant access.
    pub fn authorize_url(&self) -> Result<Url, AuthError> {
        Ok(Url::parse_with_params(
            &format!("{}/authorize", self.authority),
            &[
                ("client_id", self.client_id.as_str()),
                ("response_type", "code"),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("response_mode", "query"),
                ("scope", SCOPES),
            ],
        )?)
    }

    /// Exchange an authorization code for a session.
    pub async fn redeem_code(&self, code: &str) -> Result<AccountSession, AuthError> {
        let form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
        ];
        self.request_token(form, None).await
    }

    /// Obtain a fresh access token with the session's refresh token.
    pub async fn refresh(&self, session: &AccountSession) -> Result<AccountSession, AuthError> {
        let refresh_token = session
            .refresh_token
            .as_deref()
            .ok_or(AuthError::NotRefreshable)?;
        let form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        self.request_token(form, session.refresh_token.clone()).await
    }

    async fn request_token<'a>(
        &'a self,
        mut form: Vec<(&'a str, &'a str)>,
        previous_refresh: Option<String>,
    ) -> Result<AccountSession, AuthError> {
        form.push(("client_id", self.client_id.as_str()));
        form.push(("scope", SCOPES));
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self
            .http
            .post(format!("{}/token", self.authority))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenEndpoint {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response.json().await?;
        Ok(token.into_session(Utc::now(), previous_refresh))
    }
}

/// Owns the current session and stamps outgoing requests with it.
pub struct TokenHolder {
    client: OAuthClient,
    session: Mutex<Option<AccountSession>>,
}

impl TokenHolder {
    pub fn new(client: OAuthClient, session: Option<AccountSession>) -> Self {
        Self {
            client,
            session: Mutex::new(session),
        }
    }

    /// Current session, including any refresh done since construction.
    pub async fn session(&self) -> Option<AccountSession> {
        self.session.lock().await.clone()
    }

    /// Make sure the session is valid for at least the refresh margin.
    pub async fn ensure_fresh(&self) -> Result<(), AuthError> {
        self.fresh_header().await.map(|_| ())
    }

    /// Attach the `Authorization` header, refreshing the token first if needed.
    pub async fn authenticate(&self, request: RequestBuilder) -> Result<RequestBuilder, AuthError> {
        let header = self.fresh_header().await?;
        Ok(request.header(AUTHORIZATION, header))
    }

    async fn fresh_header(&self) -> Result<String, AuthError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(AuthError::NotAuthorized)?;
        if session.should_refresh(Utc::now()) {
            info!("Access token expires at {}, refreshing", session.expires_at);
            *session = self.client.refresh(session).await?;
        }
        Ok(session.authorization_header())
    }
}

/// Pull the authorization code out of a redirect URL or request line.
pub fn extract_code(redirect: &str) -> Option<String> {
    let pattern = Regex::new(CODE_PATTERN).ok()?;
    let raw = pattern.captures(redirect)?.get(1)?.as_str();
    let code = urlencoding::decode(raw).ok()?.into_owned();
    (!code.is_empty()).then_some(code)
}

/// Run the first-time authorization and redeem the resulting code.
///
/// With `use_listener`, the redirect is received on `localhost:8888`; when the
/// listener cannot be bound, or without it, the user pastes the redirected
/// URL on stdin.
pub async fn authorize_interactive(
    client: &OAuthClient,
    use_listener: bool,
) -> Result<AccountSession, AuthError> {
    let url = client.authorize_url()?;
    info!("Starting Microsoft account authorization");

    let listener = if use_listener {
        match TcpListener::bind(LISTENER_ADDR).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!("Cannot listen on {} ({}), falling back to pasting the URL", LISTENER_ADDR, e);
                None
            }
        }
    } else {
        None
    };

    let redirect = match listener {
        Some(listener) => {
            println!("Open this URL in a browser and grant access:\n{}", url);
            receive_redirect(listener).await?
        }
        None => {
            println!(
                "Open this URL in a browser and grant access:\n{}\n\
                 The browser is redirected to a page that fails to load. Paste its \
                 full URL here (e.g. {}?code=XYZ):",
                url, REDIRECT_URI
            );
            read_pasted_redirect().await?
        }
    };

    let code = extract_code(&redirect).ok_or_else(|| AuthError::MissingCode(redirect.clone()))?;
    let session = client.redeem_code(&code).await?;
    info!("Authorization token received");
    Ok(session)
}

async fn receive_redirect(listener: TcpListener) -> Result<String, AuthError> {
    let (stream, peer) = listener.accept().await?;
    debug!("Redirect received from {}", peer);

    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let body = "<html><body>Authorization received. You can close this window.</body></html>";
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    reader.get_mut().write_all(response.as_bytes()).await?;
    reader.get_mut().shutdown().await?;

    Ok(request_line.trim().to_string())
}

async fn read_pasted_redirect() -> Result<String, AuthError> {
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(line.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn session(expires_at: DateTime<Utc>) -> AccountSession {
        AccountSession {
            access_token: "abc".into(),
            token_type: "Bearer".into(),
            refresh_token: Some("r1".into()),
            expires_at,
        }
    }

    #[test]
    fn test_extract_code_from_url() {
        assert_eq!(
            extract_code("http://localhost:8888/?code=M.R3_BAY.abc-123&state=x"),
            Some("M.R3_BAY.abc-123".to_string())
        );
    }

    #[test]
    fn test_extract_code_from_request_line() {
        assert_eq!(
            extract_code("GET /?code=xyz%2Fq HTTP/1.1"),
            Some("xyz/q".to_string())
        );
    }

    #[test]
    fn test_extract_code_missing() {
        assert_eq!(extract_code("http://localhost:8888/?error=access_denied"), None);
        assert_eq!(extract_code("http://localhost:8888/?code="), None);
        // Only a real query parameter counts
        assert_eq!(extract_code("http://localhost:8888/?errcode=1"), None);
    }

    #[test]
    fn test_should_refresh_within_margin() {
        let expires = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let s = session(expires);

        assert!(!s.should_refresh(expires - Duration::minutes(10)));
        assert!(s.should_refresh(expires - Duration::minutes(4)));
        assert!(s.should_refresh(expires + Duration::minutes(1)));
    }

    #[test]
    fn test_authorization_header() {
        let mut s = session(Utc::now());
        assert_eq!(s.authorization_header(), "Bearer abc");

        s.token_type = String::new();
        assert_eq!(s.authorization_header(), "Bearer abc");
    }

    #[test]
    fn test_refresh_keeps_previous_refresh_token() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"new","token_type":"bearer","expires_in":3600}"#).unwrap();

        let s = response.into_session(now, Some("r1".into()));
        assert_eq!(s.access_token, "new");
        assert_eq!(s.refresh_token.as_deref(), Some("r1"));
        assert_eq!(s.expires_at, now + Duration::hours(1));
    }

    #[test]
    fn test_authorize_url() {
        let client = OAuthClient::new(reqwest::Client::new(), "my-app", None);
        let url = client.authorize_url().unwrap();

        assert!(url.as_str().starts_with(DEFAULT_AUTHORITY));
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("client_id".into(), "my-app".into())));
        assert!(pairs.contains(&("redirect_uri".into(), REDIRECT_URI.into())));
        assert!(pairs.contains(&("scope".into(), SCOPES.into())));
    }

    #[tokio::test]
    async fn test_authenticate_without_session() {
        let client = OAuthClient::new(reqwest::Client::new(), "my-app", None);
        let holder = TokenHolder::new(client, None);
        let request = reqwest::Client::new().get("http://localhost/");

        assert!(matches!(
            holder.authenticate(request).await,
            Err(AuthError::NotAuthorized)
        ));
    }

    #[tokio::test]
    async fn test_authenticate_attaches_header() {
        let client = OAuthClient::new(reqwest::Client::new(), "my-app", None);
        let holder = TokenHolder::new(client, Some(session(Utc::now() + Duration::hours(1))));

        let request = holder
            .authenticate(reqwest::Client::new().get("http://localhost/"))
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer abc");
    }

    #[tokio::test]
    async fn test_expired_session_without_refresh_token() {
        let client = OAuthClient::new(reqwest::Client::new(), "my-app", None);
        let mut expired = session(Utc::now() - Duration::hours(1));
        expired.refresh_token = None;
        let holder = TokenHolder::new(client, Some(expired));

        assert!(matches!(holder.ensure_fresh().await, Err(AuthError::NotRefreshable)));
    }
}
