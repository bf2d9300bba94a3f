//! Graph and token endpoint calls against a one-shot local HTTP server.

use chrono::{Duration, Utc};
use std::sync::Arc;
use sync_cli::{AccountSession, AuthError, GraphClient, OAuthClient, TokenHolder};
use sync_core::remote::{ItemKind, RemoteError, RemoteStorage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Answer a single request with `status` and the JSON `body`. The handle
/// yields the raw request as received.
async fn serve_once(status: &str, body: &str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_request(&mut stream).await;
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
        request
    });
    (base, handle)
}

async fn read_request(stream: &mut TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let read = stream.read(&mut chunk).await.unwrap();
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);

        let text = String::from_utf8_lossy(&buffer);
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buffer.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

fn http() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

fn session(expires_in: Duration) -> AccountSession {
    AccountSession {
        access_token: "abc".into(),
        token_type: "Bearer".into(),
        refresh_token: Some("r1".into()),
        expires_at: Utc::now() + expires_in,
    }
}

fn graph(base: &str) -> GraphClient {
    let http = http();
    let tokens = TokenHolder::new(
        OAuthClient::new(http.clone(), "my-app", None),
        Some(session(Duration::hours(1))),
    );
    GraphClient::new(http, Arc::new(tokens)).with_base_url(format!("{}/v1.0/me/drive/", base))
}

#[tokio::test]
async fn test_get_item_is_sent_to_base_url() {
    let (base, server) = serve_once(
        "200 OK",
        r#"{"id":"F1","name":"2024","lastModifiedDateTime":"2024-03-01T10:00:00Z","folder":{"childCount":0}}"#,
    )
    .await;

    let item = graph(&base).get_item("/Pictures/2024/").await.unwrap();
    assert_eq!(item.id, "F1");
    assert_eq!(item.kind, ItemKind::Folder);

    let request = server.await.unwrap();
    assert!(
        request.starts_with("GET /v1.0/me/drive/root:/Pictures/2024: HTTP/1.1\r\n"),
        "{}",
        request
    );
    assert!(request.to_ascii_lowercase().contains("authorization: bearer abc"));
}

#[tokio::test]
async fn test_missing_item_is_not_found() {
    let (base, server) = serve_once(
        "404 Not Found",
        r#"{"error":{"code":"itemNotFound","message":"The resource could not be found."}}"#,
    )
    .await;

    let result = graph(&base).get_item("/Pictures/gone.jpg").await;
    assert!(matches!(result, Err(RemoteError::NotFound(path)) if path == "/Pictures/gone.jpg"));
    server.await.unwrap();
}

#[tokio::test]
async fn test_expiring_session_is_refreshed_at_authority() {
    let (base, server) = serve_once(
        "200 OK",
        r#"{"access_token":"new","token_type":"Bearer","expires_in":3600}"#,
    )
    .await;
    let client = OAuthClient::new(http(), "my-app", None).with_authority(format!("{}/common/oauth2/v2.0/", base));
    let holder = TokenHolder::new(client, Some(session(Duration::minutes(1))));

    holder.ensure_fresh().await.unwrap();

    let refreshed = holder.session().await.unwrap();
    assert_eq!(refreshed.access_token, "new");
    assert_eq!(refreshed.refresh_token.as_deref(), Some("r1"));
    assert!(refreshed.expires_at > Utc::now() + Duration::minutes(30));

    let request = server.await.unwrap();
    assert!(request.starts_with("POST /common/oauth2/v2.0/token HTTP/1.1\r\n"), "{}", request);
    assert!(request.contains("grant_type=refresh_token"));
    assert!(request.contains("refresh_token=r1"));
    assert!(request.contains("client_id=my-app"));
}

#[tokio::test]
async fn test_rejected_refresh_keeps_old_session() {
    let (base, server) = serve_once("400 Bad Request", r#"{"error":"invalid_grant"}"#).await;
    let client = OAuthClient::new(http(), "my-app", None).with_authority(base);
    let holder = TokenHolder::new(client, Some(session(Duration::minutes(1))));

    let result = holder.ensure_fresh().await;
    assert!(matches!(
        result,
        Err(AuthError::TokenEndpoint { status: 400, ref body }) if body.contains("invalid_grant")
    ));
    assert_eq!(holder.session().await.unwrap().access_token, "abc");
    server.await.unwrap();
}
