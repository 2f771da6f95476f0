mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clearance_mirror::{
    CredentialCache, MirrorConfig, MirrorEngine, MirrorError, MirrorRequest, ReqwestSessionFactory,
    SessionPool, cache_key_for,
};
use async_compression::tokio::bufread::GzipEncoder;
use common::{TokenSolver, spawn_mock_origin, spawn_mock_origin_bytes};
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

const FORBIDDEN: &str =
    "HTTP/1.1 403 Forbidden\r\nContent-Length: 9\r\nConnection: close\r\n\r\nforbidden";

fn reqwest_engine(solver: Arc<TokenSolver>, cache: CredentialCache) -> MirrorEngine {
    let config = MirrorConfig::builder()
        .with_max_retries(2)
        .with_retry_backoff(Duration::ZERO)
        .build();
    MirrorEngine::new(
        config,
        solver,
        cache,
        Arc::new(SessionPool::new(Arc::new(ReqwestSessionFactory::default()), 8)),
    )
}

#[tokio::test]
async fn forbidden_origin_gets_a_fresh_clearance() {
    let origin = spawn_mock_origin(vec![FORBIDDEN]).await;
    let solver = TokenSolver::new();
    let engine = reqwest_engine(solver.clone(), CredentialCache::in_memory());

    let result = engine
        .mirror(MirrorRequest::new(Method::GET, origin.url(), "/page").with_query("a=1"))
        .await
        .unwrap();

    assert_eq!(result.status, StatusCode::OK);
    assert_eq!(result.body, Bytes::from_static(b"hello"));
    assert_eq!(result.attempts, 2);
    assert_eq!(solver.calls(), 2);

    let seen = origin.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].request_line(), "GET /page?a=1 HTTP/1.1");
    assert_eq!(seen[0].header("cookie").as_deref(), Some("cf_clearance=token-1"));
    assert_eq!(seen[1].header("cookie").as_deref(), Some("cf_clearance=token-2"));
    assert_eq!(seen[1].header("user-agent").as_deref(), Some("TestFox/1.0"));

    let key = cache_key_for(&origin.url(), None).unwrap();
    let record = engine.cache().get(&key).unwrap();
    assert_eq!(record.cookies["cf_clearance"], "token-2");
}

#[tokio::test]
async fn forwards_body_and_merges_caller_cookies() {
    let origin = spawn_mock_origin(vec![]).await;
    let engine = reqwest_engine(TokenSolver::new(), CredentialCache::in_memory());

    let mut headers = HeaderMap::new();
    headers.insert(header::COOKIE, HeaderValue::from_static("session=abc; cf_clearance=stale"));
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert("x-hostname", HeaderValue::from_static("ignored.example"));

    let result = engine
        .mirror(
            MirrorRequest::new(Method::POST, origin.url(), "/api/items")
                .with_headers(headers)
                .with_body(Bytes::from_static(br#"{"q":1}"#)),
        )
        .await
        .unwrap();
    assert_eq!(result.status, StatusCode::OK);
    assert_eq!(result.headers[header::CONTENT_LENGTH], "5");

    let seen = origin.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].request_line(), "POST /api/items HTTP/1.1");
    assert_eq!(seen[0].body, br#"{"q":1}"#.to_vec());
    assert_eq!(
        seen[0].header("cookie").as_deref(),
        Some("session=abc; cf_clearance=token-1")
    );
    assert_eq!(seen[0].header("content-type").as_deref(), Some("application/json"));
    assert!(seen[0].header("x-hostname").is_none());
}

#[tokio::test]
async fn persistent_forbidden_is_returned_to_caller() {
    let origin = spawn_mock_origin(vec![FORBIDDEN, FORBIDDEN, FORBIDDEN]).await;
    let solver = TokenSolver::new();
    let engine = reqwest_engine(solver.clone(), CredentialCache::in_memory());

    let result = engine
        .mirror(MirrorRequest::new(Method::GET, origin.url(), "/"))
        .await
        .unwrap();

    assert_eq!(result.status, StatusCode::FORBIDDEN);
    assert_eq!(result.body, Bytes::from_static(b"forbidden"));
    assert_eq!(result.attempts, 3);
    assert_eq!(solver.calls(), 3);
}

#[tokio::test]
async fn unreachable_origin_exhausts_retries() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let solver = TokenSolver::new();
    let engine = reqwest_engine(solver.clone(), CredentialCache::in_memory());
    let err = engine
        .mirror(MirrorRequest::new(
            Method::GET,
            format!("http://127.0.0.1:{port}"),
            "/",
        ))
        .await
        .unwrap_err();

    assert!(matches!(err, MirrorError::Transport { attempts: 3, .. }));
    assert_eq!(solver.calls(), 1);
}

#[tokio::test]
async fn clearance_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clearances.json");
    let origin = spawn_mock_origin(vec![]).await;

    {
        let engine = reqwest_engine(TokenSolver::new(), CredentialCache::open(&path).unwrap());
        engine
            .mirror(MirrorRequest::new(Method::GET, origin.url(), "/"))
            .await
            .unwrap();
    }

    let solver = TokenSolver::new();
    let engine = reqwest_engine(solver.clone(), CredentialCache::open(&path).unwrap());
    engine
        .mirror(MirrorRequest::new(Method::GET, origin.url(), "/again"))
        .await
        .unwrap();

    assert_eq!(solver.calls(), 0);
    let seen = origin.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].header("cookie").as_deref(), Some("cf_clearance=token-1"));
}

#[tokio::test]
async fn gzip_origin_body_is_served_as_identity() {
    let plain = b"hello decoded world";
    let mut compressed = Vec::new();
    GzipEncoder::new(&plain[..])
        .read_to_end(&mut compressed)
        .await
        .unwrap();

    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        compressed.len()
    )
    .into_bytes();
    response.extend_from_slice(&compressed);

    let origin = spawn_mock_origin_bytes(vec![response]).await;
    let engine = reqwest_engine(TokenSolver::new(), CredentialCache::in_memory());
    let result = engine
        .mirror(MirrorRequest::new(Method::GET, origin.url(), "/"))
        .await
        .unwrap();

    assert_eq!(result.status, StatusCode::OK);
    assert_eq!(result.body, Bytes::from_static(plain));
    assert_eq!(
        result.headers.get(header::CONTENT_ENCODING).and_then(|v| v.to_str().ok()),
        Some("identity")
    );
    assert_eq!(result.headers[header::CONTENT_LENGTH], "19");
}

#[tokio::test]
async fn cookies_set_by_one_origin_stay_off_redirected_requests() {
    let other = spawn_mock_origin(vec![
        "HTTP/1.1 200 OK\r\nSet-Cookie: other=secret; Path=/\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
    ])
    .await;
    let redirect = Box::leak(
        format!(
            "HTTP/1.1 302 Found\r\nLocation: {}/landing\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            other.url()
        )
        .into_boxed_str(),
    );
    let origin = spawn_mock_origin(vec![redirect]).await;
    let engine = reqwest_engine(TokenSolver::new(), CredentialCache::in_memory());

    engine.fetch_content(&other.url(), None, false, 1).await.unwrap();
    engine.fetch_content(&origin.url(), None, false, 1).await.unwrap();

    let seen = other.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].request_line(), "GET /landing HTTP/1.1");
    assert!(seen[1].header("cookie").is_none());
}
