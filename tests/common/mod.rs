#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use clearance_mirror::{
    ChallengeSolver, Clearance, CredentialCache, MirrorConfig, MirrorEngine, OriginResponse,
    OutboundRequest, OutboundSession, SessionFactory, SessionPool, SolveError, TransportError,
};
use http::{HeaderMap, HeaderValue, StatusCode, header};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

/// Hands out `cf_clearance=token-N` and counts calls.
pub struct TokenSolver {
    calls: AtomicUsize,
    fail: bool,
}

impl TokenSolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChallengeSolver for TokenSolver {
    fn name(&self) -> &'static str {
        "token"
    }

    async fn solve(&self, _origin: &Url, _proxy: Option<&str>) -> Result<Clearance, SolveError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail {
            return Err(SolveError::Rejected("challenge not solved".into()));
        }
        let mut cookies = BTreeMap::new();
        cookies.insert("cf_clearance".to_string(), format!("token-{call}"));
        Ok(Clearance::new(cookies, "TestFox/1.0"))
    }
}

/// Answers every request with 200 and a plain-text echo of what arrived.
pub struct EchoSession;

#[async_trait]
impl OutboundSession for EchoSession {
    async fn send(&self, request: OutboundRequest) -> Result<OriginResponse, TransportError> {
        let cookie = request
            .headers
            .get(header::COOKIE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = format!("{} {} cookie={cookie}", request.method, request.url);

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert("x-origin", HeaderValue::from_static("echo"));
        Ok(OriginResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::from(body),
            url: request.url,
        })
    }
}

pub struct EchoFactory;

impl SessionFactory for EchoFactory {
    fn create(
        &self,
        _host: &str,
        _proxy: Option<&str>,
    ) -> Result<Arc<dyn OutboundSession>, TransportError> {
        Ok(Arc::new(EchoSession))
    }
}

pub fn echo_engine(solver: Arc<TokenSolver>) -> Arc<MirrorEngine> {
    let config = MirrorConfig::builder()
        .with_retry_backoff(std::time::Duration::ZERO)
        .build();
    Arc::new(MirrorEngine::new(
        config,
        solver,
        CredentialCache::in_memory(),
        Arc::new(SessionPool::new(Arc::new(EchoFactory), 16)),
    ))
}

/// One raw HTTP request as the origin saw it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub head: String,
    pub body: Vec<u8>,
}

impl SeenRequest {
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or("")
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }
}

/// Origin that replies with `script` in order, then 200 `hello`.
pub struct MockOrigin {
    pub port: u16,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl MockOrigin {
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

pub async fn spawn_mock_origin(script: Vec<&'static str>) -> MockOrigin {
    spawn_mock_origin_bytes(script.into_iter().map(|r| r.as_bytes().to_vec()).collect()).await
}

/// Same as [`spawn_mock_origin`] for responses that are not valid UTF-8.
pub async fn spawn_mock_origin_bytes(script: Vec<Vec<u8>>) -> MockOrigin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let script = Arc::new(Mutex::new(script.into_iter().rev().collect::<Vec<Vec<u8>>>()));

    let recorded = seen.clone();
    tokio::spawn(async move {
        loop {
            if let Ok((mut socket, _)) = listener.accept().await {
                let recorded = recorded.clone();
                let script = script.clone();
                tokio::spawn(async move {
                    let Some(request) = read_request(&mut socket).await else {
                        return;
                    };
                    recorded.lock().unwrap().push(request);
                    let response = script.lock().unwrap().pop().unwrap_or_else(|| {
                        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello".to_vec()
                    });
                    let _ = socket.write_all(&response).await;
                    let _ = socket.shutdown().await;
                });
            }
        }
    });

    MockOrigin { port, seen }
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<SeenRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        let read = socket.read(&mut chunk).await.ok()?;
        if read == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..read]);
        if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut request = SeenRequest {
        head,
        body: buf[head_end..].to_vec(),
    };
    let expected = request
        .header("content-length")
        .and_then(|len| len.parse::<usize>().ok())
        .unwrap_or(0);

    while request.body.len() < expected {
        let read = socket.read(&mut chunk).await.ok()?;
        if read == 0 {
            break;
        }
        request.body.extend_from_slice(&chunk[..read]);
    }
    Some(request)
}

/// Serves the router for `engine` on an ephemeral port until the test ends.
pub async fn spawn_server(engine: Arc<MirrorEngine>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(clearance_mirror::serve(
        listener,
        clearance_mirror::AppState::new(engine),
        std::future::pending(),
    ));
    port
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}
