use std::collections::VecDeque;
use std::io::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures_util::StreamExt;
use http::header::{
    ACCEPT_ENCODING, AUTHORIZATION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, COOKIE,
    HeaderName, HeaderValue, USER_AGENT,
};
use http::{HeaderMap, Method, Request, Uri};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use serde::Deserialize;

use crate::body::RequestBody;
use crate::client::{Client, DEFAULT_USER_AGENT};
use crate::config::{RedirectPolicy, RequestConfig};
use crate::error::{BoxError, Error, ErrorCode, ErrorKind, TransportErrorKind};
use crate::proxy::ProxyConfig;
use crate::retry::RetryPolicy;
use crate::signal::{CancelHandle, Signal};
use crate::transport::{Connection, ResponseBody, Transport, TransportError};

enum Step {
    Respond {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: Bytes,
        delay: Duration,
    },
    RespondWithStalledBody {
        status: u16,
    },
    Fail {
        kind: TransportErrorKind,
    },
    Hang,
}

fn respond(status: u16) -> Step {
    Step::Respond {
        status,
        headers: Vec::new(),
        body: Bytes::new(),
        delay: Duration::ZERO,
    }
}

fn respond_with(status: u16, headers: &[(&'static str, &str)], body: &str) -> Step {
    Step::Respond {
        status,
        headers: headers
            .iter()
            .map(|(name, value)| (*name, (*value).to_owned()))
            .collect(),
        body: Bytes::from(body.to_owned()),
        delay: Duration::ZERO,
    }
}

fn respond_after(status: u16, delay: Duration) -> Step {
    Step::Respond {
        status,
        headers: Vec::new(),
        body: Bytes::new(),
        delay,
    }
}

fn redirect(status: u16, location: &str) -> Step {
    respond_with(status, &[("location", location)], "")
}

#[derive(Clone, Debug)]
struct Recorded {
    method: Method,
    uri: String,
    headers: HeaderMap,
    body: Bytes,
    proxy: Option<String>,
    at: Instant,
}

#[derive(Clone, Default)]
struct ScriptedTransport {
    steps: Arc<Mutex<VecDeque<Step>>>,
    recorded: Arc<Mutex<Vec<Recorded>>>,
}

impl ScriptedTransport {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.into())),
            recorded: Arc::default(),
        }
    }

    fn requests(&self) -> Vec<Recorded> {
        self.recorded.lock().expect("recorded lock").clone()
    }

    fn client(&self) -> Client {
        Client::builder()
            .transport(self.clone())
            .proxy_from_env(false)
            .build()
    }
}

struct ScriptedConnection {
    transport: ScriptedTransport,
    proxy: Option<String>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn dial(
        &self,
        _target: &Uri,
        proxy: Option<&ProxyConfig>,
        signal: &Signal,
    ) -> Result<Box<dyn Connection>, TransportError> {
        signal.check()?;
        Ok(Box::new(ScriptedConnection {
            transport: self.clone(),
            proxy: proxy.map(ToString::to_string),
        }))
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn send(
        self: Box<Self>,
        request: Request<RequestBody>,
        signal: &Signal,
    ) -> Result<http::Response<ResponseBody>, TransportError> {
        let (parts, body) = request.into_parts();
        let body = body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|source| TransportError::new(TransportErrorKind::Write, source))?;
        self.transport
            .recorded
            .lock()
            .expect("recorded lock")
            .push(Recorded {
                method: parts.method,
                uri: parts.uri.to_string(),
                headers: parts.headers,
                body,
                proxy: self.proxy.clone(),
                at: Instant::now(),
            });
        let step = self
            .transport
            .steps
            .lock()
            .expect("steps lock")
            .pop_front()
            .unwrap_or_else(|| respond(200));

        match step {
            Step::Respond {
                status,
                headers,
                body,
                delay,
            } => {
                signal.sleep(delay).await?;
                let mut builder = http::Response::builder().status(status);
                for (name, value) in headers {
                    builder = builder.header(name, value);
                }
                let body = Full::new(body)
                    .map_err(|never| -> BoxError { match never {} })
                    .boxed_unsync();
                Ok(builder.body(body).expect("scripted response"))
            }
            Step::RespondWithStalledBody { status } => {
                let stalled = futures_util::stream::pending::<Result<Frame<Bytes>, BoxError>>();
                let body = StreamBody::new(stalled).boxed_unsync();
                Ok(http::Response::builder()
                    .status(status)
                    .body(body)
                    .expect("scripted response"))
            }
            Step::Fail { kind } => Err(TransportError::new(
                kind,
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "scripted failure"),
            )),
            Step::Hang => Err(signal.interrupted().await.into()),
        }
    }
}

fn fast_retry(max_attempts: usize) -> RetryPolicy {
    RetryPolicy::standard()
        .max_attempts(max_attempts)
        .fixed_backoff(Duration::from_millis(1))
        .jitter_ratio(0.0)
}

#[tokio::test]
async fn defaults_session_and_request_headers_layer_in_order() {
    let transport = ScriptedTransport::new(vec![respond(200)]);
    let client = Client::builder()
        .transport(transport.clone())
        .proxy_from_env(false)
        .default_header(
            HeaderName::from_static("x-client"),
            HeaderValue::from_static("client"),
        )
        .default_header(
            HeaderName::from_static("x-shared"),
            HeaderValue::from_static("client"),
        )
        .build();
    client.session().set_default_header(
        HeaderName::from_static("x-session"),
        HeaderValue::from_static("session"),
    );
    client.session().set_default_header(
        HeaderName::from_static("x-client"),
        HeaderValue::from_static("session"),
    );

    client
        .get("https://api.test/items")
        .try_header("x-shared", "request")
        .expect("header")
        .send()
        .await
        .expect("request should succeed");

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    let headers = &requests[0].headers;
    assert_eq!(headers.get("x-client").expect("x-client"), "client");
    assert_eq!(headers.get("x-session").expect("x-session"), "session");
    assert_eq!(headers.get("x-shared").expect("x-shared"), "request");
    assert_eq!(headers.get(USER_AGENT).expect("user agent"), DEFAULT_USER_AGENT);
    assert_eq!(
        headers.get(ACCEPT_ENCODING).expect("accept encoding"),
        "gzip, deflate"
    );
}

#[tokio::test]
async fn execute_merges_declarative_config_with_base_url() {
    let transport = ScriptedTransport::new(vec![respond(200)]);
    let client = Client::builder()
        .transport(transport.clone())
        .proxy_from_env(false)
        .base_url("https://api.test/v1/")
        .build();

    let mut config = RequestConfig::new(Method::GET, "/users/:id");
    config.params.push(("id".to_owned(), "a b".to_owned()));
    config.query.push(("page".to_owned(), "2".to_owned()));
    let response = client.execute(config).await.expect("request should succeed");

    assert_eq!(response.url().as_str(), "https://api.test/v1/users/a%20b?page=2");
    assert_eq!(transport.requests()[0].uri, "https://api.test/v1/users/a%20b?page=2");
}

#[tokio::test]
async fn body_is_consumed_once_and_buffers_are_memoized() {
    let transport = ScriptedTransport::new(vec![
        respond_with(200, &[("content-type", "application/json")], r#"{"id":7}"#),
        respond_with(200, &[], "streamed"),
    ]);
    let client = transport.client();

    let mut response = client.get("https://api.test/a").send().await.expect("send");
    let first = response.bytes().await.expect("first read");
    let second = response.bytes().await.expect("memoized read");
    assert_eq!(first, second);
    assert_eq!(response.text().await.expect("text"), r#"{"id":7}"#);

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        id: u32,
    }
    assert_eq!(response.json::<Item>().await.expect("json"), Item { id: 7 });
    assert_eq!(response.value().await.expect("value")["id"], 7);
    assert!(matches!(response.body(), Err(Error::StreamAlreadyConsumed)));

    let mut response = client.get("https://api.test/b").send().await.expect("send");
    let mut stream = response.body().expect("first take");
    assert!(matches!(response.body(), Err(Error::StreamAlreadyConsumed)));
    assert!(matches!(
        response.bytes().await,
        Err(Error::StreamAlreadyConsumed)
    ));
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.expect("chunk"));
    }
    assert_eq!(collected, b"streamed");
}

#[tokio::test]
async fn retryable_statuses_use_three_attempts_with_backoff() {
    let transport = ScriptedTransport::new(vec![respond(503), respond(503), respond(200)]);
    let client = transport.client();
    let policy = RetryPolicy::standard()
        .max_attempts(3)
        .fixed_backoff(Duration::from_millis(40))
        .jitter_ratio(0.0);

    let started = Instant::now();
    let response = client
        .get("https://api.test/flaky")
        .retry_policy(policy)
        .send()
        .await
        .expect("third attempt should succeed");

    assert_eq!(response.status(), 200);
    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[1].at.duration_since(requests[0].at) >= Duration::from_millis(40));
    assert!(requests[2].at.duration_since(requests[1].at) >= Duration::from_millis(40));
    assert!(started.elapsed() >= Duration::from_millis(80));
}

#[tokio::test]
async fn overall_deadline_stops_before_second_attempt() {
    let transport = ScriptedTransport::new(vec![
        respond_after(200, Duration::from_millis(150)),
        respond_after(200, Duration::from_millis(150)),
        respond_after(200, Duration::from_millis(150)),
    ]);
    let client = transport.client();

    let started = Instant::now();
    let error = client
        .get("https://api.test/slow")
        .timeout(Duration::from_millis(100))
        .retry_policy(fast_retry(3))
        .send()
        .await
        .expect_err("deadline should elapse");

    assert!(matches!(error, Error::Timeout { .. }));
    assert_eq!(error.code(), ErrorCode::Timeout);
    assert!(error.is_timeout());
    assert_eq!(transport.requests().len(), 1);
    assert!(started.elapsed() < Duration::from_millis(150));
}

#[tokio::test]
async fn attempt_timeout_is_retried_within_deadline() {
    let transport = ScriptedTransport::new(vec![Step::Hang, respond(200)]);
    let client = transport.client();

    let response = client
        .get("https://api.test/hang-once")
        .timeout(Duration::from_secs(5))
        .attempt_timeout(Duration::from_millis(50))
        .retry_policy(fast_retry(2))
        .send()
        .await
        .expect("second attempt should succeed");

    assert_eq!(response.status(), 200);
    assert_eq!(transport.requests().len(), 2);
}

#[tokio::test]
async fn cancellation_is_terminal_and_never_retried() {
    let transport = ScriptedTransport::new(vec![Step::Hang, respond(200)]);
    let client = transport.client();
    let cancel = CancelHandle::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let error = client
        .get("https://api.test/cancel")
        .timeout(Duration::ZERO)
        .retry_policy(fast_retry(3))
        .cancel_handle(&cancel)
        .send()
        .await
        .expect_err("request should be cancelled");

    assert!(matches!(error, Error::Cancelled { .. }));
    assert!(error.is_cancelled());
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn cancelling_stops_body_stream() {
    let transport = ScriptedTransport::new(vec![Step::RespondWithStalledBody { status: 200 }]);
    let client = transport.client();
    let cancel = CancelHandle::new();

    let mut response = client
        .get("https://api.test/stream")
        .cancel_handle(&cancel)
        .send()
        .await
        .expect("headers should arrive");
    let mut stream = response.body().expect("stream");
    cancel.cancel();

    let next = stream.next().await.expect("stream yields an error");
    assert!(matches!(next, Err(Error::Cancelled { .. })));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn deadline_applies_to_buffered_body_reads() {
    let transport = ScriptedTransport::new(vec![Step::RespondWithStalledBody { status: 200 }]);
    let client = transport.client();

    let mut response = client
        .get("https://api.test/stalled")
        .timeout(Duration::from_millis(80))
        .send()
        .await
        .expect("headers should arrive");
    let error = response.bytes().await.expect_err("body read should time out");
    assert!(matches!(error, Error::Timeout { .. }));
}

#[tokio::test]
async fn see_other_switches_to_get_without_body() {
    let transport = ScriptedTransport::new(vec![redirect(303, "/done"), respond(200)]);
    let client = transport.client();

    let response = client
        .post("https://api.test/submit")
        .json(&serde_json::json!({ "name": "demo" }))
        .expect("json")
        .send()
        .await
        .expect("redirect should be followed");

    assert_eq!(response.redirect_count(), 1);
    assert_eq!(response.url().as_str(), "https://api.test/done");
    let requests = transport.requests();
    assert_eq!(requests[0].method, Method::POST);
    assert_eq!(
        requests[0].headers.get(CONTENT_TYPE).expect("content type"),
        "application/json"
    );
    assert_eq!(requests[1].method, Method::GET);
    assert!(requests[1].body.is_empty());
    assert!(requests[1].headers.get(CONTENT_TYPE).is_none());
    assert!(requests[1].headers.get(CONTENT_LENGTH).is_none());
}

#[tokio::test]
async fn temporary_redirect_replays_method_and_body() {
    let transport = ScriptedTransport::new(vec![redirect(307, "/v2/submit"), respond(201)]);
    let client = transport.client();

    let response = client
        .post("https://api.test/v1/submit")
        .text("payload")
        .send()
        .await
        .expect("redirect should be followed");

    assert_eq!(response.status(), 201);
    let requests = transport.requests();
    assert_eq!(requests[1].method, Method::POST);
    assert_eq!(requests[1].uri, "https://api.test/v2/submit");
    assert_eq!(requests[1].body, Bytes::from_static(b"payload"));
    assert_eq!(
        requests[1].headers.get(CONTENT_TYPE).expect("content type"),
        "text/plain; charset=utf-8"
    );
}

#[tokio::test]
async fn found_keeps_post_when_policy_preserves_it() {
    let transport = ScriptedTransport::new(vec![redirect(302, "/next"), respond(200)]);
    let client = transport.client();

    client
        .post("https://api.test/start")
        .text("keep")
        .redirect_policy(RedirectPolicy::default().preserve_post(true))
        .send()
        .await
        .expect("redirect should be followed");

    let requests = transport.requests();
    assert_eq!(requests[1].method, Method::POST);
    assert_eq!(requests[1].body, Bytes::from_static(b"keep"));
}

#[tokio::test]
async fn cross_origin_redirect_drops_credentials() {
    let transport = ScriptedTransport::new(vec![
        redirect(302, "https://other.test/landing"),
        respond(200),
    ]);
    let client = transport.client();

    client
        .get("https://api.test/start")
        .bearer_auth("secret")
        .try_header("cookie", "manual=1")
        .expect("cookie header")
        .send()
        .await
        .expect("redirect should be followed");

    let requests = transport.requests();
    assert_eq!(
        requests[0].headers.get(AUTHORIZATION).expect("authorization"),
        "Bearer secret"
    );
    assert!(requests[1].headers.get(AUTHORIZATION).is_none());
    assert!(requests[1].headers.get(COOKIE).is_none());
}

#[tokio::test]
async fn redirect_limit_is_enforced() {
    let transport = ScriptedTransport::new(vec![
        redirect(302, "/a"),
        redirect(302, "/b"),
        redirect(302, "/c"),
    ]);
    let client = transport.client();

    let error = client
        .get("https://api.test/loop")
        .max_redirects(2)
        .send()
        .await
        .expect_err("third redirect exceeds the limit");

    assert!(matches!(error, Error::TooManyRedirects { max_redirects: 2, .. }));
    assert_eq!(transport.requests().len(), 3);
}

#[tokio::test]
async fn redirects_can_be_disabled_and_location_is_exposed() {
    let transport = ScriptedTransport::new(vec![redirect(301, "/moved")]);
    let client = transport.client();

    let response = client
        .get("https://api.test/old")
        .follow_redirects(false)
        .send()
        .await
        .expect("redirect response is returned");

    assert_eq!(response.status(), 301);
    assert_eq!(response.location(), Some("/moved"));
    assert_eq!(response.redirect_count(), 0);
}

#[tokio::test]
async fn missing_location_is_an_error() {
    let transport = ScriptedTransport::new(vec![respond(302)]);
    let error = transport
        .client()
        .get("https://api.test/nowhere")
        .send()
        .await
        .expect_err("location is required");
    assert_eq!(error.code(), ErrorCode::MissingRedirectLocation);
    assert_eq!(error.kind(), ErrorKind::Redirect);
}

#[tokio::test]
async fn exhausted_retries_wrap_the_last_status() {
    let transport = ScriptedTransport::new(vec![respond(503), respond(503), respond(503)]);
    let client = transport.client();

    let error = client
        .get("https://api.test/down")
        .retry_policy(fast_retry(3))
        .send()
        .await
        .expect_err("retries should be exhausted");

    match &error {
        Error::MaxRetriesExceeded { attempts, source } => {
            assert_eq!(*attempts, 3);
            assert!(matches!(**source, Error::RetryableStatus { status: 503, .. }));
        }
        other => panic!("unexpected error variant: {other}"),
    }
    assert_eq!(error.status(), Some(503));
    assert_eq!(transport.requests().len(), 3);
}

#[tokio::test]
async fn transport_errors_are_retried_then_succeed() {
    let transport = ScriptedTransport::new(vec![
        Step::Fail {
            kind: TransportErrorKind::Connect,
        },
        respond(200),
    ]);
    let response = transport
        .client()
        .get("https://api.test/reconnect")
        .retry_policy(fast_retry(2))
        .send()
        .await
        .expect("second attempt should succeed");
    assert_eq!(response.status(), 200);
    assert_eq!(transport.requests().len(), 2);
}

#[tokio::test]
async fn two_connect_failures_back_off_before_success() {
    let transport = ScriptedTransport::new(vec![
        Step::Fail {
            kind: TransportErrorKind::Connect,
        },
        Step::Fail {
            kind: TransportErrorKind::Connect,
        },
        respond(200),
    ]);
    let policy = RetryPolicy::standard()
        .max_attempts(3)
        .fixed_backoff(Duration::from_millis(40))
        .jitter_ratio(0.0);

    let started = Instant::now();
    let response = transport
        .client()
        .get("https://api.test/reconnect")
        .retry_policy(policy)
        .send()
        .await
        .expect("third attempt should succeed");

    assert_eq!(response.status(), 200);
    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[1].at.duration_since(requests[0].at) >= Duration::from_millis(40));
    assert!(requests[2].at.duration_since(requests[1].at) >= Duration::from_millis(40));
    assert!(started.elapsed() >= Duration::from_millis(80));
}

#[tokio::test]
async fn single_attempt_connect_failure_is_not_wrapped() {
    let transport = ScriptedTransport::new(vec![Step::Fail {
        kind: TransportErrorKind::Connect,
    }]);
    let error = transport
        .client()
        .get("https://api.test/down")
        .send()
        .await
        .expect_err("connect failure");

    assert!(matches!(
        error,
        Error::Transport {
            kind: TransportErrorKind::Connect,
            ..
        }
    ));
    assert_eq!(error.kind(), ErrorKind::Network);
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn single_attempt_timeout_is_not_wrapped() {
    let transport = ScriptedTransport::new(vec![Step::Hang]);
    let error = transport
        .client()
        .get("https://api.test/hang")
        .timeout(Duration::from_secs(5))
        .attempt_timeout(Duration::from_millis(30))
        .send()
        .await
        .expect_err("attempt should time out");

    assert!(matches!(error, Error::AttemptTimeout { .. }));
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn retry_after_is_bounded_by_backoff_cap() {
    let transport = ScriptedTransport::new(vec![
        respond_with(503, &[("retry-after", "3600")], ""),
        respond(200),
    ]);
    let policy = RetryPolicy::standard()
        .max_attempts(2)
        .exponential_backoff(Duration::from_millis(10), Duration::from_millis(50))
        .jitter_ratio(0.0);

    let client = transport.client();
    let send = client
        .get("https://api.test/throttled")
        .timeout(Duration::ZERO)
        .retry_policy(policy)
        .send();
    let response = tokio::time::timeout(Duration::from_secs(2), send)
        .await
        .expect("retry-after must not park the request")
        .expect("second attempt should succeed");

    assert_eq!(response.status(), 200);
    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].at.duration_since(requests[0].at) >= Duration::from_millis(50));
}

#[tokio::test]
async fn unretryable_transport_error_surfaces_as_network_error() {
    let transport = ScriptedTransport::new(vec![Step::Fail {
        kind: TransportErrorKind::Tls,
    }]);
    let error = transport
        .client()
        .get("https://api.test/tls")
        .retry_policy(fast_retry(3))
        .send()
        .await
        .expect_err("tls errors are not retried by default");
    assert!(matches!(
        error,
        Error::Transport {
            kind: TransportErrorKind::Tls,
            ..
        }
    ));
    assert_eq!(error.kind(), ErrorKind::Network);
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn non_idempotent_requests_are_sent_once_without_key() {
    let transport = ScriptedTransport::new(vec![respond(503), respond(200)]);
    let client = transport.client();

    let response = client
        .post("https://api.test/orders")
        .text("order")
        .retry_policy(fast_retry(3))
        .send()
        .await
        .expect("status response is returned");

    assert_eq!(response.status(), 503);
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn idempotency_key_enables_post_retries() {
    let transport = ScriptedTransport::new(vec![respond(503), respond(200)]);
    let client = transport.client();

    let response = client
        .post("https://api.test/orders")
        .idempotency_key("order-1")
        .expect("key")
        .text("order")
        .retry_policy(fast_retry(3))
        .send()
        .await
        .expect("retry should succeed");

    assert_eq!(response.status(), 200);
    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].body, Bytes::from_static(b"order"));
}

#[tokio::test]
async fn streaming_bodies_are_never_replayed() {
    let transport = ScriptedTransport::new(vec![respond(503), respond(200)]);
    let client = transport.client();
    let chunks = futures_util::stream::iter(vec![
        Ok::<_, std::io::Error>(Bytes::from_static(b"chunk-1")),
        Ok(Bytes::from_static(b"chunk-2")),
    ]);

    let response = client
        .put("https://api.test/upload")
        .body_stream(chunks, None)
        .retry_policy(fast_retry(3))
        .send()
        .await
        .expect("status response is returned");

    assert_eq!(response.status(), 503);
    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body, Bytes::from_static(b"chunk-1chunk-2"));
    assert!(requests[0].headers.get(CONTENT_LENGTH).is_none());
}

#[tokio::test]
async fn streaming_body_cannot_follow_temporary_redirect() {
    let transport = ScriptedTransport::new(vec![redirect(307, "/again")]);
    let chunks = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(
        b"once",
    ))]);

    let error = transport
        .client()
        .put("https://api.test/upload")
        .body_stream(chunks, Some(4))
        .send()
        .await
        .expect_err("stream cannot be replayed");

    assert!(matches!(error, Error::RedirectBodyNotReplayable { .. }));
}

#[tokio::test]
async fn invalid_proxy_fails_without_direct_fallback() {
    let transport = ScriptedTransport::new(vec![respond(200)]);
    let error = transport
        .client()
        .get("https://api.test/")
        .proxy("ftp://proxy.test:2121")
        .send()
        .await
        .expect_err("unsupported proxy scheme");

    assert_eq!(error.code(), ErrorCode::InvalidProxy);
    assert_eq!(error.kind(), ErrorKind::Proxy);
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn socks5_proxy_reaches_transport() {
    let transport = ScriptedTransport::new(vec![respond(200), respond(200)]);
    let client = transport.client();
    client
        .get("https://api.test/")
        .proxy("socks5://user:pw@proxy.test")
        .send()
        .await
        .expect("request through socks5 proxy");
    client
        .get("http://api.test/")
        .proxy("socks5h://proxy.test:9050")
        .send()
        .await
        .expect("request through socks5h proxy");

    let requests = transport.requests();
    assert_eq!(requests[0].proxy.as_deref(), Some("socks5://proxy.test:1080"));
    assert_eq!(requests[1].proxy.as_deref(), Some("socks5h://proxy.test:9050"));
    assert!(requests[0].headers.get("proxy-authorization").is_none());
}

#[tokio::test]
async fn explicit_proxy_reaches_transport() {
    let transport = ScriptedTransport::new(vec![respond(200)]);
    transport
        .client()
        .get("https://api.test/")
        .proxy("http://user:pw@proxy.test:3128")
        .send()
        .await
        .expect("request through proxy");

    let requests = transport.requests();
    assert_eq!(requests[0].proxy.as_deref(), Some("http://proxy.test:3128"));
}

#[tokio::test]
async fn no_proxy_rules_bypass_explicit_proxy() {
    let transport = ScriptedTransport::new(vec![respond(200)]);
    let client = Client::builder()
        .transport(transport.clone())
        .proxy_from_env(false)
        .proxy("http://proxy.test:3128")
        .no_proxy(["internal.test"])
        .build();

    client
        .get("https://internal.test/")
        .send()
        .await
        .expect("direct request");
    assert!(transport.requests()[0].proxy.is_none());
}

#[tokio::test]
async fn response_cookies_are_sent_on_next_request() {
    let transport = ScriptedTransport::new(vec![
        respond_with(200, &[("set-cookie", "sid=abc; Path=/")], ""),
        respond(200),
    ]);
    let client = transport.client();

    client.get("https://api.test/login").send().await.expect("login");
    client.get("https://api.test/me").send().await.expect("me");

    let requests = transport.requests();
    assert!(requests[0].headers.get(COOKIE).is_none());
    assert_eq!(requests[1].headers.get(COOKIE).expect("cookie"), "sid=abc");
    assert_eq!(client.session().cookie("sid").expect("stored").value, "abc");
}

#[tokio::test]
async fn cookies_from_redirect_hops_are_kept() {
    let transport = ScriptedTransport::new(vec![
        respond_with(302, &[("location", "/home"), ("set-cookie", "hop=1")], ""),
        respond(200),
    ]);
    let client = transport.client();

    client.get("https://api.test/login").send().await.expect("login");

    let requests = transport.requests();
    assert_eq!(requests[1].headers.get(COOKIE).expect("cookie"), "hop=1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_converge_on_one_cookie_jar() {
    let steps = (0..8)
        .map(|index| Step::Respond {
            status: 200,
            headers: vec![("set-cookie", format!("c{index}={index}"))],
            body: Bytes::new(),
            delay: Duration::from_millis(5),
        })
        .collect();
    let transport = ScriptedTransport::new(steps);
    let client = transport.client();

    let tasks: Vec<_> = (0..8)
        .map(|index| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .get(format!("https://api.test/{index}"))
                    .send()
                    .await
                    .map(|response| response.status())
            })
        })
        .collect();
    for task in tasks {
        let status = task.await.expect("join").expect("request");
        assert_eq!(status, 200);
    }

    let cookies = client.session().cookies();
    assert_eq!(cookies.len(), 8);
}

#[tokio::test]
async fn streamed_gzip_body_is_decoded() {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"hello gzip stream").expect("write");
    let compressed = encoder.finish().expect("finish");
    let transport = ScriptedTransport::new(vec![Step::Respond {
        status: 200,
        headers: vec![("content-encoding", "gzip".to_owned())],
        body: Bytes::from(compressed.clone()),
        delay: Duration::ZERO,
    }]);

    let mut response = transport
        .client()
        .get("https://api.test/gz")
        .send()
        .await
        .expect("send");
    let mut stream = response.body().expect("stream");
    assert!(stream.decodes());
    let mut decoded = Vec::new();
    while let Some(chunk) = stream.next().await {
        decoded.extend_from_slice(&chunk.expect("chunk"));
    }
    assert_eq!(decoded, b"hello gzip stream");
}

#[tokio::test]
async fn streamed_decode_failure_names_the_coding() {
    let transport = ScriptedTransport::new(vec![Step::Respond {
        status: 200,
        headers: vec![("content-encoding", "deflate".to_owned())],
        body: Bytes::from_static(b"not a zlib stream"),
        delay: Duration::ZERO,
    }]);

    let mut response = transport
        .client()
        .get("https://api.test/deflated")
        .send()
        .await
        .expect("send");
    let mut stream = response.body().expect("stream");
    assert!(stream.decodes());
    let error = loop {
        match stream.next().await {
            Some(Ok(_)) => continue,
            Some(Err(error)) => break error,
            None => panic!("corrupt deflate body decoded cleanly"),
        }
    };
    match error {
        Error::DecodeContentEncoding { encoding, .. } => assert_eq!(encoding, "deflate"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn compress_gzips_buffered_request_bodies() {
    let transport = ScriptedTransport::new(vec![respond(200)]);
    transport
        .client()
        .post("https://api.test/logs")
        .text("compress me please")
        .compress(true)
        .send()
        .await
        .expect("send");

    let request = &transport.requests()[0];
    assert_eq!(
        request.headers.get(CONTENT_ENCODING).expect("content encoding"),
        "gzip"
    );
    let mut decoder = flate2::read::GzDecoder::new(&request.body[..]);
    let mut text = String::new();
    std::io::Read::read_to_string(&mut decoder, &mut text).expect("gunzip");
    assert_eq!(text, "compress me please");
}

#[tokio::test]
async fn write_to_reports_progress_against_content_length() {
    let transport = ScriptedTransport::new(vec![respond_with(
        200,
        &[("content-length", "10")],
        "0123456789",
    )]);
    let mut response = transport
        .client()
        .get("https://api.test/file")
        .send()
        .await
        .expect("send");

    let mut sink = Vec::new();
    let mut reports = Vec::new();
    let written = response
        .write_to_with_progress(&mut sink, |progress| reports.push(progress))
        .await
        .expect("write");

    assert_eq!(written, 10);
    assert_eq!(sink, b"0123456789");
    let last = reports.last().expect("progress reported");
    assert_eq!(last.total, Some(10));
    assert_eq!(last.percent(), Some(100.0));
}

#[tokio::test]
async fn get_reads_fields_by_json_pointer() {
    let transport = ScriptedTransport::new(vec![respond_with(
        200,
        &[("content-type", "application/json")],
        r#"{"user":{"name":"ada","roles":["admin","ops"]}}"#,
    )]);

    let mut response = transport
        .client()
        .get("https://api.test/me")
        .send()
        .await
        .expect("send");
    assert_eq!(
        response.get("/user/name").await.expect("get"),
        Some(serde_json::json!("ada"))
    );
    assert_eq!(
        response.get("/user/roles/1").await.expect("get"),
        Some(serde_json::json!("ops"))
    );
    assert_eq!(response.get("/user/email").await.expect("get"), None);
    assert_eq!(
        response.value().await.expect("value")["user"]["roles"][0],
        "admin"
    );
}

#[tokio::test]
async fn malformed_json_is_a_decoding_error() {
    let transport = ScriptedTransport::new(vec![respond_with(200, &[], "not json")]);
    let mut response = transport
        .client()
        .get("https://api.test/bad")
        .send()
        .await
        .expect("send");

    let error = response
        .json::<serde_json::Value>()
        .await
        .expect_err("body is not json");
    assert_eq!(error.kind(), ErrorKind::Decoding);
    match error {
        Error::Deserialize { body, .. } => assert_eq!(body, "not json"),
        other => panic!("unexpected error variant: {other}"),
    }
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let transport = ScriptedTransport::new(vec![respond_with(200, &[], "0123456789")]);
    let mut response = transport
        .client()
        .get("https://api.test/big")
        .max_response_body_bytes(4)
        .send()
        .await
        .expect("send");

    let error = response.bytes().await.expect_err("body exceeds limit");
    assert!(matches!(
        error,
        Error::ResponseBodyTooLarge {
            limit_bytes: 4,
            ..
        }
    ));
}

#[tokio::test]
async fn error_for_status_carries_body_text() {
    let transport = ScriptedTransport::new(vec![respond_with(404, &[], "missing item")]);
    let response = transport
        .client()
        .get("https://api.test/items/9")
        .send()
        .await
        .expect("send");
    assert!(!response.ok());
    assert_eq!(response.status_text(), "Not Found");

    let error = response.error_for_status().await.expect_err("404 is an error");
    match &error {
        Error::HttpStatus { status, body, .. } => {
            assert_eq!(*status, 404);
            assert_eq!(body, "missing item");
        }
        other => panic!("unexpected error variant: {other}"),
    }
    assert_eq!(error.status(), Some(404));
}

#[tokio::test]
async fn missing_method_is_a_config_error() {
    let transport = ScriptedTransport::new(Vec::new());
    let config = RequestConfig {
        url: Some("https://api.test/".to_owned()),
        ..RequestConfig::default()
    };
    let error = transport
        .client()
        .execute(config)
        .await
        .expect_err("method is required");
    assert!(matches!(error, Error::MissingMethod));
    assert_eq!(error.kind(), ErrorKind::Config);
}
