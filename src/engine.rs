use std::sync::Arc;

use http::header::{HeaderValue, USER_AGENT};
use http::{HeaderMap, Method, StatusCode};
use tracing::{Instrument, debug, info_span};
use url::Url;

use crate::body::{OutgoingBody, encode_body};
use crate::codec::StructuredCodec;
use crate::config::RequestConfig;
use crate::error::Error;
use crate::orchestrator::AttemptPlan;
use crate::proxy::{EnvProxy, NoProxyRule, ProxyConfig, should_bypass_proxy};
use crate::response::{Response, ResponseContext};
use crate::session::Session;
use crate::signal::Signal;
use crate::transport::Transport;
use crate::util::{
    ensure_accept_encoding, is_redirect_status, redact_uri_for_logs, redirect_location,
    same_origin, sanitize_headers_for_redirect,
};

/// Shared state behind every clone of a [`crate::Client`].
pub(crate) struct ClientInner {
    pub(crate) defaults: RequestConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) session: Session,
    pub(crate) codec: Arc<dyn StructuredCodec>,
    pub(crate) user_agent: HeaderValue,
    pub(crate) env_proxy: Option<EnvProxy>,
    pub(crate) no_proxy_rules: Vec<NoProxyRule>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CallState {
    Merging,
    ProxyResolve,
    Attempting,
    RedirectFollowing,
    Success,
    Failed,
}

impl CallState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Merging => "merging",
            Self::ProxyResolve => "proxy_resolve",
            Self::Attempting => "attempting",
            Self::RedirectFollowing => "redirect_following",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

fn enter(state: CallState, method: &Method, uri: &str) {
    debug!(state = state.as_str(), method = %method, uri, "http call state");
}

impl ClientInner {
    /// Runs one logical request: merge, proxy resolution, attempts and redirects.
    pub(crate) async fn execute(&self, request: RequestConfig) -> Result<Response, Error> {
        let config = self.defaults.merge(&request);
        let method = config.method.clone().unwrap_or(Method::GET);
        let log_uri = redact_uri_for_logs(config.url.as_deref().unwrap_or_default());
        let span = info_span!("fetchx.call", method = %method, uri = %log_uri);

        let result = self.follow(config).instrument(span).await;
        match &result {
            Ok(response) => debug!(
                state = CallState::Success.as_str(),
                status = response.status().as_u16(),
                redirects = response.redirect_count(),
                uri = %redact_uri_for_logs(response.url().as_str()),
                "http call finished"
            ),
            Err(error) => debug!(
                state = CallState::Failed.as_str(),
                code = error.code().as_str(),
                error = %error,
                "http call failed"
            ),
        }
        result
    }

    async fn follow(&self, config: RequestConfig) -> Result<Response, Error> {
        let timeout = config.effective_timeout();
        let signal = Signal::new(config.cancel.as_ref(), timeout);
        let redirect_policy = config.redirect_policy();
        let retry = config.effective_retry();
        let max_body_bytes = config.effective_max_response_body_bytes();

        let mut hop = config;
        let body = hop.body.take().unwrap_or_default();
        let mut outgoing = encode_body(
            &body,
            &mut hop.headers,
            self.codec.as_ref(),
            hop.compress.unwrap_or(false),
        )?;
        let mut redirect_count = 0_usize;

        loop {
            let target = hop.validate()?;
            enter(
                CallState::Merging,
                &target.method,
                &redact_uri_for_logs(target.url.as_str()),
            );
            let prepared = self.session.apply_to(&hop, &target.url).validate()?;
            let log_uri = redact_uri_for_logs(prepared.url.as_str());

            let mut headers = prepared.headers;
            if !headers.contains_key(USER_AGENT) {
                headers.insert(USER_AGENT, self.user_agent.clone());
            }
            ensure_accept_encoding(&mut headers);

            enter(CallState::ProxyResolve, &prepared.method, &log_uri);
            let proxy = self.resolve_proxy(hop.proxy.as_deref(), &prepared.url)?;

            enter(CallState::Attempting, &prepared.method, &log_uri);
            let plan = AttemptPlan {
                transport: self.transport.as_ref(),
                method: &prepared.method,
                uri: &prepared.uri,
                log_uri: &log_uri,
                headers: &headers,
                body: &outgoing,
                proxy: proxy.as_ref(),
                retry: &retry,
                attempt_timeout: hop.attempt_timeout,
                timeout,
                signal: &signal,
            };
            let response = plan.run().await?;
            self.session.update_from(response.headers(), &prepared.url);

            let status = response.status();
            if !redirect_policy.follows() || !is_redirect_status(status) {
                return Ok(Response::new(
                    response,
                    ResponseContext {
                        url: prepared.url,
                        method: prepared.method,
                        redirect_count,
                        codec: Arc::clone(&self.codec),
                        max_body_bytes,
                        signal,
                        timeout,
                    },
                ));
            }

            let next_url = redirect_target(
                response.headers(),
                status,
                &prepared.method,
                &prepared.url,
                &log_uri,
            )?;
            if redirect_count >= redirect_policy.max_redirects() {
                return Err(Error::TooManyRedirects {
                    max_redirects: redirect_policy.max_redirects(),
                    method: prepared.method,
                    uri: log_uri,
                });
            }
            drop(response);

            let (next_method, keep_body) =
                redirect_method(status, &prepared.method, redirect_policy.preserves_post());
            if keep_body && !outgoing.is_empty() && !outgoing.is_replayable() {
                return Err(Error::RedirectBodyNotReplayable {
                    method: prepared.method,
                    uri: log_uri,
                });
            }
            let body_dropped = !keep_body && !outgoing.is_empty();
            if !keep_body {
                outgoing = OutgoingBody::Empty;
            }

            let same_origin_redirect = same_origin(&prepared.url, &next_url);
            sanitize_headers_for_redirect(&mut hop.headers, body_dropped, same_origin_redirect);
            if !same_origin_redirect {
                hop.auth = None;
            }

            redirect_count += 1;
            debug!(
                state = CallState::RedirectFollowing.as_str(),
                status = status.as_u16(),
                from = %log_uri,
                to = %redact_uri_for_logs(next_url.as_str()),
                method = %next_method,
                redirect_count,
                "following redirect"
            );
            hop.method = Some(next_method);
            hop.url = Some(next_url.to_string());
            hop.base_url = None;
            hop.query.clear();
            hop.params.clear();
        }
    }

    /// Explicit proxy first, then the environment when enabled. Never falls
    /// back to a direct connection on an unusable proxy url.
    fn resolve_proxy(
        &self,
        explicit: Option<&str>,
        url: &Url,
    ) -> Result<Option<ProxyConfig>, Error> {
        if should_bypass_proxy(&self.no_proxy_rules, url) {
            return Ok(None);
        }
        if let Some(explicit) = explicit {
            return ProxyConfig::parse(explicit).map(Some);
        }
        self.env_proxy
            .as_ref()
            .and_then(|env| env.proxy_for(url))
            .map(ProxyConfig::parse)
            .transpose()
    }
}

fn redirect_target(
    headers: &HeaderMap,
    status: StatusCode,
    method: &Method,
    current: &Url,
    log_uri: &str,
) -> Result<Url, Error> {
    let location = redirect_location(headers).ok_or_else(|| Error::MissingRedirectLocation {
        status: status.as_u16(),
        method: method.clone(),
        uri: log_uri.to_owned(),
    })?;
    let invalid = || Error::InvalidRedirectLocation {
        location: redact_uri_for_logs(location),
        method: method.clone(),
        uri: log_uri.to_owned(),
    };
    let next = current.join(location.trim()).map_err(|_| invalid())?;
    if !matches!(next.scheme(), "http" | "https") || next.host_str().is_none() {
        return Err(invalid());
    }
    Ok(next)
}

/// Method for the next hop and whether the request body travels with it.
fn redirect_method(status: StatusCode, method: &Method, preserve_post: bool) -> (Method, bool) {
    match status {
        StatusCode::SEE_OTHER if *method == Method::HEAD => (Method::HEAD, false),
        StatusCode::SEE_OTHER => (Method::GET, false),
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => (method.clone(), true),
        _ if *method == Method::POST && !preserve_post => (Method::GET, false),
        _ => (method.clone(), true),
    }
}
