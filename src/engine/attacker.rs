//! Executes scenario actions against the target and turns each one into an
//! [`Outcome`].

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use cookie_store::CookieStore;
use crossbeam_channel::Sender;
use flate2::read::{GzDecoder, ZlibDecoder};
use http::header::{
    HeaderName, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, COOKIE,
    LOCATION, SET_COOKIE, USER_AGENT,
};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use regex::Regex;
use tokio::runtime::Runtime;
use url::Url;

use crate::cli::config::{Action, Scenario, ScenarioError};
use crate::engine::http_client::{read_body, HttpClient};
use crate::engine::scheduler::{Unit, UnitHandler};
use crate::vars::{Offsets, VariableStore};

pub const MAX_REDIRECTS: usize = 10;
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Result of one action.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Request path without the query string.
    pub path: String,
    pub success: bool,
    /// Time until response headers arrived. `None` when no response was
    /// received at all.
    pub elapsed: Option<Duration>,
}

impl Outcome {
    fn failed(path: String) -> Self {
        Self {
            path,
            success: false,
            elapsed: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("invalid url '{path}': {source}")]
    InvalidUrl {
        path: String,
        source: url::ParseError,
    },

    #[error("invalid method '{0}'")]
    InvalidMethod(String),

    #[error("invalid header '{0}'")]
    InvalidHeader(String),

    #[error("failed to build request: {0}")]
    Build(#[from] http::Error),

    #[error("request error: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to read body: {0}")]
    Body(#[from] hyper::Error),

    #[error("failed to decode {encoding} body: {source}")]
    Decode {
        encoding: String,
        source: std::io::Error,
    },

    #[error("invalid redirect location '{0}'")]
    InvalidRedirect(String),

    #[error("stopped after {0} redirects")]
    TooManyRedirects(usize),
}

/// Scan patterns compiled up front, indexed like the scenario's actions.
#[derive(Debug, Default)]
pub struct PatternCache {
    patterns: Vec<Option<Regex>>,
}

impl PatternCache {
    pub fn compile(actions: &[Action]) -> Result<Self, ScenarioError> {
        let patterns = actions
            .iter()
            .enumerate()
            .map(|(index, action)| {
                action
                    .scan
                    .as_deref()
                    .map(|pattern| {
                        Regex::new(pattern).map_err(|source| ScenarioError::InvalidScanPattern {
                            index,
                            path: action.path.clone(),
                            source,
                        })
                    })
                    .transpose()
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn get(&self, index: usize) -> Option<&Regex> {
        self.patterns.get(index).and_then(Option::as_ref)
    }
}

struct PreparedRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Bytes,
}

/// Runs every action of a scenario for one scheduled unit.
pub struct Attacker {
    scenario: Arc<Scenario>,
    base: Url,
    vars: Arc<VariableStore>,
    patterns: PatternCache,
    client: HttpClient,
    runtime: Arc<Runtime>,
}

impl Attacker {
    pub fn new(
        scenario: Arc<Scenario>,
        vars: Arc<VariableStore>,
        client: HttpClient,
        runtime: Arc<Runtime>,
    ) -> Result<Self, ScenarioError> {
        let base = scenario.base_url()?;
        let patterns = PatternCache::compile(&scenario.actions)?;
        Ok(Self {
            scenario,
            base,
            vars,
            patterns,
            client,
            runtime,
        })
    }

    /// Run action `index` on the calling thread. `cookies` carries the jar of
    /// the current unit.
    pub fn execute(&self, index: usize, offsets: &Offsets, cookies: &mut CookieStore) -> Outcome {
        match self.scenario.actions.get(index) {
            Some(action) => self
                .runtime
                .block_on(self.attack(index, action, offsets, cookies)),
            None => Outcome::failed(String::new()),
        }
    }

    async fn attack(
        &self,
        index: usize,
        action: &Action,
        offsets: &Offsets,
        cookies: &mut CookieStore,
    ) -> Outcome {
        let prepared = match self.prepare(action, offsets) {
            Ok(p) => p,
            Err(e) => {
                let path = self.vars.resolve(&action.path, offsets);
                tracing::warn!(path = %path, error = %e, "request not sent");
                return Outcome::failed(path);
            }
        };

        let path = prepared.url.path().to_string();
        tracing::info!(
            method = %prepared.method,
            path = %path,
            query = prepared.url.query().unwrap_or(""),
            "request"
        );

        let timeout = self.scenario.timeout();
        let started = Instant::now();
        let dispatched = tokio::time::timeout(timeout, self.dispatch(prepared, cookies)).await;
        let (response, url) = match dispatched {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                tracing::warn!(path = %path, error = %e, "request failed");
                return Outcome::failed(path);
            }
            Err(_) => {
                let e = RequestError::Timeout(timeout);
                tracing::warn!(path = %path, error = %e, "request failed");
                return Outcome::failed(path);
            }
        };
        let elapsed = started.elapsed();
        let status = response.status();
        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();

        let remaining = timeout.saturating_sub(elapsed);
        let scanning = self.patterns.get(index).is_some();
        let scanned = match tokio::time::timeout(remaining, self.inspect(index, response, &url)).await
        {
            Ok(Ok(matched)) => matched,
            Ok(Err(e)) => {
                tracing::warn!(path = %path, error = %e, "response failed");
                !scanning
            }
            Err(_) => {
                let e = RequestError::Timeout(timeout);
                tracing::warn!(path = %path, error = %e, "response failed");
                !scanning
            }
        };

        tracing::info!(
            path = %path,
            status = status.as_u16(),
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            content_length = %content_length,
            "response"
        );

        Outcome {
            path,
            success: scanned && is_success_status(status),
            elapsed: Some(elapsed),
        }
    }

    fn prepare(&self, action: &Action, offsets: &Offsets) -> Result<PreparedRequest, RequestError> {
        let resolved = self.vars.resolve(&action.path, offsets);
        let mut url = self
            .base
            .join(&resolved)
            .map_err(|source| RequestError::InvalidUrl {
                path: resolved.clone(),
                source,
            })?;

        // path query first, scenario query appended; duplicate keys are kept
        let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        pairs.extend(
            self.scenario
                .query_params
                .iter()
                .map(|(k, v)| (k.clone(), self.vars.resolve(v, offsets))),
        );
        url.set_query(None);
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }

        let method_name = action.method();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| RequestError::InvalidMethod(method_name.clone()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.scenario.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| RequestError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(&self.vars.resolve(value, offsets))
                .map_err(|_| RequestError::InvalidHeader(name.to_string()))?;
            headers.insert(name, value);
        }

        let body = match (&action.post_params, action.is_form_post()) {
            (Some(params), true) => {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(params.iter().map(|(k, v)| (k, self.vars.resolve(v, offsets))))
                    .finish();
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
                Bytes::from(encoded)
            }
            _ => action
                .content
                .as_deref()
                .map(|c| Bytes::from(self.vars.resolve(c, offsets)))
                .unwrap_or_default(),
        };

        if let Some(content_type) = &action.content_type {
            let value = HeaderValue::from_str(content_type)
                .map_err(|_| RequestError::InvalidHeader(CONTENT_TYPE.to_string()))?;
            headers.insert(CONTENT_TYPE, value);
        }

        let user_agent = HeaderValue::from_str(&self.scenario.user_agent)
            .map_err(|_| RequestError::InvalidHeader(USER_AGENT.to_string()))?;
        headers.insert(USER_AGENT, user_agent);
        let accept = if self.scenario.gzip { "gzip" } else { "" };
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static(accept));

        Ok(PreparedRequest {
            method,
            url,
            headers,
            body,
        })
    }

    /// Send the request, following redirects with the same headers.
    async fn dispatch(
        &self,
        prepared: PreparedRequest,
        cookies: &mut CookieStore,
    ) -> Result<(Response<Incoming>, Url), RequestError> {
        let PreparedRequest {
            mut method,
            mut url,
            mut headers,
            mut body,
        } = prepared;

        for _ in 0..=MAX_REDIRECTS {
            let mut req = Request::builder()
                .method(method.clone())
                .uri(url.as_str())
                .body(Full::new(body.clone()))?;
            *req.headers_mut() = headers.clone();
            if let Some(cookie) = cookie_header(cookies, &url) {
                req.headers_mut().insert(COOKIE, cookie);
            }

            let response = self.client.send(req).await?;
            for value in response.headers().get_all(SET_COOKIE) {
                if let Ok(raw) = value.to_str() {
                    let _ = cookies.parse(raw, &url);
                }
            }

            let status = response.status();
            if !is_followed_redirect(status) {
                return Ok((response, url));
            }
            let location = match response.headers().get(LOCATION) {
                Some(v) => v.to_str().unwrap_or_default().to_string(),
                None => return Ok((response, url)),
            };
            let next = url
                .join(&location)
                .map_err(|_| RequestError::InvalidRedirect(location.clone()))?;

            if matches!(
                status,
                StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER
            ) {
                if method != Method::HEAD {
                    method = Method::GET;
                }
                body = Bytes::new();
                headers.remove(CONTENT_TYPE);
            }

            let _ = read_body(response.into_body()).await;
            tracing::debug!(from = %url, to = %next, status = status.as_u16(), "redirect");
            url = next;
        }

        Err(RequestError::TooManyRedirects(MAX_REDIRECTS))
    }

    /// Read the body and apply the action's scan pattern. Returns whether the
    /// pattern matched, or `true` when the action has none.
    async fn inspect(
        &self,
        index: usize,
        response: Response<Incoming>,
        url: &Url,
    ) -> Result<bool, RequestError> {
        let (parts, body) = response.into_parts();
        let bytes = read_body(body).await?;
        let Some(pattern) = self.patterns.get(index) else {
            return Ok(true);
        };

        let decoded = decode_body(&parts.headers, bytes)?;
        let text = String::from_utf8_lossy(&decoded);
        if !pattern.is_match(&text) {
            tracing::warn!(url = %url, body = %text, "scan pattern did not match");
            return Ok(false);
        }

        for caps in pattern.captures_iter(&text) {
            for name in pattern.capture_names().flatten() {
                if name.is_empty() {
                    continue;
                }
                if let Some(m) = caps.name(name) {
                    self.vars.extract(name, m.as_str());
                }
            }
        }
        Ok(true)
    }
}

impl UnitHandler for Attacker {
    fn run_unit(&self, unit: &Unit, outcomes: &Sender<Outcome>) {
        let mut cookies = CookieStore::default();
        for index in 0..self.scenario.actions.len() {
            let outcome = self.execute(index, &unit.offsets, &mut cookies);
            let _ = outcomes.send(outcome);
        }
    }
}

/// Only 200 through 209 count, so `status / 10 == 20`.
fn is_success_status(status: StatusCode) -> bool {
    status.as_u16() / 10 == 20
}

fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

fn cookie_header(cookies: &CookieStore, url: &Url) -> Option<HeaderValue> {
    let value = cookies
        .get_request_values(url)
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("; ");
    if value.is_empty() {
        return None;
    }
    HeaderValue::from_str(&value).ok()
}

fn decode_body(headers: &HeaderMap, bytes: Bytes) -> Result<Vec<u8>, RequestError> {
    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();

    let mut out = Vec::new();
    let read = match encoding.as_str() {
        "gzip" | "x-gzip" => GzDecoder::new(&bytes[..]).read_to_end(&mut out),
        "deflate" => ZlibDecoder::new(&bytes[..]).read_to_end(&mut out),
        _ => return Ok(bytes.to_vec()),
    };
    read.map_err(|source| RequestError::Decode { encoding, source })?;
    Ok(out)
}
