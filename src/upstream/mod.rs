//! Client for the upstream fatigue telemetry integrator.
//!
//! In live mode the client authenticates, submits a paginated time-range
//! query scoped to the configured shift windows and follows pagination up
//! to a hard page cap. In mock mode it synthesizes plausible payloads for
//! the configured source ids instead. Either way callers receive
//! [`RawEvent`]s; normalization happens downstream.
//!
//! Every call is bounded by a per-call deadline. A 401 in `auto` auth mode
//! triggers exactly one re-login and one retry of the same request.

mod mock;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{truncate_body, UpstreamError};
use crate::fields;
use crate::models::{DeviceHealth, Mode, RawEvent};
use crate::shift::ShiftConfig;

// ---

/// How requests authenticate against the integrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Log in with username/password and send the returned bearer token.
    Auto,
    /// Send a static token as a bearer token.
    Bearer,
    /// Send a static token in a named header.
    Token,
    /// HTTP basic auth.
    Basic,
    /// Username/password inside every JSON request body.
    Body,
    None,
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "login" => Ok(AuthMode::Auto),
            "bearer" => Ok(AuthMode::Bearer),
            "token" | "header" => Ok(AuthMode::Token),
            "basic" => Ok(AuthMode::Basic),
            "body" | "credentials" => Ok(AuthMode::Body),
            "none" => Ok(AuthMode::None),
            other => Err(format!(
                "unknown auth mode '{other}' (expected auto|bearer|token|basic|body|none)"
            )),
        }
    }
}

/// Connection and query settings for the integrator.
#[derive(Clone)]
pub struct UpstreamConfig {
    // ---
    pub base_url: String,
    pub login_path: String,
    pub events_path: String,
    pub devices_path: String,
    pub auth_mode: AuthMode,
    pub username: Option<String>,
    pub password: Option<String>,
    pub static_token: Option<String>,
    pub token_header: String,
    /// Deadline applied to every call without a more specific override.
    pub timeout: Duration,
    pub events_timeout: Option<Duration>,
    pub devices_timeout: Option<Duration>,
    pub page_size: u32,
    /// Hard cap on pages followed per fetch.
    pub max_pages: u32,
    /// Column the integrator filters the date range on.
    pub range_date_columns: String,
    /// Column the integrator filters source ids on.
    pub filter_column: String,
    /// Source ids to synthesize in mock mode and to filter on in live mode.
    pub source_ids: Vec<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            login_path: "/api/auth/login".to_string(),
            events_path: "/api/fatigue/events".to_string(),
            devices_path: "/api/devices".to_string(),
            auth_mode: AuthMode::Auto,
            username: None,
            password: None,
            static_token: None,
            token_header: "x-token".to_string(),
            timeout: Duration::from_secs(10),
            events_timeout: None,
            devices_timeout: None,
            page_size: 100,
            max_pages: 50,
            range_date_columns: "alarm_time".to_string(),
            filter_column: "device_id".to_string(),
            source_ids: Vec::new(),
        }
    }
}

fn redact(secret: &Option<String>) -> &'static str {
    if secret.is_some() {
        "****"
    } else {
        "<unset>"
    }
}

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("login_path", &self.login_path)
            .field("events_path", &self.events_path)
            .field("devices_path", &self.devices_path)
            .field("auth_mode", &self.auth_mode)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("static_token", &redact(&self.static_token))
            .field("token_header", &self.token_header)
            .field("timeout", &self.timeout)
            .field("page_size", &self.page_size)
            .field("max_pages", &self.max_pages)
            .field("source_ids", &self.source_ids)
            .finish()
    }
}

impl UpstreamConfig {
    // ---
    /// Check that live mode has what its auth mode needs.
    pub fn validate_live(&self) -> Result<(), UpstreamError> {
        // ---
        if self.base_url.trim().is_empty() {
            return Err(UpstreamError::Config("INTEGRATOR_BASE_URL is required in live mode".into()));
        }
        let has_credentials = self.username.is_some() && self.password.is_some();
        match self.auth_mode {
            AuthMode::Auto | AuthMode::Basic | AuthMode::Body if !has_credentials => Err(
                UpstreamError::Config("username and password are required for this auth mode".into()),
            ),
            AuthMode::Bearer | AuthMode::Token if self.static_token.is_none() => Err(
                UpstreamError::Config("a static token is required for this auth mode".into()),
            ),
            _ => Ok(()),
        }
    }
}

/// Time range and source filter for one live fetch, in integrator-local time.
#[derive(Debug, Clone, PartialEq)]
pub struct EventQuery {
    pub range_start: NaiveDateTime,
    pub range_end: NaiveDateTime,
    pub source_ids: Vec<String>,
}

impl EventQuery {
    /// Query covering the union of all shift windows on the current local date.
    pub fn for_shift_day(shift: &ShiftConfig, source_ids: Vec<String>, now: DateTime<Utc>) -> Self {
        let (range_start, range_end) = shift.union_range(shift.local_now(now).date());
        Self {
            range_start,
            range_end,
            source_ids,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Login,
    Events,
    Devices,
}

impl Endpoint {
    fn name(self) -> &'static str {
        match self {
            Endpoint::Login => "login",
            Endpoint::Events => "events",
            Endpoint::Devices => "devices",
        }
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct EventsRequest<'a> {
    range_date_start: String,
    range_date_end: String,
    range_date_columns: &'a str,
    page: u32,
    page_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter_columns: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter_value: Option<String>,
}

#[derive(Deserialize)]
struct EventsEnvelope {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    message: Option<Value>,
    #[serde(default)]
    data: Option<EventsData>,
}

#[derive(Deserialize)]
struct EventsData {
    #[serde(default)]
    list: Vec<Value>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Deserialize)]
struct Pagination {
    #[serde(default)]
    total_pages: Option<Value>,
}

fn default_success() -> bool {
    true
}

fn lenient_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().map(|v| v.min(u64::from(u32::MAX)) as u32),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Decode one events page into its items and the advertised page count.
fn parse_events_page(body: Value) -> Result<(Vec<Value>, u32), UpstreamError> {
    // ---
    let envelope: EventsEnvelope = serde_json::from_value(body)
        .map_err(|e| UpstreamError::Malformed(format!("events envelope: {e}")))?;
    if !envelope.success {
        let message = envelope
            .message
            .map(|m| m.as_str().map(str::to_string).unwrap_or_else(|| m.to_string()))
            .unwrap_or_else(|| "success=false".to_string());
        return Err(UpstreamError::Rejected(truncate_body(&message)));
    }
    let Some(data) = envelope.data else {
        return Ok((Vec::new(), 1));
    };
    let total_pages = data
        .pagination
        .and_then(|p| p.total_pages)
        .as_ref()
        .and_then(lenient_u32)
        .unwrap_or(1)
        .max(1);
    Ok((data.list, total_pages))
}

/// Items of a device inventory response, whatever envelope it uses.
fn device_items(body: &Value) -> Vec<Value> {
    // ---
    ["data.list", "data.devices", "data", "list", "devices"]
        .iter()
        .find_map(|path| {
            path.split('.')
                .try_fold(body, |v, key| v.get(key))
                .and_then(Value::as_array)
        })
        .or_else(|| body.as_array())
        .cloned()
        .unwrap_or_default()
}

fn parse_device(item: &Value) -> Option<DeviceHealth> {
    let device_id = fields::SOURCE_ID
        .resolve_str(item)
        .or_else(|| fields::IDENTITY.resolve_str(item))?;
    Some(DeviceHealth {
        device_id,
        name: fields::DEVICE_NAME.resolve_str(item),
        online: fields::DEVICE_ONLINE.resolve_bool(item).unwrap_or(false),
        last_seen: fields::LAST_SEEN.resolve_str(item),
    })
}

// ---

/// Integrator client. The bearer token obtained in `auto` mode is cached for
/// the lifetime of the client and shared by all of its calls.
pub struct UpstreamClient {
    http: reqwest::Client,
    cfg: UpstreamConfig,
    token: RwLock<Option<String>>,
}

impl UpstreamClient {
    // ---
    pub fn new(cfg: UpstreamConfig) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .connect_timeout(cfg.timeout)
            .build()?;
        Ok(Self {
            http,
            cfg,
            token: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.cfg
    }

    fn path(&self, endpoint: Endpoint) -> &str {
        match endpoint {
            Endpoint::Login => &self.cfg.login_path,
            Endpoint::Events => &self.cfg.events_path,
            Endpoint::Devices => &self.cfg.devices_path,
        }
    }

    fn timeout_for(&self, endpoint: Endpoint) -> Duration {
        let specific = match endpoint {
            Endpoint::Login => None,
            Endpoint::Events => self.cfg.events_timeout,
            Endpoint::Devices => self.cfg.devices_timeout,
        };
        specific.unwrap_or(self.cfg.timeout)
    }

    fn url(&self, endpoint: Endpoint) -> String {
        format!(
            "{}/{}",
            self.cfg.base_url.trim_end_matches('/'),
            self.path(endpoint).trim_start_matches('/')
        )
    }

    /// Fetch one batch of raw events for the given mode.
    ///
    /// A live fetch is all-or-nothing: an error on any page discards the
    /// pages already read and the cached event list stays as it was.
    pub async fn fetch_batch(
        &self,
        mode: Mode,
        query: &EventQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<RawEvent>, UpstreamError> {
        // ---
        match mode {
            Mode::Mock => {
                let ids = if query.source_ids.is_empty() {
                    &self.cfg.source_ids
                } else {
                    &query.source_ids
                };
                Ok(mock::synthesize_events(ids, now))
            }
            Mode::Live => self.fetch_live(query, now).await,
        }
    }

    async fn fetch_live(
        &self,
        query: &EventQuery,
        received_at: DateTime<Utc>,
    ) -> Result<Vec<RawEvent>, UpstreamError> {
        // ---
        let mut all = Vec::new();
        let mut page = 1u32;

        loop {
            if page > self.cfg.max_pages {
                warn!(
                    max_pages = self.cfg.max_pages,
                    fetched = all.len(),
                    "hit upstream page cap, stopping pagination"
                );
                break;
            }

            let body = self.events_request(query, page)?;
            let response = self.send(Endpoint::Events, Some(body)).await.inspect_err(|e| {
                warn!(page, discarded = all.len(), error = %e, "upstream page failed, batch abandoned");
            })?;
            let (items, total_pages) = parse_events_page(response)?;
            debug!(page, total_pages, items = items.len(), "fetched events page");

            all.extend(
                items
                    .into_iter()
                    .map(|payload| RawEvent::new(payload, Mode::Live, received_at)),
            );

            if page >= total_pages {
                break;
            }
            page += 1;
        }

        info!(events = all.len(), pages = page.min(self.cfg.max_pages), "upstream fetch complete");
        Ok(all)
    }

    fn events_request(&self, query: &EventQuery, page: u32) -> Result<Value, UpstreamError> {
        // ---
        const FMT: &str = "%Y-%m-%d %H:%M:%S";
        let filter = !query.source_ids.is_empty();
        let request = EventsRequest {
            range_date_start: query.range_start.format(FMT).to_string(),
            range_date_end: query.range_end.format(FMT).to_string(),
            range_date_columns: &self.cfg.range_date_columns,
            page,
            page_size: self.cfg.page_size,
            filter_columns: filter.then_some(self.cfg.filter_column.as_str()),
            filter_value: filter.then(|| query.source_ids.join(",")),
        };
        serde_json::to_value(&request)
            .map_err(|e| UpstreamError::Malformed(format!("encoding events request: {e}")))
    }

    /// Device inventory with online/offline state.
    pub async fn fetch_devices(&self, mode: Mode) -> Result<Vec<DeviceHealth>, UpstreamError> {
        // ---
        if mode == Mode::Mock {
            return Ok(mock::synthesize_devices(&self.cfg.source_ids));
        }
        let body = self.send(Endpoint::Devices, None).await?;
        let items = device_items(&body);
        let devices: Vec<DeviceHealth> = items.iter().filter_map(parse_device).collect();
        if devices.len() < items.len() {
            debug!(
                skipped = items.len() - devices.len(),
                "device entries without an id were skipped"
            );
        }
        Ok(devices)
    }

    // --- auth

    /// Log in and cache the returned bearer token.
    pub async fn login(&self) -> Result<(), UpstreamError> {
        // ---
        let (Some(username), Some(password)) = (&self.cfg.username, &self.cfg.password) else {
            return Err(UpstreamError::Config("login requires username and password".into()));
        };
        let body = serde_json::to_value(LoginRequest { username, password })
            .map_err(|e| UpstreamError::Malformed(format!("encoding login request: {e}")))?;

        let response = self.send_once(Endpoint::Login, Some(&body)).await?;
        let token = fields::ACCESS_TOKEN
            .resolve_str(&response)
            .ok_or_else(|| UpstreamError::Malformed("login response carried no token".into()))?;

        *self.token.write() = Some(token);
        info!("authenticated with upstream");
        Ok(())
    }

    fn cached_token(&self) -> Option<String> {
        self.token.read().clone()
    }

    fn invalidate_token(&self) {
        *self.token.write() = None;
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, UpstreamError> {
        // ---
        let missing = || UpstreamError::Config("no static token configured".into());
        Ok(match self.cfg.auth_mode {
            AuthMode::Auto => match self.cached_token() {
                Some(token) => request.bearer_auth(token),
                None => request,
            },
            AuthMode::Bearer => request.bearer_auth(self.cfg.static_token.as_ref().ok_or_else(missing)?),
            AuthMode::Token => request.header(
                self.cfg.token_header.as_str(),
                self.cfg.static_token.as_ref().ok_or_else(missing)?,
            ),
            AuthMode::Basic => request.basic_auth(
                self.cfg.username.clone().unwrap_or_default(),
                self.cfg.password.clone(),
            ),
            AuthMode::Body | AuthMode::None => request,
        })
    }

    fn with_body_credentials(&self, mut body: Value) -> Value {
        if self.cfg.auth_mode == AuthMode::Body {
            if let Value::Object(map) = &mut body {
                map.insert("username".into(), json!(self.cfg.username));
                map.insert("password".into(), json!(self.cfg.password));
            }
        }
        body
    }

    /// Authorized call; in `auto` mode a 401 triggers one re-login and one retry.
    async fn send(&self, endpoint: Endpoint, body: Option<Value>) -> Result<Value, UpstreamError> {
        // ---
        let body = body.map(|b| self.with_body_credentials(b));
        if self.cfg.auth_mode == AuthMode::Auto && self.cached_token().is_none() {
            self.login().await?;
        }
        match self.send_once(endpoint, body.as_ref()).await {
            Err(UpstreamError::Auth(reason)) if self.cfg.auth_mode == AuthMode::Auto => {
                warn!(endpoint = endpoint.name(), %reason, "upstream rejected token, re-authenticating");
                self.invalidate_token();
                self.login().await?;
                match self.send_once(endpoint, body.as_ref()).await {
                    Err(UpstreamError::Auth(reason)) => Err(UpstreamError::Auth(format!(
                        "still unauthorized after re-authentication: {reason}"
                    ))),
                    other => other,
                }
            }
            other => other,
        }
    }

    /// One bounded request. 401 maps to [`UpstreamError::Auth`].
    async fn send_once(&self, endpoint: Endpoint, body: Option<&Value>) -> Result<Value, UpstreamError> {
        // ---
        let url = self.url(endpoint);
        let timeout = self.timeout_for(endpoint);

        let call = async {
            let request = match body {
                Some(body) => self.http.post(&url).json(body),
                None => self.http.get(&url),
            }
            .header("Accept", "application/json");
            let request = if endpoint == Endpoint::Login {
                request
            } else {
                self.authorize(request)?
            };

            let response = request.send().await?;
            let status = response.status();

            if status == reqwest::StatusCode::UNAUTHORIZED {
                let body = response.text().await.unwrap_or_default();
                return Err(UpstreamError::Auth(format!("HTTP 401: {}", truncate_body(&body))));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(UpstreamError::Http {
                    status: status.as_u16(),
                    body: truncate_body(&body),
                });
            }

            let value = response.json::<Value>().await.map_err(|e| {
                UpstreamError::Malformed(format!("decoding {} response: {e}", endpoint.name()))
            })?;
            Ok::<Value, UpstreamError>(value)
        };

        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| UpstreamError::Timeout {
                endpoint: endpoint.name(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }
}
