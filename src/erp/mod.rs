//! ERP Service Layer session
//!
//! One HTTP client shared by the inventory authority and the posting
//! adapter. The session is explicit: `login` stores the `B1SESSION` cookie,
//! every request carries it, and a 401 triggers exactly one re-login.

use std::time::Duration;

use reqwest::{Method, StatusCode, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ErpConfig;

const API_PREFIX: &str = "/b1s/v1";

/// Upper bound on `odata.nextLink` pages followed for one query
const MAX_QUERY_PAGES: usize = 1_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErpError {
    /// Connect failure, timeout or broken response stream
    #[error("transport error: {0}")]
    Transport(String),

    #[error("login failed: {0}")]
    Login(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ErpError {
    /// Worth retrying: the server may answer differently next time
    pub fn is_transient(&self) -> bool {
        match self {
            ErpError::Transport(_) | ErpError::Login(_) => true,
            ErpError::Status { status, .. } => *status >= 500 || *status == 429,
            ErpError::Malformed(_) => false,
        }
    }
}

fn transport_error(e: reqwest::Error) -> ErpError {
    if e.is_timeout() {
        ErpError::Transport(format!("request timed out: {}", e))
    } else {
        ErpError::Transport(e.to_string())
    }
}

/// Raw response: status plus body text
#[derive(Debug, Clone)]
pub struct ErpResponse {
    pub status: u16,
    pub body: String,
}

impl ErpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ErpError> {
        serde_json::from_str(&self.body).map_err(|e| ErpError::Malformed(e.to_string()))
    }

    /// Fail unless the status is 2xx
    pub fn error_for_status(self) -> Result<Self, ErpError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ErpError::Status {
                status: self.status,
                body: self.body,
            })
        }
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(rename = "SessionId")]
    session_id: String,
}

/// One page of an OData collection
#[derive(Deserialize)]
struct ODataPage {
    #[serde(default)]
    value: Vec<Value>,
    #[serde(rename = "odata.nextLink", alias = "@odata.nextLink", default)]
    next_link: Option<String>,
}

/// Build a stored-query `ParamList`; single quotes are doubled
pub fn param_list(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(name, value)| format!("{}='{}'", name, value.replace('\'', "''")))
        .collect::<Vec<_>>()
        .join("&")
}

pub struct ServiceLayerClient {
    http: reqwest::Client,
    config: ErpConfig,
    /// `B1SESSION=<id>` once logged in
    session: Mutex<Option<String>>,
}

impl ServiceLayerClient {
    pub fn new(config: ErpConfig) -> Result<Self, ErpError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ErpError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            base_url = %config.base_url,
            company_db = %config.company_db,
            "Service Layer client created"
        );

        Ok(Self {
            http,
            config,
            session: Mutex::new(None),
        })
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }

    fn url(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        let path = path.strip_prefix("b1s/v1/").unwrap_or(path);
        format!("{}{}/{}", base, API_PREFIX, path)
    }

    /// Log in and store the session cookie
    pub async fn login(&self) -> Result<(), ErpError> {
        let mut session = self.session.lock().await;
        *session = Some(self.do_login().await?);
        Ok(())
    }

    async fn do_login(&self) -> Result<String, ErpError> {
        let body = json!({
            "CompanyDB": self.config.company_db,
            "UserName": self.config.username,
            "Password": self.config.password,
        });

        let response = self
            .http
            .post(self.url("Login"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ErpError::Login(transport_error(e).to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ErpError::Login(e.to_string()))?;

        if !status.is_success() {
            warn!(status = status.as_u16(), "Service Layer login rejected");
            return Err(ErpError::Login(format!("HTTP {}: {}", status.as_u16(), text)));
        }

        let login: LoginResponse =
            serde_json::from_str(&text).map_err(|e| ErpError::Login(e.to_string()))?;
        info!(company_db = %self.config.company_db, "Logged in to Service Layer");
        Ok(format!("B1SESSION={}", login.session_id))
    }

    async fn session_cookie(&self) -> Result<String, ErpError> {
        let mut session = self.session.lock().await;
        if let Some(cookie) = session.as_ref() {
            return Ok(cookie.clone());
        }
        let cookie = self.do_login().await?;
        *session = Some(cookie.clone());
        Ok(cookie)
    }

    /// Drop the session unless another task already replaced it
    async fn invalidate(&self, stale: &str) {
        let mut session = self.session.lock().await;
        if session.as_deref() == Some(stale) {
            *session = None;
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<ErpResponse, ErpError> {
        let url = self.url(path);
        let mut relogged = false;

        loop {
            let cookie = self.session_cookie().await?;

            let mut request = self
                .http
                .request(method.clone(), &url)
                .header(header::COOKIE, &cookie);
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await.map_err(transport_error)?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !relogged {
                warn!(%url, "Service Layer session expired, logging in again");
                self.invalidate(&cookie).await;
                relogged = true;
                continue;
            }

            let body = response.text().await.map_err(transport_error)?;
            debug!(%method, %url, status = status.as_u16(), "Service Layer call");
            return Ok(ErpResponse {
                status: status.as_u16(),
                body,
            });
        }
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> Result<ErpResponse, ErpError> {
        self.send(Method::POST, path, &[], Some(body)).await
    }

    pub async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<ErpResponse, ErpError> {
        self.send(Method::GET, path, query, None).await
    }

    /// Run a stored SQL query and collect every result row
    pub async fn query(&self, name: &str, params: &[(&str, &str)]) -> Result<Vec<Value>, ErpError> {
        let body = json!({ "ParamList": param_list(params) });
        let mut path = format!("SQLQueries('{}')/List", name);
        let mut rows = Vec::new();

        for _ in 0..MAX_QUERY_PAGES {
            let page: ODataPage = self.post_json(&path, &body).await?.error_for_status()?.json()?;
            rows.extend(page.value);
            match page.next_link {
                Some(next) => path = next,
                None => return Ok(rows),
            }
        }

        Err(ErpError::Malformed(format!(
            "query {} returned more than {} pages",
            name, MAX_QUERY_PAGES
        )))
    }
}
