//! HTTP transport abstraction.
//!
//! Endpoint code builds [`HttpRequest`] values and hands them to a
//! [`Transport`]; the one real implementation, [`HttpTransport`], drives
//! reqwest. Keeping the trait object-safe lets the tests substitute a
//! scripted transport and lets the session snapshot carry cookies without
//! reaching into reqwest internals.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};

use crate::errors::RequestError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Request model ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Read-timeout tier, chosen per endpoint by expected payload size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutTier {
    /// 15s — small JSON exchanges.
    Short,
    /// 30s — contact lists, sync batches, long-poll status checks.
    Medium,
    /// 60s — media transfer.
    Long,
}

impl TimeoutTier {
    pub fn duration(self) -> Duration {
        match self {
            Self::Short  => Duration::from_secs(15),
            Self::Medium => Duration::from_secs(30),
            Self::Long   => Duration::from_secs(60),
        }
    }
}

/// Request body shapes the protocol actually uses.
#[derive(Debug, Clone)]
pub enum Body {
    Empty,
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
    Multipart(MultipartForm),
}

/// A multipart form kept as plain data so non-HTTP transports can inspect it.
#[derive(Debug, Clone, Default)]
pub struct MultipartForm {
    pub fields: Vec<(String, String)>,
    pub file: Option<MultipartFile>,
}

#[derive(Debug, Clone)]
pub struct MultipartFile {
    /// Part name on the wire.
    pub part: String,
    pub filename: String,
    pub mime: String,
    pub data: Vec<u8>,
}

impl MultipartForm {
    pub fn text(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.fields.push((name.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    pub fn file(
        mut self,
        part: impl AsRef<str>,
        filename: impl AsRef<str>,
        mime: impl AsRef<str>,
        data: Vec<u8>,
    ) -> Self {
        self.file = Some(MultipartFile {
            part: part.as_ref().to_string(),
            filename: filename.as_ref().to_string(),
            mime: mime.as_ref().to_string(),
            data,
        });
        self
    }

    /// First text field with the given name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Body,
    pub timeout: TimeoutTier,
}

impl HttpRequest {
    pub fn get(url: impl AsRef<str>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl AsRef<str>) -> Self {
        Self::new(Method::Post, url)
    }

    fn new(method: Method, url: impl AsRef<str>) -> Self {
        Self {
            method,
            url: url.as_ref().to_string(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Body::Empty,
            timeout: TimeoutTier::Short,
        }
    }

    pub fn query(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.query.push((name.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    pub fn header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.headers.push((name.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Body::Json(body);
        self
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = Body::Form(fields);
        self
    }

    pub fn multipart(mut self, form: MultipartForm) -> Self {
        self.body = Body::Multipart(form);
        self
    }

    pub fn timeout(mut self, tier: TimeoutTier) -> Self {
        self.timeout = tier;
        self
    }

    /// First query pair with the given name.
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<serde_json::Value, RequestError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| RequestError::new(format!("invalid JSON body: {e}")))
    }
}

// ─── Transport trait ──────────────────────────────────────────────────────────

/// Object-safe HTTP seam.
///
/// Implementations own the cookie state: the webwx session lives as much in
/// cookies as in the explicit credentials, so the trait exposes lookup and
/// bulk import/export for snapshotting.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, req: HttpRequest) -> Result<HttpResponse, RequestError>;

    /// Current value of a named cookie, any domain.
    fn cookie(&self, name: &str) -> Option<String>;

    fn export_cookies(&self) -> Vec<CookieRecord>;

    fn import_cookies(&self, cookies: &[CookieRecord]);
}

// ─── Cookie jar ───────────────────────────────────────────────────────────────

/// One stored cookie, flat enough to serialize into the session snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    /// Unix seconds; `None` for session cookies.
    pub expires: Option<i64>,
}

/// Cookie store that can be enumerated and restored.
///
/// reqwest's bundled jar is write-only from the outside; the session snapshot
/// needs to read cookies back out, and the upload endpoint needs the
/// `webwx_data_ticket` value as a form field, so we keep our own records and
/// plug in via [`reqwest::cookie::CookieStore`].
#[derive(Debug, Default)]
pub struct SessionJar {
    records: RwLock<Vec<CookieRecord>>,
}

impl SessionJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.iter().find(|r| r.name == name).map(|r| r.value.clone())
    }

    pub fn export(&self) -> Vec<CookieRecord> {
        self.records.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn import(&self, cookies: &[CookieRecord]) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        for cookie in cookies {
            upsert(&mut records, cookie.clone());
        }
    }

    fn store(&self, record: CookieRecord) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        upsert(&mut records, record);
    }
}

fn upsert(records: &mut Vec<CookieRecord>, record: CookieRecord) {
    match records
        .iter_mut()
        .find(|r| r.name == record.name && r.domain == record.domain && r.path == record.path)
    {
        Some(existing) => *existing = record,
        None => records.push(record),
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim_start_matches('.');
    host == domain || host.ends_with(&format!(".{domain}"))
}

fn parse_set_cookie(header: &str, default_domain: &str) -> Option<CookieRecord> {
    let mut parts = header.split(';').map(str::trim);
    let (name, value) = parts.next()?.split_once('=')?;
    if name.is_empty() {
        return None;
    }
    let mut record = CookieRecord {
        name: name.trim().to_string(),
        value: value.trim().to_string(),
        domain: default_domain.to_string(),
        path: "/".to_string(),
        secure: false,
        expires: None,
    };
    for attr in parts {
        let (key, val) = attr.split_once('=').unwrap_or((attr, ""));
        match key.to_ascii_lowercase().as_str() {
            "domain" if !val.is_empty() => record.domain = val.to_string(),
            "path" if !val.is_empty() => record.path = val.to_string(),
            "secure" => record.secure = true,
            "max-age" => {
                if let Ok(secs) = val.parse::<i64>() {
                    record.expires = Some(chrono::Utc::now().timestamp() + secs);
                }
            }
            "expires" => {
                if let Ok(when) = chrono::DateTime::parse_from_rfc2822(val) {
                    record.expires = Some(when.timestamp());
                }
            }
            _ => {}
        }
    }
    Some(record)
}

impl reqwest::cookie::CookieStore for SessionJar {
    fn set_cookies(
        &self,
        cookie_headers: &mut dyn Iterator<Item = &HeaderValue>,
        url: &reqwest::Url,
    ) {
        let host = url.host_str().unwrap_or_default();
        for header in cookie_headers {
            let Ok(text) = header.to_str() else { continue };
            if let Some(record) = parse_set_cookie(text, host) {
                self.store(record);
            }
        }
    }

    fn cookies(&self, url: &reqwest::Url) -> Option<HeaderValue> {
        let host = url.host_str().unwrap_or_default();
        let path = url.path();
        let https = url.scheme() == "https";
        let now = chrono::Utc::now().timestamp();

        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let header = records
            .iter()
            .filter(|r| domain_matches(host, &r.domain))
            .filter(|r| path.starts_with(&r.path))
            .filter(|r| https || !r.secure)
            .filter(|r| r.expires.is_none_or(|t| t > now))
            .map(|r| format!("{}={}", r.name, r.value))
            .collect::<Vec<_>>()
            .join("; ");
        if header.is_empty() {
            return None;
        }
        HeaderValue::from_str(&header).ok()
    }
}

// ─── reqwest implementation ───────────────────────────────────────────────────

/// The production transport.
pub struct HttpTransport {
    client: reqwest::Client,
    jar: Arc<SessionJar>,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport").finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn new() -> Result<Self, RequestError> {
        let jar = Arc::new(SessionJar::new());
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("wxweb-client/", env!("CARGO_PKG_VERSION")))
            .cookie_provider(jar.clone())
            .build()?;
        Ok(Self { client, jar })
    }

    fn build(&self, req: HttpRequest) -> Result<reqwest::RequestBuilder, RequestError> {
        let mut builder = match req.method {
            Method::Get  => self.client.get(&req.url),
            Method::Post => self.client.post(&req.url),
        };
        builder = builder.query(&req.query).timeout(req.timeout.duration());
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        builder = match req.body {
            Body::Empty => builder,
            Body::Json(value) => builder.json(&value),
            Body::Form(fields) => builder.form(&fields),
            Body::Multipart(form) => {
                let mut parts = reqwest::multipart::Form::new();
                for (name, value) in form.fields {
                    parts = parts.text(name, value);
                }
                if let Some(file) = form.file {
                    let part = reqwest::multipart::Part::bytes(file.data)
                        .file_name(file.filename)
                        .mime_str(&file.mime)
                        .map_err(|e| RequestError::new(format!("bad mime type: {e}")))?;
                    parts = parts.part(file.part, part);
                }
                builder.multipart(parts)
            }
        };
        Ok(builder)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, req: HttpRequest) -> Result<HttpResponse, RequestError> {
        let response = self.build(req)?.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(HttpResponse { status, body })
    }

    fn cookie(&self, name: &str) -> Option<String> {
        self.jar.get(name)
    }

    fn export_cookies(&self) -> Vec<CookieRecord> {
        self.jar.export()
    }

    fn import_cookies(&self, cookies: &[CookieRecord]) {
        self.jar.import(cookies);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_cookie_parsing_defaults_and_attrs() {
        let r = parse_set_cookie("webwx_data_ticket=abc123; Path=/; Secure", "wx.qq.com").unwrap();
        assert_eq!(r.name, "webwx_data_ticket");
        assert_eq!(r.value, "abc123");
        assert_eq!(r.domain, "wx.qq.com");
        assert_eq!(r.path, "/");
        assert!(r.secure);
        assert_eq!(r.expires, None);

        let r = parse_set_cookie("sid=9; Domain=.qq.com; Max-Age=60", "wx.qq.com").unwrap();
        assert_eq!(r.domain, ".qq.com");
        assert!(r.expires.is_some());
    }

    #[test]
    fn domain_matching_handles_leading_dot() {
        assert!(domain_matches("wx.qq.com", ".qq.com"));
        assert!(domain_matches("file.wx.qq.com", "wx.qq.com"));
        assert!(domain_matches("wx.qq.com", "wx.qq.com"));
        assert!(!domain_matches("wxqq.com", ".qq.com"));
        assert!(!domain_matches("qq.com.evil.test", "qq.com"));
    }

    #[test]
    fn jar_upsert_replaces_same_cookie() {
        let jar = SessionJar::new();
        jar.store(parse_set_cookie("a=1", "wx.qq.com").unwrap());
        jar.store(parse_set_cookie("a=2", "wx.qq.com").unwrap());
        assert_eq!(jar.get("a"), Some("2".to_string()));
        assert_eq!(jar.export().len(), 1);
    }
}
