//! Scripted transport shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use wxweb_client::errors::RequestError;
use wxweb_client::session::{SessionSnapshot, SyncKey, WxSession};
use wxweb_client::transport::{CookieRecord, HttpRequest, HttpResponse, Transport};
use wxweb_client::{Client, ClientSnapshot};

/// Answers requests from a pre-loaded script, in order, and records every
/// request for later inspection. An exhausted script answers with a network
/// error.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Option<HttpResponse>>>,
    requests: Mutex<Vec<HttpRequest>>,
    cookies: Mutex<Vec<CookieRecord>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_text(&self, body: &str) {
        self.push_response(200, body.as_bytes().to_vec());
    }

    pub fn push_json(&self, value: Value) {
        self.push_response(200, value.to_string().into_bytes());
    }

    pub fn push_response(&self, status: u16, body: Vec<u8>) {
        self.script
            .lock()
            .unwrap()
            .push_back(Some(HttpResponse { status, body }));
    }

    pub fn push_error(&self) {
        self.script.lock().unwrap().push_back(None);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(&self, req: HttpRequest) -> Result<HttpResponse, RequestError> {
        self.requests.lock().unwrap().push(req);
        match self.script.lock().unwrap().pop_front() {
            Some(Some(response)) => Ok(response),
            Some(None) => Err(RequestError::new("scripted network failure")),
            None => Err(RequestError::new("script exhausted")),
        }
    }

    fn cookie(&self, name: &str) -> Option<String> {
        self.cookies
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value.clone())
    }

    fn export_cookies(&self) -> Vec<CookieRecord> {
        self.cookies.lock().unwrap().clone()
    }

    fn import_cookies(&self, cookies: &[CookieRecord]) {
        self.cookies.lock().unwrap().extend_from_slice(cookies);
    }
}

pub fn cookie(name: &str, value: &str) -> CookieRecord {
    CookieRecord {
        name: name.to_string(),
        value: value.to_string(),
        domain: "wx.qq.com".to_string(),
        path: "/".to_string(),
        secure: false,
        expires: None,
    }
}

pub fn wx_session() -> WxSession {
    WxSession {
        skey: "@crypt_skey".to_string(),
        pass_ticket: "ticket==".to_string(),
        wxsid: "SID".to_string(),
        wxuin: 446_174,
        isgrayscale: true,
        sync_key: SyncKey::new(vec![(1, 100), (2, 200)]),
    }
}

pub fn logged_in_snapshot() -> ClientSnapshot {
    ClientSnapshot {
        session: SessionSnapshot {
            wx_session: Some(wx_session()),
            cookies: vec![cookie("webwx_data_ticket", "dt-abc")],
            endpoint: Some("wx.qq.com".to_string()),
        },
        user: Some(json!({ "UserName": "@me", "NickName": "Me" })),
        qr_uuid: None,
    }
}

/// A client restored into the logged-in state over a fresh mock transport.
pub async fn logged_in_client() -> (Client, Arc<MockTransport>) {
    let transport = MockTransport::new();
    let client = Client::new(transport.clone());
    client.restore(logged_in_snapshot()).await;
    (client, transport)
}
