//! Client for the WeChat web (webwx) protocol.
//!
//! The flow every consumer follows:
//!
//! 1. [`Client::authorize_url`] — fetch a QR login uuid and render the URL.
//! 2. [`Client::authorize`] — poll until the scan is confirmed.
//! 3. [`Client::login`] — trade the confirmation for session credentials.
//! 4. Either drive [`Client::sync_check`] / [`Client::sync_message`] /
//!    [`Client::flush_sync_key`] by hand, or spawn
//!    [`Client::message_stream`] and consume decoded messages.
//!
//! Message sync is two-phase: a batch fetch stages the new cursor, and only
//! [`flush_sync_key`](Client::flush_sync_key) commits it. Crash between the
//! two and the next sync re-delivers — at-least-once, never silent loss.

#![deny(unsafe_code)]

pub mod contacts;
pub mod errors;
pub mod gateway;
pub mod media;
mod parsers;
pub mod session;
pub mod transport;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use wxweb_proto::{CodecError, Message, MessageKind};

use crate::contacts::Contact;
use crate::errors::{AuthorizeError, GatewayError, LoginError, MediaError, RequestError, SendError};
use crate::gateway::Gateway;
use crate::media::FileResource;
use crate::session::{Session, SessionSnapshot, SyncKey, WxSession};
use crate::transport::{HttpTransport, Transport};

const STREAM_CAPACITY: usize = 128;
const RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

// ─── Auth state ───────────────────────────────────────────────────────────────

/// Where the client stands in the QR login flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthStage {
    #[default]
    Unauthenticated,
    /// A QR uuid was issued; nobody scanned it yet.
    QrIssued,
    /// Last poll said the code is still waiting for a scan.
    WaitingScan,
    /// Scanned on the phone; waiting for the confirm tap.
    WaitingConfirm,
    /// Confirmed; credentials not yet fetched.
    Authorized,
    /// Session initialized and syncing.
    LoggedIn,
}

/// Outcome of one [`Client::authorize`] poll. The first two are ordinary
/// retryable states, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizeStatus {
    WaitingScan,
    WaitingConfirm,
    Authorized,
}

// ─── Client ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FlowState {
    stage: AuthStage,
    qr_uuid: Option<String>,
    login_uri: Option<String>,
    user: Option<Value>,
    user_avatar: Option<String>,
    staged_sync_key: Option<SyncKey>,
}

struct ClientInner {
    gateway: Gateway,
    session: Mutex<Session>,
    flow: Mutex<FlowState>,
}

/// Shared handle to one webwx session. Cheap to clone; all clones drive the
/// same session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Build a client over the production HTTP transport.
    pub fn connect() -> Result<Self, RequestError> {
        Ok(Self::new(Arc::new(HttpTransport::new()?)))
    }

    /// Build a client over any transport. Tests use this with a scripted
    /// transport.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                gateway: Gateway::new(transport.clone()),
                session: Mutex::new(Session::new(transport)),
                flow: Mutex::new(FlowState::default()),
            }),
        }
    }

    pub async fn auth_stage(&self) -> AuthStage {
        self.inner.flow.lock().await.stage
    }

    /// The confirming user's avatar, exposed once the poll reaches
    /// [`AuthorizeStatus::WaitingConfirm`].
    pub async fn user_avatar(&self) -> Option<String> {
        self.inner.flow.lock().await.user_avatar.clone()
    }

    /// The logged-in user's profile, as the init response describes it.
    pub async fn user(&self) -> Option<Value> {
        self.inner.flow.lock().await.user.clone()
    }

    // ─── Authorization ────────────────────────────────────────────────────────

    /// Issue a fresh QR uuid and return the URL of the QR code to scan.
    pub async fn authorize_url(&self) -> Result<String, AuthorizeError> {
        let host = self.endpoint().await;
        let uuid = self.inner.gateway.get_qrcode_uuid(&host).await?;
        debug!(%uuid, "QR uuid issued");
        let url = self.inner.gateway.qrcode_url(&host, &uuid);
        let mut flow = self.inner.flow.lock().await;
        flow.qr_uuid = Some(uuid);
        flow.stage = AuthStage::QrIssued;
        Ok(url)
    }

    /// Poll the login status once.
    ///
    /// Window codes: 408 = still waiting for a scan, 201 = scanned and
    /// waiting for the confirm tap, 200 = confirmed (the session gets pinned
    /// to the server-assigned redirect host), 400 = the QR code expired.
    pub async fn authorize(&self) -> Result<AuthorizeStatus, AuthorizeError> {
        if self.inner.session.lock().await.is_authorized() {
            return Ok(AuthorizeStatus::Authorized);
        }
        let uuid = self
            .inner
            .flow
            .lock()
            .await
            .qr_uuid
            .clone()
            .ok_or(AuthorizeError::QrNotIssued)?;

        let host = self.endpoint().await;
        let body = self.inner.gateway.get_login_info(&host, &uuid).await?;
        let code = parsers::parse_window_code(&body)?;
        match code {
            408 => {
                self.inner.flow.lock().await.stage = AuthStage::WaitingScan;
                Ok(AuthorizeStatus::WaitingScan)
            }
            201 => {
                let mut flow = self.inner.flow.lock().await;
                flow.user_avatar = parsers::parse_user_avatar(&body);
                flow.stage = AuthStage::WaitingConfirm;
                Ok(AuthorizeStatus::WaitingConfirm)
            }
            200 => {
                let redirect = parsers::parse_redirect_uri(&body).ok_or_else(|| {
                    AuthorizeError::Gateway(GatewayError::Decode("no redirect_uri".into()))
                })?;
                let redirect_host = url_host(&redirect).ok_or_else(|| {
                    AuthorizeError::Gateway(GatewayError::Decode("unparsable redirect_uri".into()))
                })?;
                self.inner.session.lock().await.finish_authorize(redirect_host);
                let mut flow = self.inner.flow.lock().await;
                flow.login_uri = Some(redirect);
                flow.stage = AuthStage::Authorized;
                info!("QR scan confirmed");
                Ok(AuthorizeStatus::Authorized)
            }
            400 => Err(AuthorizeError::Timeout),
            other => Err(AuthorizeError::UnknownWindowCode(other)),
        }
    }

    /// Trade a confirmed scan for live credentials and initialize the
    /// session. No-op if the session is already active.
    pub async fn login(&self) -> Result<(), LoginError> {
        if self.inner.session.lock().await.is_active() {
            return Ok(());
        }
        let login_uri = self
            .inner
            .flow
            .lock()
            .await
            .login_uri
            .clone()
            .ok_or(LoginError::NotAuthorized)?;

        let page = self.inner.gateway.new_login_page(&login_uri).await?;
        if page.ret != "0" {
            return Err(LoginError::Rejected { ret: page.ret, message: page.message });
        }
        let ws = page.session.ok_or_else(|| {
            LoginError::Gateway(GatewayError::Decode("login page missing credentials".into()))
        })?;

        let host = {
            let mut session = self.inner.session.lock().await;
            session.initialize(ws.clone());
            session.wx_endpoint().to_string()
        };

        let init = self.inner.gateway.wx_init(&host, &ws).await?;
        let sync_key: SyncKey = serde_json::from_value(
            init.get("SyncKey").cloned().ok_or_else(|| {
                LoginError::Gateway(GatewayError::Decode("init response missing SyncKey".into()))
            })?,
        )
        .map_err(GatewayError::from)?;

        {
            let mut session = self.inner.session.lock().await;
            session.advance_sync_key(sync_key);
        }
        let mut flow = self.inner.flow.lock().await;
        flow.user = init.get("User").cloned();
        flow.stage = AuthStage::LoggedIn;
        info!("session initialized");
        Ok(())
    }

    // ─── Sync engine ──────────────────────────────────────────────────────────

    /// Long-poll the push endpoint. Non-zero selector means
    /// [`sync_message`](Self::sync_message) will have something.
    pub async fn sync_check(&self) -> Result<i64, GatewayError> {
        let (host, ws) = self.credentials().await?;
        self.inner.gateway.check_sync(&host, &ws).await
    }

    /// Fetch the pending batch and stage its cursor. The raw batch is
    /// returned; run [`decode`](wxweb_proto::decode) over `AddMsgList`
    /// entries, then commit with [`flush_sync_key`](Self::flush_sync_key).
    pub async fn sync_message(&self) -> Result<Value, GatewayError> {
        let (host, ws) = self.credentials().await?;
        let batch = self.inner.gateway.do_sync(&host, &ws).await?;
        let sync_key: SyncKey = serde_json::from_value(
            batch
                .get("SyncKey")
                .cloned()
                .ok_or_else(|| GatewayError::Decode("sync response missing SyncKey".into()))?,
        )?;
        self.inner.flow.lock().await.staged_sync_key = Some(sync_key);
        Ok(batch)
    }

    /// Commit the cursor staged by the last [`sync_message`](Self::sync_message).
    /// Call only after the batch is safely handled; an early commit turns a
    /// crash into silent message loss.
    pub async fn flush_sync_key(&self) {
        let staged = self.inner.flow.lock().await.staged_sync_key.take();
        if let Some(sync_key) = staged {
            self.inner.session.lock().await.advance_sync_key(sync_key);
        }
    }

    /// Spawn a background poll loop and get decoded messages over a channel.
    ///
    /// Retryable failures (see [`GatewayError::is_retryable`]) are logged
    /// and retried after a short delay; anything else ends the stream.
    /// Undecodable batch entries are skipped. An expired session emits
    /// [`SyncEvent::SessionExpired`] before the stream ends. Cancelling the
    /// token stops the loop between iterations and leaves any uncommitted
    /// cursor staged.
    pub fn message_stream(&self, cancel: CancellationToken) -> MessageStream {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let client = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let checked = tokio::select! {
                    _ = cancel.cancelled() => break,
                    checked = client.sync_check() => checked,
                };
                let selector = match checked {
                    Ok(selector) => selector,
                    Err(GatewayError::SessionExpired) => {
                        warn!("session expired; ending message stream");
                        let _ = tx.send(SyncEvent::SessionExpired).await;
                        break;
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(error = %e, "sync check failed; retrying");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(RETRY_DELAY) => continue,
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "sync check failed; ending message stream");
                        break;
                    }
                };
                if selector == 0 {
                    continue;
                }

                let batch = match client.sync_message().await {
                    Ok(batch) => batch,
                    Err(GatewayError::SessionExpired) => {
                        warn!("session expired; ending message stream");
                        let _ = tx.send(SyncEvent::SessionExpired).await;
                        break;
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(error = %e, "sync fetch failed; retrying");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(RETRY_DELAY) => continue,
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "sync fetch failed; ending message stream");
                        break;
                    }
                };

                let entries = batch
                    .get("AddMsgList")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let mut stop = false;
                for entry in &entries {
                    match wxweb_proto::decode(entry) {
                        Ok(message) => {
                            tokio::select! {
                                _ = cancel.cancelled() => {
                                    stop = true;
                                }
                                sent = tx.send(SyncEvent::Message(message)) => {
                                    stop = sent.is_err();
                                }
                            }
                            if stop {
                                break;
                            }
                        }
                        Err(e) => debug!(error = %e, "skipping batch entry"),
                    }
                }
                if stop || cancel.is_cancelled() {
                    // Leave the cursor staged; the next consumer re-fetches.
                    break;
                }
                client.flush_sync_key().await;
            }
        });
        MessageStream { rx, handle }
    }

    // ─── Messaging ────────────────────────────────────────────────────────────

    /// Send a composed message and record its acknowledgment.
    pub async fn send_message(&self, message: &mut Message) -> Result<(), SendError> {
        if message.is_acknowledged() {
            return Err(SendError::AlreadyAcknowledged);
        }
        let (host, ws) = self.credentials().await.map_err(SendError::Gateway)?;
        let wire = message.wire_value();
        let gw = &self.inner.gateway;
        let res = match message.kind() {
            MessageKind::Text => gw.send_text(&host, &ws, wire).await?,
            MessageKind::Image { .. } => gw.send_image(&host, &ws, wire).await?,
            MessageKind::AnimatedImage { .. } => gw.send_gif(&host, &ws, wire).await?,
            MessageKind::Video { .. } => gw.send_video(&host, &ws, wire).await?,
            MessageKind::File { .. } => gw.send_app(&host, &ws, wire).await?,
            _ => return Err(SendError::UnsupportedKind),
        };
        let local_id = id_field(&res, "LocalID")
            .ok_or_else(|| SendError::Gateway(GatewayError::Decode("no LocalID in ack".into())))?;
        let server_id = id_field(&res, "MsgID")
            .ok_or_else(|| SendError::Gateway(GatewayError::Decode("no MsgID in ack".into())))?;
        message.ack(&local_id, server_id)?;
        Ok(())
    }

    /// Download the media payload of an acknowledged message.
    pub async fn fetch_media(&self, message: &Message) -> Result<Vec<u8>, MediaError> {
        let Some(server_id) = message.server_id() else {
            return Err(MediaError::Unacknowledged);
        };
        let (host, ws) = self.credentials().await.map_err(MediaError::Gateway)?;
        let gw = &self.inner.gateway;
        let data = match message.kind() {
            MessageKind::Image { .. } | MessageKind::AnimatedImage { .. } => {
                gw.get_msg_img(&host, &ws, server_id).await?
            }
            MessageKind::Voice { .. } => gw.get_msg_voice(&host, &ws, server_id).await?,
            MessageKind::File { media_id, filename, .. } => {
                gw.get_msg_media(&host, &ws, message.from_user(), media_id, filename).await?
            }
            _ => return Err(MediaError::Unsupported),
        };
        Ok(data)
    }

    /// Upload a file and get the media id to compose a media message with.
    pub async fn upload(
        &self,
        resource: &FileResource,
        to_user: &str,
    ) -> Result<String, GatewayError> {
        let from_user = self
            .own_user_name()
            .await
            .ok_or_else(|| GatewayError::Decode("no logged-in user".into()))?;
        let (host, ws) = self.credentials().await?;
        self.inner.gateway.upload_media(&host, &ws, resource, &from_user, to_user).await
    }

    // ─── Supplementary operations ─────────────────────────────────────────────

    /// Tell the server this client is the active device.
    pub async fn notify_status(&self) -> Result<(), GatewayError> {
        let user_name = self
            .own_user_name()
            .await
            .ok_or_else(|| GatewayError::Decode("no logged-in user".into()))?;
        let (host, ws) = self.credentials().await?;
        self.inner.gateway.notify_status(&host, &ws, &user_name).await?;
        Ok(())
    }

    /// Full contact list.
    pub async fn contacts(&self) -> Result<Vec<Contact>, GatewayError> {
        let (host, ws) = self.credentials().await?;
        let res = self.inner.gateway.get_contact_list(&host, &ws).await?;
        contact_array(res, "MemberList")
    }

    /// Profiles for specific user names (the only way to resolve group
    /// members).
    pub async fn batch_contacts(&self, user_names: &[String]) -> Result<Vec<Contact>, GatewayError> {
        let (host, ws) = self.credentials().await?;
        let res = self.inner.gateway.mget_contact_list(&host, &ws, user_names).await?;
        contact_array(res, "ContactList")
    }

    pub async fn set_remark(&self, user_name: &str, remark: &str) -> Result<(), GatewayError> {
        let (host, ws) = self.credentials().await?;
        self.inner.gateway.set_user_remark(&host, &ws, user_name, remark).await?;
        Ok(())
    }

    /// Fetch a profile icon by the relative URL a contact profile carries.
    pub async fn get_icon(&self, icon_path: &str) -> Result<Vec<u8>, GatewayError> {
        let host = self.endpoint().await;
        self.inner.gateway.get_icon(&host, icon_path).await
    }

    /// Fetch a head image by its relative URL.
    pub async fn get_head_img(&self, headimg_path: &str) -> Result<Vec<u8>, GatewayError> {
        let host = self.endpoint().await;
        self.inner.gateway.get_icon(&host, headimg_path).await
    }

    pub async fn logout(&self) -> Result<(), GatewayError> {
        let (host, ws) = self.credentials().await?;
        self.inner.gateway.logout(&host, &ws).await
    }

    /// Drop all local state. Does not notify the server; use
    /// [`logout`](Self::logout) first if the session should die server-side.
    pub async fn close(&self) {
        self.inner.session.lock().await.close();
        *self.inner.flow.lock().await = FlowState::default();
    }

    // ─── Snapshots ────────────────────────────────────────────────────────────

    pub async fn dump(&self) -> ClientSnapshot {
        let session = self.inner.session.lock().await.dump();
        let flow = self.inner.flow.lock().await;
        ClientSnapshot {
            session,
            user: flow.user.clone(),
            qr_uuid: flow.qr_uuid.clone(),
        }
    }

    pub async fn restore(&self, snapshot: ClientSnapshot) {
        let active = {
            let mut session = self.inner.session.lock().await;
            session.load(snapshot.session);
            session.is_active()
        };
        let mut flow = self.inner.flow.lock().await;
        flow.user = snapshot.user;
        flow.qr_uuid = snapshot.qr_uuid;
        flow.stage = if active {
            AuthStage::LoggedIn
        } else if flow.qr_uuid.is_some() {
            AuthStage::QrIssued
        } else {
            AuthStage::Unauthenticated
        };
    }

    // ─── Internals ────────────────────────────────────────────────────────────

    async fn endpoint(&self) -> String {
        self.inner.session.lock().await.wx_endpoint().to_string()
    }

    async fn credentials(&self) -> Result<(String, WxSession), GatewayError> {
        let mut session = self.inner.session.lock().await;
        let host = session.wx_endpoint().to_string();
        let ws = session.wx_session().cloned().ok_or(GatewayError::SessionExpired)?;
        Ok((host, ws))
    }

    async fn own_user_name(&self) -> Option<String> {
        let flow = self.inner.flow.lock().await;
        flow.user
            .as_ref()
            .and_then(|u| u.get("UserName"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Flat, serializable image of a [`Client`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSnapshot {
    pub session: SessionSnapshot,
    pub user: Option<Value>,
    pub qr_uuid: Option<String>,
}

// ─── Message stream ───────────────────────────────────────────────────────────

/// An event from the background sync loop.
#[derive(Debug)]
pub enum SyncEvent {
    Message(Message),
    /// The server dropped the session. Terminal; re-authenticate.
    SessionExpired,
}

/// Receiver half of [`Client::message_stream`].
pub struct MessageStream {
    rx: mpsc::Receiver<SyncEvent>,
    handle: JoinHandle<()>,
}

impl MessageStream {
    /// Next event; `None` once the loop has ended and the channel drained.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.rx.recv().await
    }

    /// Wait for the poll loop to finish.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn url_host(url: &str) -> Option<&str> {
    let rest = url.split_once("://")?.1;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let host = &rest[..end];
    (!host.is_empty()).then_some(host)
}

fn id_field(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn contact_array(mut res: Value, field: &str) -> Result<Vec<Contact>, GatewayError> {
    let list = res
        .get_mut(field)
        .map(Value::take)
        .ok_or_else(|| GatewayError::Decode(format!("response missing {field}")))?;
    Ok(serde_json::from_value(list)?)
}
