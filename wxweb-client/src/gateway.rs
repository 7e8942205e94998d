//! One request-builder per service endpoint.
//!
//! Everything here is stateless: credentials come in as arguments, the
//! response is parsed and envelope-checked, and the result goes back up.
//! No retries happen at this layer.

use serde_json::{Value, json};
use tracing::debug;

use crate::errors::GatewayError;
use crate::media::FileResource;
use crate::parsers;
use crate::session::WxSession;
use crate::transport::{HttpRequest, MultipartForm, TimeoutTier, Transport};

use std::sync::Arc;

/// Application id baked into the web client.
const APP_ID: &str = "wx782c26e4c19acffb";

const LOGIN_SUB_HOST: &str = "login.";
const PUSH_SUB_HOST: &str = "webpush.";
const FILE_SUB_HOST: &str = "file.";

const QRCODE_UUID_PATH: &str = "/jslogin";
const QRCODE_PATH: &str = "/qrcode";
const LOGIN_PATH: &str = "/cgi-bin/mmwebwx-bin/login";
const INIT_PATH: &str = "/cgi-bin/mmwebwx-bin/webwxinit";
const STATUS_NOTIFY_PATH: &str = "/cgi-bin/mmwebwx-bin/webwxstatusnotify";
const SYNC_CHECK_PATH: &str = "/cgi-bin/mmwebwx-bin/synccheck";
const DO_SYNC_PATH: &str = "/cgi-bin/mmwebwx-bin/webwxsync";
const CONTACT_LIST_PATH: &str = "/cgi-bin/mmwebwx-bin/webwxgetcontact";
const BATCH_CONTACT_PATH: &str = "/cgi-bin/mmwebwx-bin/webwxbatchgetcontact";
const UPLOAD_MEDIA_PATH: &str = "/cgi-bin/mmwebwx-bin/webwxuploadmedia";
const MSG_IMG_PATH: &str = "/cgi-bin/mmwebwx-bin/webwxgetmsgimg";
const MSG_VOICE_PATH: &str = "/cgi-bin/mmwebwx-bin/webwxgetvoice";
const MSG_MEDIA_PATH: &str = "/cgi-bin/mmwebwx-bin/webwxgetmedia";
const SEND_MSG_PATH: &str = "/cgi-bin/mmwebwx-bin/webwxsendmsg";
const SEND_IMG_PATH: &str = "/cgi-bin/mmwebwx-bin/webwxsendmsgimg";
const SEND_GIF_PATH: &str = "/cgi-bin/mmwebwx-bin/webwxsendemoticon";
const SEND_VIDEO_PATH: &str = "/cgi-bin/mmwebwx-bin/webwxsendvideomsg";
const SEND_APP_PATH: &str = "/cgi-bin/mmwebwx-bin/webwxsendappmsg";
const OPLOG_PATH: &str = "/cgi-bin/mmwebwx-bin/webwxoplog";
const LOGOUT_PATH: &str = "/cgi-bin/mmwebwx-bin/webwxlogout";

/// Upload chunk size.
const MAX_FILE_BODY: usize = 512 * 1024;

const SESSION_EXPIRED_RET: i64 = 1101;

pub struct Gateway {
    transport: Arc<dyn Transport>,
}

impl Gateway {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    // ─── Authorization ────────────────────────────────────────────────────────

    /// Ask for a fresh QR login uuid.
    pub async fn get_qrcode_uuid(&self, host: &str) -> Result<String, GatewayError> {
        let req = HttpRequest::get(format!("https://{LOGIN_SUB_HOST}{host}{QRCODE_UUID_PATH}"))
            .query("appid", APP_ID)
            .query("fun", "new")
            .query("_", client_msg_id().to_string())
            .timeout(TimeoutTier::Medium);
        let res = self.transport.request(req).await?;
        parsers::parse_qr_uuid(&res.text())
    }

    /// The URL the QR code image lives at; render it however you like.
    pub fn qrcode_url(&self, host: &str, uuid: &str) -> String {
        format!("https://{LOGIN_SUB_HOST}{host}{QRCODE_PATH}/{uuid}")
    }

    /// Long-poll the login status page. Returns the raw script body; the
    /// caller classifies the embedded window code.
    pub async fn get_login_info(&self, host: &str, uuid: &str) -> Result<String, GatewayError> {
        let msg_id = client_msg_id();
        let req = HttpRequest::get(format!("https://{LOGIN_SUB_HOST}{host}{LOGIN_PATH}"))
            .query("loginicon", "true")
            .query("uuid", uuid)
            .query("tip", "0")
            .query("_", msg_id.to_string())
            .query("r", (msg_id / 1992).to_string())
            .timeout(TimeoutTier::Medium);
        let res = self.transport.request(req).await?;
        Ok(res.text())
    }

    /// Fetch the login page behind the confirmed-scan redirect.
    pub async fn new_login_page(
        &self,
        redirect_uri: &str,
    ) -> Result<parsers::LoginPage, GatewayError> {
        let req = HttpRequest::get(redirect_uri)
            .query("scan", chrono::Utc::now().timestamp().to_string())
            .query("version", "2")
            .query("fun", "new")
            .timeout(TimeoutTier::Medium);
        let res = self.transport.request(req).await?;
        parsers::parse_login_page(&res.text())
    }

    // ─── Session lifecycle ────────────────────────────────────────────────────

    pub async fn wx_init(&self, host: &str, ws: &WxSession) -> Result<Value, GatewayError> {
        let req = HttpRequest::post(format!("https://{host}{INIT_PATH}"))
            .query("pass_ticket", &ws.pass_ticket)
            .json(json!({ "BaseRequest": base_request(ws) }))
            .timeout(TimeoutTier::Long);
        let res = self.transport.request(req).await?;
        check_envelope(res.json()?)
    }

    pub async fn notify_status(
        &self,
        host: &str,
        ws: &WxSession,
        user_name: &str,
    ) -> Result<Value, GatewayError> {
        let req = HttpRequest::post(format!("https://{host}{STATUS_NOTIFY_PATH}"))
            .query("pass_ticket", &ws.pass_ticket)
            .json(json!({
                "BaseRequest": base_request(ws),
                "Code": 3,
                "FromUserName": user_name,
                "ToUserName": user_name,
                "ClientMsgId": client_msg_id(),
            }))
            .timeout(TimeoutTier::Medium);
        let res = self.transport.request(req).await?;
        check_envelope(res.json()?)
    }

    pub async fn logout(&self, host: &str, ws: &WxSession) -> Result<(), GatewayError> {
        let req = HttpRequest::post(format!("https://{host}{LOGOUT_PATH}"))
            .query("skey", &ws.skey)
            .query("type", "1")
            .query("redirect", "0")
            .form(vec![
                ("sid".to_string(), ws.wxsid.clone()),
                ("uin".to_string(), ws.wxuin.to_string()),
            ])
            .timeout(TimeoutTier::Short);
        // The logout page answers with a redirect, not an envelope.
        self.transport.request(req).await?;
        Ok(())
    }

    // ─── Sync ─────────────────────────────────────────────────────────────────

    /// Long-poll for pending data. `Ok(selector)`; non-zero means a sync is
    /// worth doing.
    pub async fn check_sync(&self, host: &str, ws: &WxSession) -> Result<i64, GatewayError> {
        let req = HttpRequest::get(format!("https://{PUSH_SUB_HOST}{host}{SYNC_CHECK_PATH}"))
            .query("uin", ws.wxuin.to_string())
            .query("sid", &ws.wxsid)
            .query("skey", &ws.skey)
            .query("deviceid", device_id())
            .query("_", client_msg_id().to_string())
            .query("synckey", ws.sync_key.render())
            .timeout(TimeoutTier::Medium);
        let res = self.transport.request(req).await?;
        let (retcode, selector) = parsers::parse_sync_check(&res.text())?;
        match retcode {
            0 => Ok(selector),
            SESSION_EXPIRED_RET => Err(GatewayError::SessionExpired),
            other => Err(GatewayError::ApiResponse { ret: other }),
        }
    }

    pub async fn do_sync(&self, host: &str, ws: &WxSession) -> Result<Value, GatewayError> {
        let req = HttpRequest::post(format!("https://{host}{DO_SYNC_PATH}"))
            .query("sid", &ws.wxsid)
            .query("skey", &ws.skey)
            .query("pass_ticket", &ws.pass_ticket)
            .json(json!({
                "BaseRequest": base_request(ws),
                "SyncKey": ws.sync_key,
            }))
            .timeout(TimeoutTier::Medium);
        let res = self.transport.request(req).await?;
        check_envelope(res.json()?)
    }

    // ─── Contacts ─────────────────────────────────────────────────────────────

    pub async fn get_contact_list(&self, host: &str, ws: &WxSession) -> Result<Value, GatewayError> {
        let req = HttpRequest::get(format!("https://{host}{CONTACT_LIST_PATH}"))
            .query("pass_ticket", &ws.pass_ticket)
            .query("r", client_msg_id().to_string())
            .query("seq", "0")
            .query("skey", &ws.skey)
            .timeout(TimeoutTier::Medium);
        let res = self.transport.request(req).await?;
        check_envelope(res.json()?)
    }

    pub async fn mget_contact_list(
        &self,
        host: &str,
        ws: &WxSession,
        user_names: &[String],
    ) -> Result<Value, GatewayError> {
        let list: Vec<Value> = user_names
            .iter()
            .map(|name| json!({ "UserName": name, "EncryChatRoomId": "" }))
            .collect();
        let req = HttpRequest::post(format!("https://{host}{BATCH_CONTACT_PATH}"))
            .query("pass_ticket", &ws.pass_ticket)
            .query("r", client_msg_id().to_string())
            .query("type", "ex")
            .json(json!({
                "BaseRequest": base_request(ws),
                "Count": list.len(),
                "List": list,
            }))
            .timeout(TimeoutTier::Medium);
        let res = self.transport.request(req).await?;
        check_envelope(res.json()?)
    }

    pub async fn set_user_remark(
        &self,
        host: &str,
        ws: &WxSession,
        user_name: &str,
        remark: &str,
    ) -> Result<Value, GatewayError> {
        let req = HttpRequest::post(format!("https://{host}{OPLOG_PATH}"))
            .query("pass_ticket", &ws.pass_ticket)
            .json(json!({
                "BaseRequest": base_request(ws),
                "UserName": user_name,
                "RemarkName": remark,
                "CmdId": 2,
            }))
            .timeout(TimeoutTier::Short);
        let res = self.transport.request(req).await?;
        check_envelope(res.json()?)
    }

    // ─── Sending ──────────────────────────────────────────────────────────────

    pub async fn send_text(
        &self,
        host: &str,
        ws: &WxSession,
        msg: &Value,
    ) -> Result<Value, GatewayError> {
        let req = HttpRequest::post(format!("https://{host}{SEND_MSG_PATH}"))
            .query("pass_ticket", &ws.pass_ticket);
        self.send(req, ws, msg.clone()).await
    }

    pub async fn send_image(
        &self,
        host: &str,
        ws: &WxSession,
        msg: &Value,
    ) -> Result<Value, GatewayError> {
        let req = HttpRequest::post(format!("https://{host}{SEND_IMG_PATH}"))
            .query("fun", "async")
            .query("f", "json");
        self.send(req, ws, msg.clone()).await
    }

    /// Animated images go through the emoticon endpoint with an extra flag.
    pub async fn send_gif(
        &self,
        host: &str,
        ws: &WxSession,
        msg: &Value,
    ) -> Result<Value, GatewayError> {
        let mut msg = msg.clone();
        msg["EmojiFlag"] = json!(2);
        let req = HttpRequest::post(format!("https://{host}{SEND_GIF_PATH}"))
            .query("pass_ticket", &ws.pass_ticket)
            .query("fun", "sys")
            .query("f", "json");
        self.send(req, ws, msg).await
    }

    pub async fn send_video(
        &self,
        host: &str,
        ws: &WxSession,
        msg: &Value,
    ) -> Result<Value, GatewayError> {
        let req = HttpRequest::post(format!("https://{host}{SEND_VIDEO_PATH}"))
            .query("pass_ticket", &ws.pass_ticket)
            .query("fun", "async")
            .query("f", "json");
        self.send(req, ws, msg.clone()).await
    }

    /// File and other app-style messages.
    pub async fn send_app(
        &self,
        host: &str,
        ws: &WxSession,
        msg: &Value,
    ) -> Result<Value, GatewayError> {
        let req = HttpRequest::post(format!("https://{host}{SEND_APP_PATH}"))
            .query("pass_ticket", &ws.pass_ticket)
            .query("fun", "async")
            .query("f", "json");
        self.send(req, ws, msg.clone()).await
    }

    async fn send(
        &self,
        req: HttpRequest,
        ws: &WxSession,
        msg: Value,
    ) -> Result<Value, GatewayError> {
        let req = req
            .json(json!({
                "BaseRequest": base_request(ws),
                "Scene": 0,
                "Msg": msg,
            }))
            .timeout(TimeoutTier::Short);
        let res = self.transport.request(req).await?;
        check_envelope(res.json()?)
    }

    // ─── Media download ───────────────────────────────────────────────────────

    pub async fn get_msg_img(
        &self,
        host: &str,
        ws: &WxSession,
        msg_id: &str,
    ) -> Result<Vec<u8>, GatewayError> {
        let req = HttpRequest::get(format!("https://{host}{MSG_IMG_PATH}"))
            .query("MsgID", msg_id)
            .query("skey", &ws.skey)
            .timeout(TimeoutTier::Long);
        self.fetch_bytes(req).await
    }

    pub async fn get_msg_voice(
        &self,
        host: &str,
        ws: &WxSession,
        msg_id: &str,
    ) -> Result<Vec<u8>, GatewayError> {
        let req = HttpRequest::get(format!("https://{host}{MSG_VOICE_PATH}"))
            .query("msgid", msg_id)
            .query("skey", &ws.skey)
            .timeout(TimeoutTier::Long);
        self.fetch_bytes(req).await
    }

    pub async fn get_msg_media(
        &self,
        host: &str,
        ws: &WxSession,
        sender: &str,
        media_id: &str,
        filename: &str,
    ) -> Result<Vec<u8>, GatewayError> {
        let data_ticket = self.data_ticket()?;
        let req = HttpRequest::get(format!("https://{FILE_SUB_HOST}{host}{MSG_MEDIA_PATH}"))
            .query("sender", sender)
            .query("mediaid", media_id)
            .query("filename", filename)
            .query("fromuser", ws.wxuin.to_string())
            .query("pass_ticket", &ws.pass_ticket)
            .query("webwx_data_ticket", data_ticket)
            .timeout(TimeoutTier::Long);
        self.fetch_bytes(req).await
    }

    /// Profile images are addressed by the relative URL the contact list
    /// hands out.
    pub async fn get_icon(&self, host: &str, icon_path: &str) -> Result<Vec<u8>, GatewayError> {
        let req =
            HttpRequest::get(format!("https://{host}{icon_path}")).timeout(TimeoutTier::Medium);
        self.fetch_bytes(req).await
    }

    async fn fetch_bytes(&self, req: HttpRequest) -> Result<Vec<u8>, GatewayError> {
        let res = self.transport.request(req).await?;
        if res.status != 200 {
            return Err(GatewayError::Decode(format!("unexpected status {}", res.status)));
        }
        Ok(res.body)
    }

    // ─── Upload ───────────────────────────────────────────────────────────────

    /// Chunked media upload. Returns the server-assigned media id.
    pub async fn upload_media(
        &self,
        host: &str,
        ws: &WxSession,
        resource: &FileResource,
        from_user: &str,
        to_user: &str,
    ) -> Result<String, GatewayError> {
        let total = resource.size();
        if total == 0 {
            return Err(GatewayError::EmptyUpload);
        }
        let data_ticket = self.data_ticket()?;
        let url = format!("https://{FILE_SUB_HOST}{host}{UPLOAD_MEDIA_PATH}");
        let upload_request = json!({
            "UploadType": 2,
            "BaseRequest": base_request(ws),
            "ClientMediaId": client_msg_id(),
            "TotalLen": total,
            "StartPos": 0,
            "DataLen": total,
            "MediaType": 4,
            "FromUserName": from_user,
            "ToUserName": to_user,
            "FileMd5": resource.md5_hex(),
        });
        let upload_request = serde_json::to_string(&upload_request)?;

        let chunks = resource.data().chunks(MAX_FILE_BODY).collect::<Vec<_>>();
        let chunk_count = chunks.len().max(1);
        let mime = resource.mime_type();

        let mut last = Value::Null;
        for (index, chunk) in chunks.iter().enumerate() {
            debug!(index, chunk_count, "uploading media chunk");
            let mut form = MultipartForm::default()
                .text("id", "WU_FILE_0")
                .text("name", resource.name())
                .text("type", &mime)
                .text("lastModifiedDate", resource.last_modified())
                .text("size", total.to_string())
                .text("mediatype", resource.media_class())
                .text("uploadmediarequest", &upload_request)
                .text("webwx_data_ticket", &data_ticket)
                .text("pass_ticket", &ws.pass_ticket);
            if chunk_count > 1 {
                form = form.text("chunk", index.to_string()).text("chunks", chunk_count.to_string());
            }
            form = form.file("filename", resource.name(), &mime, chunk.to_vec());

            let req = HttpRequest::post(&url)
                .query("f", "json")
                .multipart(form)
                .timeout(TimeoutTier::Long);
            let res = self.transport.request(req).await?;
            last = check_envelope(res.json()?)?;
        }

        // The final response must confirm the whole length made it up.
        let reported = last.get("StartPos").and_then(value_u64).unwrap_or(0);
        if reported != total {
            return Err(GatewayError::UploadIncomplete { reported, expected: total });
        }
        last.get("MediaId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::Decode("upload response missing MediaId".into()))
    }

    fn data_ticket(&self) -> Result<String, GatewayError> {
        self.transport
            .cookie("webwx_data_ticket")
            .ok_or_else(|| GatewayError::Decode("missing webwx_data_ticket cookie".into()))
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

/// Envelope rule shared by every JSON endpoint: `Ret == 0` strips the
/// envelope, `1101` means the session is gone, anything else is a service
/// error.
fn check_envelope(mut body: Value) -> Result<Value, GatewayError> {
    let ret = body
        .get("BaseResponse")
        .and_then(|b| b.get("Ret"))
        .and_then(value_i64)
        .ok_or_else(|| GatewayError::Decode("response missing BaseResponse.Ret".into()))?;
    match ret {
        0 => {
            if let Some(obj) = body.as_object_mut() {
                obj.remove("BaseResponse");
            }
            Ok(body)
        }
        SESSION_EXPIRED_RET => Err(GatewayError::SessionExpired),
        other => Err(GatewayError::ApiResponse { ret: other }),
    }
}

fn value_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn value_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Fresh browser-style device id: `"e"` followed by 15 digits.
fn device_id() -> String {
    let mut bytes = [0u8; 8];
    let seed = match getrandom::getrandom(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes),
        Err(_) => chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0) as u64,
    };
    format!("e{:015}", 100_000_000_000_000 + seed % 900_000_000_000_000)
}

/// Millisecond timestamp used as a client-side request id.
fn client_msg_id() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn base_request(ws: &WxSession) -> Value {
    json!({
        "Uin": ws.wxuin,
        "Sid": ws.wxsid,
        "Skey": ws.skey,
        "DeviceID": device_id(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_classification() {
        let ok = json!({ "BaseResponse": { "Ret": 0 }, "X": 1 });
        let stripped = check_envelope(ok).unwrap();
        assert_eq!(stripped, json!({ "X": 1 }));

        let expired = json!({ "BaseResponse": { "Ret": 1101 } });
        assert!(matches!(check_envelope(expired), Err(GatewayError::SessionExpired)));

        let failed = json!({ "BaseResponse": { "Ret": "-14" } });
        assert!(matches!(
            check_envelope(failed),
            Err(GatewayError::ApiResponse { ret: -14 })
        ));

        let shapeless = json!({ "X": 1 });
        assert!(matches!(check_envelope(shapeless), Err(GatewayError::Decode(_))));
    }

    #[test]
    fn device_id_shape() {
        let id = device_id();
        assert_eq!(id.len(), 16);
        assert!(id.starts_with('e'));
        assert!(id[1..].chars().all(|c| c.is_ascii_digit()));
        assert_ne!(&id[1..2], "0");
    }
}
