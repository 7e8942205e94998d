//! Extractors for the service's script-shaped and markup-shaped responses.
//!
//! Several endpoints answer with a JavaScript snippet meant for a browser
//! (`window.code = 200; window.redirect_uri = "…";`). We never execute any
//! of it; the templates are fixed, so anchored regexes pull the fields out.
//! The login page is pseudo-XML and goes through the markup parser instead.

use std::sync::LazyLock;

use regex::Regex;

use wxweb_proto::markup;

use crate::errors::GatewayError;
use crate::session::WxSession;

static QR_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"window\.QRLogin\.code\s*=\s*(\d+)").unwrap());
static QR_UUID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"window\.QRLogin\.uuid\s*=\s*"([^"]+)""#).unwrap());
static WINDOW_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"window\.code\s*=\s*(\d+)").unwrap());
static REDIRECT_URI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"window\.redirect_uri\s*=\s*"([^"]+)""#).unwrap());
static USER_AVATAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"window\.userAvatar\s*=\s*'([^']+)'").unwrap());
static SYNC_CHECK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"window\.synccheck\s*=\s*\{\s*retcode\s*:\s*"(\d+)"\s*,\s*selector\s*:\s*"(\d+)"\s*\}"#)
        .unwrap()
});

fn capture_i64(re: &Regex, body: &str, what: &str) -> Result<i64, GatewayError> {
    let text = re
        .captures(body)
        .and_then(|c| c.get(1))
        .ok_or_else(|| GatewayError::Decode(format!("no {what} in response")))?
        .as_str();
    text.parse()
        .map_err(|_| GatewayError::Decode(format!("non-numeric {what}: {text}")))
}

fn capture_str(re: &Regex, body: &str) -> Option<String> {
    re.captures(body).and_then(|c| c.get(1)).map(|m| m.as_str().to_string())
}

/// Extract the QR uuid from a `/jslogin` response; the embedded status code
/// must be 200.
pub fn parse_qr_uuid(body: &str) -> Result<String, GatewayError> {
    let code = capture_i64(&QR_CODE, body, "QRLogin.code")?;
    if code != 200 {
        return Err(GatewayError::ApiResponse { ret: code });
    }
    capture_str(&QR_UUID, body).ok_or_else(|| GatewayError::Decode("no QRLogin.uuid".into()))
}

/// The login-poll status code (`window.code`).
pub fn parse_window_code(body: &str) -> Result<i64, GatewayError> {
    capture_i64(&WINDOW_CODE, body, "window.code")
}

pub fn parse_redirect_uri(body: &str) -> Option<String> {
    capture_str(&REDIRECT_URI, body)
}

pub fn parse_user_avatar(body: &str) -> Option<String> {
    capture_str(&USER_AVATAR, body)
}

/// `(retcode, selector)` from a status-check response.
pub fn parse_sync_check(body: &str) -> Result<(i64, i64), GatewayError> {
    let caps = SYNC_CHECK
        .captures(body)
        .ok_or_else(|| GatewayError::Decode("no synccheck payload".into()))?;
    let retcode = caps[1]
        .parse()
        .map_err(|_| GatewayError::Decode("non-numeric retcode".into()))?;
    let selector = caps[2]
        .parse()
        .map_err(|_| GatewayError::Decode("non-numeric selector".into()))?;
    Ok((retcode, selector))
}

/// The parsed login page. Credentials exist only when `ret` is `"0"`.
#[derive(Debug, Clone)]
pub struct LoginPage {
    pub ret: String,
    pub message: String,
    pub session: Option<WxSession>,
}

/// Parse the `error`-rooted login page handed back by the redirect URL.
pub fn parse_login_page(body: &str) -> Result<LoginPage, GatewayError> {
    let doc = markup::parse(body).map_err(|e| GatewayError::Decode(e.to_string()))?;
    let error = doc
        .tree("error")
        .ok_or_else(|| GatewayError::Decode("login page missing error root".into()))?;

    let ret = error.text("ret").unwrap_or_default().to_string();
    let message = error.text("message").unwrap_or_default().to_string();

    let session = match (
        error.text("skey"),
        error.text("wxsid"),
        error.text("wxuin"),
        error.text("pass_ticket"),
    ) {
        (Some(skey), Some(wxsid), Some(wxuin), Some(pass_ticket)) => Some(WxSession {
            skey: skey.to_string(),
            wxsid: wxsid.to_string(),
            wxuin: wxuin
                .parse()
                .map_err(|_| GatewayError::Decode("non-numeric wxuin".into()))?,
            // The ticket is URL-encoded inside the XML.
            pass_ticket: percent_decode(pass_ticket),
            isgrayscale: error.text("isgrayscale") == Some("1"),
            sync_key: Default::default(),
        }),
        _ => None,
    };

    Ok(LoginPage { ret, message, session })
}

/// Decode `%XX` escapes; malformed escapes pass through untouched.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
