//! Typed webwx messages and their wire codec.
//!
//! The service ships every message as a loosely-typed JSON object whose
//! `MsgType` integer selects the real shape; `MsgType` 49 is a wrapper whose
//! true kind sits in a secondary `AppMsgType` field. Decoding goes through a
//! closed lookup table built once at startup — there is no runtime
//! registration.

use std::collections::HashMap;
use std::fmt;
use std::sync::{LazyLock, OnceLock};

use serde_json::{Value, json};

use crate::markup::{self, ATTRS_KEY, MarkupError, MarkupTree};

/// Fixed appid stamped into outgoing `appmsg` documents.
const APPMSG_APPID: &str = "wxeb7ec651dd0aefa9";

const EXTENDED_CODE: i64 = 49;

// ─── MessageKind ──────────────────────────────────────────────────────────────

/// Closed sum of wire message kinds.
///
/// Media kinds carry the server-side media identifier obtained from an
/// upload or a received payload; [`MessageKind::File`] additionally carries
/// the attachment metadata the `appmsg` document needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Image { media_id: String },
    AnimatedImage { media_id: String },
    Voice { media_id: String },
    Video { media_id: String },
    File { media_id: String, filename: String, size: u64, extension: String },
    LocationShare,
    BusinessCard,
    Transfer,
    ChatLog,
    ShareLink,
    MiniApp,
    Notice,
    Revoke,
    StatusNotify,
    /// Wrapper kind; received instances always decode to the kind named by
    /// the secondary discriminator, never to this variant.
    Extended,
}

impl MessageKind {
    /// Wire discriminator.
    pub fn code(&self) -> i64 {
        match self {
            Self::ChatLog => 0,
            Self::Text => 1,
            Self::Image { .. } => 3,
            Self::ShareLink => 5,
            Self::File { .. } => 6,
            Self::LocationShare => 17,
            Self::MiniApp => 33,
            Self::Voice { .. } => 34,
            Self::BusinessCard => 42,
            Self::Video { .. } => 43,
            Self::AnimatedImage { .. } => 47,
            Self::Extended => 49,
            Self::StatusNotify => 51,
            Self::Transfer => 2000,
            Self::Notice => 10000,
            Self::Revoke => 10002,
        }
    }

    /// Media identifier, for kinds that carry one.
    pub fn media_id(&self) -> Option<&str> {
        match self {
            Self::Image { media_id }
            | Self::AnimatedImage { media_id }
            | Self::Voice { media_id }
            | Self::Video { media_id }
            | Self::File { media_id, .. } => Some(media_id),
            _ => None,
        }
    }
}

// ─── CodecError ───────────────────────────────────────────────────────────────

/// Decode/acknowledge failure.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    /// No decoder registered for this discriminator (or secondary
    /// discriminator, for wrapper payloads).
    UnsupportedKind { kind: i64, app_kind: Option<i64> },
    /// A required wire field is absent.
    Missing(&'static str),
    /// A wire field is present but has the wrong shape.
    Malformed { field: &'static str },
    /// Embedded markup payload failed to parse.
    Markup(MarkupError),
    /// The message already carries a server id.
    AlreadyAcknowledged,
    /// Acknowledgment echoed a different local id than the one sent.
    AckMismatch { expected: String, got: String },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedKind { kind, app_kind: Some(app) } => {
                write!(f, "unsupported message kind {kind} (app kind {app})")
            }
            Self::UnsupportedKind { kind, app_kind: None } => {
                write!(f, "unsupported message kind {kind}")
            }
            Self::Missing(field) => write!(f, "missing wire field {field}"),
            Self::Malformed { field } => write!(f, "malformed wire field {field}"),
            Self::Markup(e) => write!(f, "embedded markup: {e}"),
            Self::AlreadyAcknowledged => write!(f, "message is already acknowledged"),
            Self::AckMismatch { expected, got } => {
                write!(f, "acknowledge id mismatch: sent {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Markup(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MarkupError> for CodecError {
    fn from(e: MarkupError) -> Self {
        Self::Markup(e)
    }
}

// ─── Message ──────────────────────────────────────────────────────────────────

/// A single chat message, either composed locally or decoded off the wire.
///
/// The local id is derived from the creation timestamp at microsecond
/// resolution and is what the service echoes back on acknowledgment; the
/// server id exists only once the message has been acknowledged. Decoded
/// messages arrive already acknowledged.
#[derive(Debug, Clone)]
pub struct Message {
    from_user: String,
    to_user: String,
    content: String,
    create_time: i64,
    local_id: i64,
    server_id: Option<String>,
    kind: MessageKind,
    wire: OnceLock<Value>,
}

impl Message {
    /// Compose a message with the current time as creation timestamp.
    pub fn new(
        kind: MessageKind,
        from_user: impl Into<String>,
        to_user: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let create_time = chrono::Utc::now().timestamp();
        Self {
            from_user: from_user.into(),
            to_user: to_user.into(),
            content: content.into(),
            create_time,
            local_id: local_id_for(create_time),
            server_id: None,
            kind,
            wire: OnceLock::new(),
        }
    }

    pub fn text(
        from_user: impl Into<String>,
        to_user: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(MessageKind::Text, from_user, to_user, content)
    }

    pub fn image(
        from_user: impl Into<String>,
        to_user: impl Into<String>,
        media_id: impl Into<String>,
    ) -> Self {
        Self::new(MessageKind::Image { media_id: media_id.into() }, from_user, to_user, "")
    }

    pub fn animated_image(
        from_user: impl Into<String>,
        to_user: impl Into<String>,
        media_id: impl Into<String>,
    ) -> Self {
        Self::new(MessageKind::AnimatedImage { media_id: media_id.into() }, from_user, to_user, "")
    }

    pub fn voice(
        from_user: impl Into<String>,
        to_user: impl Into<String>,
        media_id: impl Into<String>,
    ) -> Self {
        Self::new(MessageKind::Voice { media_id: media_id.into() }, from_user, to_user, "")
    }

    pub fn video(
        from_user: impl Into<String>,
        to_user: impl Into<String>,
        media_id: impl Into<String>,
    ) -> Self {
        Self::new(MessageKind::Video { media_id: media_id.into() }, from_user, to_user, "")
    }

    pub fn file(
        from_user: impl Into<String>,
        to_user: impl Into<String>,
        media_id: impl Into<String>,
        filename: impl Into<String>,
        size: u64,
        extension: impl Into<String>,
    ) -> Self {
        let kind = MessageKind::File {
            media_id: media_id.into(),
            filename: filename.into(),
            size,
            extension: extension.into(),
        };
        Self::new(kind, from_user, to_user, "")
    }

    /// Rebase the message on an explicit creation timestamp (unix seconds).
    /// The local id follows the timestamp.
    pub fn with_create_time(mut self, create_time: i64) -> Self {
        self.create_time = create_time;
        self.local_id = local_id_for(create_time);
        self.wire = OnceLock::new();
        self
    }

    pub fn from_user(&self) -> &str {
        &self.from_user
    }

    pub fn to_user(&self) -> &str {
        &self.to_user
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Creation timestamp, unix seconds.
    pub fn create_time(&self) -> i64 {
        self.create_time
    }

    /// Client-generated id used for send deduplication and ack matching.
    pub fn local_id(&self) -> i64 {
        self.local_id
    }

    /// Server-assigned id; present only after acknowledgment.
    pub fn server_id(&self) -> Option<&str> {
        self.server_id.as_deref()
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn is_acknowledged(&self) -> bool {
        self.server_id.is_some()
    }

    /// Record the server's acknowledgment. Fails if the echoed local id
    /// differs from ours or the message was already acknowledged.
    pub fn ack(&mut self, local_id: &str, server_id: impl Into<String>) -> Result<(), CodecError> {
        if self.server_id.is_some() {
            return Err(CodecError::AlreadyAcknowledged);
        }
        let expected = self.local_id.to_string();
        if local_id != expected {
            return Err(CodecError::AckMismatch { expected, got: local_id.to_string() });
        }
        self.server_id = Some(server_id.into());
        Ok(())
    }

    /// The outgoing wire body. Memoized: repeated calls return the identical
    /// value, so a retried send carries the exact same payload.
    pub fn wire_value(&self) -> &Value {
        self.wire.get_or_init(|| {
            let mut v = json!({
                "Type": self.kind.code(),
                "FromUserName": self.from_user,
                "ToUserName": self.to_user,
                // Legacy field and the canonical one; both must be present.
                "LocalID": self.local_id,
                "ClientMsgId": self.local_id,
            });
            match &self.kind {
                MessageKind::Image { media_id }
                | MessageKind::AnimatedImage { media_id }
                | MessageKind::Voice { media_id }
                | MessageKind::Video { media_id } => {
                    v["MediaId"] = Value::String(media_id.clone());
                }
                MessageKind::File { .. } => {
                    v["Content"] = Value::String(self.appmsg_document());
                }
                _ => {
                    v["Content"] = Value::String(self.content.clone());
                }
            }
            v
        })
    }

    fn appmsg_document(&self) -> String {
        let MessageKind::File { media_id, filename, size, extension } = &self.kind else {
            return String::new();
        };
        let attrs: MarkupTree = [("appid", APPMSG_APPID), ("sdkver", "")].into_iter().collect();
        let attach: MarkupTree = [
            ("totallen", size.to_string()),
            ("attachid", media_id.clone()),
            ("fileext", extension.clone()),
        ]
        .into_iter()
        .collect();

        let mut appmsg = MarkupTree::new();
        appmsg.insert(ATTRS_KEY, attrs);
        appmsg.insert("title", filename.as_str());
        appmsg.insert("des", "");
        appmsg.insert("action", "");
        appmsg.insert("type", self.kind.code().to_string());
        appmsg.insert("content", self.content.as_str());
        appmsg.insert("url", "");
        appmsg.insert("lowurl", "");
        appmsg.insert("appattach", attach);
        appmsg.insert("extinfo", "");

        let mut doc = MarkupTree::new();
        doc.insert("appmsg", appmsg);
        markup::serialize(&doc)
    }
}

fn local_id_for(create_time: i64) -> i64 {
    create_time * 1_000_000
}

// ─── Decoding ─────────────────────────────────────────────────────────────────

type DecodeFn = fn(&Value) -> Result<Message, CodecError>;

// Every kind except the Extended wrapper; wrapper payloads re-dispatch on
// their secondary discriminator against this same table.
static REGISTRY: LazyLock<HashMap<i64, DecodeFn>> = LazyLock::new(|| {
    let mut table: HashMap<i64, DecodeFn> = HashMap::new();
    table.insert(0, |v| decode_plain(v, MessageKind::ChatLog));
    table.insert(1, |v| decode_plain(v, MessageKind::Text));
    table.insert(3, |v| decode_media(v, |id| MessageKind::Image { media_id: id }));
    table.insert(5, |v| decode_plain(v, MessageKind::ShareLink));
    table.insert(6, decode_file);
    table.insert(17, decode_location_share);
    table.insert(33, |v| decode_plain(v, MessageKind::MiniApp));
    table.insert(34, |v| decode_media(v, |id| MessageKind::Voice { media_id: id }));
    table.insert(42, |v| decode_plain(v, MessageKind::BusinessCard));
    table.insert(43, |v| decode_media(v, |id| MessageKind::Video { media_id: id }));
    table.insert(47, |v| decode_media(v, |id| MessageKind::AnimatedImage { media_id: id }));
    table.insert(51, |v| decode_plain(v, MessageKind::StatusNotify));
    table.insert(2000, |v| decode_plain(v, MessageKind::Transfer));
    table.insert(10000, |v| decode_plain(v, MessageKind::Notice));
    table.insert(10002, |v| decode_plain(v, MessageKind::Revoke));
    table
});

/// Decode one entry of a sync batch into a typed [`Message`].
///
/// The result is always already acknowledged with the wire-provided server
/// id. Unknown discriminators yield [`CodecError::UnsupportedKind`]; callers
/// are expected to skip the entry, not abort the batch.
pub fn decode(value: &Value) -> Result<Message, CodecError> {
    let kind = field_i64(value, "MsgType")?;
    let code = if kind == EXTENDED_CODE {
        field_i64(value, "AppMsgType")?
    } else {
        kind
    };
    let decode_fn = REGISTRY.get(&code).ok_or(CodecError::UnsupportedKind {
        kind,
        app_kind: (kind == EXTENDED_CODE).then_some(code),
    })?;
    decode_fn(value)
}

struct CommonFields {
    from_user: String,
    to_user: String,
    create_time: i64,
    server_id: String,
}

fn decode_common(value: &Value) -> Result<CommonFields, CodecError> {
    Ok(CommonFields {
        from_user: field_str(value, "FromUserName")?.to_string(),
        to_user: field_str(value, "ToUserName")?.to_string(),
        create_time: field_i64(value, "CreateTime")?,
        server_id: field_id(value, "MsgId")?,
    })
}

fn build(common: CommonFields, kind: MessageKind, content: String) -> Message {
    Message {
        from_user: common.from_user,
        to_user: common.to_user,
        content,
        create_time: common.create_time,
        local_id: local_id_for(common.create_time),
        server_id: Some(common.server_id),
        kind,
        wire: OnceLock::new(),
    }
}

fn decode_plain(value: &Value, kind: MessageKind) -> Result<Message, CodecError> {
    let common = decode_common(value)?;
    let content = markup::unescape(field_str(value, "Content")?);
    Ok(build(common, kind, content))
}

fn decode_media(value: &Value, kind: fn(String) -> MessageKind) -> Result<Message, CodecError> {
    let common = decode_common(value)?;
    let media_id = field_str(value, "MediaId")?.to_string();
    let content = markup::unescape(field_str(value, "Content")?);
    Ok(build(common, kind(media_id), content))
}

fn decode_location_share(value: &Value) -> Result<Message, CodecError> {
    let common = decode_common(value)?;
    let doc = markup::parse(&markup::unescape(field_str(value, "Content")?))?;
    let title = doc
        .path(&["msg", "appmsg"])
        .and_then(|t| t.text("title"))
        .ok_or(CodecError::Missing("msg.appmsg.title"))?;
    Ok(build(common, MessageKind::LocationShare, title.to_string()))
}

/// The service ships file messages in two shapes: wrapped in an Extended
/// payload with the metadata under `msg.appmsg`, or as a bare kind-6 payload
/// with a top-level `appattach`. Both must decode.
fn decode_file(value: &Value) -> Result<Message, CodecError> {
    let common = decode_common(value)?;
    let wire_media_id = field_str(value, "MediaId")?.to_string();
    let doc = markup::parse(&markup::unescape(field_str(value, "Content")?))?;

    let kind = if field_i64(value, "MsgType")? == EXTENDED_CODE {
        let appmsg = doc.path(&["msg", "appmsg"]).ok_or(CodecError::Missing("msg.appmsg"))?;
        let attach = appmsg.tree("appattach").ok_or(CodecError::Missing("msg.appmsg.appattach"))?;
        MessageKind::File {
            media_id: wire_media_id,
            filename: appmsg
                .text("title")
                .ok_or(CodecError::Missing("msg.appmsg.title"))?
                .to_string(),
            size: parse_size(attach.text("totallen"), "totallen")?,
            extension: attach
                .text("fileext")
                .ok_or(CodecError::Missing("appattach.fileext"))?
                .to_string(),
        }
    } else {
        let attach = doc.tree("appattach").ok_or(CodecError::Missing("appattach"))?;
        let media_id = if wire_media_id.is_empty() {
            // Some senders omit the outer media id; the attachment's own id
            // stands in for it.
            attach
                .text("attachid")
                .ok_or(CodecError::Missing("appattach.attachid"))?
                .to_string()
        } else {
            wire_media_id
        };
        MessageKind::File {
            media_id,
            filename: attach
                .text("filename")
                .ok_or(CodecError::Missing("appattach.filename"))?
                .to_string(),
            size: parse_size(attach.text("filesize"), "filesize")?,
            extension: attach
                .text("fileext")
                .ok_or(CodecError::Missing("appattach.fileext"))?
                .to_string(),
        }
    };

    Ok(build(common, kind, String::new()))
}

fn parse_size(text: Option<&str>, field: &'static str) -> Result<u64, CodecError> {
    text.ok_or(CodecError::Missing(field))?
        .parse()
        .map_err(|_| CodecError::Malformed { field })
}

fn field_str<'a>(value: &'a Value, field: &'static str) -> Result<&'a str, CodecError> {
    value
        .get(field)
        .ok_or(CodecError::Missing(field))?
        .as_str()
        .ok_or(CodecError::Malformed { field })
}

/// Integer field that may arrive as a JSON number or a numeric string.
fn field_i64(value: &Value, field: &'static str) -> Result<i64, CodecError> {
    match value.get(field).ok_or(CodecError::Missing(field))? {
        Value::Number(n) => n.as_i64().ok_or(CodecError::Malformed { field }),
        Value::String(s) => s.parse().map_err(|_| CodecError::Malformed { field }),
        _ => Err(CodecError::Malformed { field }),
    }
}

/// Identifier field that may arrive as a string or a number.
fn field_id(value: &Value, field: &'static str) -> Result<String, CodecError> {
    match value.get(field).ok_or(CodecError::Missing(field))? {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(CodecError::Malformed { field }),
    }
}
