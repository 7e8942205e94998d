mod common;

use common::logged_in_client;
use serde_json::{Value, json};
use wxweb_client::errors::{MediaError, SendError};
use wxweb_client::transport::Body;
use wxweb_client::{Message, MessageKind};

fn ack_response(local_id: i64, msg_id: &str) -> Value {
    json!({
        "BaseResponse": { "Ret": 0 },
        "LocalID": local_id.to_string(),
        "MsgID": msg_id,
    })
}

fn body_json(body: &Body) -> &Value {
    match body {
        Body::Json(v) => v,
        other => panic!("expected JSON body, got {other:?}"),
    }
}

#[tokio::test]
async fn text_send_acknowledges_once() {
    let (client, transport) = logged_in_client().await;
    let mut msg = Message::text("@me", "@friend", "hello").with_create_time(1_700_000_000);

    transport.push_json(ack_response(msg.local_id(), "5555"));
    client.send_message(&mut msg).await.unwrap();
    assert_eq!(msg.server_id(), Some("5555"));

    // A second send must not touch the network.
    let before = transport.request_count();
    assert!(matches!(
        client.send_message(&mut msg).await,
        Err(SendError::AlreadyAcknowledged)
    ));
    assert_eq!(transport.request_count(), before);

    let requests = transport.requests();
    let req = requests.last().unwrap();
    assert!(req.url.ends_with("/webwxsendmsg"));
    let body = body_json(&req.body);
    assert_eq!(body["Scene"], 0);
    assert_eq!(body["Msg"]["Type"], 1);
    assert_eq!(body["Msg"]["Content"], "hello");
    assert_eq!(body["BaseRequest"]["Uin"], 446_174);
    assert_eq!(body["BaseRequest"]["Sid"], "SID");
}

#[tokio::test]
async fn ack_mismatch_is_rejected() {
    let (client, transport) = logged_in_client().await;
    let mut msg = Message::text("@me", "@friend", "hello").with_create_time(1_700_000_000);

    transport.push_json(json!({
        "BaseResponse": { "Ret": 0 },
        "LocalID": "42",
        "MsgID": "5555",
    }));
    match client.send_message(&mut msg).await {
        Err(SendError::AckMismatch { expected, got }) => {
            assert_eq!(expected, msg.local_id().to_string());
            assert_eq!(got, "42");
        }
        other => panic!("expected ack mismatch, got {other:?}"),
    }
    assert!(!msg.is_acknowledged());
}

#[tokio::test]
async fn gif_send_adds_emoji_flag_without_touching_the_message() {
    let (client, transport) = logged_in_client().await;
    let mut msg = Message::animated_image("@me", "@friend", "mid-gif")
        .with_create_time(1_700_000_001);

    transport.push_json(ack_response(msg.local_id(), "6001"));
    client.send_message(&mut msg).await.unwrap();

    let requests = transport.requests();
    let req = requests.last().unwrap();
    assert!(req.url.ends_with("/webwxsendemoticon"));
    assert_eq!(req.query_value("fun"), Some("sys"));
    let body = body_json(&req.body);
    assert_eq!(body["Msg"]["EmojiFlag"], 2);
    assert_eq!(body["Msg"]["MediaId"], "mid-gif");

    // The flag is a wire-side addition; the memoized message value stays
    // clean for any retry through another endpoint.
    assert!(msg.wire_value().get("EmojiFlag").is_none());
}

#[tokio::test]
async fn send_routes_by_kind() {
    let (client, transport) = logged_in_client().await;

    let mut image = Message::image("@me", "@friend", "mid-1").with_create_time(1);
    transport.push_json(ack_response(image.local_id(), "1"));
    client.send_message(&mut image).await.unwrap();
    assert!(transport.requests().last().unwrap().url.ends_with("/webwxsendmsgimg"));

    let mut video = Message::video("@me", "@friend", "mid-2").with_create_time(2);
    transport.push_json(ack_response(video.local_id(), "2"));
    client.send_message(&mut video).await.unwrap();
    assert!(transport.requests().last().unwrap().url.ends_with("/webwxsendvideomsg"));

    let mut file =
        Message::file("@me", "@friend", "mid-3", "doc.pdf", 99, "pdf").with_create_time(3);
    transport.push_json(ack_response(file.local_id(), "3"));
    client.send_message(&mut file).await.unwrap();
    assert!(transport.requests().last().unwrap().url.ends_with("/webwxsendappmsg"));

    let mut notice = Message::new(MessageKind::Notice, "@me", "@friend", "x");
    assert!(matches!(
        client.send_message(&mut notice).await,
        Err(SendError::UnsupportedKind)
    ));
}

#[tokio::test]
async fn media_fetch_requires_acknowledgment_and_routes_by_kind() {
    let (client, transport) = logged_in_client().await;

    let unsent = Message::image("@me", "@friend", "mid-1");
    assert!(matches!(
        client.fetch_media(&unsent).await,
        Err(MediaError::Unacknowledged)
    ));

    let mut image = Message::image("@me", "@friend", "mid-1").with_create_time(4);
    transport.push_json(ack_response(image.local_id(), "9100"));
    client.send_message(&mut image).await.unwrap();

    transport.push_response(200, vec![0xFF, 0xD8]);
    let bytes = client.fetch_media(&image).await.unwrap();
    assert_eq!(bytes, vec![0xFF, 0xD8]);
    let requests = transport.requests();
    let req = requests.last().unwrap();
    assert!(req.url.ends_with("/webwxgetmsgimg"));
    assert_eq!(req.query_value("MsgID"), Some("9100"));

    let mut text = Message::text("@me", "@friend", "hi").with_create_time(5);
    transport.push_json(ack_response(text.local_id(), "9101"));
    client.send_message(&mut text).await.unwrap();
    assert!(matches!(
        client.fetch_media(&text).await,
        Err(MediaError::Unsupported)
    ));
}

#[tokio::test]
async fn file_media_downloads_through_the_file_host() {
    let (client, transport) = logged_in_client().await;

    // A received file message, as the sync loop would decode it.
    let wire = json!({
        "MsgType": 6,
        "MsgId": "8800",
        "FromUserName": "@friend",
        "ToUserName": "@me",
        "CreateTime": 6,
        "Content": "&lt;appattach&gt;&lt;filename&gt;doc.pdf&lt;/filename&gt;\
                    &lt;filesize&gt;4&lt;/filesize&gt;&lt;fileext&gt;pdf&lt;/fileext&gt;\
                    &lt;attachid&gt;@media9&lt;/attachid&gt;&lt;/appattach&gt;",
        "MediaId": "",
    });
    let msg = wxweb_proto::decode(&wire).unwrap();

    transport.push_response(200, b"%PDF".to_vec());
    let bytes = client.fetch_media(&msg).await.unwrap();
    assert_eq!(bytes, b"%PDF".to_vec());

    let requests = transport.requests();
    let req = requests.last().unwrap();
    assert!(req.url.starts_with("https://file.wx.qq.com/"));
    assert!(req.url.ends_with("/webwxgetmedia"));
    assert_eq!(req.query_value("mediaid"), Some("@media9"));
    assert_eq!(req.query_value("sender"), Some("@friend"));
    assert_eq!(req.query_value("webwx_data_ticket"), Some("dt-abc"));
}
