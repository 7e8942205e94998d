mod common;

use common::logged_in_client;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wxweb_client::errors::GatewayError;
use wxweb_client::{MessageKind, SyncEvent};

fn sync_check_body(retcode: i64, selector: i64) -> String {
    format!(r#"window.synccheck={{retcode:"{retcode}",selector:"{selector}"}}"#)
}

fn text_entry(msg_id: &str, content: &str) -> serde_json::Value {
    json!({
        "MsgType": 1,
        "MsgId": msg_id,
        "FromUserName": "@friend",
        "ToUserName": "@me",
        "CreateTime": 1_600_000_000,
        "Content": content,
    })
}

fn batch(entries: Vec<serde_json::Value>, key_val: i64) -> serde_json::Value {
    json!({
        "BaseResponse": { "Ret": 0 },
        "AddMsgList": entries,
        "SyncKey": { "Count": 1, "List": [{ "Key": 1, "Val": key_val }] },
    })
}

#[tokio::test]
async fn cursor_commits_only_on_flush() {
    let (client, transport) = logged_in_client().await;

    transport.push_text(&sync_check_body(0, 2));
    assert_eq!(client.sync_check().await.unwrap(), 2);

    transport.push_json(batch(vec![text_entry("1", "hi")], 999));
    let fetched = client.sync_message().await.unwrap();
    assert_eq!(fetched["AddMsgList"][0]["Content"], "hi");
    // The envelope is stripped before the batch reaches the caller.
    assert!(fetched.get("BaseResponse").is_none());

    // Not committed yet: a crash here re-delivers the batch.
    let staged = client.dump().await;
    assert_eq!(
        staged.session.wx_session.as_ref().unwrap().sync_key.render(),
        "1_100|2_200"
    );

    client.flush_sync_key().await;
    let committed = client.dump().await;
    assert_eq!(
        committed.session.wx_session.as_ref().unwrap().sync_key.render(),
        "1_999"
    );

    // The next status check carries the committed cursor.
    transport.push_text(&sync_check_body(0, 0));
    client.sync_check().await.unwrap();
    let requests = transport.requests();
    let last = requests.last().unwrap();
    assert_eq!(last.query_value("synckey"), Some("1_999"));
}

#[tokio::test]
async fn sync_check_classifies_retcodes() {
    let (client, transport) = logged_in_client().await;

    transport.push_text(&sync_check_body(1101, 0));
    assert!(matches!(
        client.sync_check().await,
        Err(GatewayError::SessionExpired)
    ));

    transport.push_text(&sync_check_body(1100, 0));
    assert!(matches!(
        client.sync_check().await,
        Err(GatewayError::ApiResponse { ret: 1100 })
    ));
}

#[tokio::test]
async fn stream_delivers_messages_and_ends_on_expiry() {
    let (client, transport) = logged_in_client().await;

    transport.push_text(&sync_check_body(0, 2));
    transport.push_json(batch(
        vec![text_entry("10", "first"), text_entry("11", "second")],
        300,
    ));
    transport.push_text(&sync_check_body(1101, 0));

    let mut stream = client.message_stream(CancellationToken::new());

    match stream.recv().await.unwrap() {
        SyncEvent::Message(m) => {
            assert_eq!(*m.kind(), MessageKind::Text);
            assert_eq!(m.content(), "first");
            assert_eq!(m.server_id(), Some("10"));
        }
        other => panic!("expected message, got {other:?}"),
    }
    match stream.recv().await.unwrap() {
        SyncEvent::Message(m) => assert_eq!(m.content(), "second"),
        other => panic!("expected message, got {other:?}"),
    }
    assert!(matches!(stream.recv().await, Some(SyncEvent::SessionExpired)));
    assert!(stream.recv().await.is_none());
    stream.join().await;

    // The handled batch was committed before the loop ended.
    let snapshot = client.dump().await;
    assert_eq!(
        snapshot.session.wx_session.unwrap().sync_key.render(),
        "1_300"
    );
}

#[tokio::test]
async fn stream_skips_undecodable_entries() {
    let (client, transport) = logged_in_client().await;

    let unknown = json!({
        "MsgType": 777,
        "MsgId": "1",
        "FromUserName": "@friend",
        "ToUserName": "@me",
        "CreateTime": 1,
        "Content": "",
    });
    transport.push_text(&sync_check_body(0, 2));
    transport.push_json(batch(vec![unknown, text_entry("12", "kept")], 301));
    transport.push_text(&sync_check_body(1101, 0));

    let mut stream = client.message_stream(CancellationToken::new());
    match stream.recv().await.unwrap() {
        SyncEvent::Message(m) => assert_eq!(m.content(), "kept"),
        other => panic!("expected message, got {other:?}"),
    }
    assert!(matches!(stream.recv().await, Some(SyncEvent::SessionExpired)));
}

#[tokio::test]
async fn stream_retries_transient_failures_and_stops_on_garbage() {
    let (client, transport) = logged_in_client().await;

    // A network failure is retried; an unparsable status body is not.
    transport.push_error();
    transport.push_text(&sync_check_body(0, 2));
    transport.push_json(batch(vec![text_entry("13", "after retry")], 303));
    transport.push_text("window.nonsense=1;");

    let mut stream = client.message_stream(CancellationToken::new());
    match stream.recv().await.unwrap() {
        SyncEvent::Message(m) => assert_eq!(m.content(), "after retry"),
        other => panic!("expected message, got {other:?}"),
    }
    assert!(stream.recv().await.is_none());
    stream.join().await;
    assert_eq!(transport.request_count(), 4);
}

#[tokio::test]
async fn cancelled_stream_leaves_cursor_staged() {
    let (client, transport) = logged_in_client().await;
    let cancel = CancellationToken::new();

    // More entries than the stream buffers, so with no reader the loop is
    // guaranteed to still be mid-batch when the cancel lands.
    let entries: Vec<_> = (0..500).map(|i| text_entry(&i.to_string(), "x")).collect();
    transport.push_text(&sync_check_body(0, 2));
    transport.push_json(batch(entries, 302));

    let stream = client.message_stream(cancel.clone());
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    cancel.cancel();
    stream.join().await;

    // The batch was never fully handled, so the cursor must not move.
    let snapshot = client.dump().await;
    assert_eq!(
        snapshot.session.wx_session.unwrap().sync_key.render(),
        "1_100|2_200"
    );
}
