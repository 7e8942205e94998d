mod common;

use common::logged_in_client;
use serde_json::{Value, json};
use wxweb_client::errors::GatewayError;
use wxweb_client::media::FileResource;
use wxweb_client::transport::{Body, MultipartForm};

const CHUNK: usize = 512 * 1024;

fn ok_chunk() -> Value {
    json!({ "BaseResponse": { "Ret": 0 } })
}

fn final_chunk(start_pos: usize, media_id: &str) -> Value {
    json!({ "BaseResponse": { "Ret": 0 }, "StartPos": start_pos, "MediaId": media_id })
}

fn multipart(body: &Body) -> &MultipartForm {
    match body {
        Body::Multipart(form) => form,
        other => panic!("expected multipart body, got {other:?}"),
    }
}

#[tokio::test]
async fn large_upload_goes_out_in_chunks() {
    let (client, transport) = logged_in_client().await;
    let size = CHUNK * 5 / 2; // 2.5 chunks
    let resource = FileResource::new("big.bin", vec![0u8; size]);

    transport.push_json(ok_chunk());
    transport.push_json(ok_chunk());
    transport.push_json(final_chunk(size, "MEDIA-BIG"));

    let media_id = client.upload(&resource, "@friend").await.unwrap();
    assert_eq!(media_id, "MEDIA-BIG");

    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    for (index, req) in requests.iter().enumerate() {
        assert!(req.url.starts_with("https://file.wx.qq.com/"));
        assert!(req.url.ends_with("/webwxuploadmedia"));
        assert_eq!(req.query_value("f"), Some("json"));

        let form = multipart(&req.body);
        assert_eq!(form.field("id"), Some("WU_FILE_0"));
        assert_eq!(form.field("name"), Some("big.bin"));
        assert_eq!(form.field("size"), Some(size.to_string().as_str()));
        assert_eq!(form.field("chunk"), Some(index.to_string().as_str()));
        assert_eq!(form.field("chunks"), Some("3"));
        assert_eq!(form.field("webwx_data_ticket"), Some("dt-abc"));
        assert_eq!(form.field("pass_ticket"), Some("ticket=="));

        let request_json: Value =
            serde_json::from_str(form.field("uploadmediarequest").unwrap()).unwrap();
        assert_eq!(request_json["UploadType"], 2);
        assert_eq!(request_json["MediaType"], 4);
        assert_eq!(request_json["TotalLen"], size);
        assert_eq!(request_json["StartPos"], 0);
        assert_eq!(request_json["FromUserName"], "@me");
        assert_eq!(request_json["ToUserName"], "@friend");

        let file = form.file.as_ref().unwrap();
        assert_eq!(file.part, "filename");
        let expected_len = if index < 2 { CHUNK } else { size - 2 * CHUNK };
        assert_eq!(file.data.len(), expected_len);
    }
}

#[tokio::test]
async fn small_upload_is_a_single_unindexed_request() {
    let (client, transport) = logged_in_client().await;
    let resource = FileResource::new("note.txt", b"hello".to_vec());

    transport.push_json(final_chunk(5, "MEDIA-SMALL"));
    let media_id = client.upload(&resource, "@friend").await.unwrap();
    assert_eq!(media_id, "MEDIA-SMALL");

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    let form = multipart(&requests[0].body);
    assert_eq!(form.field("chunk"), None);
    assert_eq!(form.field("chunks"), None);
    assert_eq!(form.field("mediatype"), Some("doc"));
}

#[tokio::test]
async fn empty_upload_is_rejected_without_a_request() {
    let (client, transport) = logged_in_client().await;
    let resource = FileResource::new("empty.bin", Vec::new());

    assert!(matches!(
        client.upload(&resource, "@friend").await,
        Err(GatewayError::EmptyUpload)
    ));
    assert_eq!(transport.request_count(), 0);
}

#[tokio::test]
async fn short_final_position_fails_the_upload() {
    let (client, transport) = logged_in_client().await;
    let resource = FileResource::new("note.txt", b"hello world".to_vec());

    transport.push_json(final_chunk(5, "MEDIA-X"));
    match client.upload(&resource, "@friend").await {
        Err(GatewayError::UploadIncomplete { reported, expected }) => {
            assert_eq!(reported, 5);
            assert_eq!(expected, 11);
        }
        other => panic!("expected incomplete upload, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_middle_chunk_aborts() {
    let (client, transport) = logged_in_client().await;
    let resource = FileResource::new("big.bin", vec![1u8; CHUNK * 3]);

    transport.push_json(ok_chunk());
    transport.push_json(json!({ "BaseResponse": { "Ret": -1 } }));
    assert!(matches!(
        client.upload(&resource, "@friend").await,
        Err(GatewayError::ApiResponse { ret: -1 })
    ));
    assert_eq!(transport.request_count(), 2);
}
