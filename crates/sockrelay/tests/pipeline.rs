#![cfg(all(target_os = "linux", feature = "http"))]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use sockrelay::http::{router, AppState, HttpConfig};
use sockrelay::link::{LinkConfig, ResilientLink};
use sockrelay::relay::{default_output_path, ProcessingError, RelayConfig, RelayServer};
use tower::ServiceExt;

const BOUNDARY: &str = "pipeline-boundary";

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/sockrelay-pipeline-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn upload_request(file_name: &str, content: &str) -> Request<Body> {
    let body = format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"myfile\"; filename=\"{file_name}\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n\
         {content}\r\n\
         --{BOUNDARY}--\r\n"
    );
    Request::post("/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .expect("upload request should build")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_flows_through_consumer_to_event_stream() {
    let dir = unique_temp_dir("flow");

    // Stub transcoder: writes the output next to the source.
    let convert = |source: &Path| -> Result<PathBuf, ProcessingError> {
        let output = default_output_path(source);
        std::fs::copy(source, &output).map_err(|source_err| ProcessingError::Spawn {
            program: "copy".to_string(),
            source: source_err,
        })?;
        Ok(output)
    };
    let relay = RelayServer::bind(
        RelayConfig {
            listen: "127.0.0.1:0".to_string(),
            raise_fd_limit: false,
            ..RelayConfig::default()
        },
        Arc::new(convert),
    )
    .expect("relay should bind")
    .spawn()
    .expect("relay should start");

    let link = ResilientLink::connect(LinkConfig::new(format!(
        "ws://{}/websocket",
        relay.local_addr()
    )))
    .expect("link should connect");

    let state = AppState::new(
        HttpConfig {
            files_dir: dir.join("files"),
            static_dir: dir.join("static"),
            ..HttpConfig::default()
        },
        Arc::new(link.sender()),
        link.fanout().clone(),
    );
    let app = router(state);

    let events = app
        .clone()
        .oneshot(Request::get("/sse").body(Body::empty()).expect("sse request"))
        .await
        .expect("sse should respond");
    assert_eq!(events.status(), StatusCode::OK);

    let uploaded = app
        .clone()
        .oneshot(upload_request("clip.mov", "frames"))
        .await
        .expect("upload should respond");
    assert_eq!(uploaded.status(), StatusCode::OK);

    let mut body = events.into_body();
    let frame = tokio::time::timeout(Duration::from_secs(10), body.frame())
        .await
        .expect("event should arrive")
        .expect("stream should yield a frame")
        .expect("frame should not error");
    let data = String::from_utf8(frame.into_data().expect("data frame").to_vec())
        .expect("event should be UTF-8");
    assert!(data.starts_with("data: "), "unexpected event {data:?}");
    assert!(data.ends_with(".mov.mp4\n\n"), "unexpected event {data:?}");

    let converted = data
        .trim_start_matches("data: ")
        .trim_end()
        .to_string();
    let download = app
        .oneshot(
            Request::get(format!("/download/{converted}"))
                .body(Body::empty())
                .expect("download request"),
        )
        .await
        .expect("download should respond");
    assert_eq!(download.status(), StatusCode::OK);
    let bytes = download
        .into_body()
        .collect()
        .await
        .expect("download body")
        .to_bytes();
    assert_eq!(&bytes[..], b"frames");

    link.shutdown();
    relay.shutdown().expect("relay should stop cleanly");
    let _ = std::fs::remove_dir_all(&dir);
}
