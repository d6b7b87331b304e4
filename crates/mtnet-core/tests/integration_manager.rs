//! End-to-end tests through the request manager against a local server:
//! plain methods, single and multi-segment downloads, redirects, and the
//! three cancellation scopes.

mod common;

use std::sync::Once;
use std::time::Duration;

use mtnet_core::config::ManagerConfig;
use mtnet_core::{
    DownloadConfig, ReplyEvent, RequestContext, RequestKind, RequestManager,
};

use common::range_server::{self, RangeServerOptions};

fn manager() -> std::sync::Arc<RequestManager> {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // A fixed pool large enough for the tests that run concurrently.
        let cfg = ManagerConfig {
            max_workers: 16,
            ..Default::default()
        };
        assert!(RequestManager::initialize_with(cfg));
    });
    RequestManager::global().expect("manager initialized")
}

fn test_body(len: usize) -> Vec<u8> {
    (0u8..=255).cycle().take(len).collect()
}

#[tokio::test]
async fn simple_get_returns_body_and_headers() {
    let mgr = manager();
    let body = test_body(4096);
    let url = range_server::start(body.clone());

    let mut reply = mgr
        .submit(RequestContext::new(RequestKind::Get, &url))
        .expect("valid url accepted");
    let id = reply.task().id;
    assert!(id > 0);

    let rsp = reply.wait_finished().await.expect("terminal result");
    assert!(rsp.success, "error: {}", rsp.error_message);
    assert!(rsp.error_message.is_empty());
    assert_eq!(rsp.body, body);
    assert_eq!(rsp.headers.get("Content-Type"), Some("application/octet-stream"));
    assert_eq!(rsp.task.id, id);
    assert_eq!(rsp.performance.bytes_received, body.len() as u64);

    // Channel closes after the terminal event.
    assert!(reply.recv().await.is_none());
}

#[tokio::test]
async fn invalid_url_rejected_at_submission() {
    let mgr = manager();
    assert!(mgr
        .submit(RequestContext::new(RequestKind::Get, "not a url"))
        .is_none());
    assert!(mgr
        .submit(RequestContext::new(RequestKind::Get, "file:///etc/passwd"))
        .is_none());
}

#[tokio::test]
async fn post_echoes_body() {
    let mgr = manager();
    let url = range_server::start(Vec::new());

    let mut ctx = RequestContext::new(RequestKind::Post, &url);
    ctx.body = "{\"k\":1}".to_string();
    ctx.headers.insert("Content-Type", "application/json");

    let mut reply = mgr.submit(ctx).expect("submitted");
    let rsp = reply.wait_finished().await.expect("terminal result");
    assert!(rsp.success, "error: {}", rsp.error_message);
    assert!(rsp.body_text().contains("\"k\":1"));
}

#[tokio::test]
async fn head_has_headers_but_no_body() {
    let mgr = manager();
    let url = range_server::start(test_body(1000));

    let mut reply = mgr
        .submit(RequestContext::new(RequestKind::Head, &url))
        .expect("submitted");
    let rsp = reply.wait_finished().await.expect("terminal result");
    assert!(rsp.success, "error: {}", rsp.error_message);
    assert!(rsp.body.is_empty());
    assert_eq!(rsp.headers.get("Content-Length"), Some("1000"));
}

#[tokio::test]
async fn redirects_followed_within_budget() {
    let mgr = manager();
    let body = test_body(2048);
    let base = range_server::start(body.clone());

    let mut reply = mgr
        .submit(RequestContext::new(
            RequestKind::Get,
            format!("{}hop2", base),
        ))
        .expect("submitted");
    let rsp = reply.wait_finished().await.expect("terminal result");
    assert!(rsp.success, "error: {}", rsp.error_message);
    assert_eq!(rsp.body, body);
}

#[tokio::test]
async fn redirect_budget_exhaustion_fails() {
    let mgr = manager();
    let base = range_server::start(test_body(128));

    // Five hops against the default budget of three.
    let mut reply = mgr
        .submit(RequestContext::new(
            RequestKind::Get,
            format!("{}hop5", base),
        ))
        .expect("submitted");
    let rsp = reply.wait_finished().await.expect("terminal result");
    assert!(!rsp.success);
    assert!(!rsp.cancelled);
    assert!(rsp.error_message.contains("302"), "got: {}", rsp.error_message);
}

#[tokio::test]
async fn multi_segment_download_matches_source() {
    let mgr = manager();
    let body = test_body(256 * 1024);
    let base = range_server::start(body.clone());
    let dir = tempfile::tempdir().unwrap();

    let mut ctx = RequestContext::new(RequestKind::MtDownload, format!("{}files/data.bin", base));
    ctx.download = Some(DownloadConfig {
        save_dir: dir.path().to_path_buf(),
        overwrite: true,
        thread_count: 4,
        ..Default::default()
    });

    let mut reply = mgr.submit(ctx).expect("submitted");
    let rsp = reply.wait_finished().await.expect("terminal result");
    assert!(rsp.success, "error: {}", rsp.error_message);
    assert!(rsp.body_text().contains("average speed"));

    let final_path = dir.path().join("data.bin");
    let content = std::fs::read(&final_path).expect("final file exists");
    assert_eq!(content.len(), body.len());
    assert_eq!(content, body, "multi-segment bytes equal the source");

    // No temp file left behind.
    let names: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(names.len(), 1, "only the final file remains: {:?}", names);
}

#[tokio::test]
async fn multi_segment_failure_leaves_no_files() {
    let mgr = manager();
    let body = test_body(64 * 1024);
    // HEAD advertises a length but GET ignores Range: segments see 200 and
    // must reject the transfer instead of writing wrong bytes.
    let base = range_server::start_with_options(
        body,
        RangeServerOptions {
            support_ranges: false,
            ..Default::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();

    let mut ctx = RequestContext::new(RequestKind::MtDownload, format!("{}nodata.bin", base));
    ctx.download = Some(DownloadConfig {
        save_dir: dir.path().to_path_buf(),
        overwrite: true,
        thread_count: 3,
        ..Default::default()
    });

    let mut reply = mgr.submit(ctx).expect("submitted");
    let rsp = reply.wait_finished().await.expect("terminal result");
    assert!(!rsp.success);
    assert!(!rsp.error_message.is_empty());

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert!(leftovers.is_empty(), "temp and final absent: {:?}", leftovers);
}

#[tokio::test]
async fn single_stream_download_writes_file() {
    let mgr = manager();
    let body = test_body(32 * 1024);
    let base = range_server::start(body.clone());
    let dir = tempfile::tempdir().unwrap();

    let mut ctx = RequestContext::new(RequestKind::Download, format!("{}plain.bin", base));
    ctx.download = Some(DownloadConfig {
        save_dir: dir.path().to_path_buf(),
        overwrite: true,
        thread_count: 1,
        ..Default::default()
    });

    let mut reply = mgr.submit(ctx).expect("submitted");
    let rsp = reply.wait_finished().await.expect("terminal result");
    assert!(rsp.success, "error: {}", rsp.error_message);
    let content = std::fs::read(dir.path().join("plain.bin")).expect("file exists");
    assert_eq!(content, body);
}

#[tokio::test]
async fn cancel_single_delivers_synthetic_result() {
    let mgr = manager();
    let body = test_body(64 * 1024);
    let base = range_server::start_with_options(
        body,
        RangeServerOptions {
            body_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        },
    );

    let mut reply = mgr
        .submit(RequestContext::new(RequestKind::Get, format!("{}slow", base)))
        .expect("submitted");
    let id = reply.task().id;

    tokio::time::sleep(Duration::from_millis(150)).await;
    mgr.cancel(id);

    let rsp = tokio::time::timeout(Duration::from_secs(5), reply.wait_finished())
        .await
        .expect("cancellation acknowledged in bounded time")
        .expect("synthetic terminal result");
    assert!(!rsp.success);
    assert!(rsp.cancelled);
    assert!(
        rsp.body_text().contains(&format!("id: {}", id)),
        "body attributes the id: {}",
        rsp.body_text()
    );
}

#[tokio::test]
async fn transfer_timeout_produces_failure() {
    let mgr = manager();
    let body = test_body(64 * 1024);
    let base = range_server::start_with_options(
        body,
        RangeServerOptions {
            body_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        },
    );

    let mut ctx = RequestContext::new(RequestKind::Get, format!("{}timeout", base));
    ctx.behavior.transfer_timeout_ms = 500;

    let mut reply = mgr.submit(ctx).expect("submitted");
    let rsp = tokio::time::timeout(Duration::from_secs(10), reply.wait_finished())
        .await
        .expect("timeout enforced")
        .expect("terminal result");
    assert!(!rsp.success);
    assert!(!rsp.cancelled);
    assert!(!rsp.error_message.is_empty());
}

#[tokio::test]
async fn batch_completes_with_batch_finished() {
    let mgr = manager();
    let url = range_server::start(test_body(512));

    let contexts = vec![
        RequestContext::new(RequestKind::Get, &url),
        RequestContext::new(RequestKind::Get, &url),
    ];
    let (mut reply, batch_id) = mgr.submit_batch(contexts).expect("batch accepted");
    assert!(batch_id > 0);
    assert!(reply.is_batch());

    let mut finished = 0;
    let mut batch_done = None;
    while let Some(event) = reply.recv().await {
        match event {
            ReplyEvent::Finished(rsp) => {
                assert!(rsp.success, "member failed: {}", rsp.error_message);
                assert_eq!(rsp.task.batch_id, batch_id);
                finished += 1;
            }
            ReplyEvent::BatchFinished {
                batch_id: done_id,
                all_success,
            } => {
                assert_eq!(done_id, batch_id);
                batch_done = Some(all_success);
            }
            _ => {}
        }
    }
    assert_eq!(finished, 2, "one terminal per member");
    assert_eq!(batch_done, Some(true));
}

#[tokio::test]
async fn batch_abort_on_failure_cancels_survivors() {
    let mgr = manager();
    let slow = range_server::start_with_options(
        test_body(64 * 1024),
        RangeServerOptions {
            body_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        },
    );

    let mut a = RequestContext::new(RequestKind::Get, format!("{}a", slow));
    let mut b = RequestContext::new(RequestKind::Get, format!("{}b", slow));
    // Unroutable port: fails fast while the other two are mid-transfer.
    let mut c = RequestContext::new(RequestKind::Get, "http://127.0.0.1:1/refused");
    for ctx in [&mut a, &mut b, &mut c] {
        ctx.task.abort_batch_on_failed = true;
    }

    let (mut reply, batch_id) = mgr.submit_batch(vec![a, b, c]).expect("batch accepted");

    let outcome = tokio::time::timeout(Duration::from_secs(10), async {
        let mut batch_done = None;
        while let Some(event) = reply.recv().await {
            if let ReplyEvent::BatchFinished {
                batch_id: done_id,
                all_success,
            } = event
            {
                assert_eq!(done_id, batch_id);
                batch_done = Some(all_success);
            }
        }
        batch_done
    })
    .await
    .expect("batch terminates quickly despite slow survivors");
    assert_eq!(outcome, Some(false));
}

#[tokio::test]
async fn session_cancel_silences_members() {
    let mgr = manager();
    let slow = range_server::start_with_options(
        test_body(64 * 1024),
        RangeServerOptions {
            body_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        },
    );

    let session_id = mgr.next_session_id();
    assert!(session_id > 0);

    let mut ctx = RequestContext::new(RequestKind::Get, format!("{}session", slow));
    ctx.task.session_id = session_id;
    let mut reply = mgr.submit(ctx).expect("submitted");

    tokio::time::sleep(Duration::from_millis(100)).await;
    mgr.cancel_session(session_id);

    // The session's reply is dropped without a terminal event.
    let event = tokio::time::timeout(Duration::from_secs(5), reply.recv())
        .await
        .expect("channel closes in bounded time");
    assert!(event.is_none(), "no response delivered after session stop");
}

#[tokio::test]
async fn send_runs_synchronously_on_caller_thread() {
    let mgr = manager();
    let body = test_body(1024);
    let url = range_server::start(body.clone());

    // send() blocks, so drive it from a blocking task.
    let ok = tokio::task::spawn_blocking(move || {
        let mgr = manager();
        let (tx, rx) = std::sync::mpsc::channel();
        let accepted = mgr.send(
            RequestContext::new(RequestKind::Get, &url),
            move |rsp| {
                let _ = tx.send(rsp);
            },
            true,
        );
        assert!(accepted);
        let rsp = rx.recv().expect("callback ran before send returned");
        assert!(rsp.success, "error: {}", rsp.error_message);
        assert_eq!(rsp.body, body);
        true
    })
    .await
    .unwrap();
    assert!(ok);
}
