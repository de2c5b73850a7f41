//! End-to-end tests against a local mock server.


use test_helpers::*;

use aes::Aes128;
use cbc::Encryptor;
use cipher::block_padding::Pkcs7;
use cipher::{BlockEncryptMut, KeyIvInit};
use mizu_dl::tmpfile::{Range, RangeTmpFile, TmpCursor};
use mizu_dl::{DownloadConfig, DownloadHub, DownloadParam, DownloadState};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn hub(config: DownloadConfig) -> DownloadHub {
    init_logging();
    DownloadHub::new(config).expect("hub construction failed")
}

#[tokio::test]
async fn normal_download_streams_to_file() {
    let server = MockServer::start().await;
    let body = deterministic_body(64 * 1024);

    // No Accept-Ranges, plain 200: forces the sequential strategy.
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let hub = hub(DownloadConfig::new());
    let task = hub
        .download(DownloadParam::new(
            format!("{}/file.bin", server.uri()),
            "file.bin",
            dir.path(),
        ))
        .unwrap();

    assert_eq!(wait_for_end(&task).await, DownloadState::Succeed);

    let written = std::fs::read(dir.path().join("file.bin")).unwrap();
    assert_eq!(written, body);
    assert!(!dir.path().join("file.bin.shadow").exists());
    assert!(task.progress().is_complete());
}

#[tokio::test]
async fn range_download_reassembles_all_ranges() {
    let server = MockServer::start().await;
    let body = deterministic_body(10 * 1024 * 1024);

    Mock::given(method("GET"))
        .and(path("/big.bin"))
        .respond_with(RangeBody::new(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    // 10 MB at 2 MB per range: 5 ranges, 4 in flight at once.
    let hub = hub(
        DownloadConfig::new()
            .range_size(2 * 1024 * 1024)
            .range_concurrency(4),
    );
    let task = hub
        .download(DownloadParam::new(
            format!("{}/big.bin", server.uri()),
            "big.bin",
            dir.path(),
        ))
        .unwrap();

    assert_eq!(wait_for_end(&task).await, DownloadState::Succeed);

    let written = std::fs::read(dir.path().join("big.bin")).unwrap();
    assert_eq!(written, body);
    assert!(!dir.path().join("big.bin.tmp").exists());
    assert!(!dir.path().join("big.bin.shadow").exists());

    let progress = task.progress();
    assert!(progress.is_complete());
    assert_eq!(progress.total_size, body.len() as u64);

    // One range request per slice, on top of the probe.
    let requests = server.received_requests().await.unwrap();
    let range_headers: Vec<String> = requests
        .iter()
        .filter_map(|r| r.headers.get("range"))
        .filter_map(|v| v.to_str().ok().map(String::from))
        .collect();
    for expected in [
        "bytes=0-2097151",
        "bytes=2097152-4194303",
        "bytes=8388608-10485759",
    ] {
        assert!(
            range_headers.iter().any(|h| h == expected),
            "missing range request {expected}, got {range_headers:?}"
        );
    }
}

#[tokio::test]
async fn resume_requests_only_undone_ranges() {
    const MB: u64 = 1024 * 1024;

    let server = MockServer::start().await;
    let body = deterministic_body(10 * MB as usize);

    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .respond_with(RangeBody::new(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();

    // Fabricate a crashed 10 MB download at 2 MB per range: ranges 0, 1,
    // 3 and 4 already done, range 2 interrupted halfway through.
    let shadow = dir.path().join("data.bin.shadow");
    let mut prefilled = body.clone();
    prefilled[(5 * MB) as usize..(6 * MB) as usize].fill(0);
    std::fs::write(&shadow, &prefilled).unwrap();

    let tmp = dir.path().join("data.bin.tmp");
    RangeTmpFile::create(&tmp, 10 * MB, 2 * MB).await.unwrap();
    let mut cursor = TmpCursor::open(&tmp).await.unwrap();
    for index in [0u64, 1, 2, 3, 4] {
        let start = index * 2 * MB;
        let mut range = Range::new(index, start, start + 2 * MB - 1);
        // Range 2's cursor stopped mid-span at the 5 MB mark.
        range.current = if index == 2 { 5 * MB } else { range.end + 1 };
        cursor.persist_cursor(&range).await.unwrap();
    }
    cursor.flush().await.unwrap();

    let hub = hub(DownloadConfig::new().range_size(2 * MB));
    let task = hub
        .download(DownloadParam::new(
            format!("{}/data.bin", server.uri()),
            "data.bin",
            dir.path(),
        ))
        .unwrap();

    assert_eq!(wait_for_end(&task).await, DownloadState::Succeed);
    assert_eq!(std::fs::read(dir.path().join("data.bin")).unwrap(), body);

    // Only the probe and the outstanding back half of range 2 hit the
    // server; the request resumes from the persisted cursor, not the
    // range start.
    let requests = server.received_requests().await.unwrap();
    let range_headers: Vec<String> = requests
        .iter()
        .filter_map(|r| r.headers.get("range"))
        .filter_map(|v| v.to_str().ok().map(String::from))
        .collect();
    assert!(range_headers.iter().any(|h| h == "bytes=5242880-6291455"));
    assert_eq!(
        range_headers.iter().filter(|h| *h != "bytes=0-").count(),
        1,
        "completed bytes were re-requested: {range_headers:?}"
    );
}

#[tokio::test]
async fn existing_file_short_circuits_download() {
    let server = MockServer::start().await;
    let body = deterministic_body(4096);

    Mock::given(method("GET"))
        .and(path("/done.bin"))
        .respond_with(RangeBody::new(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("done.bin"), &body).unwrap();

    let hub = hub(DownloadConfig::new());
    let task = hub
        .download(DownloadParam::new(
            format!("{}/done.bin", server.uri()),
            "done.bin",
            dir.path(),
        ))
        .unwrap();

    assert_eq!(wait_for_end(&task).await, DownloadState::Succeed);
    assert!(task.progress().is_complete());

    // Only the probe hit the server.
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn stop_lands_in_stopped_not_failed() {
    let server = MockServer::start().await;
    let body = deterministic_body(1024);

    Mock::given(method("GET"))
        .and(path("/slow.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body)
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let hub = hub(DownloadConfig::new());
    let task = hub
        .download(DownloadParam::new(
            format!("{}/slow.bin", server.uri()),
            "slow.bin",
            dir.path(),
        ))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    task.stop();

    assert_eq!(wait_for_end(&task).await, DownloadState::Stopped);
    assert!(task.can_start());
    assert!(!dir.path().join("slow.bin").exists());
}

#[tokio::test]
async fn stalled_response_fails_on_read_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stall.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(deterministic_body(1024))
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    // An inactivity timeout, so a server that goes silent fails fast while
    // a slow-but-flowing transfer is left alone.
    let hub = hub(DownloadConfig::new().read_timeout(1));
    let task = hub
        .download(DownloadParam::new(
            format!("{}/stall.bin", server.uri()),
            "stall.bin",
            dir.path(),
        ))
        .unwrap();

    let state = wait_for_end(&task).await;
    assert!(
        matches!(state, DownloadState::Failed { .. }),
        "stalled transfer should fail, got {state:?}"
    );
    assert!(task.can_start());
}

#[tokio::test]
async fn restart_after_stop_while_queued_runs_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(deterministic_body(1024))
                .set_delay(Duration::from_millis(700)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(deterministic_body(2048)))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let hub = hub(DownloadConfig::new().max_task(1));

    // Occupy the single worker so the second task stays queued.
    let blocker = hub
        .download(DownloadParam::new(
            format!("{}/a.bin", server.uri()),
            "a.bin",
            dir.path(),
        ))
        .unwrap();
    let task = hub
        .download(DownloadParam::new(
            format!("{}/b.bin", server.uri()),
            "b.bin",
            dir.path(),
        ))
        .unwrap();

    // Stop and restart while still queued: the stale queue entry must not
    // produce a second transfer alongside the fresh one.
    task.stop();
    assert_eq!(task.state(), DownloadState::Stopped);
    task.start().unwrap();

    assert_eq!(wait_for_end(&blocker).await, DownloadState::Succeed);
    assert_eq!(wait_for_end(&task).await, DownloadState::Succeed);

    let hits = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/b.bin")
        .count();
    assert_eq!(hits, 1, "task transferred more than once after restart");
}

#[tokio::test]
async fn queue_runs_at_most_max_task_downloads() {
    let server = MockServer::start().await;
    for name in ["a.bin", "b.bin"] {
        Mock::given(method("GET"))
            .and(path(format!("/{name}")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(deterministic_body(2048))
                    .set_delay(Duration::from_millis(800)),
            )
            .mount(&server)
            .await;
    }

    let dir = tempfile::tempdir().unwrap();
    let hub = hub(DownloadConfig::new().max_task(1));

    let first = hub
        .download(DownloadParam::new(
            format!("{}/a.bin", server.uri()),
            "a.bin",
            dir.path(),
        ))
        .unwrap();
    let second = hub
        .download(DownloadParam::new(
            format!("{}/b.bin", server.uri()),
            "b.bin",
            dir.path(),
        ))
        .unwrap();

    // The single worker must finish the first task before touching the
    // second one.
    tokio::time::timeout(TEST_TIMEOUT, async {
        let mut rx = second.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            if state == DownloadState::Downloading || state.is_end() {
                assert!(
                    first.state().is_end(),
                    "second task started before the first finished"
                );
                break;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    assert_eq!(wait_for_end(&first).await, DownloadState::Succeed);
    assert_eq!(wait_for_end(&second).await, DownloadState::Succeed);
}

#[tokio::test]
async fn duplicate_download_returns_same_task() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dup.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(deterministic_body(512))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let hub = hub(DownloadConfig::new());
    let param = DownloadParam::new(format!("{}/dup.bin", server.uri()), "dup.bin", dir.path());

    let first = hub.download(param.clone()).unwrap();
    let second = hub.download(param).unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));

    assert_eq!(wait_for_end(&first).await, DownloadState::Succeed);
}

#[tokio::test]
async fn save_name_resolved_from_content_disposition() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/export"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-disposition", "attachment; filename=\"report 1.bin\"")
                .set_body_bytes(deterministic_body(256)),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let hub = hub(DownloadConfig::new());
    let task = hub
        .download(DownloadParam::new(
            format!("{}/export", server.uri()),
            "",
            dir.path(),
        ))
        .unwrap();

    assert_eq!(wait_for_end(&task).await, DownloadState::Succeed);
    let file = task.file().expect("save name should be resolved");
    assert_eq!(file.file_name().unwrap(), "report 1.bin");
    assert!(file.exists());
}

#[tokio::test]
async fn m3u8_download_merges_segments_in_order() {
    let server = MockServer::start().await;

    let segments: Vec<Vec<u8>> = (0u8..3)
        .map(|i| {
            let mut seg = vec![0x47];
            seg.extend(std::iter::repeat(i + 1).take(500));
            seg
        })
        .collect();

    let playlist = "#EXTM3U\n\
        #EXT-X-TARGETDURATION:10\n\
        #EXTINF:9.8,\nseg0.ts\n\
        #EXTINF:9.8,\nseg1.ts\n\
        #EXTINF:9.8,\nseg2.ts\n\
        #EXT-X-ENDLIST\n";
    Mock::given(method("GET"))
        .and(path("/video.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(playlist))
        .mount(&server)
        .await;
    // Stagger the responses so segments complete in reverse order; the
    // merge must still follow playlist order.
    for (i, seg) in segments.iter().enumerate() {
        Mock::given(method("GET"))
            .and(path(format!("/seg{i}.ts")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(seg.clone())
                    .set_delay(Duration::from_millis((2 - i as u64) * 150)),
            )
            .mount(&server)
            .await;
    }

    let dir = tempfile::tempdir().unwrap();
    let hub = hub(DownloadConfig::new());
    let task = hub
        .download(DownloadParam::new(
            format!("{}/video.m3u8", server.uri()),
            "video.ts",
            dir.path(),
        ))
        .unwrap();

    assert_eq!(wait_for_end(&task).await, DownloadState::Succeed);

    let expected: Vec<u8> = segments.concat();
    assert_eq!(std::fs::read(dir.path().join("video.ts")).unwrap(), expected);

    // Progress counts segments for HLS.
    let progress = task.progress();
    assert_eq!(progress.total_size, 3);
    assert!(progress.is_complete());

    // Temp artifacts are gone after the merge.
    assert!(!dir.path().join("video.ts.tmp").exists());
    assert!(!dir.path().join("video.ts.0.ts").exists());
}

#[tokio::test]
async fn m3u8_master_selects_best_variant_and_decrypts() {
    let server = MockServer::start().await;

    let key = *b"0123456789abcdef";
    let iv = [0u8; 16];
    let segments: Vec<Vec<u8>> = (0u8..2)
        .map(|i| {
            let mut seg = vec![0x47];
            seg.extend(std::iter::repeat(0xA0 + i).take(333));
            seg
        })
        .collect();
    let encrypted: Vec<Vec<u8>> = segments
        .iter()
        .map(|seg| {
            Encryptor::<Aes128>::new_from_slices(&key, &iv)
                .unwrap()
                .encrypt_padded_vec_mut::<Pkcs7>(seg)
        })
        .collect();

    let master = "#EXTM3U\n\
        #EXT-X-STREAM-INF:BANDWIDTH=400000\nlow/index.m3u8\n\
        #EXT-X-STREAM-INF:BANDWIDTH=1600000\nhigh/index.m3u8\n";
    let media = "#EXTM3U\n\
        #EXT-X-KEY:METHOD=AES-128,URI=\"/key.bin\"\n\
        #EXTINF:9.8,\ns0.ts\n\
        #EXTINF:9.8,\ns1.ts\n\
        #EXT-X-ENDLIST\n";

    Mock::given(method("GET"))
        .and(path("/master.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(master))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/high/index.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(media))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/key.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(key.to_vec()))
        .mount(&server)
        .await;
    for (i, seg) in encrypted.iter().enumerate() {
        Mock::given(method("GET"))
            .and(path(format!("/high/s{i}.ts")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(seg.clone()))
            .mount(&server)
            .await;
    }

    let dir = tempfile::tempdir().unwrap();
    let hub = hub(DownloadConfig::new());
    let task = hub
        .download(DownloadParam::new(
            format!("{}/master.m3u8", server.uri()),
            "show.ts",
            dir.path(),
        ))
        .unwrap();

    assert_eq!(wait_for_end(&task).await, DownloadState::Succeed);

    let expected: Vec<u8> = segments.concat();
    assert_eq!(std::fs::read(dir.path().join("show.ts")).unwrap(), expected);

    // The low-bandwidth variant is never fetched.
    let requests = server.received_requests().await.unwrap();
    assert!(!requests.iter().any(|r| r.url.path().starts_with("/low/")));
}

#[tokio::test]
async fn remove_deletes_artifacts() {
    let server = MockServer::start().await;
    let body = deterministic_body(2048);

    Mock::given(method("GET"))
        .and(path("/gone.bin"))
        .respond_with(RangeBody::new(body.clone()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let hub = hub(DownloadConfig::new());
    let url = format!("{}/gone.bin", server.uri());
    let task = hub
        .download(DownloadParam::new(&url, "gone.bin", dir.path()))
        .unwrap();

    assert_eq!(wait_for_end(&task).await, DownloadState::Succeed);
    assert!(dir.path().join("gone.bin").exists());

    hub.remove(&url, true).await;
    assert!(!dir.path().join("gone.bin").exists());
    assert!(hub.task(&url).is_none());
}
