mod common;

use serde_json::json;
use tuneworker::queue::EventSink;
use tuneworker::track::Track;
use tuneworker::workers::{CacheEvent, CacheRequest, CacheWorker};

use common::{Route, TestServer, metadata_writer, next_event, test_config, wav_bytes};

fn track(value: serde_json::Value) -> Track {
    serde_json::from_value(value).unwrap()
}

#[tokio::test]
async fn test_caches_flac_track_end_to_end() {
    let server = TestServer::start(vec![("/stream", Route::ok("audio/flac", wav_bytes()))]).await;
    let cache_dir = tempfile::tempdir().unwrap();
    let config = test_config(&server);

    let (events, mut rx) = EventSink::channel();
    let worker = CacheWorker::spawn(metadata_writer(&config), events);

    let keep_running = worker
        .handle_message(CacheRequest::Task {
            track: track(json!({"id": 1, "br": 320000, "name": "Song"})),
            url: server.url("/stream"),
            audio_cache_path: cache_dir.path().to_path_buf(),
        })
        .await
        .unwrap();
    assert!(keep_running);

    let event = next_event(&mut rx).await;
    let wire = serde_json::to_value(&event).unwrap();
    assert_eq!(wire["type"], "task-done");
    assert_eq!(wire["data"]["cache"], true);
    assert_eq!(wire["data"]["name"], "Song");

    let CacheEvent::TaskDone { data } = event else {
        panic!("expected task-done, got {:?}", event);
    };
    let expected = cache_dir.path().join("1-320000-Song.flac");
    assert_eq!(data.path, expected);
    assert!(expected.exists());
    assert_eq!(data.size, std::fs::metadata(&expected).unwrap().len());

    let keep_running = worker.handle_message(CacheRequest::Quit).await.unwrap();
    assert!(!keep_running);
    assert!(matches!(next_event(&mut rx).await, CacheEvent::Finished));
}

#[tokio::test]
async fn test_failed_task_is_swallowed_and_queue_continues() {
    let server = TestServer::start(vec![
        ("/missing.mp3", Route::status(404)),
        ("/ok.mp3", Route::ok("audio/mpeg", wav_bytes())),
    ])
    .await;
    let cache_dir = tempfile::tempdir().unwrap();
    let config = test_config(&server);

    let (events, mut rx) = EventSink::channel();
    let worker = CacheWorker::spawn(metadata_writer(&config), events);

    for (id, path) in [(1, "/missing.mp3"), (2, "/ok.mp3")] {
        worker
            .handle_message(CacheRequest::Task {
                track: track(json!({"id": id, "br": 128000, "name": format!("T{}", id)})),
                url: server.url(path),
                audio_cache_path: cache_dir.path().to_path_buf(),
            })
            .await
            .unwrap();
    }
    worker.handle_message(CacheRequest::Quit).await.unwrap();

    // Only the good task reports, then the shutdown acknowledgment
    match next_event(&mut rx).await {
        CacheEvent::TaskDone { data } => {
            assert_eq!(data.path.file_name().unwrap(), "2-128000-T2.mp3");
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(matches!(next_event(&mut rx).await, CacheEvent::Finished));
    assert!(!cache_dir.path().join("1-128000-T1.mp3").exists());
}

#[tokio::test]
async fn test_unreachable_cover_writes_nothing() {
    let server = TestServer::start(vec![("/song.mp3", Route::ok("audio/mpeg", wav_bytes()))]).await;
    let cache_dir = tempfile::tempdir().unwrap();
    let config = test_config(&server);

    let (events, mut rx) = EventSink::channel();
    let worker = CacheWorker::spawn(metadata_writer(&config), events);

    worker
        .handle_message(CacheRequest::Task {
            track: track(json!({
                "id": 3,
                "name": "Covered",
                "al": {"name": "LP", "picUrl": server.url("/no-such-cover.jpg")}
            })),
            url: server.url("/song.mp3"),
            audio_cache_path: cache_dir.path().to_path_buf(),
        })
        .await
        .unwrap();
    worker.handle_message(CacheRequest::Quit).await.unwrap();

    assert!(matches!(next_event(&mut rx).await, CacheEvent::Finished));
    assert_eq!(std::fs::read_dir(cache_dir.path()).unwrap().count(), 0);
}
