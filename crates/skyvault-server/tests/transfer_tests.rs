//! Upload and download over a live server

mod common;

use common::{PASSWORD, TestServer, has_record, payload, wait_for_history};
use skyvault_server::protocol::codec::encode_frame;
use skyvault_server::protocol::{Request, Response};

#[test]
fn test_round_trip_across_chunk_boundaries() {
    let server = TestServer::start();
    let mut client = server.user("alice");

    for size in [0usize, 1, 4095, 4096, 4097, 3 * 1024 * 1024] {
        let name = format!("file-{size}.bin");
        let data = payload(size);

        let upload = client.upload("/", &name, &data).unwrap();
        assert!(upload.result.success, "upload {size}: {}", upload.result.message);
        assert_eq!(upload.result.message, "Upload complete");

        let on_disk = std::fs::read(server.user_root("alice").join(&name)).unwrap();
        assert_eq!(on_disk.len(), size);
        assert!(on_disk == data, "stored bytes differ for size {size}");

        let download = client.download("/", &name).unwrap();
        assert!(download.result.success, "download {size}: {}", download.result.message);
        assert_eq!(download.size, size as u64);
        assert!(download.data == data, "downloaded bytes differ for size {size}");
    }
}

#[test]
fn test_upload_progress_ends_at_exactly_one_hundred() {
    let server = TestServer::start();
    let mut client = server.user("alice");
    let data = payload(512 * 1024);

    let upload = client.upload("/", "big.bin", &data).unwrap();
    assert!(upload.result.success);

    let (received, total, percent) = *upload.progress.last().unwrap();
    assert_eq!(percent, 100);
    assert_eq!(received, total);
    assert_eq!(total, data.len() as u64);

    let mut previous = 0;
    for &(received, total, percent) in &upload.progress {
        assert!(received >= previous, "progress went backwards");
        assert!(received <= total);
        if received < total {
            assert!(percent < 100, "100% reported at {received}/{total}");
        }
        previous = received;
    }
}

#[test]
fn test_empty_upload_completes_immediately() {
    let server = TestServer::start();
    let mut client = server.user("alice");

    let upload = client.upload("/", "empty.txt", b"").unwrap();
    assert!(upload.result.success);
    assert_eq!(upload.progress, vec![(0, 0, 100)]);

    let metadata = std::fs::metadata(server.user_root("alice").join("empty.txt")).unwrap();
    assert_eq!(metadata.len(), 0);
}

#[test]
fn test_upload_into_subdirectory() {
    let server = TestServer::start();
    let mut client = server.user("alice");
    std::fs::create_dir(server.user_root("alice").join("docs")).unwrap();

    let upload = client.upload("/docs", "notes.txt", b"hello").unwrap();
    assert!(upload.result.success);

    let files = client.list("docs/").unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "notes.txt");
    assert_eq!(files[0].size, 5);
    assert!(!files[0].is_directory);
}

#[test]
fn test_upload_overwrites_existing_file() {
    let server = TestServer::start();
    let mut client = server.user("alice");

    client.upload("/", "a.txt", b"a much longer first version").unwrap();
    client.upload("/", "a.txt", b"short").unwrap();

    let on_disk = std::fs::read(server.user_root("alice").join("a.txt")).unwrap();
    assert_eq!(on_disk, b"short");
}

#[test]
fn test_frames_pipelined_behind_upload_are_answered() {
    let server = TestServer::start();
    let mut client = server.user("alice");
    let data = payload(10_000);

    let reply = client
        .request(&Request::Upload {
            filename: "piped.bin".to_string(),
            size: data.len() as u64,
            path: "/".to_string(),
        })
        .unwrap();
    assert_eq!(reply, Response::ReadyToReceive);

    // File bytes and the next control frame in a single write
    let mut burst = data.clone();
    burst.extend(
        encode_frame(&Request::List {
            path: "/".to_string(),
        })
        .unwrap(),
    );
    client.send_raw(&burst).unwrap();

    loop {
        match client.recv_reply().unwrap() {
            Response::UploadProgress { .. } => continue,
            Response::UploadResult { success, .. } => {
                assert!(success);
                break;
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    match client.recv_reply().unwrap() {
        Response::FileList { success, files, .. } => {
            assert!(success);
            assert_eq!(files.len(), 1);
            assert_eq!(files[0].name, "piped.bin");
            assert_eq!(files[0].size, 10_000);
        }
        other => panic!("expected file_list, got {other:?}"),
    }
}

#[test]
fn test_download_missing_file_fails_cleanly() {
    let server = TestServer::start();
    let mut client = server.user("alice");

    let download = client.download("/", "nope.txt").unwrap();
    assert!(!download.result.success);
    assert_eq!(download.result.message, "File not found");

    // Connection stays usable
    assert!(client.list("/").unwrap().is_empty());
}

#[test]
fn test_download_directory_is_refused() {
    let server = TestServer::start();
    let mut client = server.user("alice");
    std::fs::create_dir(server.user_root("alice").join("docs")).unwrap();

    let download = client.download("/", "docs").unwrap();
    assert!(!download.result.success);
}

#[test]
fn test_ready_to_receive_without_download() {
    let server = TestServer::start();
    let mut client = server.user("alice");

    let reply = client.request(&Request::ReadyToReceive).unwrap();
    assert_eq!(
        reply,
        Response::DownloadResult {
            success: false,
            message: "No download prepared".to_string(),
        }
    );
}

#[test]
fn test_concurrent_clients_transfer_independently() {
    let server = TestServer::start();
    let addr = server.addr;
    let root = server.root.path().to_path_buf();

    let workers: Vec<_> = (0..8)
        .map(|i| {
            std::thread::spawn(move || {
                let username = format!("user{i}");
                let mut client = skyvault_server::Client::connect(addr).unwrap();
                client
                    .set_timeout(Some(std::time::Duration::from_secs(10)))
                    .unwrap();
                assert!(client.register(&username, common::PASSWORD).unwrap().success);
                assert!(client.login(&username, common::PASSWORD).unwrap().success);

                let data = payload(64 * 1024 + i);
                assert!(client.upload("/", "data.bin", &data).unwrap().result.success);
                let download = client.download("/", "data.bin").unwrap();
                assert!(download.data == data);
                username
            })
        })
        .collect();

    for worker in workers {
        let username = worker.join().unwrap();
        let stored = std::fs::read(root.join(&username).join("data.bin")).unwrap();
        let i: usize = username.trim_start_matches("user").parse().unwrap();
        assert_eq!(stored.len(), 64 * 1024 + i);
    }
}

#[test]
fn test_server_stats_count_connections() {
    let server = TestServer::start();
    {
        let mut client = server.user("alice");
        client.upload("/", "a.txt", b"abc").unwrap();
    }
    let _second = server.client();
    std::thread::sleep(std::time::Duration::from_millis(100));

    let stats = server.stop();
    assert_eq!(stats.accepted, 2);
    assert_eq!(stats.tasks_dropped, 0);
    assert!(stats.tasks_queued > 0);
}

#[test]
fn test_small_upload_reports_completion() {
    let server = TestServer::start();
    let mut client = server.user("alice");

    let upload = client.upload("/", "a.txt", b"0123456789").unwrap();
    assert!(upload.result.success);
    assert_eq!(upload.result.message, "Upload complete");
    assert_eq!(upload.progress.last(), Some(&(10, 10, 100)));
    assert_eq!(
        std::fs::read(server.user_root("alice").join("a.txt")).unwrap(),
        b"0123456789"
    );

    let history = client.history().unwrap();
    assert!(has_record(&history, "upload", "success"));
}

#[test]
fn test_disconnect_mid_upload_ends_the_session() {
    let server = TestServer::start();
    let mut client = server.user("alice");
    client
        .send(&Request::Upload {
            filename: "partial.bin".into(),
            size: 1000,
            path: "/".into(),
        })
        .unwrap();
    assert_eq!(client.recv_reply().unwrap(), Response::ReadyToReceive);
    client.send_raw(&payload(100)).unwrap();
    client.disconnect().unwrap();

    let mut again = server.client();
    assert!(again.login("alice", PASSWORD).unwrap().success);
    wait_for_history(&mut again, |history| {
        has_record(history, "upload", "failure") && has_record(history, "logout", "success")
    });

    // The file holds at most what arrived, and the server still serves uploads
    let partial = std::fs::metadata(server.user_root("alice").join("partial.bin")).unwrap();
    assert!(partial.len() <= 100);
    assert!(again.upload("/", "partial.bin", b"whole").unwrap().result.success);
}

#[test]
fn test_disconnect_mid_download_ends_the_session() {
    let server = TestServer::start();
    let mut client = server.user("alice");
    let data = payload(32 * 1024 * 1024);
    assert!(client.upload("/", "big.bin", &data).unwrap().result.success);

    client
        .send(&Request::Download {
            filename: "big.bin".into(),
            path: "/".into(),
        })
        .unwrap();
    assert!(matches!(
        client.recv_reply().unwrap(),
        Response::DownloadMeta { .. }
    ));
    client.send(&Request::ReadyToReceive).unwrap();
    assert_eq!(client.recv_reply().unwrap(), Response::ReadyToSend);
    // Walk away with most of the file unread
    client.disconnect().unwrap();

    let mut again = server.client();
    assert!(again.login("alice", PASSWORD).unwrap().success);
    wait_for_history(&mut again, |history| {
        has_record(history, "download", "failure") && has_record(history, "logout", "success")
    });

    let download = again.download("/", "big.bin").unwrap();
    assert!(download.result.success);
    assert!(download.data == data);
}

#[test]
fn test_file_shrinking_before_ready_to_receive_is_reported() {
    let server = TestServer::start();
    let mut client = server.user("alice");
    assert!(client.upload("/", "a.txt", b"0123456789").unwrap().result.success);
    let on_disk = server.user_root("alice").join("a.txt");

    let request = Request::Download {
        filename: "a.txt".into(),
        path: "/".into(),
    };
    match client.request(&request).unwrap() {
        Response::DownloadMeta { size, .. } => assert_eq!(size, 10),
        other => panic!("unexpected {other:?}"),
    }
    std::fs::write(&on_disk, b"0123").unwrap();
    assert_eq!(
        client.request(&Request::ReadyToReceive).unwrap(),
        Response::DownloadResult {
            success: false,
            message: "Filesystem error".into(),
        }
    );

    // Same when the file is gone entirely
    assert!(matches!(
        client.request(&request).unwrap(),
        Response::DownloadMeta { .. }
    ));
    std::fs::remove_file(&on_disk).unwrap();
    assert!(matches!(
        client.request(&Request::ReadyToReceive).unwrap(),
        Response::DownloadResult { success: false, .. }
    ));

    // The connection is still reading control frames
    assert!(client.list("/").unwrap().is_empty());
    assert!(client.upload("/", "a.txt", b"again").unwrap().result.success);
    assert_eq!(client.download("/", "a.txt").unwrap().data, b"again");
}
