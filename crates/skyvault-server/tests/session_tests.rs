//! Accounts, request validation and the path sandbox

mod common;

use common::{PASSWORD, TestServer};
use skyvault_server::protocol::{Request, Response};

#[test]
fn test_register_then_login() {
    let server = TestServer::start();
    let mut client = server.client();

    let reply = client.register("alice", PASSWORD).unwrap();
    assert!(reply.success);
    assert_eq!(reply.message, "Registration successful");

    let reply = client.login("alice", PASSWORD).unwrap();
    assert!(reply.success);
    assert_eq!(reply.message, "Login successful");
    assert!(server.user_root("alice").is_dir());
}

#[test]
fn test_register_duplicate_username() {
    let server = TestServer::start();
    let _alice = server.user("alice");

    let mut other = server.client();
    let reply = other.register("alice", "another password").unwrap();
    assert!(!reply.success);
    assert_eq!(reply.message, "Username already exists");
}

#[test]
fn test_register_rejects_bad_input() {
    let server = TestServer::start();
    let mut client = server.client();

    let reply = client.register("", PASSWORD).unwrap();
    assert!(!reply.success);
    assert_eq!(reply.message, "Username and password are required");

    let reply = client.register("../evil", PASSWORD).unwrap();
    assert!(!reply.success);
    assert!(!server.root.path().join("../evil").exists());
}

#[test]
fn test_login_failures_share_one_message() {
    let server = TestServer::start();
    let _alice = server.user("alice");
    let mut client = server.client();

    let wrong_password = client.login("alice", "wrong").unwrap();
    let unknown_user = client.login("mallory", PASSWORD).unwrap();
    assert!(!wrong_password.success);
    assert!(!unknown_user.success);
    assert_eq!(wrong_password.message, "Invalid username or password");
    assert_eq!(wrong_password.message, unknown_user.message);

    let empty = client.login("alice", "").unwrap();
    assert!(!empty.success);
}

#[test]
fn test_requests_before_login_are_refused() {
    let server = TestServer::start();
    let mut client = server.client();

    let err = client.list("/").unwrap_err();
    assert!(err.to_string().contains("Not logged in"), "{err}");

    let upload = client.upload("/", "a.txt", b"data").unwrap();
    assert!(!upload.result.success);
    assert_eq!(upload.result.message, "Not logged in");

    let reply = client.delete("/", "a.txt").unwrap();
    assert!(!reply.success);
    assert_eq!(reply.message, "Not logged in");

    let err = client.history().unwrap_err();
    assert!(err.to_string().contains("Not logged in"), "{err}");
}

#[test]
fn test_list_empty_root() {
    let server = TestServer::start();
    let mut client = server.user("alice");
    assert!(client.list("/").unwrap().is_empty());
}

#[test]
fn test_list_reports_directories_and_sizes() {
    let server = TestServer::start();
    let mut client = server.user("alice");
    let root = server.user_root("alice");
    std::fs::create_dir(root.join("photos")).unwrap();
    std::fs::write(root.join("notes.txt"), b"twelve bytes").unwrap();

    let files = client.list("/").unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].name, "notes.txt");
    assert_eq!(files[0].size, 12);
    assert!(!files[0].is_directory);
    assert_eq!(files[1].name, "photos");
    assert!(files[1].is_directory);
    assert_eq!(files[1].size, 0);
}

#[test]
fn test_users_cannot_see_each_other() {
    let server = TestServer::start();
    let mut alice = server.user("alice");
    let mut bob = server.user("bob");

    assert!(alice.upload("/", "secret.txt", b"alice only").unwrap().result.success);
    assert!(bob.list("/").unwrap().is_empty());

    let download = bob.download("../alice", "secret.txt").unwrap();
    assert!(!download.result.success);
    assert!(download.data.is_empty());
}

#[test]
fn test_traversal_is_rejected_everywhere() {
    let server = TestServer::start();
    let mut client = server.user("alice");
    std::fs::write(server.root.path().join("outside.txt"), b"host file").unwrap();

    let err = client.list("../..").unwrap_err();
    assert!(err.to_string().contains("Invalid path"), "{err}");

    let upload = client.upload("../", "evil.txt", b"nope").unwrap();
    assert!(!upload.result.success);
    assert_eq!(upload.result.message, "Invalid path");
    assert!(!server.root.path().join("evil.txt").exists());

    let upload = client.upload("/", "../evil.txt", b"nope").unwrap();
    assert!(!upload.result.success);
    assert!(!server.root.path().join("evil.txt").exists());

    let download = client.download("/..", "outside.txt").unwrap();
    assert!(!download.result.success);
    assert_eq!(download.result.message, "Invalid path");

    let reply = client.delete("/..", "outside.txt").unwrap();
    assert!(!reply.success);
    assert!(server.root.path().join("outside.txt").exists());
}

#[cfg(unix)]
#[test]
fn test_symlink_escape_is_rejected() {
    let server = TestServer::start();
    let mut client = server.user("alice");
    let outside = server.root.path().join("outside");
    std::fs::create_dir(&outside).unwrap();
    std::fs::write(outside.join("host.txt"), b"host file").unwrap();
    std::os::unix::fs::symlink(&outside, server.user_root("alice").join("escape")).unwrap();

    let err = client.list("/escape").unwrap_err();
    assert!(err.to_string().contains("Invalid path"), "{err}");

    let download = client.download("/escape", "host.txt").unwrap();
    assert!(!download.result.success);

    let upload = client.upload("/escape", "planted.txt", b"x").unwrap();
    assert!(!upload.result.success);
    assert!(!outside.join("planted.txt").exists());
}

#[test]
fn test_delete_file_and_directory() {
    let server = TestServer::start();
    let mut client = server.user("alice");
    let root = server.user_root("alice");
    std::fs::create_dir_all(root.join("old/nested")).unwrap();
    std::fs::write(root.join("old/nested/file.txt"), b"x").unwrap();
    client.upload("/", "a.txt", b"abc").unwrap();

    let reply = client.delete("/", "a.txt").unwrap();
    assert!(reply.success);
    assert_eq!(reply.message, "Deleted");
    assert!(!root.join("a.txt").exists());

    let reply = client.delete("/", "old").unwrap();
    assert!(reply.success);
    assert!(!root.join("old").exists());

    let reply = client.delete("/", "a.txt").unwrap();
    assert!(!reply.success);
    assert_eq!(reply.message, "File not found");
}

#[test]
fn test_delete_refuses_the_user_root() {
    let server = TestServer::start();
    let mut client = server.user("alice");

    let reply = client.delete("/", "").unwrap();
    assert!(!reply.success);
    let reply = client.delete("/", ".").unwrap();
    assert!(!reply.success);
    assert!(server.user_root("alice").is_dir());
}

#[test]
fn test_unknown_type_gets_error_reply() {
    let server = TestServer::start();
    let mut client = server.client();

    client.send_payload(br#"{"type":"frobnicate"}"#).unwrap();
    match client.recv().unwrap() {
        Response::Error { message } => assert!(message.contains("frobnicate"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }

    // The connection survives
    assert!(client.register("alice", PASSWORD).unwrap().success);
}

#[test]
fn test_malformed_json_gets_error_reply() {
    let server = TestServer::start();
    let mut client = server.client();

    client.send_payload(b"{not json").unwrap();
    assert!(matches!(client.recv().unwrap(), Response::Error { .. }));

    client.send_payload(br#"{"username":"alice"}"#).unwrap();
    assert!(matches!(client.recv().unwrap(), Response::Error { .. }));

    client.send_payload(br#"[1, 2, 3]"#).unwrap();
    assert!(matches!(client.recv().unwrap(), Response::Error { .. }));

    assert!(client.register("alice", PASSWORD).unwrap().success);
}

#[test]
fn test_missing_fields_get_typed_failure() {
    let server = TestServer::start();
    let mut client = server.client();

    client.send_payload(br#"{"type":"login","username":"alice"}"#).unwrap();
    match client.recv().unwrap() {
        Response::LoginResult { success, .. } => assert!(!success),
        other => panic!("expected login_result, got {other:?}"),
    }
}

#[test]
fn test_oversized_frame_closes_connection() {
    let server = TestServer::start_with(|config| config.max_frame_size = 1024);
    let mut client = server.client();

    client.send_raw(&u32::MAX.to_be_bytes()).unwrap();
    assert!(client.recv().is_err());
}

#[test]
fn test_frame_split_across_writes() {
    let server = TestServer::start();
    let mut client = server.client();
    let frame = skyvault_server::protocol::codec::encode_frame(&Request::Register {
        username: "alice".to_string(),
        password: PASSWORD.to_string(),
    })
    .unwrap();

    for byte in &frame {
        client.send_raw(std::slice::from_ref(byte)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    match client.recv_reply().unwrap() {
        Response::RegisterResult { success, .. } => assert!(success),
        other => panic!("expected register_result, got {other:?}"),
    }
}
