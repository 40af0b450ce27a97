//! File sharing between users and the operation history

mod common;

use common::{PASSWORD, TestServer};
use skyvault_server::protocol::{Response, ShareAction, ShareNotice};

fn share_id(notification: &Response) -> i64 {
    match notification {
        Response::ShareRequest { id, .. } => *id,
        other => panic!("expected share_request, got {other:?}"),
    }
}

#[test]
fn test_share_pushed_to_online_recipient_and_accepted() {
    let server = TestServer::start();
    let mut alice = server.user("alice");
    let mut bob = server.user("bob");
    let data = common::payload(20_000);

    assert!(alice.upload("/", "report.pdf", &data).unwrap().result.success);
    let reply = alice.share("bob", "/", "report.pdf").unwrap();
    assert!(reply.success, "{}", reply.message);

    let notification = bob.wait_notification().unwrap();
    assert_eq!(
        notification,
        Response::ShareRequest {
            id: share_id(&notification),
            owner: "alice".to_string(),
            filename: "report.pdf".to_string(),
        }
    );

    let reply = bob
        .respond_share(share_id(&notification), ShareAction::Accept)
        .unwrap();
    assert!(reply.success);
    assert_eq!(reply.message, "Share accepted");

    let shared = bob.list("/shared").unwrap();
    assert_eq!(shared.len(), 1);
    assert_eq!(shared[0].name, "report.pdf");
    assert_eq!(shared[0].size, data.len() as u64);

    let download = bob.download("/shared", "report.pdf").unwrap();
    assert!(download.data == data);

    // The owner keeps the original
    assert!(server.user_root("alice").join("report.pdf").is_file());
}

#[test]
fn test_pending_shares_delivered_at_login() {
    let server = TestServer::start();
    let mut alice = server.user("alice");
    let mut carol = server.client();
    assert!(carol.register("carol", PASSWORD).unwrap().success);

    alice.upload("/", "one.txt", b"1").unwrap();
    alice.upload("/", "two.txt", b"2").unwrap();
    assert!(alice.share("carol", "/", "one.txt").unwrap().success);
    assert!(alice.share("carol", "/", "two.txt").unwrap().success);

    assert!(carol.login("carol", PASSWORD).unwrap().success);
    let Response::PendingShares { shares } = carol.wait_notification().unwrap() else {
        panic!("expected pending_shares");
    };
    let names: Vec<&str> = shares.iter().map(|s| s.filename.as_str()).collect();
    assert_eq!(names, vec!["one.txt", "two.txt"]);
    assert!(shares.iter().all(|s| s.owner == "alice"));

    let ShareNotice { id, .. } = shares[1].clone();
    let reply = carol.respond_share(id, ShareAction::Reject).unwrap();
    assert!(reply.success);
    assert_eq!(reply.message, "Share rejected");
    assert!(!server.user_root("carol").join("shared/two.txt").exists());
}

#[test]
fn test_share_cannot_be_answered_twice() {
    let server = TestServer::start();
    let mut alice = server.user("alice");
    let mut bob = server.user("bob");

    alice.upload("/", "a.txt", b"abc").unwrap();
    alice.share("bob", "/", "a.txt").unwrap();
    let id = share_id(&bob.wait_notification().unwrap());

    assert!(bob.respond_share(id, ShareAction::Accept).unwrap().success);
    let again = bob.respond_share(id, ShareAction::Reject).unwrap();
    assert!(!again.success);
    assert_eq!(again.message, "Share not found or already handled");
}

#[test]
fn test_only_the_recipient_can_answer() {
    let server = TestServer::start();
    let mut alice = server.user("alice");
    let mut bob = server.user("bob");
    let mut eve = server.user("eve");

    alice.upload("/", "a.txt", b"abc").unwrap();
    alice.share("bob", "/", "a.txt").unwrap();
    let id = share_id(&bob.wait_notification().unwrap());

    assert!(!eve.respond_share(id, ShareAction::Accept).unwrap().success);
    assert!(!server.user_root("eve").join("shared/a.txt").exists());
    assert!(bob.respond_share(id, ShareAction::Accept).unwrap().success);
}

#[test]
fn test_share_rejects_bad_targets() {
    let server = TestServer::start();
    let mut alice = server.user("alice");
    alice.upload("/", "a.txt", b"abc").unwrap();

    let reply = alice.share("nobody", "/", "a.txt").unwrap();
    assert!(!reply.success);
    assert_eq!(reply.message, "Recipient does not exist");

    let reply = alice.share("alice", "/", "a.txt").unwrap();
    assert!(!reply.success);
    assert_eq!(reply.message, "Cannot share a file with yourself");

    let _bob = server.user("bob");
    let reply = alice.share("bob", "/", "missing.txt").unwrap();
    assert!(!reply.success);
    assert_eq!(reply.message, "File not found");
}

#[test]
fn test_history_is_newest_first() {
    let server = TestServer::start();
    let mut alice = server.user("alice");

    alice.upload("/", "a.txt", b"abc").unwrap();
    alice.download("/", "a.txt").unwrap();
    alice.delete("/", "a.txt").unwrap();

    let history = alice.history().unwrap();
    let operations: Vec<&str> = history.iter().map(|r| r.operation.as_str()).collect();
    assert_eq!(operations, vec!["delete", "download", "upload", "login"]);
    assert!(history.iter().all(|r| r.status == "success"));
    assert_eq!(history[0].filename, "a.txt");
    // `%Y-%m-%d %H:%M:%S`
    assert_eq!(history[0].time.len(), 19);
}

#[test]
fn test_history_records_failures_per_user() {
    let server = TestServer::start();
    let mut alice = server.user("alice");
    let mut bob = server.user("bob");

    alice.delete("/", "missing.txt").unwrap();
    let history = alice.history().unwrap();
    assert_eq!(history[0].operation, "delete");
    assert_eq!(history[0].status, "failure");

    let bob_history = bob.history().unwrap();
    assert!(bob_history.iter().all(|r| r.operation == "login"));
}
