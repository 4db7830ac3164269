//! File operator behavior: range reads, writes, occurrence-disciplined
//! edits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use tether_agent::fileops::{handle_edit_file, handle_read_file, handle_write_file};
use tether_agent::transport::{Outbox, WriteOp};
use tether_core::protocol::{
    AgentPayload, EditFileRequest, FileContent, OpResult, ReadFileRequest, WriteFileRequest,
};

async fn next_payload(rx: &mut mpsc::Receiver<WriteOp>) -> AgentPayload {
    let op = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for reply")
        .expect("outbox closed");
    match op {
        WriteOp::Message(env) => env.payload,
        WriteOp::Ping => panic!("unexpected keep-alive"),
    }
}

async fn read_reply(rx: &mut mpsc::Receiver<WriteOp>) -> FileContent {
    match next_payload(rx).await {
        AgentPayload::FileContent(content) => content,
        other => panic!("expected file content, got {other:?}"),
    }
}

async fn op_reply(rx: &mut mpsc::Receiver<WriteOp>) -> OpResult {
    match next_payload(rx).await {
        AgentPayload::OpResult(result) => result,
        other => panic!("expected op result, got {other:?}"),
    }
}

fn read_request(path: &str, offset: i64, limit: i64) -> ReadFileRequest {
    ReadFileRequest {
        path: path.to_string(),
        offset,
        limit,
        max_size: 0,
    }
}

#[tokio::test]
async fn read_returns_requested_line_range() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f");
    std::fs::write(&path, "L1\nL2\nL3\n").unwrap();

    let (outbox, mut rx) = Outbox::channel(8);
    handle_read_file(
        outbox,
        "r1".into(),
        read_request(path.to_str().unwrap(), 1, 1),
        Arc::new(Vec::new()),
    )
    .await;

    let reply = read_reply(&mut rx).await;
    assert_eq!(reply.error, "");
    assert_eq!(reply.content, "L2\n");
    assert_eq!(reply.total_lines, 3);
    assert_eq!(reply.file_size, 9);
}

#[tokio::test]
async fn read_whole_file_keeps_trailing_newline_discipline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f");
    std::fs::write(&path, "only").unwrap();

    let (outbox, mut rx) = Outbox::channel(8);
    handle_read_file(
        outbox,
        "r2".into(),
        read_request(path.to_str().unwrap(), 0, 0),
        Arc::new(Vec::new()),
    )
    .await;

    let reply = read_reply(&mut rx).await;
    // One line collected, so exactly one trailing newline is appended
    assert_eq!(reply.content, "only\n");
    assert_eq!(reply.total_lines, 1);
}

#[tokio::test]
async fn read_offset_past_end_returns_empty_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f");
    std::fs::write(&path, "L1\nL2\n").unwrap();

    let (outbox, mut rx) = Outbox::channel(8);
    handle_read_file(
        outbox,
        "r3".into(),
        read_request(path.to_str().unwrap(), 10, 5),
        Arc::new(Vec::new()),
    )
    .await;

    let reply = read_reply(&mut rx).await;
    assert_eq!(reply.content, "");
    assert_eq!(reply.total_lines, 2);
}

#[tokio::test]
async fn read_missing_file_reports_not_found() {
    let (outbox, mut rx) = Outbox::channel(8);
    handle_read_file(
        outbox,
        "r4".into(),
        read_request("/definitely/not/here", 0, 0),
        Arc::new(Vec::new()),
    )
    .await;
    assert!(read_reply(&mut rx).await.error.contains("文件不存在"));
}

#[tokio::test]
async fn read_directory_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (outbox, mut rx) = Outbox::channel(8);
    handle_read_file(
        outbox,
        "r5".into(),
        read_request(dir.path().to_str().unwrap(), 0, 0),
        Arc::new(Vec::new()),
    )
    .await;
    assert!(read_reply(&mut rx).await.error.contains("路径是目录"));
}

#[tokio::test]
async fn read_oversized_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big");
    std::fs::write(&path, "0123456789").unwrap();

    let (outbox, mut rx) = Outbox::channel(8);
    handle_read_file(
        outbox,
        "r6".into(),
        ReadFileRequest {
            path: path.to_str().unwrap().to_string(),
            offset: 0,
            limit: 0,
            max_size: 4,
        },
        Arc::new(Vec::new()),
    )
    .await;

    let reply = read_reply(&mut rx).await;
    assert!(reply.error.contains("文件过大"));
    assert_eq!(reply.file_size, 10);
}

#[tokio::test]
async fn read_denied_path_is_rejected() {
    let (outbox, mut rx) = Outbox::channel(8);
    handle_read_file(
        outbox,
        "r7".into(),
        read_request("/etc/hostname", 0, 0),
        Arc::new(vec!["/tmp".to_string()]),
    )
    .await;
    assert!(read_reply(&mut rx).await.error.contains("路径不允许"));
}

#[tokio::test]
async fn write_creates_parents_with_restrictive_file_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a/b/c.txt");

    let (outbox, mut rx) = Outbox::channel(8);
    handle_write_file(
        outbox,
        "w1".into(),
        WriteFileRequest {
            path: path.to_str().unwrap().to_string(),
            content: "hello".to_string(),
        },
        Arc::new(Vec::new()),
    )
    .await;

    let reply = op_reply(&mut rx).await;
    assert!(reply.success, "write failed: {}", reply.error);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[tokio::test]
async fn edit_with_unique_match_substitutes_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f");
    std::fs::write(&path, "one foo two").unwrap();

    let (outbox, mut rx) = Outbox::channel(8);
    handle_edit_file(
        outbox,
        "e1".into(),
        EditFileRequest {
            path: path.to_str().unwrap().to_string(),
            old_string: "foo".to_string(),
            new_string: "bar".to_string(),
            replace_all: false,
        },
        Arc::new(Vec::new()),
    )
    .await;

    assert!(op_reply(&mut rx).await.success);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "one bar two");
}

#[tokio::test]
async fn edit_with_ambiguous_match_fails_and_leaves_file_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f");
    std::fs::write(&path, "foo and foo").unwrap();

    let (outbox, mut rx) = Outbox::channel(8);
    handle_edit_file(
        outbox,
        "e2".into(),
        EditFileRequest {
            path: path.to_str().unwrap().to_string(),
            old_string: "foo".to_string(),
            new_string: "bar".to_string(),
            replace_all: false,
        },
        Arc::new(Vec::new()),
    )
    .await;

    let reply = op_reply(&mut rx).await;
    assert!(!reply.success);
    assert!(reply.error.contains("出现 2 次"));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "foo and foo");
}

#[tokio::test]
async fn edit_replace_all_substitutes_every_occurrence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f");
    std::fs::write(&path, "foo and foo").unwrap();

    let (outbox, mut rx) = Outbox::channel(8);
    handle_edit_file(
        outbox,
        "e3".into(),
        EditFileRequest {
            path: path.to_str().unwrap().to_string(),
            old_string: "foo".to_string(),
            new_string: "bar".to_string(),
            replace_all: true,
        },
        Arc::new(Vec::new()),
    )
    .await;

    assert!(op_reply(&mut rx).await.success);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "bar and bar");
}

#[tokio::test]
async fn edit_rejects_empty_and_missing_old_string() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f");
    std::fs::write(&path, "content").unwrap();

    let (outbox, mut rx) = Outbox::channel(8);
    handle_edit_file(
        outbox.clone(),
        "e4".into(),
        EditFileRequest {
            path: path.to_str().unwrap().to_string(),
            old_string: String::new(),
            new_string: "x".to_string(),
            replace_all: false,
        },
        Arc::new(Vec::new()),
    )
    .await;
    assert!(op_reply(&mut rx).await.error.contains("old_string 不能为空"));

    handle_edit_file(
        outbox,
        "e5".into(),
        EditFileRequest {
            path: path.to_str().unwrap().to_string(),
            old_string: "absent".to_string(),
            new_string: "x".to_string(),
            replace_all: false,
        },
        Arc::new(Vec::new()),
    )
    .await;
    assert!(op_reply(&mut rx).await.error.contains("old_string 未找到"));
}
