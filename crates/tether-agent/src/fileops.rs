//! File operator: range-limited read, write, in-place find/replace.
//!
//! Every operation consults the path allow-list first and reports failures
//! in its own reply; file errors never tear down the session.

use std::path::Path;
use std::sync::Arc;

use tokio::fs;
use tracing::{info, warn};

use tether_core::constants::{DEFAULT_LINE_LIMIT, DEFAULT_MAX_FILE_SIZE};
use tether_core::is_path_allowed;
use tether_core::protocol::{
    AgentEnvelope, AgentPayload, EditFileRequest, FileContent, OpResult, ReadFileRequest,
    WriteFileRequest,
};

use crate::transport::Outbox;

/// Read a range of lines from a file.
pub async fn handle_read_file(
    outbox: Outbox,
    request_id: String,
    req: ReadFileRequest,
    allowed_paths: Arc<Vec<String>>,
) {
    let path = &req.path;
    if !is_path_allowed(path, &allowed_paths) {
        send_file_content(&outbox, &request_id, "", 0, 0, &format!("路径不允许: {path}")).await;
        return;
    }

    let meta = match fs::metadata(path).await {
        Ok(meta) => meta,
        Err(_) => {
            send_file_content(&outbox, &request_id, "", 0, 0, &format!("文件不存在: {path}")).await;
            return;
        }
    };
    if meta.is_dir() {
        send_file_content(&outbox, &request_id, "", 0, 0, &format!("路径是目录: {path}")).await;
        return;
    }

    let max_size = if req.max_size <= 0 {
        DEFAULT_MAX_FILE_SIZE
    } else {
        req.max_size
    };
    let file_size = meta.len() as i64;
    if file_size > max_size {
        send_file_content(
            &outbox,
            &request_id,
            "",
            0,
            file_size,
            &format!("文件过大: {file_size} 字节（上限 {max_size}）"),
        )
        .await;
        return;
    }

    let data = match fs::read(path).await {
        Ok(data) => data,
        Err(e) => {
            send_file_content(&outbox, &request_id, "", 0, 0, &format!("打开失败: {e}")).await;
            return;
        }
    };
    let text = String::from_utf8_lossy(&data);

    let offset = req.offset.max(0) as usize;
    let limit = if req.limit <= 0 {
        DEFAULT_LINE_LIMIT as usize
    } else {
        req.limit as usize
    };

    let mut lines: Vec<&str> = Vec::new();
    let mut total_lines: i64 = 0;
    for line in text.lines() {
        total_lines += 1;
        if (total_lines - 1) < offset as i64 {
            continue;
        }
        if lines.len() < limit {
            lines.push(line);
        }
    }

    let mut content = lines.join("\n");
    if !lines.is_empty() {
        content.push('\n');
    }
    send_file_content(&outbox, &request_id, &content, total_lines, file_size, "").await;
}

/// Write a file, creating parent directories as needed.
pub async fn handle_write_file(
    outbox: Outbox,
    request_id: String,
    req: WriteFileRequest,
    allowed_paths: Arc<Vec<String>>,
) {
    let path = &req.path;
    if !is_path_allowed(path, &allowed_paths) {
        send_op_result(&outbox, &request_id, false, &format!("路径不允许: {path}")).await;
        return;
    }

    if let Some(parent) = Path::new(path).parent() {
        if let Err(e) = fs::create_dir_all(parent).await {
            send_op_result(&outbox, &request_id, false, &format!("创建目录失败: {e}")).await;
            return;
        }
        set_mode(parent, 0o755).await;
    }
    if let Err(e) = fs::write(path, req.content.as_bytes()).await {
        send_op_result(&outbox, &request_id, false, &format!("写入失败: {e}")).await;
        return;
    }
    set_mode(Path::new(path), 0o600).await;

    info!("[执行] 写入文件: {path} ({} 字节)", req.content.len());
    send_op_result(&outbox, &request_id, true, "").await;
}

/// In-place find/replace with occurrence discipline: a unique match or
/// `replace_all`; anything else fails and leaves the file untouched.
pub async fn handle_edit_file(
    outbox: Outbox,
    request_id: String,
    req: EditFileRequest,
    allowed_paths: Arc<Vec<String>>,
) {
    let path = &req.path;
    if !is_path_allowed(path, &allowed_paths) {
        send_op_result(&outbox, &request_id, false, &format!("路径不允许: {path}")).await;
        return;
    }

    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) => {
            send_op_result(&outbox, &request_id, false, &format!("读取失败: {e}")).await;
            return;
        }
    };

    if req.old_string.is_empty() {
        send_op_result(&outbox, &request_id, false, "old_string 不能为空").await;
        return;
    }

    let count = content.matches(&req.old_string).count();
    if count == 0 {
        send_op_result(&outbox, &request_id, false, "old_string 未找到").await;
        return;
    }
    if !req.replace_all && count > 1 {
        send_op_result(
            &outbox,
            &request_id,
            false,
            &format!("old_string 出现 {count} 次，需更多上下文或使用 replace_all"),
        )
        .await;
        return;
    }

    let new_content = if req.replace_all {
        content.replace(&req.old_string, &req.new_string)
    } else {
        content.replacen(&req.old_string, &req.new_string, 1)
    };

    if let Err(e) = fs::write(path, new_content.as_bytes()).await {
        send_op_result(&outbox, &request_id, false, &format!("写回失败: {e}")).await;
        return;
    }
    set_mode(Path::new(path), 0o600).await;

    info!("[执行] 编辑文件: {path}");
    send_op_result(&outbox, &request_id, true, "").await;
}

/// Best-effort chmod; file operations do not fail on permission metadata.
async fn set_mode(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, Permissions::from_mode(mode)).await;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
}

async fn send_file_content(
    outbox: &Outbox,
    request_id: &str,
    content: &str,
    total_lines: i64,
    file_size: i64,
    error: &str,
) {
    let reply = AgentEnvelope::reply(
        request_id,
        AgentPayload::FileContent(FileContent {
            content: content.to_string(),
            total_lines,
            file_size,
            error: error.to_string(),
        }),
    );
    if outbox.send(reply).await.is_err() {
        warn!("[执行] 发送 FileContent 失败");
    }
}

async fn send_op_result(outbox: &Outbox, request_id: &str, success: bool, error: &str) {
    let reply = AgentEnvelope::reply(
        request_id,
        AgentPayload::OpResult(OpResult {
            success,
            error: error.to_string(),
        }),
    );
    if outbox.send(reply).await.is_err() {
        warn!("[执行] 发送 OpResult 失败");
    }
}
