//! Local tool detection for the registration message.

use std::collections::BTreeMap;

use tokio::process::Command;

/// Tools probed at registration time, with their version commands.
const TOOL_CHECKS: &[(&str, &str, &[&str])] = &[
    ("go", "go", &["version"]),
    ("node", "node", &["--version"]),
    ("python3", "python3", &["--version"]),
    ("git", "git", &["--version"]),
    ("docker", "docker", &["--version"]),
    ("pnpm", "pnpm", &["--version"]),
    ("bun", "bun", &["--version"]),
    ("rustc", "rustc", &["--version"]),
];

/// Probe the fixed tool list. Absent or failing tools are omitted; the
/// value is the first line of the version output, trimmed.
pub async fn detect_tools() -> BTreeMap<String, String> {
    let mut tools = BTreeMap::new();
    for (name, cmd, args) in TOOL_CHECKS {
        let output = match Command::new(cmd).args(*args).output().await {
            Ok(output) if output.status.success() => output,
            _ => continue,
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = stdout.trim().lines().next().unwrap_or("").to_string();
        tools.insert(name.to_string(), version);
    }
    tools
}
