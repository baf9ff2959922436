//! End-to-end tests against shell-script tool servers

use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use triad_core::config::{ServerConfig, ToolsConfig};
use triad_core::{ToolDispatcher, TriadError};
use triad_tools::{ToolManager, ToolServer};

/// A line-oriented JSON-RPC server in POSIX sh.
///
/// Tools: echo (replies "pong"), slow (never replies), crash (exits),
/// fail (JSON-RPC error), bad (isError result), later/now (answered out of
/// order). Prints a garbage line and a server ping before answering
/// `initialize`.
const FAKE_SERVER: &str = r#"
echo "booting" >&2
echo "this is not json"
later_id=""
now_seen=""
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  method=$(printf '%s' "$line" | sed -n 's/.*"method":"\([^"]*\)".*/\1/p')
  case "$method" in
    initialize)
      printf '{"jsonrpc":"2.0","id":"srv-1","method":"ping"}\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}\n' "$id"
      ;;
    tools/list)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo"},{"name":"slow"},{"name":"crash"},{"name":"fail"},{"name":"bad"},{"name":"later"},{"name":"now"}]}}\n' "$id"
      ;;
    tools/call)
      name=$(printf '%s' "$line" | sed -n 's/.*"params":{"name":"\([^"]*\)".*/\1/p')
      case "$name" in
        echo)
          printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id"
          ;;
        slow)
          ;;
        crash)
          exit 1
          ;;
        fail)
          printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32000,"message":"tool blew up"}}\n' "$id"
          ;;
        bad)
          printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"no such file"}],"isError":true}}\n' "$id"
          ;;
        later)
          if [ -n "$now_seen" ]; then
            printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"later"}]}}\n' "$id"
          else
            later_id="$id"
          fi
          ;;
        now)
          now_seen=1
          printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"now"}]}}\n' "$id"
          if [ -n "$later_id" ]; then
            printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"later"}]}}\n' "$later_id"
            later_id=""
          fi
          ;;
      esac
      ;;
    *)
      ;;
  esac
done
"#;

/// Reads forever, never answers
const SILENT_SERVER: &str = r#"
while IFS= read -r line; do
  :
done
"#;

fn write_script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path.to_string_lossy().into_owned()
}

fn sh_server(name: &str, script: &str) -> ServerConfig {
    ServerConfig {
        name: name.to_string(),
        command: "sh".to_string(),
        args: vec![script.to_string()],
        env: HashMap::new(),
    }
}

fn tools_config(servers: Vec<ServerConfig>) -> ToolsConfig {
    ToolsConfig {
        handshake_timeout_ms: 5_000,
        list_timeout_ms: 5_000,
        call_timeout_ms: 5_000,
        shutdown_grace_ms: 500,
        select_servers: true,
        servers,
    }
}

fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_start_lists_tools_and_calls_echo() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "fake.sh", FAKE_SERVER);
    let manager = ToolManager::start(&tools_config(vec![sh_server("fake", &script)]))
        .await
        .unwrap();

    let tools = manager.list_tools();
    assert_eq!(tools.len(), 7);
    assert_eq!(tools[0].0, "fake");
    assert_eq!(tools[0].1.name, "echo");
    assert_eq!(tools[0].1.description.as_deref(), Some("Echo"));
    assert_eq!(manager.find_server("echo").as_deref(), Some("fake"));
    assert_eq!(manager.find_server("missing"), None);

    let outcome = manager.call("echo", json!({"text": "hi"})).await.unwrap();
    assert!(!outcome.is_error);
    assert_eq!(outcome.text(), "pong");

    let status = manager.status();
    assert_eq!(status.len(), 1);
    assert!(status[0].ready);
    assert_eq!(status[0].tool_count, 7);
    assert_eq!(status[0].pending, 0);
    assert!(status[0].pid.is_some());

    manager.shutdown().await;
    assert!(manager.status().is_empty());
}

#[tokio::test]
async fn test_out_of_order_responses_match_by_id() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "fake.sh", FAKE_SERVER);
    let manager = ToolManager::start(&tools_config(vec![sh_server("fake", &script)]))
        .await
        .unwrap();

    let (later, now) = tokio::join!(
        manager.call("later", json!({})),
        manager.call("now", json!({}))
    );
    assert_eq!(later.unwrap().text(), "later");
    assert_eq!(now.unwrap().text(), "now");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_error_responses() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "fake.sh", FAKE_SERVER);
    let manager = ToolManager::start(&tools_config(vec![sh_server("fake", &script)]))
        .await
        .unwrap();

    match manager.call("fail", json!({})).await {
        Err(TriadError::ToolError { code, message }) => {
            assert_eq!(code, -32000);
            assert_eq!(message, "tool blew up");
        }
        other => panic!("expected ToolError, got {:?}", other.map(|o| o.text())),
    }

    let outcome = manager.call("bad", json!({})).await.unwrap();
    assert!(outcome.is_error);
    assert_eq!(outcome.text(), "no such file");

    assert!(matches!(
        manager.call("missing", json!({})).await,
        Err(TriadError::ToolNotFound(_))
    ));
    assert!(matches!(
        manager.call_on("nowhere", "echo", json!({})).await,
        Err(TriadError::ServerNotFound(_))
    ));
    assert_eq!(
        manager.call_on("fake", "echo", json!({})).await.unwrap().text(),
        "pong"
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn test_call_timeout_leaves_no_pending_entry() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "fake.sh", FAKE_SERVER);
    let mut config = tools_config(vec![sh_server("fake", &script)]);
    config.call_timeout_ms = 300;
    let manager = ToolManager::start(&config).await.unwrap();

    match manager.call("slow", json!({})).await {
        Err(TriadError::ToolCallTimeout { tool, timeout_ms }) => {
            assert_eq!(tool, "slow");
            assert_eq!(timeout_ms, 300);
        }
        other => panic!("expected timeout, got {:?}", other.map(|o| o.text())),
    }

    // The server keeps serving after a timed-out request.
    assert_eq!(manager.call("echo", json!({})).await.unwrap().text(), "pong");
    assert_eq!(manager.status()[0].pending, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_crash_rejects_all_pending_requests() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "fake.sh", FAKE_SERVER);
    let manager = ToolManager::start(&tools_config(vec![sh_server("fake", &script)]))
        .await
        .unwrap();

    let (slow, crash) = tokio::join!(
        manager.call("slow", json!({})),
        manager.call("crash", json!({}))
    );
    assert!(matches!(slow, Err(TriadError::ProcessExited(_))));
    assert!(matches!(crash, Err(TriadError::ProcessExited(_))));

    let status = manager.status();
    assert!(!status[0].ready);
    assert_eq!(status[0].pending, 0);

    // A dead server no longer provides tools.
    assert!(matches!(
        manager.call("echo", json!({})).await,
        Err(TriadError::ToolNotFound(_))
    ));
    assert!(matches!(
        manager.call_on("fake", "echo", json!({})).await,
        Err(TriadError::ProcessExited(_))
    ));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_handshake_timeout_is_fatal() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "silent.sh", SILENT_SERVER);
    let mut config = tools_config(vec![]);
    config.handshake_timeout_ms = 200;

    match ToolServer::start(&sh_server("silent", &script), &config).await {
        Err(TriadError::HandshakeTimeout { server, timeout_ms }) => {
            assert_eq!(server, "silent");
            assert_eq!(timeout_ms, 200);
        }
        Err(other) => panic!("expected handshake timeout, got {}", other),
        Ok(_) => panic!("silent server should not start"),
    }

    config.servers = vec![sh_server("silent", &script)];
    assert!(ToolManager::start(&config).await.is_err());
}

#[tokio::test]
async fn test_partial_start_keeps_healthy_servers() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "fake.sh", FAKE_SERVER);
    let broken = ServerConfig {
        name: "broken".to_string(),
        command: "/nonexistent/triad-tool-server".to_string(),
        args: vec![],
        env: HashMap::new(),
    };
    let manager = ToolManager::start(&tools_config(vec![broken, sh_server("fake", &script)]))
        .await
        .unwrap();

    let status = manager.status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].name, "fake");

    let empty = ToolManager::start(&tools_config(vec![])).await.unwrap();
    assert!(empty.status().is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_escalates_to_kill() {
    let dir = TempDir::new().unwrap();
    let body = format!("trap '' TERM\n{}", FAKE_SERVER);
    let script = write_script(dir.path(), "stubborn.sh", &body);
    let mut config = tools_config(vec![sh_server("stubborn", &script)]);
    config.shutdown_grace_ms = 200;
    let manager = ToolManager::start(&config).await.unwrap();

    let pid = manager.status()[0].pid.unwrap();
    assert!(process_alive(pid));

    manager.shutdown().await;
    assert!(!process_alive(pid));

    // Second shutdown is a no-op.
    manager.shutdown().await;
}

#[tokio::test]
async fn test_dispatcher_returns_text() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "fake.sh", FAKE_SERVER);
    let manager = ToolManager::start(&tools_config(vec![sh_server("fake", &script)]))
        .await
        .unwrap();

    let value = manager.dispatch("echo", json!({})).await.unwrap();
    assert_eq!(value, json!("pong"));
    assert!(matches!(
        manager.dispatch("bad", json!({})).await,
        Err(TriadError::ToolError { .. })
    ));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_dropping_server_handle_stops_process() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "fake.sh", FAKE_SERVER);
    let config = tools_config(vec![]);
    let server = ToolServer::start(&sh_server("fake", &script), &config)
        .await
        .unwrap();
    let pid = server.status().pid.unwrap();
    drop(server);

    let mut alive = true;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if !process_alive(pid) {
            alive = false;
            break;
        }
    }
    assert!(!alive);
}
