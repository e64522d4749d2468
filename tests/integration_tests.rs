//! Integration tests for memeloop
//!
//! CLI smoke tests run the real binary; the WebSocket tests start a real
//! server on an ephemeral port with in-process collaborators.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a memeloop Command isolated from the caller's environment
fn memeloop(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("memeloop");
    cmd.current_dir(dir.path())
        .env_remove("MEMELOOP_PORT")
        .env_remove("MEMELOOP_MAX_ITERATIONS")
        .env_remove("MEMELOOP_HISTORY_DIR")
        .env_remove("IMGFLIP_USERNAME")
        .env_remove("IMGFLIP_PASSWORD")
        .env_remove("FRONTEND_URL");
    cmd
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        memeloop(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("generate"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        memeloop(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_generate_requires_topic() {
        let dir = TempDir::new().unwrap();
        memeloop(&dir).arg("generate").assert().failure();
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod config_cmd {
    use super::*;

    #[test]
    fn test_show_defaults() {
        let dir = TempDir::new().unwrap();
        memeloop(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("built-in defaults"))
            .stdout(predicate::str::contains("max_iterations = 5"))
            .stdout(predicate::str::contains("port = 8000"));
    }

    #[test]
    fn test_show_reads_local_file_and_env() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("memeloop.toml"),
            "[pipeline]\nmax_iterations = 3\n",
        )
        .unwrap();

        memeloop(&dir)
            .args(["config", "show"])
            .env("MEMELOOP_PORT", "9100")
            .assert()
            .success()
            .stdout(predicate::str::contains("max_iterations = 3"))
            .stdout(predicate::str::contains("port = 9100"));
    }

    #[test]
    fn test_show_masks_password() {
        let dir = TempDir::new().unwrap();
        memeloop(&dir)
            .args(["config", "show"])
            .env("IMGFLIP_USERNAME", "meme-lord")
            .env("IMGFLIP_PASSWORD", "hunter2")
            .assert()
            .success()
            .stdout(predicate::str::contains("meme-lord"))
            .stdout(predicate::str::contains("hunter2").not());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[pipeline]\nmax_iterations = 0\n").unwrap();

        memeloop(&dir)
            .args(["config", "validate", "--config"])
            .arg(&path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("max_iterations"));
    }

    #[test]
    fn test_missing_explicit_config_fails() {
        let dir = TempDir::new().unwrap();
        memeloop(&dir)
            .args(["config", "show", "--config", "nope.toml"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("nope.toml"));
    }

    #[test]
    fn test_validate_ok() {
        let dir = TempDir::new().unwrap();
        memeloop(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }
}

// =============================================================================
// WebSocket Approval Flow
// =============================================================================

mod ws_flow {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use futures_util::{SinkExt, StreamExt};
    use memeloop::config::AppConfig;
    use memeloop::pipeline::{ContentMiner, ImageRenderer, SpecWriter, StageRunner};
    use memeloop::server::{build_router, build_state};
    use memeloop_common::{IterationContext, MemeSpec};
    use serde_json::{Value, json};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct EchoMiner;

    #[async_trait]
    impl ContentMiner for EchoMiner {
        async fn mine(&self, prompt: &str, ctx: &IterationContext) -> anyhow::Result<String> {
            let feedback: Vec<&str> = ctx.feedback().collect();
            Ok(format!("TOPIC: {}\nFEEDBACK: {}", prompt, feedback.join("; ")))
        }
    }

    struct FixedWriter;

    #[async_trait]
    impl SpecWriter for FixedWriter {
        async fn write_spec(
            &self,
            _prompt: &str,
            mined: &str,
            _ctx: &IterationContext,
        ) -> anyhow::Result<MemeSpec> {
            Ok(MemeSpec {
                topics_searched: vec![],
                insights: mined.to_string(),
                meme_template_id: 55311130,
                template_name: "This Is Fine".to_string(),
                top_text: "Monday 7am".to_string(),
                bottom_text: "This is fine".to_string(),
                reasoning: String::new(),
            })
        }
    }

    #[derive(Default)]
    struct CountingRenderer(AtomicU32);

    #[async_trait]
    impl ImageRenderer for CountingRenderer {
        async fn render(&self, _spec: &MemeSpec) -> anyhow::Result<String> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("https://i.imgflip.com/test{}.jpg", n))
        }
    }

    async fn start_server() -> SocketAddr {
        let stages = StageRunner::new(
            Arc::new(EchoMiner),
            Arc::new(FixedWriter),
            Arc::new(CountingRenderer::default()),
        );
        let state = build_state(&AppConfig::default(), stages);
        let app = build_router(state, &[]);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    /// Connect and wait until the session is registered.
    async fn connect(addr: SocketAddr, client_id: &str) -> Socket {
        let (mut socket, _) = connect_async(format!("ws://{}/ws/{}", addr, client_id))
            .await
            .unwrap();
        socket
            .send(Message::Text(json!({"type": "hello"}).to_string().into()))
            .await
            .unwrap();
        let echo = next_json(&mut socket).await;
        assert_eq!(echo["type"], "echo");
        assert_eq!(echo["data"]["type"], "hello");
        socket
    }

    async fn next_json(socket: &mut Socket) -> Value {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => panic!("Expected text frame, got {:?}", other),
            }
        }
    }

    async fn next_approval_request(socket: &mut Socket) -> Value {
        loop {
            let msg = next_json(socket).await;
            if msg["type"] == "approval_request" {
                return msg;
            }
        }
    }

    fn generate(addr: SocketAddr, prompt: &str, client_id: &str) -> tokio::task::JoinHandle<(u16, Value)> {
        let url = format!("http://{}/generate-meme", addr);
        let body = json!({"prompt": prompt, "client_id": client_id});
        tokio::spawn(async move {
            let resp = reqwest::Client::new()
                .post(url)
                .json(&body)
                .send()
                .await
                .unwrap();
            let status = resp.status().as_u16();
            (status, resp.json::<Value>().await.unwrap())
        })
    }

    #[tokio::test]
    async fn test_reject_then_approve_over_websocket() {
        let addr = start_server().await;
        let mut socket = connect(addr, "alice").await;
        let run = generate(addr, "monday morning struggles", "alice");

        let first = next_approval_request(&mut socket).await;
        assert_eq!(first["iteration"], 1);
        assert_eq!(first["artifact_reference"], "https://i.imgflip.com/test1.jpg");
        assert_eq!(first["meme_spec"]["template_name"], "This Is Fine");
        socket
            .send(Message::Text(
                json!({
                    "type": "decision",
                    "approved": "false",
                    "feedback": "make it funnier",
                    "command_id": first["command_id"],
                })
                .to_string()
                .into(),
            ))
            .await
            .unwrap();

        let second = next_approval_request(&mut socket).await;
        assert_eq!(second["iteration"], 2);
        assert_ne!(second["command_id"], first["command_id"]);
        // The rejection feedback reached the next attempt's stages.
        assert!(
            second["meme_spec"]["insights"]
                .as_str()
                .unwrap()
                .contains("make it funnier")
        );
        socket
            .send(Message::Text(
                json!({"type": "decision", "approved": "true", "command_id": second["command_id"]})
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();

        let (status, body) = run.await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body["approved"], true);
        assert_eq!(body["iterations"], 2);
        assert_eq!(body["meme_url"], "https://i.imgflip.com/test2.jpg");

        let run_id = body["run_id"].as_str().unwrap();
        let record: Value = reqwest::get(format!("http://{}/runs/{}", addr, run_id))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(record["context"]["iterations"][0]["outcome"], "rejected");
        assert_eq!(record["context"]["iterations"][1]["outcome"], "approved");
    }

    #[tokio::test]
    async fn test_duplicate_handshake_is_closed_with_policy_code() {
        let addr = start_server().await;
        let _first = connect(addr, "alice").await;

        let (mut second, _) = connect_async(format!("ws://{}/ws/alice", addr))
            .await
            .unwrap();
        let notice = next_json(&mut second).await;
        assert_eq!(notice["type"], "event_log");
        assert!(notice["message"].as_str().unwrap().contains("alice"));

        match second.next().await {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 1008),
            other => panic!("Expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generate_without_connection_is_rejected() {
        let addr = start_server().await;
        let (status, body) = generate(addr, "cats", "nobody").await.unwrap();
        assert_eq!(status, 400);
        assert!(body["error"].as_str().unwrap().contains("WebSocket"));
    }

    #[tokio::test]
    async fn test_disconnect_aborts_run() {
        let addr = start_server().await;
        let mut socket = connect(addr, "alice").await;
        let run = generate(addr, "cats", "alice");

        let _ = next_approval_request(&mut socket).await;
        socket.close(None).await.unwrap();
        drop(socket);

        let (status, body) = run.await.unwrap();
        assert_eq!(status, 410);
        assert_eq!(body["iterations"], 1);
    }

    #[tokio::test]
    async fn test_stale_decision_is_acknowledged() {
        let addr = start_server().await;
        let mut socket = connect(addr, "alice").await;
        socket
            .send(Message::Text(
                json!({"type": "decision", "approved": "true", "command_id": "not-pending"})
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();
        let ack = next_json(&mut socket).await;
        assert_eq!(ack["type"], "event_log");
        assert!(ack["message"].as_str().unwrap().contains("ignored"));
    }
}
