use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use taohash_proxy::{ListenPorts, ProxyConfig, ProxyServer, ShareLog};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy)]
struct PoolOptions {
    respond_configure: bool,
    extranonce1: &'static str,
    send_initial_job: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            respond_configure: true,
            extranonce1: "abcd",
            send_initial_job: true,
        }
    }
}

/// A scripted upstream pool. Accepts any number of connections; each gets
/// the standard subscribe/authorize handshake, an initial difficulty of
/// 1024, and (optionally) an initial job. Submits are accepted only when the
/// worker field was rewritten to the pool account; a nonce of `ffffffff` is
/// rejected as a low difficulty share. After answering the first submit the
/// pool pushes a new difficulty of 2048.
async fn spawn_pool(opts: PoolOptions) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve_pool_connection(socket, opts));
        }
    });

    port
}

async fn serve_pool_connection(socket: TcpStream, opts: PoolOptions) {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut first_submit_answered = false;

    while let Ok(Some(line)) = lines.next_line().await {
        let msg: Value = serde_json::from_str(&line).unwrap();
        let id = msg["id"].clone();

        match msg["method"].as_str() {
            Some("mining.configure") => {
                if opts.respond_configure {
                    let resp = json!({
                        "id": id,
                        "result": {"version-rolling": true, "version-rolling.mask": "1fffe000"},
                        "error": null,
                    });
                    write_half
                        .write_all(format!("{resp}\n").as_bytes())
                        .await
                        .unwrap();
                }
            }
            Some("mining.subscribe") => {
                let resp = json!({
                    "id": id,
                    "result": [
                        [["mining.set_difficulty", "deadbeef"], ["mining.notify", "deadbeef"]],
                        opts.extranonce1,
                        4,
                    ],
                    "error": null,
                });
                write_half
                    .write_all(format!("{resp}\n").as_bytes())
                    .await
                    .unwrap();
            }
            Some("mining.authorize") => {
                let auth = json!({"id": id, "result": true, "error": null});
                let diff = json!({"id": null, "method": "mining.set_difficulty", "params": [1024]});
                let mut burst = format!("{auth}\n{diff}\n");
                if opts.send_initial_job {
                    let job = json!({
                        "id": null,
                        "method": "mining.notify",
                        "params": ["j0", "prev", "cb1", "cb2", [], "20000000", "1a0377ae", "66aabbcc", true],
                    });
                    burst.push_str(&format!("{job}\n"));
                }
                write_half.write_all(burst.as_bytes()).await.unwrap();
            }
            Some("mining.submit") => {
                let worker = msg["params"][0].as_str().unwrap_or_default();
                let nonce = msg["params"][4].as_str().unwrap_or_default();

                let resp = if worker != "pool_account.worker" {
                    json!({"id": id, "result": null, "error": [24, "unauthorized worker", null]})
                } else if nonce == "ffffffff" {
                    json!({"id": id, "result": null, "error": [23, "low difficulty share", null]})
                } else {
                    json!({"id": id, "result": true, "error": null})
                };
                write_half
                    .write_all(format!("{resp}\n").as_bytes())
                    .await
                    .unwrap();

                if !first_submit_answered {
                    first_submit_answered = true;
                    let diff =
                        json!({"id": null, "method": "mining.set_difficulty", "params": [2048]});
                    write_half
                        .write_all(format!("{diff}\n").as_bytes())
                        .await
                        .unwrap();
                }
            }
            _ => {}
        }
    }
}

struct TestMiner {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl TestMiner {
    async fn connect(port: u16) -> Self {
        let socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read_half, write_half) = socket.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            write: write_half,
        }
    }

    async fn send(&mut self, message: Value) {
        self.write
            .write_all(format!("{message}\n").as_bytes())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for proxy message")
            .unwrap()
            .expect("proxy closed the connection");
        serde_json::from_str(&line).unwrap()
    }

    /// Read until the connection closes; panics if it stays open.
    async fn expect_disconnect(&mut self) {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            match timeout(Duration::from_secs(5), self.lines.next_line()).await {
                Ok(Ok(Some(_))) => {
                    if tokio::time::Instant::now() > deadline {
                        panic!("proxy kept the connection open");
                    }
                }
                Ok(Ok(None)) | Ok(Err(_)) => return,
                Err(_) => panic!("proxy kept the connection open"),
            }
        }
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    config_path: PathBuf,
    server: Arc<ProxyServer>,
    listen_port: u16,
}

fn config_toml(pool_port: u16) -> String {
    format!(
        r#"[pools.normal]
host = "127.0.0.1"
port = {pool_port}
user = "pool_account.worker"
pass = "x"
"#
    )
}

/// Stand up a ProxyServer against the given upstream port, with a listener
/// on an ephemeral port.
async fn start_proxy(pool_port: u16) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.toml");
    std::fs::write(&config_path, config_toml(pool_port)).unwrap();

    let config = ProxyConfig::load(&config_path).unwrap();
    let sharelog = ShareLog::open(&dir.path().join("shares.db")).unwrap();
    let server = Arc::new(ProxyServer::new(
        config,
        config_path.clone(),
        ListenPorts::default(),
        sharelog,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listen_port = listener.local_addr().unwrap().port();
    tokio::spawn(server.clone().accept_loop(listener, "normal".to_string()));

    Harness {
        _dir: dir,
        config_path,
        server,
        listen_port,
    }
}

#[tokio::test]
async fn test_full_session_with_min_difficulty_and_submits() {
    let pool_port = spawn_pool(PoolOptions::default()).await;
    let harness = start_proxy(pool_port).await;
    let mut miner = TestMiner::connect(harness.listen_port).await;

    // Early burst: configure, subscribe, authorize back to back on accept.
    miner
        .send(json!({
            "id": 1,
            "method": "mining.configure",
            "params": [["version-rolling"], {"version-rolling.mask": "1fffe000"}],
        }))
        .await;
    miner
        .send(json!({"id": 2, "method": "mining.subscribe", "params": ["cgminer/4.10"]}))
        .await;
    miner
        .send(json!({"id": 3, "method": "mining.authorize", "params": ["x.rig1", "x;md=8192;"]}))
        .await;

    // Responses arrive in request order despite the upstream handshake
    // happening in between.
    let configure = miner.recv().await;
    assert_eq!(configure["id"], json!(1));
    assert_eq!(configure["result"]["version-rolling"], json!(true));
    assert_eq!(configure["result"]["version-rolling.mask"], json!("1fffe000"));

    let subscribe = miner.recv().await;
    assert_eq!(subscribe["id"], json!(2));
    assert_eq!(subscribe["result"][1], json!("abcd"));
    assert_eq!(subscribe["result"][2], json!(4));

    let authorize = miner.recv().await;
    assert_eq!(authorize["id"], json!(3));
    assert_eq!(authorize["result"], json!(true));
    assert_eq!(authorize["error"], Value::Null);

    // Pool pushed 1024 but the password demanded at least 8192.
    let difficulty = miner.recv().await;
    assert_eq!(difficulty["method"], json!("mining.set_difficulty"));
    assert_eq!(difficulty["params"][0], json!(8192.0));

    let job = miner.recv().await;
    assert_eq!(job["method"], json!("mining.notify"));
    assert_eq!(job["params"][0], json!("j0"));

    // Accepted share: worker field is rewritten to the pool account, the
    // response keeps the miner's id.
    miner
        .send(json!({
            "id": 10,
            "method": "mining.submit",
            "params": ["x.rig1", "j0", "00000000", "66aabbcc", "00000001"],
        }))
        .await;
    let accepted = miner.recv().await;
    assert_eq!(accepted["id"], json!(10));
    assert_eq!(accepted["result"], json!(true));

    // The pool raised difficulty to 2048 after the first share; the minimum
    // still wins.
    let clamped = miner.recv().await;
    assert_eq!(clamped["method"], json!("mining.set_difficulty"));
    assert_eq!(clamped["params"][0], json!(8192.0));

    // Rejected share.
    miner
        .send(json!({
            "id": 11,
            "method": "mining.submit",
            "params": ["x.rig1", "j0", "00000000", "66aabbcc", "ffffffff"],
        }))
        .await;
    let rejected = miner.recv().await;
    assert_eq!(rejected["id"], json!(11));
    assert_eq!(rejected["result"], Value::Null);
    assert_eq!(rejected["error"][0], json!(23));

    // Both verdicts were durably logged before the responses above were
    // released.
    let rows = harness.server.sharelog().recent(10, 0).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].accepted, false);
    assert_eq!(
        rows[0].error.as_deref(),
        Some(r#"[23,"low difficulty share",null]"#)
    );
    assert_eq!(rows[1].accepted, true);
    for row in &rows {
        assert!(row.miner.starts_with("x.rig1@127.0.0.1:"));
        assert_eq!(row.pool, "normal");
        assert_eq!(row.difficulty, 8192.0);
    }

    let snapshot = harness.server.stats().snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].worker, "x.rig1");
    assert_eq!(snapshot[0].accepted, 1);
    assert_eq!(snapshot[0].rejected, 1);
    assert_eq!(snapshot[0].difficulty, 8192.0);
    assert_eq!(snapshot[0].pool_difficulty, 2048.0);
    assert_eq!(snapshot[0].pool_type, "normal");
}

#[tokio::test]
async fn test_legacy_upstream_gets_local_configure_answer() {
    let pool_port = spawn_pool(PoolOptions {
        respond_configure: false,
        ..Default::default()
    })
    .await;
    let harness = start_proxy(pool_port).await;
    let mut miner = TestMiner::connect(harness.listen_port).await;

    miner
        .send(json!({
            "id": 1,
            "method": "mining.configure",
            "params": [["version-rolling"], {"version-rolling.mask": "1fffe000"}],
        }))
        .await;
    miner
        .send(json!({"id": 2, "method": "mining.subscribe", "params": ["cgminer/4.10"]}))
        .await;

    // The pool stays silent for 2s; the proxy answers on its behalf,
    // echoing the requested mask.
    let configure = miner.recv().await;
    assert_eq!(configure["id"], json!(1));
    assert_eq!(configure["result"]["version-rolling"], json!(true));
    assert_eq!(configure["result"]["version-rolling.mask"], json!("1fffe000"));

    let subscribe = miner.recv().await;
    assert_eq!(subscribe["result"][1], json!("abcd"));
}

#[tokio::test]
async fn test_handshake_after_early_burst_window() {
    let pool_port = spawn_pool(PoolOptions::default()).await;
    let harness = start_proxy(pool_port).await;
    let mut miner = TestMiner::connect(harness.listen_port).await;

    // Idle through the early burst; the handshake then runs through the
    // normal broker loop.
    sleep(Duration::from_millis(1300)).await;

    miner
        .send(json!({"id": 1, "method": "mining.subscribe", "params": ["cgminer/4.10"]}))
        .await;
    let subscribe = miner.recv().await;
    assert_eq!(subscribe["result"][1], json!("abcd"));

    miner
        .send(json!({"id": 2, "method": "mining.authorize", "params": ["x.rig1", "x"]}))
        .await;
    let authorize = miner.recv().await;
    assert_eq!(authorize["result"], json!(true));

    // No password minimum: the pool difficulty passes through untouched.
    let difficulty = miner.recv().await;
    assert_eq!(difficulty["params"][0], json!(1024.0));

    let job = miner.recv().await;
    assert_eq!(job["method"], json!("mining.notify"));
}

#[tokio::test]
async fn test_submit_before_ready_gets_stratum_error() {
    let pool_port = spawn_pool(PoolOptions {
        send_initial_job: false,
        ..Default::default()
    })
    .await;
    let harness = start_proxy(pool_port).await;
    let mut miner = TestMiner::connect(harness.listen_port).await;

    miner
        .send(json!({"id": 1, "method": "mining.subscribe", "params": ["cgminer/4.10"]}))
        .await;
    miner
        .send(json!({"id": 2, "method": "mining.authorize", "params": ["x.rig1", "x"]}))
        .await;

    let _subscribe = miner.recv().await;
    let _authorize = miner.recv().await;
    let _difficulty = miner.recv().await;

    // Authorized but no job yet: a submit is illegal and answered with the
    // Stratum invalid-state error.
    miner
        .send(json!({
            "id": 9,
            "method": "mining.submit",
            "params": ["x.rig1", "j0", "00000000", "66aabbcc", "00000001"],
        }))
        .await;
    let error = miner.recv().await;
    assert_eq!(error["id"], json!(9));
    assert_eq!(error["result"], Value::Null);
    assert_eq!(error["error"][0], json!(20));
    assert_eq!(error["error"][1], json!("Invalid message for current state"));
}

#[tokio::test]
async fn test_reload_terminates_sessions_and_rebinds_new_connections() {
    let pool1 = spawn_pool(PoolOptions::default()).await;
    let pool2 = spawn_pool(PoolOptions {
        extranonce1: "beef",
        ..Default::default()
    })
    .await;
    let harness = start_proxy(pool1).await;

    let mut miner1 = TestMiner::connect(harness.listen_port).await;
    miner1
        .send(json!({"id": 1, "method": "mining.subscribe", "params": ["cgminer/4.10"]}))
        .await;
    let subscribe = miner1.recv().await;
    assert_eq!(subscribe["result"][1], json!("abcd"));
    assert_eq!(harness.server.session_count(), 1);

    // Point the normal pool somewhere else and reload: the call returns
    // immediately, the old session dies shortly after.
    std::fs::write(&harness.config_path, config_toml(pool2)).unwrap();
    harness.server.reload().unwrap();

    miner1.expect_disconnect().await;
    for _ in 0..50 {
        if harness.server.session_count() == 0 && harness.server.stats().snapshot().is_empty() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(harness.server.session_count(), 0);
    assert!(harness.server.stats().snapshot().is_empty());

    // New connections are served by the new upstream.
    let mut miner2 = TestMiner::connect(harness.listen_port).await;
    miner2
        .send(json!({"id": 1, "method": "mining.subscribe", "params": ["cgminer/4.10"]}))
        .await;
    let subscribe = miner2.recv().await;
    assert_eq!(subscribe["result"][1], json!("beef"));
}

#[tokio::test]
async fn test_reload_is_idempotent_and_keeps_config_on_parse_failure() {
    let pool_port = spawn_pool(PoolOptions::default()).await;
    let harness = start_proxy(pool_port).await;

    // Unchanged file: a no-op beyond the log line.
    harness.server.reload().unwrap();
    harness.server.reload().unwrap();
    assert_eq!(
        harness.server.config().pools["normal"].port,
        pool_port
    );

    // Broken file: the error surfaces and the previous config stays.
    std::fs::write(&harness.config_path, "pools = 12 :::").unwrap();
    assert!(harness.server.reload().is_err());
    assert_eq!(
        harness.server.config().pools["normal"].port,
        pool_port
    );
}
