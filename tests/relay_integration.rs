//! Integration tests for the vsock relay against a fake multiplexer.
//!
//! The hypervisor's vsock multiplexer is a Unix stream server speaking a text
//! handshake (`CONNECT <port>\n` → `OK <host_port>\n`) in front of JSON-lines
//! traffic. A `UnixListener` plays that role here, so the full relay lifecycle
//! runs without a hypervisor: handshake retry, init frame, output fan-in,
//! input fan-out, exit, EOF, and cancellation.

use std::{path::PathBuf, sync::Arc, time::Instant};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::UnixListener,
};

use lia::{
    hub::{TaskHub, WsEvent},
    relay::{RelayInit, RelayOutcome, VsockRelay},
    LiaError,
};
use uuid::Uuid;

//--------------------------------------------------------------------------------------------------
// Helpers
//--------------------------------------------------------------------------------------------------

fn relay_init() -> RelayInit {
    RelayInit {
        api_key: "test-key".to_string(),
        prompt: "write a haiku".to_string(),
        files: None,
    }
}

struct FakeMux {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl FakeMux {
    /// Accepts one connection and performs the multiplexer handshake.
    async fn accept(listener: &UnixListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, writer) = stream.into_split();
        let mut mux = Self {
            reader: BufReader::new(read_half),
            writer,
        };

        let line = mux.read_line().await;
        assert_eq!(line, "CONNECT 5000\n");
        mux.send_raw("OK 5000\n").await;
        mux
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line
    }

    /// Reads one frame and checks it is a single well-formed JSON line.
    async fn read_frame(&mut self) -> serde_json::Value {
        let line = self.read_line().await;
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        serde_json::from_str(&line).unwrap()
    }

    async fn send_raw(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }
}

fn socket_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("test.vsock")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_full_session_output_input_exit() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);
    let listener = UnixListener::bind(&path).unwrap();

    let guest = tokio::spawn(async move {
        let mut mux = FakeMux::accept(&listener).await;

        // The first frame is the one-shot init with key and prompt.
        let init = mux.read_frame().await;
        assert_eq!(init["type"], "init");
        assert_eq!(init["api_key"], "test-key");
        assert_eq!(init["prompt"], "write a haiku");

        mux.send_raw("{\"type\":\"output\",\"data\":\"an old silent pond\"}\n")
            .await;
        mux.send_raw("{\"type\":\"heartbeat\"}\n").await;

        // Wait for the host to forward subscriber input.
        let input = mux.read_frame().await;
        assert_eq!(input["type"], "input");
        assert_eq!(input["data"], "continue");

        mux.send_raw("{\"type\":\"output\",\"data\":\"a frog jumps in\"}\n")
            .await;
        mux.send_raw("{\"type\":\"exit\",\"code\":0}\n").await;
    });

    let hub = Arc::new(TaskHub::new());
    let relay = VsockRelay::new(Uuid::new_v4(), path, hub.clone());
    let (session, mut outcome_rx) = relay.start(relay_init()).await.unwrap();

    session
        .input_sender()
        .send("continue".to_string())
        .await
        .unwrap();

    assert_eq!(outcome_rx.recv().await, Some(RelayOutcome::Exited(0)));
    guest.await.unwrap();

    // Both output frames were published; the heartbeat was dropped.
    let outputs: Vec<String> = hub
        .replay()
        .into_iter()
        .map(|event| match event {
            WsEvent::Output { data, .. } => data,
            other => panic!("unexpected event in replay: {:?}", other),
        })
        .collect();
    assert_eq!(outputs, vec!["an old silent pond", "a frog jumps in"]);
}

#[test_log::test(tokio::test)]
async fn test_handshake_retries_until_listener_appears() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);

    // Bind only after the relay has already failed a few attempts.
    let late_path = path.clone();
    let guest = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(350)).await;
        let listener = UnixListener::bind(&late_path).unwrap();
        let mut mux = FakeMux::accept(&listener).await;
        let init = mux.read_frame().await;
        assert_eq!(init["type"], "init");
        mux.send_raw("{\"type\":\"exit\",\"code\":7}\n").await;
    });

    let hub = Arc::new(TaskHub::new());
    let relay = VsockRelay::new(Uuid::new_v4(), path, hub);
    let (_session, mut outcome_rx) = relay.start(relay_init()).await.unwrap();

    assert_eq!(outcome_rx.recv().await, Some(RelayOutcome::Exited(7)));
    guest.await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_handshake_gives_up_when_guest_never_listens() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);

    let hub = Arc::new(TaskHub::new());
    let relay = VsockRelay::new(Uuid::new_v4(), path, hub);

    let started = Instant::now();
    let err = relay.start(relay_init()).await.err().unwrap();
    let elapsed = started.elapsed();

    assert!(matches!(err, LiaError::RelayHandshake(_)));
    assert!(err.to_string().contains("handshake"));
    // 100 attempts at 100ms spacing: roughly the ten-second budget.
    assert!(elapsed.as_secs() >= 9);
    assert!(elapsed.as_secs() <= 30);
}

#[test_log::test(tokio::test)]
async fn test_eof_mid_session_reports_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);
    let listener = UnixListener::bind(&path).unwrap();

    let guest = tokio::spawn(async move {
        let mut mux = FakeMux::accept(&listener).await;
        let _init = mux.read_frame().await;
        mux.send_raw("{\"type\":\"output\",\"data\":\"partial\"}\n")
            .await;
        // Drop the connection without an exit frame.
    });

    let hub = Arc::new(TaskHub::new());
    let relay = VsockRelay::new(Uuid::new_v4(), path, hub.clone());
    let (_session, mut outcome_rx) = relay.start(relay_init()).await.unwrap();

    assert_eq!(outcome_rx.recv().await, Some(RelayOutcome::Disconnected));
    guest.await.unwrap();
    assert_eq!(hub.replay().len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_boot_noise_is_skipped_before_first_valid_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);
    let listener = UnixListener::bind(&path).unwrap();

    let guest = tokio::spawn(async move {
        let mut mux = FakeMux::accept(&listener).await;
        let _init = mux.read_frame().await;
        mux.send_raw("garbage from the console\n").await;
        mux.send_raw("{\"type\":\"output\",\"data\":\"ok now\"}\n").await;
        mux.send_raw("{\"type\":\"exit\",\"code\":0}\n").await;
    });

    let hub = Arc::new(TaskHub::new());
    let relay = VsockRelay::new(Uuid::new_v4(), path, hub.clone());
    let (_session, mut outcome_rx) = relay.start(relay_init()).await.unwrap();

    assert_eq!(outcome_rx.recv().await, Some(RelayOutcome::Exited(0)));
    guest.await.unwrap();
    assert_eq!(hub.replay().len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_cancellation_unblocks_both_loops() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);
    let listener = UnixListener::bind(&path).unwrap();

    let guest = tokio::spawn(async move {
        let mut mux = FakeMux::accept(&listener).await;
        let _init = mux.read_frame().await;
        // Hold the connection open until the host hangs up.
        let mut line = String::new();
        while mux.reader.read_line(&mut line).await.unwrap_or(0) > 0 {
            line.clear();
        }
    });

    let hub = Arc::new(TaskHub::new());
    let relay = VsockRelay::new(Uuid::new_v4(), path, hub);
    let (session, mut outcome_rx) = relay.start(relay_init()).await.unwrap();

    // stop() signals shutdown and joins the reader and writer.
    session.stop().await;

    assert_eq!(outcome_rx.recv().await, Some(RelayOutcome::Cancelled));
    guest.await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_rejected_handshake_is_retried_not_trusted() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);
    let listener = UnixListener::bind(&path).unwrap();

    let guest = tokio::spawn(async move {
        // First connection: refuse the handshake.
        {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut writer) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            writer.write_all(b"ERR no such port\n").await.unwrap();
        }

        // Second connection: play along.
        let mut mux = FakeMux::accept(&listener).await;
        let _init = mux.read_frame().await;
        mux.send_raw("{\"type\":\"exit\",\"code\":0}\n").await;
    });

    let hub = Arc::new(TaskHub::new());
    let relay = VsockRelay::new(Uuid::new_v4(), path, hub);
    let (_session, mut outcome_rx) = relay.start(relay_init()).await.unwrap();

    assert_eq!(outcome_rx.recv().await, Some(RelayOutcome::Exited(0)));
    guest.await.unwrap();
}
