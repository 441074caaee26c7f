//! The per-task vsock relay: handshake, init frame, and the two steady-state
//! loops.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        unix::{OwnedReadHalf, OwnedWriteHalf},
        UnixStream,
    },
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{hub::TaskHub, store::TaskFile, LiaError, LiaResult};

use super::{decode_line, encode_line, RelayMessage, GUEST_PORT};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How many times the handshake is attempted before the task fails.
pub const HANDSHAKE_ATTEMPTS: u32 = 100;

/// Delay between handshake attempts. Together with [`HANDSHAKE_ATTEMPTS`] this
/// gives the guest listener roughly ten seconds to come up.
pub const HANDSHAKE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Host→guest keep-alive cadence while no input flows.
const HOST_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Depth of the host→guest input queue.
const INPUT_QUEUE_DEPTH: usize = 100;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The data the init frame carries into the guest.
#[derive(Debug, Clone)]
pub struct RelayInit {
    /// API key for the agent.
    pub api_key: String,
    /// The initial prompt.
    pub prompt: String,
    /// Files to materialize in the guest working directory.
    pub files: Option<Vec<TaskFile>>,
}

/// Why a relay session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The guest sent an exit frame with this code.
    Exited(i32),
    /// The stream hit EOF or broke mid-session.
    Disconnected,
    /// The session was cancelled from the host side.
    Cancelled,
}

/// A live relay session: the input sender, the cancellation channel, and the
/// handles of the two loops.
#[derive(Debug)]
pub struct RelaySession {
    input_tx: mpsc::Sender<String>,
    shutdown_tx: broadcast::Sender<()>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

/// Per-task bidirectional pipe between the host process and the in-guest
/// listener, reached through the hypervisor's vsock multiplexer.
pub struct VsockRelay {
    task_id: Uuid,
    vsock_path: PathBuf,
    hub: Arc<TaskHub>,
}

//--------------------------------------------------------------------------------------------------
// Methods: RelaySession
//--------------------------------------------------------------------------------------------------

impl RelaySession {
    /// A sender into the writer loop. Frames from concurrent senders are
    /// serialized in arrival order.
    pub fn input_sender(&self) -> mpsc::Sender<String> {
        self.input_tx.clone()
    }

    /// Signals both loops to stop at the next message boundary.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Signals shutdown and waits for both loops to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.reader_handle.await;
        let _ = self.writer_handle.await;
    }
}

//--------------------------------------------------------------------------------------------------
// Methods: VsockRelay
//--------------------------------------------------------------------------------------------------

impl VsockRelay {
    /// Creates a relay for one task. `vsock_path` is the hypervisor's
    /// host-side multiplexer socket.
    pub fn new(task_id: Uuid, vsock_path: PathBuf, hub: Arc<TaskHub>) -> Self {
        Self {
            task_id,
            vsock_path,
            hub,
        }
    }

    /// Connects to the guest, performs the multiplexer handshake, sends the
    /// init frame, and spawns the reader and writer loops.
    ///
    /// Returns the session handle plus a receiver that yields exactly one
    /// [`RelayOutcome`] when the session ends.
    pub async fn start(
        &self,
        init: RelayInit,
    ) -> LiaResult<(RelaySession, mpsc::Receiver<RelayOutcome>)> {
        let (reader, mut writer) = self.connect_and_handshake().await?;

        // One-shot init frame; no reply is expected.
        let init_line = encode_line(&RelayMessage::Init {
            api_key: init.api_key,
            prompt: init.prompt,
            files: init.files,
        })?;
        writer
            .write_all(init_line.as_bytes())
            .await
            .map_err(|e| LiaError::RelayHandshake(format!("failed to send init frame: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| LiaError::RelayHandshake(format!("failed to flush init frame: {}", e)))?;

        let (input_tx, input_rx) = mpsc::channel::<String>(INPUT_QUEUE_DEPTH);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let (outcome_tx, outcome_rx) = mpsc::channel::<RelayOutcome>(1);

        let reader_handle = tokio::spawn(Self::reader_loop(
            self.task_id,
            reader,
            self.hub.clone(),
            shutdown_tx.clone(),
            outcome_tx,
        ));
        let writer_handle = tokio::spawn(Self::writer_loop(
            self.task_id,
            writer,
            input_rx,
            shutdown_tx.clone(),
        ));

        Ok((
            RelaySession {
                input_tx,
                shutdown_tx,
                reader_handle,
                writer_handle,
            },
            outcome_rx,
        ))
    }

    /// Retries connect-plus-handshake until the guest listener answers or the
    /// attempt budget runs out.
    async fn connect_and_handshake(
        &self,
    ) -> LiaResult<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
        let mut last_error = String::new();

        for attempt in 1..=HANDSHAKE_ATTEMPTS {
            match self.try_handshake().await {
                Ok(halves) => {
                    debug!(
                        task_id = %self.task_id,
                        attempt,
                        "vsock handshake established"
                    );
                    return Ok(halves);
                }
                Err(e) => last_error = e,
            }
            time::sleep(HANDSHAKE_RETRY_DELAY).await;
        }

        Err(LiaError::RelayHandshake(format!(
            "no answer from guest port {} after {} attempts: {}",
            GUEST_PORT, HANDSHAKE_ATTEMPTS, last_error
        )))
    }

    /// One connect attempt: `CONNECT <port>\n`, expect a line starting with
    /// `OK `. Anything else fails the attempt.
    async fn try_handshake(&self) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf), String> {
        let stream = UnixStream::connect(&self.vsock_path)
            .await
            .map_err(|e| format!("connect: {}", e))?;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half
            .write_all(format!("CONNECT {}\n", GUEST_PORT).as_bytes())
            .await
            .map_err(|e| format!("send CONNECT: {}", e))?;

        let mut response = String::new();
        reader
            .read_line(&mut response)
            .await
            .map_err(|e| format!("read response: {}", e))?;

        if response.starts_with("OK ") {
            Ok((reader, write_half))
        } else {
            Err(format!("unexpected response {:?}", response.trim_end()))
        }
    }

    /// Guest → host loop. Publishes output frames to the hub, drops
    /// heartbeats, and ends the session on exit, EOF, cancellation, or a parse
    /// error past the first valid frame.
    async fn reader_loop(
        task_id: Uuid,
        mut reader: BufReader<OwnedReadHalf>,
        hub: Arc<TaskHub>,
        shutdown_tx: broadcast::Sender<()>,
        outcome_tx: mpsc::Sender<RelayOutcome>,
    ) {
        let mut shutdown_rx = shutdown_tx.subscribe();
        let mut valid_frames = 0u64;
        let mut line = String::new();

        let outcome = loop {
            line.clear();
            tokio::select! {
                _ = shutdown_rx.recv() => break RelayOutcome::Cancelled,
                read = reader.read_line(&mut line) => match read {
                    Ok(0) => {
                        info!(task_id = %task_id, "vsock stream closed by peer");
                        break RelayOutcome::Disconnected;
                    }
                    Ok(_) => match decode_line(&line) {
                        Ok(RelayMessage::Output { data }) => {
                            valid_frames += 1;
                            hub.publish_output(data);
                        }
                        Ok(RelayMessage::Exit { code }) => {
                            info!(task_id = %task_id, code, "guest agent exited");
                            break RelayOutcome::Exited(code);
                        }
                        Ok(RelayMessage::Error { message }) => {
                            valid_frames += 1;
                            warn!(task_id = %task_id, %message, "guest reported error");
                            hub.publish_error(message);
                        }
                        Ok(RelayMessage::Heartbeat) => {
                            valid_frames += 1;
                        }
                        Ok(other) => {
                            warn!(task_id = %task_id, ?other, "ignoring host-bound frame of wrong direction");
                        }
                        Err(e) if valid_frames == 0 => {
                            // Boot noise on the port before the agent speaks
                            // the protocol.
                            debug!(task_id = %task_id, error = %e, "skipping pre-protocol line");
                        }
                        Err(e) => {
                            warn!(task_id = %task_id, error = %e, "malformed frame mid-session");
                            break RelayOutcome::Disconnected;
                        }
                    },
                    Err(e) => {
                        warn!(task_id = %task_id, error = %e, "vsock read failed");
                        break RelayOutcome::Disconnected;
                    }
                },
            }
        };

        // Unblock the writer, then report exactly once.
        let _ = shutdown_tx.send(());
        let _ = outcome_tx.send(outcome).await;
    }

    /// Host → guest loop. Wraps each queued input as one JSON line and
    /// write-alls it, so cancellation can never tear a frame. Emits a
    /// heartbeat line after thirty seconds of input silence.
    async fn writer_loop(
        task_id: Uuid,
        mut writer: OwnedWriteHalf,
        mut input_rx: mpsc::Receiver<String>,
        shutdown_tx: broadcast::Sender<()>,
    ) {
        let mut shutdown_rx = shutdown_tx.subscribe();
        let start = time::Instant::now() + HOST_HEARTBEAT_INTERVAL;
        let mut heartbeat = time::interval_at(start, HOST_HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                maybe_input = input_rx.recv() => match maybe_input {
                    Some(data) => {
                        let Ok(frame) = encode_line(&RelayMessage::Input { data }) else {
                            break;
                        };
                        if Self::write_frame(&mut writer, &frame).await.is_err() {
                            warn!(task_id = %task_id, "vsock write failed");
                            break;
                        }
                        heartbeat.reset();
                    }
                    // All input senders are gone; the session is over.
                    None => break,
                },
                _ = heartbeat.tick() => {
                    let Ok(frame) = encode_line(&RelayMessage::Heartbeat) else {
                        break;
                    };
                    if Self::write_frame(&mut writer, &frame).await.is_err() {
                        break;
                    }
                }
            }
        }

        // Make sure the reader does not outlive the writer.
        let _ = shutdown_tx.send(());
    }

    async fn write_frame(writer: &mut OwnedWriteHalf, frame: &str) -> std::io::Result<()> {
        writer.write_all(frame.as_bytes()).await?;
        writer.flush().await
    }
}
