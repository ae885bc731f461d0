//! NDJSON-framed channel over a child process's stdin/stdout (or any pair of
//! async read/write halves, which keeps this testable without spawning a
//! real process).

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::Mutex;

use crate::errors::{PoolError, PoolResult};

use super::message::Envelope;

/// One direction of framed communication: `R` is a `tokio::io::AsyncBufRead`
/// line stream, `W` an `AsyncWrite` half. The supervisor holds one
/// `IpcChannel<ChildStdout, ChildStdin>` per worker; the worker binary holds
/// the mirror image over its own stdin/stdout.
pub struct IpcChannel<R, W> {
    reader: Mutex<Lines<BufReader<R>>>,
    writer: Mutex<W>,
}

impl<R, W> IpcChannel<R, W>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(BufReader::new(reader).lines()),
            writer: Mutex::new(writer),
        }
    }

    pub async fn send<T: Serialize>(&self, message: T) -> PoolResult<()> {
        let envelope = Envelope::new(message);
        let mut line = serde_json::to_string(&envelope)?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads and decodes the next line. `Ok(None)` means the peer closed the stream.
    pub async fn recv<T: DeserializeOwned>(&self) -> PoolResult<Option<Envelope<T>>> {
        let mut reader = self.reader.lock().await;
        match reader.next_line().await? {
            Some(line) if line.trim().is_empty() => Ok(None),
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }

    /// Reads lines until one decodes to a message for which `matches` returns
    /// true, or `timeout` elapses. Non-matching messages are dropped — the
    /// caller is expected to own the channel for the duration of the wait,
    /// since there is no separate listener registry to park them on.
    pub async fn wait_for<T, F>(&self, timeout: Duration, matches: F) -> PoolResult<Envelope<T>>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        tokio::time::timeout(timeout, async {
            loop {
                match self.recv::<T>().await? {
                    Some(envelope) if matches(&envelope.message) => return Ok(envelope),
                    Some(_) => continue,
                    None => {
                        return Err(PoolError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "channel closed while waiting for message",
                        )))
                    }
                }
            }
        })
        .await
        .map_err(|_| PoolError::RequestTimeout("wait_for".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::{RequestKind, ToSupervisor, ToWorker, WorkerRequest};
    use tokio::io::duplex;

    #[tokio::test]
    async fn send_then_recv_round_trips() {
        let (a, b) = duplex(4096);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let left = IpcChannel::new(a_read, a_write);
        let right = IpcChannel::new(b_read, b_write);

        left.send(ToWorker::Request {
            request: WorkerRequest {
                request_id: "r-1".to_string(),
                user_id: "user-a".to_string(),
                kind: RequestKind::AgentMessage,
                payload: serde_json::json!({"text": "hi"}),
                timeout_ms: None,
            },
        })
        .await
        .unwrap();

        let received = right.recv::<ToWorker>().await.unwrap().unwrap();
        match received.message {
            ToWorker::Request { request } => assert_eq!(request.request_id, "r-1"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_for_skips_non_matching_messages() {
        let (a, b) = duplex(4096);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let left = IpcChannel::new(a_read, a_write);
        let right = IpcChannel::new(b_read, b_write);

        left.send(ToSupervisor::Ready {
            worker_id: "worker-0".to_string(),
        })
        .await
        .unwrap();
        left.send(ToSupervisor::Heartbeat {
            worker_id: "worker-0".to_string(),
            health: crate::ipc::message::PartialHealth {
                state: crate::ipc::message::WorkerState::Ready,
                active_requests: 0,
                memory_bytes: 0,
                requests_processed: 0,
            },
        })
        .await
        .unwrap();

        let envelope = right
            .wait_for::<ToSupervisor, _>(Duration::from_millis(500), |m| {
                matches!(m, ToSupervisor::Heartbeat { .. })
            })
            .await
            .unwrap();
        assert!(matches!(envelope.message, ToSupervisor::Heartbeat { .. }));
    }

    #[tokio::test]
    async fn wait_for_times_out_when_nothing_matches() {
        let (a, b) = duplex(4096);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let left = IpcChannel::new(a_read, a_write);
        let right = IpcChannel::new(b_read, b_write);

        left.send(ToSupervisor::Ready {
            worker_id: "worker-0".to_string(),
        })
        .await
        .unwrap();

        let result = right
            .wait_for::<ToSupervisor, _>(Duration::from_millis(50), |m| {
                matches!(m, ToSupervisor::Error { .. })
            })
            .await;
        assert!(matches!(result, Err(PoolError::RequestTimeout(_))));
    }
}
