//! Remote agent sessions over an SSH shell channel.
//!
//! The channel behaves like a login shell: the first write is the composed
//! command line (`source ~/.bashrc; cd <dir>; ENV=… claude …`), everything
//! after that is forwarded byte for byte.

use russh::ChannelMsg;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{EVENT_CHANNEL_SIZE, ManagedProcess, WRITE_CHANNEL_SIZE, WriteRequest};
use crate::core::{ExitKind, ProcessEvent};
use crate::tunnel::RemoteShell;

/// A remote agent running in an SSH shell channel.
pub struct RemoteProcess {
    write_tx: mpsc::Sender<WriteRequest>,
    cancel: CancellationToken,
}

/// Attach to a shell channel and launch the agent with the given command
/// line.
pub(crate) async fn attach(
    mut shell: RemoteShell,
    command_line: String,
) -> anyhow::Result<(RemoteProcess, mpsc::Receiver<ProcessEvent>)> {
    shell.write(command_line.as_bytes()).await?;
    shell.write(b"\n").await?;

    let (write_tx, write_rx) = mpsc::channel(WRITE_CHANNEL_SIZE);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            pump_loop(shell, write_rx, event_tx, cancel).await;
        });
    }

    Ok((RemoteProcess { write_tx, cancel }, event_rx))
}

/// Single task owning the channel: forwards write requests out and channel
/// messages in.
async fn pump_loop(
    mut shell: RemoteShell,
    mut write_rx: mpsc::Receiver<WriteRequest>,
    event_tx: mpsc::Sender<ProcessEvent>,
    cancel: CancellationToken,
) {
    let mut exit_status: Option<u32> = None;
    let mut killed = false;

    loop {
        tokio::select! {
            request = write_rx.recv() => {
                match request {
                    Some(WriteRequest::Bytes(bytes)) => {
                        if shell.write(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(WriteRequest::Resize { cols, rows }) => {
                        if shell.resize(cols, rows).await.is_err() {
                            break;
                        }
                    }
                    Some(WriteRequest::Kill) => {
                        killed = true;
                        shell.close().await;
                    }
                    None => break,
                }
            }
            msg = shell.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if event_tx.send(ProcessEvent::Data(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, .. }) => {
                        if event_tx.send(ProcessEvent::Data(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status: code }) => {
                        exit_status = Some(code);
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
            () = cancel.cancelled() => {
                killed = true;
                shell.close().await;
                break;
            }
        }
    }

    let kind = if killed {
        ExitKind::Killed
    } else if let Some(code) = exit_status {
        ExitKind::Exited(i32::try_from(code).ok())
    } else {
        // Channel dropped without reporting an exit status: the transport
        // under it went away.
        let _ = event_tx.send(ProcessEvent::ConnectionLost).await;
        ExitKind::TransportLost
    };
    let _ = event_tx.send(ProcessEvent::Exit(kind)).await;
}

#[async_trait::async_trait]
impl ManagedProcess for RemoteProcess {
    async fn write(&self, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.write_tx
            .send(WriteRequest::Bytes(bytes))
            .await
            .map_err(|_| anyhow::anyhow!("remote shell channel closed"))
    }

    async fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        self.write_tx
            .send(WriteRequest::Resize { cols, rows })
            .await
            .map_err(|_| anyhow::anyhow!("remote shell channel closed"))
    }

    async fn kill(&self) -> anyhow::Result<()> {
        // Closing the channel ends the remote login shell and everything
        // under it; the pump reports the exit as killed.
        if self.write_tx.send(WriteRequest::Kill).await.is_err() {
            self.cancel.cancel();
        }
        Ok(())
    }

    fn pid(&self) -> Option<i32> {
        None
    }
}

impl Drop for RemoteProcess {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
