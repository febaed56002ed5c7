use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    protocol::{write_control_frame, ControlFrame, ControlLines, TransferMode},
    registry::{DuplicateName, SessionRegistry},
    relay::{self, TransferRequest},
};

pub struct ChatServer {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
}

impl ChatServer {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared handle to the session registry, usable while the server runs.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let ChatServer { listener, registry } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("chat server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<SessionRegistry>,
) {
    match result {
        Ok((stream, peer)) => spawn_client_handler(stream, peer, registry),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_client_handler(stream: TcpStream, peer: SocketAddr, registry: &Arc<SessionRegistry>) {
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, registry).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

/// Drives one control connection: AwaitingIntro, then the Active dispatch
/// loop, then cleanup. The session is unregistered on any exit path, so a
/// peer that vanishes without an `x` frame still leaves the registry.
async fn handle_connection(stream: TcpStream, registry: Arc<SessionRegistry>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();
    let mut lines = ControlLines::new(BufReader::new(reader));

    let Some((name, host, port)) = await_intro(&mut lines).await? else {
        debug!(?peer, "connection closed before introducing itself");
        return Ok(());
    };

    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();
    if let Err(DuplicateName(taken)) = registry.register(&name, &host, port, outbox_tx).await {
        warn!(?peer, name = %taken, "rejecting duplicate registration");
        return Ok(());
    }

    info!(?peer, name = %name, "client joined");
    let result = run_session(&registry, &mut lines, &mut writer, &mut outbox_rx, &name).await;

    if registry.unregister(&name).await.is_some() {
        info!(?peer, name = %name, "client disconnected");
    }
    result
}

/// Reads the first frame, which must be an intro.
///
/// `Ok(None)` means the peer closed before sending one; any other first
/// frame is an error that closes the connection.
async fn await_intro<R>(lines: &mut ControlLines<R>) -> Result<Option<(String, String, u16)>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(line) = lines.next().await? else {
        return Ok(None);
    };

    match ControlFrame::parse(&line) {
        Ok(ControlFrame::Intro { name, host, port }) => Ok(Some((name, host, port))),
        Ok(other) => anyhow::bail!("expected an intro frame, got {other}"),
        Err(err) => anyhow::bail!("malformed intro frame: {err}"),
    }
}

/// The Active state: multiplexes inbound frames with the session's outbound
/// queue until the peer exits or the connection fails. The line source lives
/// across iterations, so a line that has only partially arrived when the
/// outbox branch wins is picked up where it left off.
async fn run_session<R, W>(
    registry: &Arc<SessionRegistry>,
    lines: &mut ControlLines<R>,
    writer: &mut W,
    outbox: &mut mpsc::UnboundedReceiver<ControlFrame>,
    session_name: &str,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        select! {
            line = lines.next() => {
                match line? {
                    Some(line) => {
                        if !dispatch_frame(registry, writer, session_name, &line).await? {
                            break;
                        }
                    }
                    None => break,
                }
            }
            frame = outbox.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(err) = write_control_frame(writer, &frame).await {
                            debug!(error = ?err, "failed to deliver frame to client");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    Ok(())
}

/// Routes one decoded control frame. Returns `Ok(false)` when the session
/// should close.
///
/// Malformed frames and frames naming an unregistered sender are logged and
/// dropped; neither closes the connection.
async fn dispatch_frame<W>(
    registry: &Arc<SessionRegistry>,
    writer: &mut W,
    session_name: &str,
    line: &str,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let frame = match ControlFrame::parse(line) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(%err, line, "ignoring malformed frame");
            return Ok(true);
        }
    };

    match frame {
        ControlFrame::Intro { name, .. } => {
            debug!(name = %name, "ignoring intro on an active connection");
            Ok(true)
        }
        ControlFrame::Chat { sender, message } => {
            if registry.lookup(&sender).await.is_none() {
                debug!(%sender, "dropping chat from unknown sender");
                return Ok(true);
            }
            broadcast(registry, &sender, &message).await;
            Ok(true)
        }
        ControlFrame::FileRequest {
            sender,
            mode,
            owner,
            path,
        } => {
            handle_file_request(registry, &sender, mode, &owner, path).await;
            Ok(true)
        }
        ControlFrame::Exit { sender } => {
            if sender != session_name {
                debug!(%sender, "dropping exit naming another session");
                return Ok(true);
            }
            // Echo before unregistering so the goodbye reaches the client
            // ahead of the close.
            write_control_frame(writer, &ControlFrame::Exit { sender }).await?;
            registry.unregister(session_name).await;
            Ok(false)
        }
    }
}

/// Sends a chat frame to every registered session except the sender.
///
/// Works over a snapshot, so sessions joining or leaving mid-fan-out are
/// unaffected. A recipient whose queue is gone is skipped; its own
/// connection's failure path removes it from the registry.
async fn broadcast(registry: &SessionRegistry, sender: &str, message: &str) {
    for session in registry.snapshot().await {
        if session.name == sender {
            continue;
        }
        let delivered = session.send(ControlFrame::Chat {
            sender: sender.to_string(),
            message: message.to_string(),
        });
        if !delivered {
            debug!(recipient = %session.name, "skipping recipient with a closed queue");
        }
    }
}

/// Resolves a file request and spawns one relay task for it.
///
/// An unregistered sender or owner drops the request with only a log line;
/// the control protocol has no error opcode to answer with.
async fn handle_file_request(
    registry: &Arc<SessionRegistry>,
    sender: &str,
    mode: TransferMode,
    owner: &str,
    path: String,
) {
    let Some(requestor) = registry.lookup(sender).await else {
        debug!(%sender, "dropping file request from unknown sender");
        return;
    };
    if mode != TransferMode::Relay {
        warn!(?mode, %sender, "dropping file request with unimplemented mode");
        return;
    }
    let Some(owner_session) = registry.lookup(owner).await else {
        warn!(%owner, %sender, "dropping file request for unknown owner");
        return;
    };

    let request = TransferRequest {
        requestor,
        owner: owner_session,
        path,
    };
    tokio::spawn(async move {
        if let Err(err) = relay::run(request).await {
            warn!(error = ?err, "file relay failed");
        }
    });
}
