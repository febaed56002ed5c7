use std::{
    net::SocketAddr,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::{
    fs,
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::protocol::{
    read_transfer_header, write_transfer_header, TransferCommand, TransferStatus, BLOCK_SIZE,
};

/// How long one accept call may block before the shutdown flag is re-checked.
const DEFAULT_ACCEPT_WAIT: Duration = Duration::from_secs(10);

/// A received body whose byte count disagrees with the declared length.
/// The partial file has already been deleted by the time this surfaces.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("received {actual} of {declared} bytes for '{path}'")]
pub struct SizeMismatch {
    pub path: String,
    pub declared: u64,
    pub actual: u64,
}

/// Per-client listener for inbound transfer connections.
///
/// Each accepted connection carries exactly one command, one status, and at
/// most one file body, then closes. There is no multiplexing and no
/// cancellation of a transfer in flight; the shutdown flag is only consulted
/// between accepts.
pub struct TransferEndpoint {
    listener: TcpListener,
    local_name: String,
    shutdown: Arc<AtomicBool>,
    accept_wait: Duration,
}

impl TransferEndpoint {
    pub async fn bind(
        addr: SocketAddr,
        local_name: String,
        shutdown: Arc<AtomicBool>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            local_name,
            shutdown,
            accept_wait: DEFAULT_ACCEPT_WAIT,
        })
    }

    /// Overrides the bounded accept wait. A shorter wait makes the endpoint
    /// notice the shutdown flag sooner.
    pub fn accept_wait(mut self, wait: Duration) -> Self {
        self.accept_wait = wait;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop: bounded waits so the shutdown flag is observed even when
    /// nobody connects, one spawned handler per accepted connection.
    pub async fn run(self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            let (stream, peer) = match timeout(self.accept_wait, self.listener.accept()).await {
                Err(_) => continue,
                Ok(Err(err)) => {
                    warn!(error = ?err, "failed to accept transfer connection");
                    continue;
                }
                Ok(Ok(accepted)) => accepted,
            };

            let local_name = self.local_name.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_transfer(stream, &local_name).await {
                    warn!(peer = %peer, error = ?err, "transfer connection failed");
                }
            });
        }
        debug!(name = %self.local_name, "transfer endpoint stopped");
    }
}

/// Services one accepted transfer connection: read the single command
/// header, then transmit or receive one file.
async fn handle_transfer(mut stream: TcpStream, local_name: &str) -> Result<()> {
    let header = read_transfer_header(&mut stream)
        .await
        .context("failed to read transfer command")?;

    match TransferCommand::parse(&header)? {
        TransferCommand::Transmit { path } => transmit_file(&mut stream, local_name, &path).await,
        TransferCommand::Receive { .. } => receive_file(&mut stream, local_name).await,
    }
}

/// Answers a transmit command: `n:` when the path is not a readable regular
/// file, otherwise `l:` with the length followed by the whole body in fixed
/// chunks.
pub async fn transmit_file<W>(conn: &mut W, local_name: &str, path: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut file = match open_regular_file(path).await {
        Some(file) => file,
        None => {
            info!(%path, "requested file is missing or not readable");
            let status = TransferStatus::NotFound {
                owner: local_name.to_string(),
                path: path.to_string(),
            };
            write_transfer_header(conn, &status.to_string()).await?;
            return Ok(());
        }
    };

    let length = file
        .metadata()
        .await
        .with_context(|| format!("failed to stat '{path}'"))?
        .len();
    let status = TransferStatus::Found {
        owner: local_name.to_string(),
        path: path.to_string(),
        length,
    };
    write_transfer_header(conn, &status.to_string()).await?;

    let mut buffer = [0u8; BLOCK_SIZE];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .with_context(|| format!("failed reading '{path}'"))?;
        if read == 0 {
            break;
        }
        conn.write_all(&buffer[..read])
            .await
            .context("failed streaming file body")?;
    }
    conn.flush().await.context("failed flushing file body")?;

    debug!(%path, length, "transmitted file");
    Ok(())
}

async fn open_regular_file(path: &str) -> Option<fs::File> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() => fs::File::open(path).await.ok(),
        _ => None,
    }
}

/// Handles a receive command: reads the status header, then writes the body
/// to the path the status names.
///
/// Guards: a status claiming this client as owner is refused (self-echo),
/// and a destination that is a directory is rejected before any write. An
/// existing destination file is deleted first. When the stream ends short of
/// the declared length the partial file is deleted and the mismatch reported.
pub async fn receive_file<R>(conn: &mut R, local_name: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let header = read_transfer_header(conn)
        .await
        .context("failed to read transfer status")?;

    let (owner, path, declared) = match TransferStatus::parse(&header)? {
        TransferStatus::NotFound { owner, path } => {
            warn!(%owner, %path, "remote file not found");
            return Ok(());
        }
        TransferStatus::Found {
            owner,
            path,
            length,
        } => (owner, path, length),
    };

    if owner == local_name {
        warn!(%path, "refusing a file that claims this client as its owner");
        return Ok(());
    }

    let destination = Path::new(&path);
    match fs::metadata(destination).await {
        Ok(meta) if meta.is_dir() => {
            warn!(%path, "destination is a directory, refusing to write");
            return Ok(());
        }
        Ok(_) => {
            fs::remove_file(destination)
                .await
                .with_context(|| format!("failed to replace existing '{path}'"))?;
        }
        Err(_) => {}
    }

    let mut file = fs::File::create(destination)
        .await
        .with_context(|| format!("failed to create '{path}'"))?;

    let written = match copy_stream_to_file(conn, &mut file).await {
        Ok(written) => written,
        Err(err) => {
            drop(file);
            let _ = fs::remove_file(destination).await;
            return Err(err).with_context(|| format!("failed receiving body of '{path}'"));
        }
    };

    if written != declared {
        drop(file);
        let _ = fs::remove_file(destination).await;
        return Err(SizeMismatch {
            path,
            declared,
            actual: written,
        }
        .into());
    }

    info!(%path, bytes = written, "received file");
    Ok(())
}

/// Streams until the connection closes, returning the byte count. The
/// declared/actual comparison happens in the caller once the stream ends.
async fn copy_stream_to_file<R>(conn: &mut R, file: &mut fs::File) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; BLOCK_SIZE];
    let mut total = 0u64;
    loop {
        let read = conn.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read]).await?;
        total += read as u64;
    }
    file.flush().await?;
    Ok(total)
}
