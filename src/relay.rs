use std::io;

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, info, warn};

use crate::{
    protocol::{
        read_transfer_header, write_transfer_header, TransferCommand, TransferStatus, BLOCK_SIZE,
    },
    registry::Session,
};

/// One file movement, consumed entirely by a single relay task.
#[derive(Debug)]
pub struct TransferRequest {
    pub requestor: Session,
    pub owner: Session,
    pub path: String,
}

/// Bridges the owner's and requestor's transfer endpoints for one file.
///
/// Opens an outbound connection to each endpoint, tells the owner to
/// transmit and the requestor to receive, forwards the owner's status header
/// verbatim, then pipes the body through in fixed chunks. Either endpoint
/// being unreachable aborts the whole relay; the clients get no error frame,
/// only this task's log line. Both connections drop when the task finishes,
/// success or not.
pub async fn run(request: TransferRequest) -> Result<()> {
    let TransferRequest {
        requestor,
        owner,
        path,
    } = request;

    let mut owner_conn = TcpStream::connect(owner.transfer_addr())
        .await
        .with_context(|| format!("failed to reach owner '{}' at {}", owner.name, owner.transfer_addr()))?;
    let mut requestor_conn = TcpStream::connect(requestor.transfer_addr())
        .await
        .with_context(|| {
            format!(
                "failed to reach requestor '{}' at {}",
                requestor.name,
                requestor.transfer_addr()
            )
        })?;

    let transmit = TransferCommand::Transmit { path: path.clone() };
    write_transfer_header(&mut owner_conn, &transmit.to_string())
        .await
        .context("failed to send transmit command to owner")?;

    let receive = TransferCommand::Receive { path: path.clone() };
    write_transfer_header(&mut requestor_conn, &receive.to_string())
        .await
        .context("failed to send receive command to requestor")?;

    let status_header = read_transfer_header(&mut owner_conn)
        .await
        .context("owner closed before sending a status")?;

    // The status must reach the requestor before any body byte, unmodified.
    write_transfer_header(&mut requestor_conn, &status_header)
        .await
        .context("failed to forward status to requestor")?;

    match TransferStatus::parse(&status_header)? {
        TransferStatus::NotFound { owner, path } => {
            info!(%owner, %path, "owner reported file not found");
        }
        TransferStatus::Found { length, .. } => {
            let relayed = copy_body(&mut owner_conn, &mut requestor_conn)
                .await
                .context("relay stream failed mid-transfer")?;
            if relayed == length {
                debug!(%path, bytes = relayed, "relay complete");
            } else {
                // The receiving endpoint owns repair; it compares its own
                // count and deletes the mismatched file.
                warn!(%path, declared = length, relayed, "relayed byte count does not match the declared length");
            }
        }
    }

    Ok(())
}

/// Copies bytes until the source closes, in `BLOCK_SIZE` chunks, returning
/// the running total.
async fn copy_body<R, W>(src: &mut R, dst: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = [0u8; BLOCK_SIZE];
    let mut total = 0u64;
    loop {
        let read = src.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        dst.write_all(&buffer[..read]).await?;
        total += read as u64;
    }
    dst.flush().await?;
    Ok(total)
}
