use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    endpoint::TransferEndpoint,
    protocol::{write_control_frame, ControlFrame, ControlLines, TransferMode},
};

/// Runs the interactive client: starts the transfer endpoint, introduces
/// itself to the server, then multiplexes stdin commands with server frames.
pub async fn run(args: ClientArgs) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let endpoint = TransferEndpoint::bind(
        args.transfer_listen,
        args.name.clone(),
        Arc::clone(&shutdown),
    )
    .await
    .with_context(|| format!("failed to bind transfer endpoint on {}", args.transfer_listen))?;
    let transfer_addr = endpoint.local_addr()?;
    tokio::spawn(endpoint.run());

    let (mut reader, mut writer) = establish_connection(&args).await?;
    write_control_frame(
        &mut writer,
        &ControlFrame::Intro {
            name: args.name.clone(),
            host: transfer_addr.ip().to_string(),
            port: transfer_addr.port(),
        },
    )
    .await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    run_client_loop(&mut reader, &mut writer, &mut stdin, &args.name).await?;

    shutdown.store(true, Ordering::Relaxed);
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(
    ControlLines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    tokio::net::tcp::OwnedWriteHalf,
)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((ControlLines::new(BufReader::new(reader)), writer))
}

/// Both line sources survive losing a `select!` race: a server frame or a
/// typed command whose bytes have only partially arrived is resumed on the
/// next iteration rather than dropped.
async fn run_client_loop(
    reader: &mut ControlLines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    stdin: &mut io::Lines<BufReader<tokio::io::Stdin>>,
    name: &str,
) -> Result<()> {
    loop {
        select! {
            server_line = reader.next() => {
                if !handle_server_line(server_line, name).await? {
                    break;
                }
            }
            input = stdin.next_line() => {
                if !handle_stdin_input(input, writer, name).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                let _ = write_control_frame(writer, &ControlFrame::Exit {
                    sender: name.to_string(),
                }).await;
                break;
            }
        }
    }
    Ok(())
}

/// Renders one server frame. Returns `Ok(false)` once the session is over,
/// either through the exit echo or the server closing the connection.
async fn handle_server_line(line: io::Result<Option<String>>, name: &str) -> Result<bool> {
    let Some(line) = line? else {
        write_stdout("*** server closed the connection").await?;
        return Ok(false);
    };

    match ControlFrame::parse(&line) {
        Ok(ControlFrame::Chat { sender, message }) => {
            write_stdout(&format!("<{sender}> {message}")).await?;
            Ok(true)
        }
        Ok(ControlFrame::Exit { sender }) if sender == name => {
            write_stdout("*** goodbye").await?;
            Ok(false)
        }
        Ok(other) => {
            warn!(frame = %other, "ignoring unexpected server frame");
            Ok(true)
        }
        Err(err) => {
            warn!(%err, line, "ignoring malformed server frame");
            Ok(true)
        }
    }
}

/// Interprets one line of user input: `/quit` leaves, `/file <owner> <path>`
/// requests a relay, anything else is chat text.
async fn handle_stdin_input(
    input: io::Result<Option<String>>,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    name: &str,
) -> Result<bool> {
    let Some(input) = input? else {
        return Ok(false);
    };

    let text = input.trim();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_control_frame(
            writer,
            &ControlFrame::Exit {
                sender: name.to_string(),
            },
        )
        .await?;
        // Keep reading; the server echoes the exit frame before closing.
        return Ok(true);
    }

    if let Some(rest) = text.strip_prefix("/file ") {
        let mut parts = rest.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(path), None) => {
                write_control_frame(
                    writer,
                    &ControlFrame::FileRequest {
                        sender: name.to_string(),
                        mode: TransferMode::Relay,
                        owner: owner.to_string(),
                        path: path.to_string(),
                    },
                )
                .await?;
            }
            _ => {
                write_stdout("usage: /file <owner> <path>").await?;
            }
        }
        return Ok(true);
    }

    write_control_frame(
        writer,
        &ControlFrame::Chat {
            sender: name.to_string(),
            message: text.to_string(),
        },
    )
    .await?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut tokio::net::tcp::OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
