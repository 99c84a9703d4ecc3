use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    select,
    task::{JoinError, JoinHandle},
};
use tracing::{info, warn};

use crate::{cli::ClientArgs, crypto::SessionKey, handshake, protocol::ClientInput, transport};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    let session_key = handshake::initiate(&mut reader, &mut writer, &args.nickname, args.key_bits)
        .await
        .context("handshake with relay failed")?;
    info!(server = %args.server, nickname = %args.nickname, bits = session_key.bits(), "session established");

    // Relay lines are read on their own task so a half-read frame is never
    // abandoned when stdin wins a select.
    let mut listener = tokio::spawn(listen_to_relay(reader, session_key.clone()));

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    let outcome = run_client_loop(&mut listener, &mut writer, &mut stdin, &mut input, &session_key).await;
    shutdown_connection(&mut writer).await;
    listener.abort();

    outcome
}

async fn establish_connection(args: &ClientArgs) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(&args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

/// What the loop should do after handling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// Stop reading stdin but keep printing until the relay hangs up.
    Drain,
    Stop,
}

async fn run_client_loop(
    listener: &mut JoinHandle<Result<()>>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    session_key: &SessionKey,
) -> Result<()> {
    let mut reading_stdin = true;
    loop {
        input.clear();
        let flow = select! {
            finished = &mut *listener => {
                return handle_listener_exit(finished);
            }
            bytes_read = stdin.read_line(input), if reading_stdin => {
                handle_stdin_input(bytes_read, input, writer, session_key).await?
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                Flow::Stop
            }
        };

        match flow {
            Flow::Continue => {}
            Flow::Drain => reading_stdin = false,
            Flow::Stop => return Ok(()),
        }
    }
}

async fn listen_to_relay(mut reader: BufReader<OwnedReadHalf>, session_key: SessionKey) -> Result<()> {
    loop {
        match transport::receive_encrypted_line(&mut reader, &session_key).await {
            Ok(Some(text)) => write_stdout(&text).await?,
            Ok(None) => {
                write_stdout("*** disconnected from relay").await?;
                return Ok(());
            }
            Err(error) if error.is_line_local() => {
                warn!(%error, "dropping undecryptable line from relay");
            }
            Err(error) => return Err(error).context("lost connection to relay"),
        }
    }
}

fn handle_listener_exit(finished: Result<Result<()>, JoinError>) -> Result<()> {
    finished.context("relay listener task failed")?
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
    session_key: &SessionKey,
) -> Result<Flow> {
    if bytes_read? == 0 {
        return Ok(Flow::Stop);
    }

    match ClientInput::classify(input) {
        ClientInput::Blank => Ok(Flow::Continue),
        ClientInput::Chat(text) => {
            transport::send_encrypted_line(writer, &text, session_key).await?;
            Ok(Flow::Continue)
        }
        ClientInput::Quit(text) => {
            transport::send_encrypted_line(writer, &text, session_key).await?;
            Ok(Flow::Drain)
        }
        ClientInput::Farewell(text) => {
            transport::send_encrypted_line(writer, &text, session_key).await?;
            write_stdout("*** leaving chat").await?;
            Ok(Flow::Stop)
        }
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
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
