use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{anyhow, Context, Result};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(20);

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("secure-relay");

    let (mut relay_child, mut relay_log) = spawn_relay(&binary).await?;
    let addr = read_relay_addr(&mut relay_log).await?;

    let mut alice = spawn_client(&binary, "alice", &addr).await?;
    wait_for_log(&mut relay_log, "nickname=alice").await?;
    let mut bob = spawn_client(&binary, "bob", &addr).await?;
    wait_for_log(&mut relay_log, "nickname=bob").await?;

    // Drain further relay logs in the background so the pipe never fills.
    let relay_log_task = tokio::spawn(async move {
        drain_lines(relay_log).await;
    });

    let alice_sees_bob = read_line_expect(&mut alice.stdout, "waiting for alice join notice").await?;
    assert_eq!(alice_sees_bob, "SERVER: bob joined the chat");

    // Chat lines reach the other participant only; there is no self-echo.
    alice.send_line("Hello from Alice").await.context("alice send line")?;
    let bob_hears_alice = read_line_expect(&mut bob.stdout, "waiting for bob to hear alice").await?;
    assert_eq!(bob_hears_alice, "alice: Hello from Alice");

    bob.send_line("Hi Alice!").await.context("bob send line")?;
    let alice_hears_bob = read_line_expect(&mut alice.stdout, "waiting for alice to hear bob").await?;
    assert_eq!(alice_hears_bob, "bob: Hi Alice!");

    // Bob asks the relay to end his session and is told goodbye before the stream closes.
    bob.send_line("/quit").await.context("bob send quit")?;
    let bob_farewell = read_line_expect(&mut bob.stdout, "waiting for bob farewell").await?;
    assert_eq!(bob_farewell, "SERVER: Goodbye");
    let bob_closed = read_line_expect(&mut bob.stdout, "waiting for bob disconnect").await?;
    assert_eq!(bob_closed, "*** disconnected from relay");
    let alice_sees_departure =
        read_line_expect(&mut alice.stdout, "waiting for alice to see bob leave").await?;
    assert_eq!(alice_sees_departure, "SERVER: bob left the chat");

    // Alice leaves from her own side.
    alice.send_line("Bye").await.context("alice send bye")?;
    let alice_quit = read_line_expect(&mut alice.stdout, "waiting for alice quit confirmation").await?;
    assert_eq!(alice_quit, "*** leaving chat");

    ensure_success(&mut alice.child, "alice client").await?;
    ensure_success(&mut bob.child, "bob client").await?;

    // The relay stays up after clients disconnect; terminate it manually.
    let _ = relay_child.kill().await;
    let _ = relay_child.wait().await;
    let _ = relay_log_task.await;

    Ok(())
}

#[tokio::test]
async fn generated_key_is_accepted_by_the_relay() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("secure-relay");
    let dir = tempfile::tempdir()?;
    let key_path = dir.path().join("relay.key");

    let status = timeout(
        READ_TIMEOUT,
        Command::new(&binary)
            .arg("keygen")
            .arg("--rsa-bits")
            .arg("1024")
            .arg("--output")
            .arg(&key_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status(),
    )
    .await
    .context("keygen timed out")??;
    assert!(status.success(), "keygen exited with {status}");

    let config = secure_relay::config::RelayConfig::load(&key_path)?;
    assert_eq!(config.keypair().bits(), 1024);

    let mut cmd = Command::new(&binary);
    cmd.arg("server")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .arg("--private-key")
        .arg(&key_path)
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut relay_child = cmd.spawn().context("failed to spawn relay")?;
    let mut relay_log = BufReader::new(
        relay_child
            .stderr
            .take()
            .context("relay stderr missing after spawn")?,
    );

    wait_for_log(&mut relay_log, "loaded RSA keypair").await?;
    read_relay_addr(&mut relay_log).await?;

    let _ = relay_child.kill().await;
    let _ = relay_child.wait().await;
    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

async fn spawn_relay(binary: &Path) -> Result<(Child, BufReader<ChildStderr>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("server")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .arg("--rsa-bits")
        .arg("1024")
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn relay")?;
    let stderr = child
        .stderr
        .take()
        .context("relay stderr missing after spawn")?;

    Ok((child, BufReader::new(stderr)))
}

async fn read_relay_addr(reader: &mut BufReader<ChildStderr>) -> Result<String> {
    let line = wait_for_log(reader, "relay listening on").await?;
    let addr = line
        .split_whitespace()
        .last()
        .context("unexpected relay banner format")?;
    if !addr.contains(':') {
        return Err(anyhow!("relay banner missing socket: {line}"));
    }
    Ok(addr.to_string())
}

/// Reads relay log lines until one contains `needle`.
async fn wait_for_log(reader: &mut BufReader<ChildStderr>, needle: &str) -> Result<String> {
    loop {
        match read_line(reader).await? {
            Some(line) if line.contains(needle) => return Ok(line),
            Some(_) => continue,
            None => return Err(anyhow!("relay log ended before '{needle}'")),
        }
    }
}

async fn spawn_client(binary: &Path, nickname: &str, addr: &str) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--nickname")
        .arg(nickname)
        .arg("--server")
        .arg(addr)
        .env("RUST_LOG", "warn")
        .env("NO_COLOR", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn client {nickname}"))?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    Ok(ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    })
}

async fn read_line_expect<R>(reader: &mut BufReader<R>, description: &str) -> Result<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("{description}: stream closed")),
        Err(err) => Err(err.context(format!("{description}: failed to read line"))),
    }
}

async fn read_line<R>(reader: &mut BufReader<R>) -> Result<Option<String>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    let read_future = reader.read_line(&mut line);
    let bytes_io = match timeout(READ_TIMEOUT, read_future).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    let byte_count = bytes_io?;
    if byte_count == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_lines(mut reader: BufReader<ChildStderr>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| {
            let has_data = bytes > 0;
            if has_data {
                buffer.clear();
            }
            has_data
        })
        .unwrap_or(false)
    {}
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = timeout(READ_TIMEOUT, child.wait())
        .await
        .with_context(|| format!("{name} did not exit"))?
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
