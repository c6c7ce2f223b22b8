//! Spawns the compiled binary: one broker and two clients wired up over
//! pipes, chatting and moving a real file end to end.

use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{anyhow, Context, Result};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn cli_chat_and_file_transfer_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("chat-courier");

    let (mut broker_child, mut broker_stdout) = spawn_broker(&binary).await?;
    let port = read_broker_port(&mut broker_stdout).await?;

    // Drain further broker logs in the background so the pipe never fills.
    let broker_log_task = tokio::spawn(async move {
        drain_stdout(broker_stdout).await;
    });

    let src_dir = tempfile::tempdir()?;
    let download_dir = tempfile::tempdir()?;
    let src = src_dir.path().join("notes.txt");
    let payload = b"the quick brown fox jumps over the lazy dog\n";
    std::fs::write(&src, payload)?;

    let mut alice = spawn_client(&binary, "alice", port, src_dir.path()).await?;
    let mut bob = spawn_client(&binary, "bob", port, download_dir.path()).await?;

    alice
        .read_until(|line| line == "[bob has joined the chat]")
        .await?;

    // Chat fans out to the other participant only.
    bob.send_line("hello alice").await?;
    alice
        .read_until(|line| line == "[bob] hello alice")
        .await?;
    alice.send_line("/who").await?;
    alice
        .read_until(|line| line == "Online users: alice, bob")
        .await?;

    // Offer, accept, and relay the file; the client appends size and
    // checksum on its own.
    alice
        .send_line(&format!("/sendfile bob {}", src.display()))
        .await?;
    bob.read_until(|line| line.starts_with("[File transfer initiated from alice to bob"))
        .await?;
    bob.send_line("/acceptfile alice").await?;

    alice
        .read_until(|line| line == "[File transfer complete from alice to bob]")
        .await?;
    bob.read_until(|line| line == "[File transfer complete from alice to bob]")
        .await?;

    let received = download_dir.path().join("notes.txt");
    assert_eq!(std::fs::read(&received)?, payload);

    // Departure is announced to the remaining participant.
    alice.send_line("/quit").await?;
    alice.read_until(|line| line == "*** disconnecting").await?;
    bob.read_until(|line| line == "[alice has left the chat]")
        .await?;
    bob.send_line("/quit").await?;
    bob.read_until(|line| line == "*** disconnecting").await?;

    ensure_success(&mut alice.child, "alice client").await?;
    ensure_success(&mut bob.child, "bob client").await?;

    // The broker stays up after clients disconnect; terminate it manually.
    let _ = broker_child.kill().await;
    let _ = broker_child.wait().await;
    let _ = broker_log_task.await;

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

    /// Read stdout lines until one satisfies the predicate, skipping
    /// progress chatter and unrelated broadcasts.
    async fn read_until(&mut self, wanted: impl Fn(&str) -> bool) -> Result<String> {
        for _ in 0..100 {
            match read_line(&mut self.stdout).await? {
                Some(line) if wanted(&line) => return Ok(line),
                Some(_) => continue,
                None => return Err(anyhow!("stdout closed while waiting for a line")),
            }
        }
        Err(anyhow!("expected line never arrived"))
    }
}

async fn spawn_broker(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("broker")
        .arg("0")
        .env("RUST_LOG_STYLE", "never")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn broker")?;
    let stdout = child
        .stdout
        .take()
        .context("broker stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_broker_port(reader: &mut BufReader<ChildStdout>) -> Result<u16> {
    let line = read_line(reader)
        .await?
        .context("broker did not emit a listening address")?;
    let addr = line
        .split_whitespace()
        .last()
        .context("unexpected broker banner format")?;
    let (_, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("broker banner missing socket: {line}"))?;
    port.parse().context("unparsable broker port")
}

async fn spawn_client(
    binary: &Path,
    username: &str,
    port: u16,
    download_dir: &Path,
) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("127.0.0.1")
        .arg(username)
        .arg("--port")
        .arg(port.to_string())
        .arg("--download-dir")
        .arg(download_dir)
        .env("RUST_LOG", "warn")
        .env("RUST_LOG_STYLE", "never")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn client {username}"))?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    let mut process = ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    };

    let banner = format!("*** connected to 127.0.0.1:{port} as {username}");
    process.read_until(|line| line == banner).await?;

    Ok(process)
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let read_future = reader.read_line(&mut line);
    let byte_count = match timeout(READ_TIMEOUT, read_future).await {
        Ok(result) => result?,
        Err(_) => return Err(anyhow!("timed out waiting for a line")),
    };
    if byte_count == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
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
    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
