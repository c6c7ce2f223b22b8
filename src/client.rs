//! Interactive client: control-channel loop plus transfer bookkeeping.
//!
//! Two concerns share one select loop: every line from the broker is
//! printed and fed to the notification tracker, and every line of local
//! input is forwarded to the broker. `/sendfile` is validated locally
//! first (the file must exist and be regular; its size in KB and MD5
//! digest are appended to the command), and `/canceltransfer` also
//! cancels locally running transfer agents. When a broadcast shows this
//! client is party to a started transfer, the matching agent is launched
//! against the announced relay port.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::agent;
use crate::checksum;
use crate::cli::ClientArgs;
use crate::event::ServerEvent;

pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect((args.hostname.as_str(), args.port))
        .await
        .with_context(|| format!("failed to connect to {}:{}", args.hostname, args.port))?;
    let relay_host = stream.peer_addr()?.ip();
    let (reader, mut writer) = stream.into_split();

    send_line(&mut writer, &args.username).await?;
    write_stdout(&format!(
        "*** connected to {}:{} as {}",
        args.hostname, args.port, args.username
    ))
    .await?;

    let mut controller = Controller::new(args.username, relay_host, args.download_dir);

    // One pump task per source; channel recv is cancel-safe, so no line
    // is ever half-read when the other arm of the select fires.
    let (server_tx, mut server_rx) = mpsc::unbounded_channel::<String>();
    let reader_task = tokio::spawn(pump_server_lines(reader, server_tx));
    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<String>();
    let input_task = tokio::spawn(pump_stdin_lines(input_tx));

    loop {
        select! {
            line = server_rx.recv() => match line {
                Some(line) => {
                    write_stdout(&line).await?;
                    controller.observe(&line);
                }
                None => {
                    write_stdout("*** server closed the connection").await?;
                    break;
                }
            },
            line = input_rx.recv() => match line {
                Some(line) => {
                    if !controller.handle_input(line.trim_end(), &mut writer).await? {
                        break;
                    }
                }
                None => break,
            },
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    reader_task.abort();
    input_task.abort();
    controller.cancel_agents();
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
    Ok(())
}

async fn pump_server_lines(reader: OwnedReadHalf, lines: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
                if lines.send(trimmed).is_err() {
                    break;
                }
            }
        }
    }
}

async fn pump_stdin_lines(lines: mpsc::UnboundedSender<String>) {
    let mut stdin = BufReader::new(io::stdin());
    let mut line = String::new();
    loop {
        line.clear();
        match stdin.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if lines.send(line.clone()).is_err() {
                    break;
                }
            }
        }
    }
}

struct OutgoingOffer {
    path: PathBuf,
    checksum: String,
}

struct IncomingOffer {
    filename: String,
}

struct Controller {
    username: String,
    relay_host: IpAddr,
    download_dir: PathBuf,
    /// Offers this client made, keyed by recipient.
    outgoing: HashMap<String, OutgoingOffer>,
    /// Offers made to this client, keyed by sender.
    incoming: HashMap<String, IncomingOffer>,
    agents: Vec<(JoinHandle<()>, watch::Sender<bool>)>,
}

impl Controller {
    fn new(username: String, relay_host: IpAddr, download_dir: PathBuf) -> Self {
        Self {
            username,
            relay_host,
            download_dir,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            agents: Vec::new(),
        }
    }

    /// Track transfer lifecycle notifications addressed to this client.
    /// Lines that parse to no known event are plain chat traffic.
    fn observe(&mut self, line: &str) {
        let Some(event) = ServerEvent::parse(line) else {
            return;
        };
        match event {
            ServerEvent::TransferInitiated {
                sender,
                recipient,
                filename,
                ..
            } if recipient == self.username => {
                self.incoming.insert(sender, IncomingOffer { filename });
            }
            ServerEvent::TransferStarted {
                sender,
                recipient,
                port,
            } => {
                let addr = SocketAddr::new(self.relay_host, port);
                if sender == self.username {
                    if let Some(offer) = self.outgoing.get(&recipient) {
                        self.spawn_sender(addr, offer.path.clone(), offer.checksum.clone());
                    }
                }
                if recipient == self.username {
                    if let Some(offer) = self.incoming.get(&sender) {
                        debug!(file = %offer.filename, %sender, "launching receive agent");
                        self.spawn_receiver(addr);
                    }
                }
            }
            ServerEvent::TransferComplete { sender, recipient }
            | ServerEvent::TransferFailed {
                sender, recipient, ..
            }
            | ServerEvent::TransferRejected { sender, recipient }
            | ServerEvent::TransferCancelled { sender, recipient } => {
                if sender == self.username {
                    self.outgoing.remove(&recipient);
                }
                if recipient == self.username {
                    self.incoming.remove(&sender);
                }
                self.agents.retain(|(handle, _)| !handle.is_finished());
            }
            _ => {}
        }
    }

    /// Forward local input to the broker; returns false when the session
    /// should end.
    async fn handle_input(&mut self, text: &str, writer: &mut OwnedWriteHalf) -> Result<bool> {
        if text.is_empty() {
            return Ok(true);
        }

        let first_word = text.split_whitespace().next().unwrap_or_default();
        match first_word {
            "/sendfile" => {
                if let Some(line) = self.prepare_sendfile(text).await {
                    send_line(writer, &line).await?;
                }
                Ok(true)
            }
            "/canceltransfer" => {
                self.cancel_agents();
                send_line(writer, text).await?;
                Ok(true)
            }
            "/quit" => {
                send_line(writer, text).await?;
                write_stdout("*** disconnecting").await?;
                Ok(false)
            }
            _ => {
                send_line(writer, text).await?;
                Ok(true)
            }
        }
    }

    /// Validate a `/sendfile` locally and append the size (KB) and MD5
    /// digest the broker expects. Returns `None` when the command should
    /// not be sent.
    async fn prepare_sendfile(&mut self, text: &str) -> Option<String> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.len() < 3 {
            let _ = write_stderr("!!! usage: /sendfile <recipient> <filename>").await;
            return None;
        }
        let recipient = tokens[1];
        let filename = tokens[2];
        let path = PathBuf::from(filename);

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => {
                let _ = write_stderr(&format!("!!! {filename} is not a readable file")).await;
                return None;
            }
        };

        let size_kb = metadata.len().div_ceil(1024);
        let digest = match checksum::md5_hex(&path).await {
            Ok(digest) => digest,
            Err(err) => {
                let _ = write_stderr(&format!("!!! failed to checksum {filename}: {err}")).await;
                return None;
            }
        };

        self.outgoing.insert(
            recipient.to_string(),
            OutgoingOffer {
                path,
                checksum: digest.clone(),
            },
        );
        Some(format!("/sendfile {recipient} {filename} {size_kb} {digest}"))
    }

    fn spawn_sender(&mut self, addr: SocketAddr, path: PathBuf, checksum: String) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            if let Err(err) = agent::send_file(addr, &path, &checksum, cancel_rx).await {
                let _ = write_stderr(&format!("!!! {err:#}")).await;
            }
        });
        self.agents.push((handle, cancel_tx));
    }

    fn spawn_receiver(&mut self, addr: SocketAddr) {
        let download_dir = self.download_dir.clone();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            if let Err(err) = agent::receive_file(addr, &download_dir, cancel_rx).await {
                let _ = write_stderr(&format!("!!! {err:#}")).await;
            }
        });
        self.agents.push((handle, cancel_tx));
    }

    fn cancel_agents(&mut self) {
        for (_, cancel) in &self.agents {
            let _ = cancel.send(true);
        }
        self.agents.clear();
    }
}

async fn send_line(writer: &mut OwnedWriteHalf, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
