//! Parsing for client command lines.
//!
//! Anything that does not start with `/` is a chat message. Commands are
//! whitespace-delimited; a recognized command with bad arguments is a
//! parse error (the session replies privately and keeps running), while an
//! unrecognized `/word` is surfaced as [`ClientCommand::Unknown`].

use anyhow::{anyhow, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Chat(String),
    Who,
    Quit,
    SendFile {
        recipient: String,
        filename: String,
        size_kb: u64,
        checksum: Option<String>,
    },
    AcceptFile {
        sender: String,
    },
    RejectFile {
        sender: String,
    },
    CancelTransfer,
    Unknown(String),
}

impl ClientCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('/') {
            return Ok(ClientCommand::Chat(trimmed.to_string()));
        }

        let mut parts = trimmed.split_whitespace();
        let command = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();

        match command {
            "/who" => Ok(ClientCommand::Who),
            "/quit" => Ok(ClientCommand::Quit),
            "/canceltransfer" => Ok(ClientCommand::CancelTransfer),
            "/sendfile" => parse_sendfile(&args),
            "/acceptfile" => match args.first() {
                Some(sender) => Ok(ClientCommand::AcceptFile {
                    sender: sender.to_string(),
                }),
                None => Err(anyhow!("Usage: /acceptfile <sender>")),
            },
            "/rejectfile" => match args.first() {
                Some(sender) => Ok(ClientCommand::RejectFile {
                    sender: sender.to_string(),
                }),
                None => Err(anyhow!("Usage: /rejectfile <sender>")),
            },
            other => Ok(ClientCommand::Unknown(other.to_string())),
        }
    }
}

fn parse_sendfile(args: &[&str]) -> Result<ClientCommand> {
    if args.len() < 2 {
        return Err(anyhow!(
            "Usage: /sendfile <recipient> <filename> [<sizeKB> <checksum>]"
        ));
    }

    let size_kb = match args.get(2) {
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow!("Invalid file size: {raw}"))?,
        None => 0,
    };

    Ok(ClientCommand::SendFile {
        recipient: args[0].to_string(),
        filename: args[1].to_string(),
        size_kb,
        checksum: args.get(3).map(|cs| cs.to_string()),
    })
}
