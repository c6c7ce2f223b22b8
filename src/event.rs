//! Tagged broadcast events and their wire rendering.
//!
//! Every line the broker pushes to clients is constructed from a
//! [`ServerEvent`] and rendered to the legacy human-readable bracketed
//! text; the client parses the same text back into the enum instead of
//! substring-matching at call sites. Lines that match no known shape
//! parse to `None` and are ignored by callers.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Joined {
        username: String,
    },
    Left {
        username: String,
    },
    Chat {
        username: String,
        text: String,
    },
    TransferInitiated {
        sender: String,
        recipient: String,
        filename: String,
        size_kb: u64,
        checksum: Option<String>,
    },
    TransferAccepted {
        sender: String,
        recipient: String,
        filename: String,
        size_kb: u64,
    },
    TransferRejected {
        sender: String,
        recipient: String,
    },
    TransferStarted {
        sender: String,
        recipient: String,
        port: u16,
    },
    TransferProgress {
        sender: String,
        recipient: String,
        percent: u64,
    },
    TransferComplete {
        sender: String,
        recipient: String,
    },
    TransferFailed {
        sender: String,
        recipient: String,
        reason: String,
    },
    TransferCancelled {
        sender: String,
        recipient: String,
    },
    UserList {
        usernames: Vec<String>,
    },
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerEvent::Joined { username } => {
                write!(f, "[{username} has joined the chat]")
            }
            ServerEvent::Left { username } => {
                write!(f, "[{username} has left the chat]")
            }
            ServerEvent::Chat { username, text } => write!(f, "[{username}] {text}"),
            ServerEvent::TransferInitiated {
                sender,
                recipient,
                filename,
                size_kb,
                checksum,
            } => {
                write!(
                    f,
                    "[File transfer initiated from {sender} to {recipient} {filename} ({size_kb} KB)"
                )?;
                if let Some(checksum) = checksum {
                    write!(f, " checksum:{checksum}")?;
                }
                write!(f, "]")
            }
            ServerEvent::TransferAccepted {
                sender,
                recipient,
                filename,
                size_kb,
            } => write!(
                f,
                "[File transfer accepted by {recipient} from {sender} File: {filename} ({size_kb} KB)]"
            ),
            ServerEvent::TransferRejected { sender, recipient } => {
                write!(f, "[File transfer rejected by {recipient} from {sender}]")
            }
            ServerEvent::TransferStarted {
                sender,
                recipient,
                port,
            } => write!(
                f,
                "[Starting file transfer from {sender} to {recipient} port:{port}]"
            ),
            ServerEvent::TransferProgress {
                sender,
                recipient,
                percent,
            } => write!(
                f,
                "[File transfer progress from {sender} to {recipient}: {percent}%]"
            ),
            ServerEvent::TransferComplete { sender, recipient } => {
                write!(f, "[File transfer complete from {sender} to {recipient}]")
            }
            ServerEvent::TransferFailed {
                sender,
                recipient,
                reason,
            } => write!(
                f,
                "[File transfer failed from {sender} to {recipient}: {reason}]"
            ),
            ServerEvent::TransferCancelled { sender, recipient } => {
                write!(f, "[File transfer cancelled from {sender} to {recipient}]")
            }
            ServerEvent::UserList { usernames } => {
                write!(f, "Online users: {}", usernames.join(", "))
            }
        }
    }
}

impl ServerEvent {
    /// Parse a broadcast line back into its event. Unknown shapes yield
    /// `None`; the control protocol treats those as plain text.
    pub fn parse(line: &str) -> Option<ServerEvent> {
        if let Some(rest) = line.strip_prefix("Online users: ") {
            return Some(ServerEvent::UserList {
                usernames: rest
                    .split(", ")
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect(),
            });
        }

        if line.starts_with('[') && line.ends_with(']') {
            let inner = &line[1..line.len() - 1];
            if let Some(event) = parse_bracketed(inner) {
                return Some(event);
            }
        }

        parse_chat(line)
    }
}

fn parse_bracketed(inner: &str) -> Option<ServerEvent> {
    if let Some(rest) = inner.strip_prefix("File transfer initiated from ") {
        let tokens: Vec<&str> = rest.split_whitespace().collect();
        if tokens.len() < 6 || tokens[1] != "to" || tokens[5] != "KB)" {
            return None;
        }
        let size_kb = tokens[4].strip_prefix('(')?.parse().ok()?;
        let checksum = match tokens.get(6) {
            Some(token) => Some(token.strip_prefix("checksum:")?.to_string()),
            None => None,
        };
        return Some(ServerEvent::TransferInitiated {
            sender: tokens[0].to_string(),
            recipient: tokens[2].to_string(),
            filename: tokens[3].to_string(),
            size_kb,
            checksum,
        });
    }

    if let Some(rest) = inner.strip_prefix("File transfer accepted by ") {
        let tokens: Vec<&str> = rest.split_whitespace().collect();
        if tokens.len() != 7 || tokens[1] != "from" || tokens[3] != "File:" || tokens[6] != "KB)" {
            return None;
        }
        let size_kb = tokens[5].strip_prefix('(')?.parse().ok()?;
        return Some(ServerEvent::TransferAccepted {
            sender: tokens[2].to_string(),
            recipient: tokens[0].to_string(),
            filename: tokens[4].to_string(),
            size_kb,
        });
    }

    if let Some(rest) = inner.strip_prefix("File transfer rejected by ") {
        let (recipient, sender) = rest.split_once(" from ")?;
        return Some(ServerEvent::TransferRejected {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
        });
    }

    if let Some(rest) = inner.strip_prefix("Starting file transfer from ") {
        let (sender, rest) = rest.split_once(" to ")?;
        let (recipient, port) = rest.split_once(" port:")?;
        return Some(ServerEvent::TransferStarted {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            port: port.parse().ok()?,
        });
    }

    if let Some(rest) = inner.strip_prefix("File transfer progress from ") {
        let (sender, rest) = rest.split_once(" to ")?;
        let (recipient, percent) = rest.split_once(": ")?;
        return Some(ServerEvent::TransferProgress {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            percent: percent.strip_suffix('%')?.parse().ok()?,
        });
    }

    if let Some(rest) = inner.strip_prefix("File transfer complete from ") {
        let (sender, recipient) = rest.split_once(" to ")?;
        return Some(ServerEvent::TransferComplete {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
        });
    }

    if let Some(rest) = inner.strip_prefix("File transfer failed from ") {
        let (sender, rest) = rest.split_once(" to ")?;
        let (recipient, reason) = rest.split_once(": ")?;
        return Some(ServerEvent::TransferFailed {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            reason: reason.to_string(),
        });
    }

    if let Some(rest) = inner.strip_prefix("File transfer cancelled from ") {
        let (sender, recipient) = rest.split_once(" to ")?;
        return Some(ServerEvent::TransferCancelled {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
        });
    }

    if let Some(username) = inner.strip_suffix(" has joined the chat") {
        return Some(ServerEvent::Joined {
            username: username.to_string(),
        });
    }

    if let Some(username) = inner.strip_suffix(" has left the chat") {
        return Some(ServerEvent::Left {
            username: username.to_string(),
        });
    }

    None
}

fn parse_chat(line: &str) -> Option<ServerEvent> {
    let rest = line.strip_prefix('[')?;
    let (username, text) = rest.split_once("] ")?;
    if username.is_empty() {
        return None;
    }
    Some(ServerEvent::Chat {
        username: username.to_string(),
        text: text.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(event: ServerEvent) {
        let line = event.to_string();
        assert_eq!(ServerEvent::parse(&line), Some(event), "wire: {line}");
    }

    #[test]
    fn joined_and_left_roundtrip() {
        roundtrip(ServerEvent::Joined {
            username: "alice".into(),
        });
        roundtrip(ServerEvent::Left {
            username: "bob".into(),
        });
    }

    #[test]
    fn chat_roundtrip() {
        roundtrip(ServerEvent::Chat {
            username: "alice".into(),
            text: "hello there".into(),
        });
    }

    #[test]
    fn chat_with_trailing_bracket() {
        let parsed = ServerEvent::parse("[alice] see item [1]");
        assert_eq!(
            parsed,
            Some(ServerEvent::Chat {
                username: "alice".into(),
                text: "see item [1]".into(),
            })
        );
    }

    #[test]
    fn initiated_roundtrip_with_and_without_checksum() {
        roundtrip(ServerEvent::TransferInitiated {
            sender: "alice".into(),
            recipient: "bob".into(),
            filename: "report.pdf".into(),
            size_kb: 42,
            checksum: Some("5eb63bbbe01eeed093cb22bb8f5acdc3".into()),
        });
        roundtrip(ServerEvent::TransferInitiated {
            sender: "alice".into(),
            recipient: "bob".into(),
            filename: "report.pdf".into(),
            size_kb: 42,
            checksum: None,
        });
    }

    #[test]
    fn accepted_roundtrip() {
        roundtrip(ServerEvent::TransferAccepted {
            sender: "alice".into(),
            recipient: "bob".into(),
            filename: "report.pdf".into(),
            size_kb: 42,
        });
    }

    #[test]
    fn transfer_lifecycle_roundtrips() {
        roundtrip(ServerEvent::TransferRejected {
            sender: "alice".into(),
            recipient: "bob".into(),
        });
        roundtrip(ServerEvent::TransferStarted {
            sender: "alice".into(),
            recipient: "bob".into(),
            port: 12346,
        });
        roundtrip(ServerEvent::TransferProgress {
            sender: "alice".into(),
            recipient: "bob".into(),
            percent: 35,
        });
        roundtrip(ServerEvent::TransferComplete {
            sender: "alice".into(),
            recipient: "bob".into(),
        });
        roundtrip(ServerEvent::TransferFailed {
            sender: "alice".into(),
            recipient: "bob".into(),
            reason: "CHECKSUM_FAILED".into(),
        });
        roundtrip(ServerEvent::TransferCancelled {
            sender: "alice".into(),
            recipient: "bob".into(),
        });
    }

    #[test]
    fn user_list_roundtrip() {
        roundtrip(ServerEvent::UserList {
            usernames: vec!["alice".into(), "bob".into()],
        });
    }

    #[test]
    fn exact_wire_text() {
        let event = ServerEvent::TransferStarted {
            sender: "alice".into(),
            recipient: "bob".into(),
            port: 12346,
        };
        assert_eq!(
            event.to_string(),
            "[Starting file transfer from alice to bob port:12346]"
        );
    }

    #[test]
    fn malformed_lines_are_ignored() {
        assert_eq!(ServerEvent::parse("plain server banner"), None);
        assert_eq!(ServerEvent::parse("[File transfer initiated from]"), None);
        assert_eq!(ServerEvent::parse("[Starting file transfer from a]"), None);
        assert_eq!(ServerEvent::parse(""), None);
    }
}
