//! Chat broker with brokered file transfers.
//!
//! One binary, two modes. The broker accepts line-oriented TCP control
//! connections, fans chat out to every session, and mediates file
//! transfers by opening an ephemeral relay port per accepted offer. The
//! client multiplexes local input with broker broadcasts and launches
//! transfer agents when a broadcast shows it is party to a started
//! transfer. Each module owns one responsibility:
//!
//! - [`cli`] parses the command-line interface for broker and client modes.
//! - [`command`] parses slash commands arriving on a control connection.
//! - [`event`] is the tagged broadcast event type and its wire text.
//! - [`registry`] tracks who is online and routes broadcasts.
//! - [`ledger`] tracks pending transfers and allocates relay ports.
//! - [`broker`] accepts connections and runs one session loop per client.
//! - [`relay`] ferries handshake frames and file bytes between two peers.
//! - [`frame`] is the binary codec for the relay data phase.
//! - [`checksum`] computes MD5 digests off the async workers.
//! - [`client`] is the interactive controller.
//! - [`agent`] sends or receives one file over a relay port.
//!
//! Integration tests drive a real broker over loopback TCP; the e2e test
//! exercises the compiled binary end to end.

pub mod agent;
pub mod broker;
pub mod checksum;
pub mod cli;
pub mod client;
pub mod command;
pub mod event;
pub mod frame;
pub mod ledger;
pub mod registry;
pub mod relay;
