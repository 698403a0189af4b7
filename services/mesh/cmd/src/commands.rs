//! Console input for the interactive node.
//!
//! Plain lines are broadcast. Lines starting with `/` are commands:
//!
//! ```text
//! /msg <peer_id> <text>        private message
//! /join <#channel> <password>  join a channel
//! /leave <#channel>            leave a channel
//! /ch <#channel> <text>        channel message
//! /retain <#channel> on|off    toggle channel retention
//! /hs <peer_id>                start a handshake
//! /peers                       list known peers
//! /channels                    list joined channels
//! /stats                       routing counters
//! /quit                        announce departure and exit
//! ```

use crate::config::parse_peer_id;
use anyhow::{bail, Result};
use mesh_wire::PeerId;

/// One parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Public broadcast
    Broadcast(String),
    /// Private message
    Private {
        /// Recipient
        to: PeerId,
        /// Text
        text: String,
    },
    /// Join a channel
    Join {
        /// Channel name
        channel: String,
        /// Channel password
        password: String,
    },
    /// Leave a channel
    Leave(String),
    /// Channel message
    Channel {
        /// Channel name
        channel: String,
        /// Text
        text: String,
    },
    /// Toggle retention
    Retain {
        /// Channel name
        channel: String,
        /// New setting
        enabled: bool,
    },
    /// Explicit handshake
    Handshake(PeerId),
    /// List peers
    Peers,
    /// List channels
    Channels,
    /// Show counters
    Stats,
    /// Exit
    Quit,
}

// Splits off the first word, returning it and the trimmed rest
fn word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.split_once(char::is_whitespace) {
        Some((first, rest)) => (first, rest.trim()),
        None => (input, ""),
    }
}

fn required<'a>(value: &'a str, what: &str, usage: &str) -> Result<&'a str> {
    if value.is_empty() {
        bail!("missing {}; usage: {}", what, usage);
    }
    Ok(value)
}

impl Command {
    /// Parse a console line; `None` for blank lines
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(body) = line.strip_prefix('/') else {
            return Ok(Some(Command::Broadcast(line.to_string())));
        };

        let (name, rest) = word(body);
        let command = match name {
            "msg" => {
                let usage = "/msg <peer_id> <text>";
                let (peer, text) = word(rest);
                Command::Private {
                    to: parse_peer_id(required(peer, "peer id", usage)?)?,
                    text: required(text, "text", usage)?.to_string(),
                }
            }
            "join" => {
                let usage = "/join <#channel> <password>";
                let (channel, password) = word(rest);
                Command::Join {
                    channel: required(channel, "channel", usage)?.to_string(),
                    password: required(password, "password", usage)?.to_string(),
                }
            }
            "leave" => Command::Leave(required(rest, "channel", "/leave <#channel>")?.to_string()),
            "ch" => {
                let usage = "/ch <#channel> <text>";
                let (channel, text) = word(rest);
                Command::Channel {
                    channel: required(channel, "channel", usage)?.to_string(),
                    text: required(text, "text", usage)?.to_string(),
                }
            }
            "retain" => {
                let usage = "/retain <#channel> on|off";
                let (channel, setting) = word(rest);
                let enabled = match setting {
                    "on" => true,
                    "off" => false,
                    _ => bail!("usage: {}", usage),
                };
                Command::Retain {
                    channel: required(channel, "channel", usage)?.to_string(),
                    enabled,
                }
            }
            "hs" => Command::Handshake(parse_peer_id(required(rest, "peer id", "/hs <peer_id>")?)?),
            "peers" => Command::Peers,
            "channels" => Command::Channels,
            "stats" => Command::Stats,
            "quit" | "exit" => Command::Quit,
            other => bail!("unknown command /{}", other),
        };
        Ok(Some(command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_lines_broadcast() {
        assert_eq!(
            Command::parse("  hello mesh  ").unwrap(),
            Some(Command::Broadcast("hello mesh".to_string()))
        );
        assert_eq!(Command::parse("   ").unwrap(), None);
    }

    #[test]
    fn test_commands() {
        assert_eq!(
            Command::parse("/msg 0000beef see you at 5").unwrap(),
            Some(Command::Private {
                to: PeerId(0xbeef),
                text: "see you at 5".to_string()
            })
        );
        assert_eq!(
            Command::parse("/join #ops hunter2").unwrap(),
            Some(Command::Join {
                channel: "#ops".to_string(),
                password: "hunter2".to_string()
            })
        );
        assert_eq!(
            Command::parse("/retain #ops off").unwrap(),
            Some(Command::Retain {
                channel: "#ops".to_string(),
                enabled: false
            })
        );
        assert_eq!(
            Command::parse("/ch #ops deploy done").unwrap(),
            Some(Command::Channel {
                channel: "#ops".to_string(),
                text: "deploy done".to_string()
            })
        );
        assert_eq!(Command::parse("/quit").unwrap(), Some(Command::Quit));
    }

    #[test]
    fn test_bad_commands() {
        assert!(Command::parse("/msg").is_err());
        assert!(Command::parse("/msg 0000beef").is_err());
        assert!(Command::parse("/msg 00000000 hi").is_err());
        assert!(Command::parse("/join #ops").is_err());
        assert!(Command::parse("/retain #ops maybe").is_err());
        assert!(Command::parse("/frobnicate").is_err());
    }
}
