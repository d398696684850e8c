//! Interactive line commands
//!
//! Each line typed in chat mode is one word-based command. Most map straight
//! onto an engine [`Command`]; a few are handled by the terminal itself.

use courier_core::{
    Command, ConnectivityMode, ConversationId, CorrelationId, DeviceAddress, MessageContent,
    UserId,
};

use crate::error::{CliError, Result};

/// What a typed line asks for
#[derive(Debug, Clone, PartialEq)]
pub enum InputAction {
    Engine(Command),
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
Commands:
  send <conversation> <recipient> <text>   send a message
  retry <correlation-id>                   resend a failed message
  discard <correlation-id>                 drop a failed message
  open <conversation> | close <conversation>
  read <conversation>                      mark everything read
  clear <conversation>                     clear local history
  receipts on|off                          report reads to the server
  mode online|offline                      switch connectivity mode
  connect | disconnect                     server connection
  discover | stop                          nearby device discovery
  peer-connect <address> | peer-disconnect <address>
  peer-send <address> <text>
  peer-rename <address> [name]             empty name resets it
  peer-clear <address>
  status | help | quit";

/// Parse one input line; blank lines yield `None`
pub fn parse_line(line: &str) -> Result<Option<InputAction>> {
    let line = line.trim();
    let Some((word, rest)) = split_word(line) else {
        return Ok(None);
    };

    let action = match word {
        "send" => {
            let (conversation, rest) = require_word(rest, "send", "conversation")?;
            let (recipient, text) = require_word(rest, "send", "recipient")?;
            InputAction::Engine(Command::SendMessage {
                conversation_id: ConversationId::new(conversation),
                recipient_id: UserId::new(recipient),
                content: MessageContent::text(require_text(text, "send")?),
                metadata: None,
            })
        }
        "retry" => InputAction::Engine(Command::RetryMessage {
            correlation_id: CorrelationId::new(single(rest, "retry", "correlation-id")?),
        }),
        "discard" => InputAction::Engine(Command::DiscardMessage {
            correlation_id: CorrelationId::new(single(rest, "discard", "correlation-id")?),
        }),
        "open" => InputAction::Engine(Command::OpenConversation {
            conversation_id: ConversationId::new(single(rest, "open", "conversation")?),
        }),
        "close" => InputAction::Engine(Command::CloseConversation {
            conversation_id: ConversationId::new(single(rest, "close", "conversation")?),
        }),
        "read" => InputAction::Engine(Command::MarkConversationRead {
            conversation_id: ConversationId::new(single(rest, "read", "conversation")?),
        }),
        "clear" => InputAction::Engine(Command::ClearHistory {
            conversation_id: ConversationId::new(single(rest, "clear", "conversation")?),
        }),
        "receipts" => {
            let enabled = match single(rest, "receipts", "on|off")? {
                "on" => true,
                "off" => false,
                other => return Err(CliError::Input(format!("receipts: expected on|off, got {}", other))),
            };
            InputAction::Engine(Command::SetReadReceipts { enabled })
        }
        "mode" => {
            let mode = match single(rest, "mode", "online|offline")? {
                "online" => ConnectivityMode::Online,
                "offline" | "offline-local" => ConnectivityMode::OfflineLocal,
                other => {
                    return Err(CliError::Input(format!("mode: expected online|offline, got {}", other)))
                }
            };
            InputAction::Engine(Command::SetMode { mode })
        }
        "connect" => InputAction::Engine(Command::Connect),
        "disconnect" => InputAction::Engine(Command::Disconnect),
        "discover" => InputAction::Engine(Command::StartDiscovery),
        "stop" => InputAction::Engine(Command::StopDiscovery),
        "peer-connect" => InputAction::Engine(Command::ConnectPeer {
            address: DeviceAddress::new(single(rest, "peer-connect", "address")?),
        }),
        "peer-disconnect" => InputAction::Engine(Command::DisconnectPeer {
            address: DeviceAddress::new(single(rest, "peer-disconnect", "address")?),
        }),
        "peer-send" => {
            let (address, text) = require_word(rest, "peer-send", "address")?;
            InputAction::Engine(Command::SendPeerMessage {
                address: DeviceAddress::new(address),
                text: require_text(text, "peer-send")?.to_string(),
            })
        }
        "peer-rename" => {
            let (address, name) = require_word(rest, "peer-rename", "address")?;
            let name = name.trim();
            InputAction::Engine(Command::RenamePeer {
                address: DeviceAddress::new(address),
                display_name: (!name.is_empty()).then(|| name.to_string()),
            })
        }
        "peer-clear" => InputAction::Engine(Command::ClearPeerHistory {
            address: DeviceAddress::new(single(rest, "peer-clear", "address")?),
        }),
        "status" => InputAction::Status,
        "help" | "?" => InputAction::Help,
        "quit" | "exit" => InputAction::Quit,
        other => return Err(CliError::Input(format!("unknown command '{}', try help", other))),
    };
    Ok(Some(action))
}

fn split_word(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }
    Some(match text.find(char::is_whitespace) {
        Some(end) => (&text[..end], &text[end..]),
        None => (text, ""),
    })
}

fn require_word<'a>(text: &'a str, command: &str, what: &str) -> Result<(&'a str, &'a str)> {
    split_word(text).ok_or_else(|| CliError::Input(format!("{}: missing {}", command, what)))
}

/// Exactly one argument
fn single<'a>(text: &'a str, command: &str, what: &str) -> Result<&'a str> {
    let (word, rest) = require_word(text, command, what)?;
    if !rest.trim().is_empty() {
        return Err(CliError::Input(format!("{}: unexpected '{}'", command, rest.trim())));
    }
    Ok(word)
}

fn require_text<'a>(text: &'a str, command: &str) -> Result<&'a str> {
    let text = text.trim();
    if text.is_empty() {
        return Err(CliError::Input(format!("{}: missing text", command)));
    }
    Ok(text)
}
