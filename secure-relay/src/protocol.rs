//! Wire markers and the input rules built on top of them.
//!
//! After the handshake every line is an encrypted frame; the markers below
//! are matched against the decrypted text.

/// Prefix of the display-name registration line sent as the last handshake step.
pub const NICK_PREFIX: &str = "NICK|";

/// Origin shown for messages generated by the relay itself.
pub const SERVER_ORIGIN: &str = "SERVER";

/// Sent to a peer that asked to leave, just before its stream is closed.
pub const FAREWELL: &str = "Goodbye";

const SERVER_QUIT_MARKERS: &[&str] = &["/quit", "/exit"];
const CLIENT_FAREWELL_MARKERS: &[&str] = &["bye", "goodbye"];

pub fn nick_line(display_name: &str) -> String {
    format!("{NICK_PREFIX}{display_name}")
}

/// Extracts the display name from a `NICK|<name>` line.
///
/// Returns `None` when the marker is missing or the name is blank.
pub fn parse_nick_line(line: &str) -> Option<&str> {
    let name = line.strip_prefix(NICK_PREFIX)?.trim();
    (!name.is_empty()).then_some(name)
}

/// Whether a decrypted line asks the server to end the session.
pub fn is_quit_marker(line: &str) -> bool {
    SERVER_QUIT_MARKERS
        .iter()
        .any(|marker| line.eq_ignore_ascii_case(marker))
}

pub fn joined_notice(display_name: &str) -> String {
    format!("{display_name} joined the chat")
}

pub fn left_notice(display_name: &str) -> String {
    format!("{display_name} left the chat")
}

/// What the terminal client does with one line typed by its user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInput {
    /// Nothing worth sending.
    Blank,
    /// Send the line, then hang up without waiting for the relay.
    Farewell(String),
    /// Send the line and keep reading until the relay closes the stream.
    Quit(String),
    Chat(String),
}

impl ClientInput {
    pub fn classify(raw: &str) -> Self {
        let text = raw.trim_end_matches(['\r', '\n']);
        if text.trim().is_empty() {
            return ClientInput::Blank;
        }

        if CLIENT_FAREWELL_MARKERS
            .iter()
            .any(|marker| text.eq_ignore_ascii_case(marker))
        {
            ClientInput::Farewell(text.to_string())
        } else if is_quit_marker(text) {
            ClientInput::Quit(text.to_string())
        } else {
            ClientInput::Chat(text.to_string())
        }
    }
}
