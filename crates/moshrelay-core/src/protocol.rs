//! Wire contract shared by both roles.
//!
//! Covers the three textual formats the agent exchanges with its peers:
//! - the relay announce datagram (`CONNECT <api-key> <rendezvous-key>`)
//! - the `mosh-server` ready line (`MOSH CONNECT <port> <key>`)
//! - the rendezvous-key line printed by the server role (`MOSH_KEY <key>`)
//!
//! plus the `--version` probe output of the mosh binaries.

use semver::Version;

use crate::error::ParseError;

/// Exact mosh version both sides must run.
pub const REQUIRED_VERSION: &str = "1.4.0";

/// Largest datagram relayed in either direction.
pub const MAX_PACKET_SIZE: usize = 1500;

/// Prefix of the line `mosh-server` prints once it is listening.
pub const CONNECT_MARKER: &str = "MOSH CONNECT";

/// Prefix of the line the server role prints with the rendezvous key.
pub const KEY_LINE_PREFIX: &str = "MOSH_KEY";

/// Environment variable used to hand the rendezvous key to `mosh-client`.
pub const RENDEZVOUS_ENV: &str = "MOSH_KEY";

/// Flag that makes a mosh binary print its version.
pub const VERSION_FLAG: &str = "--version";

pub const CLIENT_BINARY: &str = "mosh-client";
pub const SERVER_BINARY: &str = "mosh-server";

/// Datagrams buffered per direction between two pipeline stages.
pub const PACKET_CHANNEL_CAPACITY: usize = 256;

/// Build the announce payload sent once to the relay server.
pub fn announce_payload(api_key: &str, rendezvous_key: &str) -> String {
    format!("CONNECT {api_key} {rendezvous_key}")
}

/// Format the line the server role prints so the client can pick up the key.
pub fn key_line(rendezvous_key: &str) -> String {
    format!("{KEY_LINE_PREFIX} {rendezvous_key}")
}

/// Extract the rendezvous key from a `MOSH_KEY <key>` line.
///
/// Returns `None` for any other line, including a bare prefix with no key.
pub fn parse_key_line(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(KEY_LINE_PREFIX)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let key = rest.trim();
    (!key.is_empty()).then_some(key)
}

/// Port and rendezvous key reported by `mosh-server`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectDetails {
    pub port: u16,
    pub rendezvous_key: String,
}

/// Scan captured `mosh-server` output for the ready line.
///
/// The third and fourth whitespace tokens of the first line starting with
/// [`CONNECT_MARKER`] are the port and the key.
pub fn parse_connect_details(output: &str) -> Result<ConnectDetails, ParseError> {
    let line = output
        .lines()
        .find(|line| line.starts_with(CONNECT_MARKER))
        .ok_or(ParseError::NoKeyFound)?;

    let tokens: Vec<&str> = line.split_whitespace().collect();
    let [_, _, port, key, ..] = tokens.as_slice() else {
        return Err(ParseError::MalformedMarker(line.to_string()));
    };
    let port = port.parse::<u16>().map_err(|_| ParseError::InvalidPort {
        token: (*port).to_string(),
    })?;

    Ok(ConnectDetails {
        port,
        rendezvous_key: (*key).to_string(),
    })
}

/// Return the raw version token of a `--version` probe.
///
/// `mosh-client (mosh 1.4.0) [build mosh 1.4.0]` yields `1.4.0`: the third
/// whitespace token of the first line with one trailing `)` removed.
pub fn version_token<'a>(program: &str, output: &'a str) -> Result<&'a str, ParseError> {
    let first = output
        .lines()
        .next()
        .ok_or_else(|| ParseError::EmptyOutput {
            program: program.to_string(),
        })?;
    let token = first
        .split_whitespace()
        .nth(2)
        .ok_or_else(|| ParseError::TooFewTokens {
            program: program.to_string(),
            line: first.to_string(),
        })?;
    Ok(token.strip_suffix(')').unwrap_or(token))
}

/// Parse a `--version` probe into a semantic version.
///
/// Releases tagged with two components (`1.3`) are read as `1.3.0`.
pub fn parse_version_output(program: &str, output: &str) -> Result<Version, ParseError> {
    let token = version_token(program, output)?;
    let normalized = match token.matches('.').count() {
        1 => format!("{token}.0"),
        _ => token.to_string(),
    };
    Version::parse(&normalized).map_err(|e| ParseError::InvalidVersion {
        token: token.to_string(),
        reason: e.to_string(),
    })
}

/// The pinned version as a [`Version`].
pub fn required_version() -> Version {
    Version::new(1, 4, 0)
}
