//! # Conformance Scripts
//!
//! A script puts a raw client in front of the endpoint under test and
//! lists what happens, one step at a time:
//!
//! ```toml
//! [peer]
//! dcid = "01"
//!
//! [[steps]]
//! action = "client_hello"
//!
//! [[steps]]
//! action = "expect_event"
//! events = ["tls_client_initial_request", "tls_handshake_event:ServerHello"]
//!
//! [[steps]]
//! action = "send"
//! level = "one_rtt"
//! frames = [{ type = "stream", stream_id = 0, data = "hello", fin = true }]
//!
//! [[steps]]
//! action = "expect_stream"
//! stream_id = 0
//! recv_state = "DataRecvd"
//! ```
//!
//! Byte strings (cids, tokens, CRYPTO payloads) are written as hex;
//! STREAM payloads and reasons as UTF-8 text.

pub mod frames;
pub mod runner;

pub use frames::{decode_hex, FrameSpec};
pub use runner::{RunReport, Runner};

use quicprobe_quic::EncryptionLevel;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that end a script run.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to read script {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid script: {0}")]
    Parse(#[from] toml::de::Error),

    /// The script itself is wrong, e.g. a malformed hex string.
    #[error("step {step} ({action}): {reason}")]
    InvalidStep {
        step: usize,
        action: &'static str,
        reason: String,
    },

    /// The endpoint returned an error the step did not expect.
    #[error("step {step} ({action}): {source}")]
    Quic {
        step: usize,
        action: &'static str,
        #[source]
        source: quicprobe_quic::Error,
    },

    #[error("step {step} ({action}): expectation failed: {message}")]
    Expectation {
        step: usize,
        action: &'static str,
        message: String,
    },
}

/// A parsed script.
#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub peer: PeerSpec,

    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Script {
    pub fn from_toml(text: &str) -> Result<Self, ScriptError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ScriptError> {
        let text = std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut script = Self::from_toml(&text)?;
        if script.name.is_none() {
            script.name = path.file_stem().map(|s| s.to_string_lossy().into_owned());
        }
        Ok(script)
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }
}

/// The raw client's identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeerSpec {
    /// Destination cid of the first Initial (hex); the connection's key
    pub dcid: String,

    /// Source cid (hex)
    pub scid: String,

    /// Seed of the client's random source
    pub seed: u64,
}

impl Default for PeerSpec {
    fn default() -> Self {
        Self {
            dcid: "01".to_string(),
            scid: "c0c1c2c3c4c5c6c7".to_string(),
            seed: 7,
        }
    }
}

/// Encryption level of a sent packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelSpec {
    Initial,
    Handshake,
    OneRtt,
}

impl From<LevelSpec> for EncryptionLevel {
    fn from(level: LevelSpec) -> Self {
        match level {
            LevelSpec::Initial => EncryptionLevel::Initial,
            LevelSpec::Handshake => EncryptionLevel::Handshake,
            LevelSpec::OneRtt => EncryptionLevel::OneRtt,
        }
    }
}

fn default_true() -> bool {
    true
}

/// One script step.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Send an Initial carrying a ClientHello.
    ClientHello {
        #[serde(default)]
        omit_transport_parameters: bool,

        /// Override initial_source_connection_id (hex)
        #[serde(default)]
        initial_source_connection_id: Option<String>,
    },

    /// Send one packet with the given frames.
    Send {
        level: LevelSpec,
        frames: Vec<FrameSpec>,

        /// Reuse or skip packet numbers
        #[serde(default)]
        packet_number: Option<u64>,
    },

    /// Open a stream on the endpoint under test.
    OpenStream {
        bidirectional: bool,
        #[serde(default)]
        expect_id: Option<u64>,
    },

    /// Write on a stream of the endpoint under test.
    AppSend {
        stream_id: u64,
        data: String,
        #[serde(default)]
        fin: bool,
        #[serde(default)]
        expect_error: bool,
    },

    /// Read from a stream of the endpoint under test.
    AppRead {
        stream_id: u64,
        #[serde(default)]
        expect_data: Option<String>,
        #[serde(default)]
        expect_fin: Option<bool>,
        #[serde(default)]
        expect_error: bool,
    },

    /// Application close on the endpoint under test.
    Close {
        error_code: u64,
        #[serde(default)]
        reason: String,
    },

    /// Fire a timer: `ack`, `closing`, `draining` or `idle`.
    Tick { timer: String },

    /// Events, in order, since the last matched event. Each entry is a
    /// name or `name:detail`.
    ExpectEvent { events: Vec<String> },

    /// Stream states by name, or `none` once the stream is gone.
    ExpectStream {
        stream_id: u64,
        #[serde(default)]
        send_state: Option<String>,
        #[serde(default)]
        recv_state: Option<String>,
    },

    /// Connection state, and optionally an error code it recorded.
    ExpectState {
        state: String,
        #[serde(default)]
        error_code: Option<u64>,
    },

    /// A frame the peer received since the last matched frame.
    ExpectFrame {
        frame: String,
        #[serde(default = "default_true")]
        present: bool,
    },
}

impl Step {
    pub fn action(&self) -> &'static str {
        match self {
            Step::ClientHello { .. } => "client_hello",
            Step::Send { .. } => "send",
            Step::OpenStream { .. } => "open_stream",
            Step::AppSend { .. } => "app_send",
            Step::AppRead { .. } => "app_read",
            Step::Close { .. } => "close",
            Step::Tick { .. } => "tick",
            Step::ExpectEvent { .. } => "expect_event",
            Step::ExpectStream { .. } => "expect_stream",
            Step::ExpectState { .. } => "expect_state",
            Step::ExpectFrame { .. } => "expect_frame",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_steps() {
        let script = Script::from_toml(
            r#"
name = "fin"

[peer]
dcid = "0a0b"

[[steps]]
action = "client_hello"

[[steps]]
action = "send"
level = "one_rtt"
frames = [
    { type = "stream", stream_id = 0, offset = 5, data = "world", fin = true },
    { type = "ping" },
]

[[steps]]
action = "expect_frame"
frame = "ack"
"#,
        )
        .unwrap();
        assert_eq!(script.name(), "fin");
        assert_eq!(script.peer.dcid, "0a0b");
        assert_eq!(script.peer.seed, 7);
        assert_eq!(script.steps.len(), 3);
        match &script.steps[1] {
            Step::Send { level, frames, packet_number } => {
                assert_eq!(*level, LevelSpec::OneRtt);
                assert_eq!(frames.len(), 2);
                assert!(packet_number.is_none());
            }
            other => panic!("unexpected step {other:?}"),
        }
        assert!(matches!(&script.steps[2], Step::ExpectFrame { present: true, .. }));
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let err = Script::from_toml("[[steps]]\naction = \"dance\"\n").unwrap_err();
        assert!(matches!(err, ScriptError::Parse(_)));
    }

    #[test]
    fn test_load_names_script_after_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handshake.toml");
        std::fs::write(&path, "[[steps]]\naction = \"client_hello\"\n").unwrap();
        let script = Script::load(&path).unwrap();
        assert_eq!(script.name(), "handshake");

        let missing = Script::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(missing, ScriptError::Io { .. }));
    }
}
