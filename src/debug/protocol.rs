//! Wire protocol of the debug session.
//!
//! Every message is a UTF-8 JSON object of the form
//! `{"type": <string>, "payload": <object>}`, framed by the payload byte
//! length as a decimal string terminated by the sentinel `#`:
//!
//! ```text
//! 42#{"type":"hello","payload":{...}}
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::io::{Read, Write};

/// Protocol version exchanged in the `hello` handshake.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

const FRAME_SENTINEL: u8 = b'#';

/// Upper bound on an accepted frame body, to keep a misbehaving peer from
/// making the session allocate arbitrarily.
const MAX_FRAME_LEN: usize = 1 << 20;

/// A command received from the debugger client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Command {
    /// Handshake; the session rejects mismatched versions or net hashes.
    Hello { version: String, hash: String },
    /// Instantiate the net from the factory and run it.
    Start {},
    /// Stop the running net.
    Stop {},
    /// Raise or clear the pause flag; paused runners block at the enable
    /// checkpoint.
    Pause { pause: bool },
    /// Stop and discard the net, then reinstantiate it from the factory.
    Reload {},
    /// Replace the breakpoint set.
    Breakpoints { ids: Vec<u64> },
    /// Close the connection and end the session.
    Exit {},
}

/// An event sent to the debugger client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    /// The current set of active states, with activation depths.
    States { states: Vec<ActiveState> },
    /// Acknowledgement; the payload depends on what is being acknowledged.
    Ack(serde_json::Value),
    Error { message: String },
    Exit { reason: String },
}

/// One entry of a [`Event::States`] report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveState {
    pub id: u64,
    pub count: usize,
}

/// Serializes the given message and writes it as one frame.
///
/// # Errors
/// Returns an error if serialization or the socket write fails.
pub fn write_frame(writer: &mut impl Write, message: &impl Serialize) -> Result<()> {
    let body = serde_json::to_vec(message).context("Failed to serialize frame body")?;

    let mut frame = Vec::with_capacity(body.len() + 12);
    frame.extend_from_slice(body.len().to_string().as_bytes());
    frame.push(FRAME_SENTINEL);
    frame.extend_from_slice(&body);

    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame and deserializes its body.
///
/// # Errors
/// Returns an error if the stream ends, the length prefix is malformed or
/// oversized, or the body is not a valid message.
pub fn read_frame<T: DeserializeOwned>(reader: &mut impl Read) -> Result<T> {
    let mut len: usize = 0;
    let mut digits = 0;
    loop {
        let mut byte = [0_u8; 1];
        reader.read_exact(&mut byte)?;
        match byte[0] {
            b'0'..=b'9' => {
                len = len * 10 + usize::from(byte[0] - b'0');
                digits += 1;
                if len > MAX_FRAME_LEN {
                    bail!("Frame length exceeds {MAX_FRAME_LEN} bytes");
                }
            }
            FRAME_SENTINEL => {
                if digits == 0 {
                    bail!("Frame is missing its length prefix");
                }
                break;
            }
            other => bail!("Unexpected byte {other:#04x} in frame length prefix"),
        }
    }

    let mut body = vec![0_u8; len];
    reader.read_exact(&mut body)?;
    serde_json::from_slice(&body).context("Malformed frame body")
}
