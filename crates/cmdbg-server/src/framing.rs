//! Framing strategies.
//!
//! A strategy chews on a connection's raw receive buffer and peels off the
//! next complete message, removing the consumed bytes. Callers drain it in a
//! loop, since one read may carry several messages.

use crate::error::ServerError;

/// Marker line opening a server envelope.
pub const ENVELOPE_OPEN: &str = "[== \"CMake Server\" ==[";
/// Marker line closing a server envelope.
pub const ENVELOPE_CLOSE: &str = "]== \"CMake Server\" ==]";

/// Chunks a byte stream into logical messages.
pub trait BufferStrategy: Send {
    /// Extract the next complete message from `raw`, or `None` when more
    /// bytes are needed. Consumed bytes are removed from `raw`.
    fn buffer_message(&mut self, raw: &mut Vec<u8>) -> Result<Option<String>, ServerError>;

    /// Transform an outbound payload for the wire. Identity by default.
    fn buffer_out_message(&self, message: &str) -> String {
        message.to_string()
    }

    /// Drop any partially accumulated state.
    fn clear(&mut self) {}
}

fn take_line(raw: &mut Vec<u8>) -> Option<String> {
    let end = raw.iter().position(|&b| b == b'\n')?;
    let mut line = String::from_utf8_lossy(&raw[..end]).into_owned();
    raw.drain(..=end);
    if line.ends_with('\r') {
        line.pop();
    }
    Some(line)
}

/// One message per `\n`-terminated line; a trailing `\r` is stripped.
#[derive(Debug, Default)]
pub struct LineStrategy;

impl BufferStrategy for LineStrategy {
    fn buffer_message(&mut self, raw: &mut Vec<u8>) -> Result<Option<String>, ServerError> {
        Ok(take_line(raw))
    }
}

/// Payloads delimited by magic marker lines.
///
/// Everything between an open and close marker accumulates into one message;
/// an open marker resets any partial payload. Outbound messages are wrapped
/// in the same envelope.
#[derive(Debug, Default)]
pub struct EnvelopeStrategy {
    partial: String,
}

impl BufferStrategy for EnvelopeStrategy {
    fn buffer_message(&mut self, raw: &mut Vec<u8>) -> Result<Option<String>, ServerError> {
        while let Some(line) = take_line(raw) {
            if line == ENVELOPE_OPEN {
                self.partial.clear();
            } else if line == ENVELOPE_CLOSE {
                return Ok(Some(std::mem::take(&mut self.partial)));
            } else {
                self.partial.push_str(&line);
                self.partial.push('\n');
            }
        }
        Ok(None)
    }

    fn buffer_out_message(&self, message: &str) -> String {
        // The close marker must sit on its own line; inbound parsing keeps
        // payloads newline-terminated, so this round-trips.
        let newline = if message.ends_with('\n') { "" } else { "\n" };
        format!("\n{ENVELOPE_OPEN}\n{message}{newline}{ENVELOPE_CLOSE}\n")
    }

    fn clear(&mut self) {
        self.partial.clear();
    }
}

/// One message per balanced top-level JSON object, at any fragmentation.
///
/// The buffer is handed to a streaming parser on every feed; an incomplete
/// object simply waits for more bytes, anything unparsable is a framing
/// error. The emitted frame is the exact byte run of the object.
#[derive(Debug, Default)]
pub struct JsonStrategy;

impl BufferStrategy for JsonStrategy {
    fn buffer_message(&mut self, raw: &mut Vec<u8>) -> Result<Option<String>, ServerError> {
        let start = match raw.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(start) => start,
            None => {
                raw.clear();
                return Ok(None);
            }
        };

        let mut stream = serde_json::Deserializer::from_slice(&raw[start..])
            .into_iter::<serde_json::Value>();
        match stream.next() {
            None => Ok(None),
            Some(Ok(value)) => {
                let end = start + stream.byte_offset();
                let frame = String::from_utf8_lossy(&raw[start..end]).into_owned();
                raw.drain(..end);
                if value.is_object() {
                    Ok(Some(frame))
                } else {
                    Err(ServerError::Framing(
                        "expected a top-level JSON object".to_string(),
                    ))
                }
            }
            Some(Err(err)) if err.is_eof() => Ok(None),
            Some(Err(err)) => Err(ServerError::Framing(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(strategy: &mut dyn BufferStrategy, raw: &mut Vec<u8>) -> Vec<String> {
        let mut messages = Vec::new();
        while let Some(message) = strategy.buffer_message(raw).unwrap() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn line_strategy_strips_terminators() {
        let mut strategy = LineStrategy;
        let mut raw = b"hello\r\nworld\npartial".to_vec();
        assert_eq!(drain(&mut strategy, &mut raw), ["hello", "world"]);
        assert_eq!(raw, b"partial");

        raw.extend_from_slice(b"\n");
        assert_eq!(drain(&mut strategy, &mut raw), ["partial"]);
    }

    #[test]
    fn line_strategy_byte_by_byte_equals_bulk() {
        let input = b"first\r\nsecond\nthird\n";
        let mut bulk_raw = input.to_vec();
        let bulk = drain(&mut LineStrategy, &mut bulk_raw);

        let mut strategy = LineStrategy;
        let mut raw = Vec::new();
        let mut trickled = Vec::new();
        for &byte in input {
            raw.push(byte);
            trickled.extend(drain(&mut strategy, &mut raw));
        }
        assert_eq!(trickled, bulk);
        assert_eq!(trickled, ["first", "second", "third"]);
    }

    #[test]
    fn envelope_round_trips() {
        let mut strategy = EnvelopeStrategy::default();
        let payload = "{\n\"Command\": \"Break\"\n}\n";
        let mut raw = strategy.buffer_out_message(payload).into_bytes();
        assert_eq!(drain(&mut strategy, &mut raw), [payload]);
        assert!(raw.is_empty());
    }

    #[test]
    fn envelope_open_marker_resets_partial_payload() {
        let mut strategy = EnvelopeStrategy::default();
        let mut raw = format!(
            "{ENVELOPE_OPEN}\ngarbage\n{ENVELOPE_OPEN}\nkept\n{ENVELOPE_CLOSE}\n"
        )
        .into_bytes();
        assert_eq!(drain(&mut strategy, &mut raw), ["kept\n"]);
    }

    #[test]
    fn json_strategy_survives_any_fragmentation() {
        let messages = [
            "{ \"test\": 10}",
            "{ \"test\": { \"test2\": false} }",
            "{ \"test\": [1, 2, 3] }",
            "{ \"a\": { \"1\": {}, \n\n\n \"2\":[] \t\t\t\t}}",
        ];
        let stream: String = messages.concat();

        let mut strategy = JsonStrategy;
        let mut raw = Vec::new();
        let mut framed = Vec::new();
        for byte in stream.bytes() {
            raw.push(byte);
            framed.extend(drain(&mut strategy, &mut raw));
        }
        assert_eq!(framed, messages);

        // The same stream in one read produces the same frames.
        let mut raw = stream.clone().into_bytes();
        assert_eq!(drain(&mut JsonStrategy, &mut raw), messages);
    }

    #[test]
    fn json_strategy_rejects_garbage() {
        let mut strategy = JsonStrategy;
        let mut raw = b"not json".to_vec();
        assert!(matches!(
            strategy.buffer_message(&mut raw),
            Err(ServerError::Framing(_))
        ));

        let mut raw = b"[1, 2]".to_vec();
        assert!(matches!(
            strategy.buffer_message(&mut raw),
            Err(ServerError::Framing(_))
        ));
    }

    #[test]
    fn json_strategy_waits_for_balanced_braces() {
        let mut strategy = JsonStrategy;
        let mut raw = b"{\"a\": {\"b\": 1}".to_vec();
        assert_eq!(strategy.buffer_message(&mut raw).unwrap(), None);
        raw.push(b'}');
        assert_eq!(
            strategy.buffer_message(&mut raw).unwrap().as_deref(),
            Some("{\"a\": {\"b\": 1}}")
        );
    }
}
