//! Open handshake for the framed transport.
//!
//! Before frames flow, the dialing side sends a small line-oriented request
//! carrying a path and a header map, and the listening side answers with a
//! status line:
//!
//! ```text
//! KEELSON/1 /updates        |  KEELSON/1 200
//! client: billing           |
//! <blank line>              |  <blank line>
//! ```
//!
//! The block is read byte-at-a-time up to a fixed cap, so a misbehaving
//! peer cannot make the listener buffer unbounded garbage.

use std::collections::HashMap;
use std::io::{self, Read, Write};

/// Request headers carried by the framed handshake.
pub type Headers = HashMap<String, String>;

const PROTOCOL: &str = "KEELSON/1";
const MAX_BLOCK: usize = 8 * 1024;

pub(crate) fn send_request<W: Write>(writer: &mut W, path: &str, headers: &Headers) -> io::Result<()> {
    let path = if path.is_empty() { "/" } else { path };
    let mut block = format!("{PROTOCOL} {path}\r\n");
    let mut names: Vec<&String> = headers.keys().collect();
    names.sort();
    for name in names {
        block.push_str(name);
        block.push_str(": ");
        block.push_str(&headers[name]);
        block.push_str("\r\n");
    }
    block.push_str("\r\n");
    writer.write_all(block.as_bytes())
}

pub(crate) fn read_request<R: Read>(reader: &mut R) -> io::Result<(String, Headers)> {
    let block = read_block(reader)?;
    let mut lines = block.lines();
    let request = lines
        .next()
        .ok_or_else(|| bad_handshake("empty handshake"))?;
    let path = request
        .strip_prefix(PROTOCOL)
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .ok_or_else(|| bad_handshake("bad handshake request line"))?;

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| bad_handshake("bad handshake header line"))?;
        headers.insert(name.trim().to_string(), value.trim().to_string());
    }
    Ok((path.to_string(), headers))
}

pub(crate) fn send_response<W: Write>(writer: &mut W, accepted: bool) -> io::Result<()> {
    let status = if accepted { 200 } else { 400 };
    writer.write_all(format!("{PROTOCOL} {status}\r\n\r\n").as_bytes())
}

pub(crate) fn read_response<R: Read>(reader: &mut R) -> io::Result<()> {
    let block = read_block(reader)?;
    let status = block
        .lines()
        .next()
        .and_then(|line| line.strip_prefix(PROTOCOL))
        .map(str::trim)
        .ok_or_else(|| bad_handshake("bad handshake response"))?;
    if status == "200" {
        Ok(())
    } else {
        Err(bad_handshake(format!("handshake rejected with status {status}")))
    }
}

/// Read until the blank line terminating the block.
fn read_block<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut block: Vec<u8> = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "handshake cut short")),
            Ok(_) => {
                block.push(byte[0]);
                if block.ends_with(b"\r\n\r\n") {
                    break;
                }
                if block.len() > MAX_BLOCK {
                    return Err(bad_handshake("handshake block too large"));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    String::from_utf8(block).map_err(|_| bad_handshake("handshake is not UTF-8"))
}

fn bad_handshake(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn request_round_trip() {
        let mut headers = Headers::new();
        headers.insert("client".into(), "billing".into());
        headers.insert("token".into(), "abc123".into());

        let mut wire = Vec::new();
        send_request(&mut wire, "/updates", &headers).unwrap();

        let (path, parsed) = read_request(&mut Cursor::new(wire)).unwrap();
        assert_eq!(path, "/updates");
        assert_eq!(parsed, headers);
    }

    #[test]
    fn empty_path_defaults_to_root() {
        let mut wire = Vec::new();
        send_request(&mut wire, "", &Headers::new()).unwrap();
        let (path, headers) = read_request(&mut Cursor::new(wire)).unwrap();
        assert_eq!(path, "/");
        assert!(headers.is_empty());
    }

    #[test]
    fn response_status_checked() {
        let mut wire = Vec::new();
        send_response(&mut wire, true).unwrap();
        read_response(&mut Cursor::new(wire)).unwrap();

        let mut wire = Vec::new();
        send_response(&mut wire, false).unwrap();
        assert!(read_response(&mut Cursor::new(wire)).is_err());
    }

    #[test]
    fn malformed_blocks_rejected() {
        let wire = b"NOPE/9 /x\r\n\r\n".to_vec();
        assert!(read_request(&mut Cursor::new(wire)).is_err());

        let wire = b"KEELSON/1 /x\r\nbroken header\r\n\r\n".to_vec();
        assert!(read_request(&mut Cursor::new(wire)).is_err());

        // no terminator
        let wire = b"KEELSON/1 /x\r\n".to_vec();
        assert!(read_request(&mut Cursor::new(wire)).is_err());
    }
}
