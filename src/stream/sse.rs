//! Incremental server-sent events parser
//!
//! Accumulates bytes until a blank line, then parses the accumulated
//! `data:` payload into JSON. Malformed events are skipped; the stream
//! continues.

use serde_json::Value;

pub struct SseParser {
    buf: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed raw bytes; returns every completed JSON event.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Value> {
        // Normalize CRLF so the blank-line scan only sees '\n'.
        self.buf.extend(bytes.iter().copied().filter(|&b| b != b'\r'));
        let mut events = Vec::new();
        while let Some(pos) = find_blank_line(&self.buf) {
            let event: Vec<u8> = self.buf.drain(..pos + 2).collect();
            if let Some(v) = parse_event(&event[..pos]) {
                events.push(v);
            }
        }
        events
    }

    /// Parse any residue as a final event.
    pub fn flush(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.buf);
        parse_event(&rest)
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn parse_event(raw: &[u8]) -> Option<Value> {
    let text = String::from_utf8_lossy(raw);
    let data: String = text
        .lines()
        .filter_map(|l| l.strip_prefix("data:"))
        .map(|l| l.trim())
        .collect::<Vec<_>>()
        .join("\n");
    let data = if data.is_empty() {
        // Tolerate bare JSON lines without the SSE field name.
        text.trim().to_string()
    } else {
        data
    };
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    serde_json::from_str(&data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut p = SseParser::new();
        let got = p.push(b"data: {\"type\":\"partial\",\"text\":\"hi\"}\n\n");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["text"], "hi");
    }

    #[test]
    fn test_event_split_across_pushes() {
        let mut p = SseParser::new();
        assert!(p.push(b"data: {\"a\"").is_empty());
        let got = p.push(b": 1}\n\n");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["a"], 1);
    }

    #[test]
    fn test_crlf_events() {
        let mut p = SseParser::new();
        let got = p.push(b"data: {\"a\":1}\r\n\r\ndata: {\"a\":2}\r\n\r\n");
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn test_malformed_event_skipped() {
        let mut p = SseParser::new();
        let got = p.push(b"data: not json\n\ndata: {\"ok\":true}\n\n");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["ok"], true);
    }

    #[test]
    fn test_done_marker_ignored() {
        let mut p = SseParser::new();
        assert!(p.push(b"data: [DONE]\n\n").is_empty());
    }

    #[test]
    fn test_flush_residue() {
        let mut p = SseParser::new();
        p.push(b"data: {\"tail\":true}");
        let got = p.flush().unwrap();
        assert_eq!(got["tail"], true);
    }
}
