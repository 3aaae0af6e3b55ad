//! NDJSON framing pump
//!
//! Splits a concatenated byte stream into one JSON object per callback,
//! tolerating brace-nested payloads, arbitrary chunk boundaries, and
//! SSE-style `data:` prefixes. The pump never fails on malformed input;
//! parse errors surface only when the consumer parses a delivered line.

pub struct NdjsonPump {
    on_line: Box<dyn FnMut(&str) + Send>,
    buf: Vec<u8>,
    /// Start of the current top-level segment
    start: usize,
    /// Scan cursor
    pos: usize,
    in_string: bool,
    escaped: bool,
    depth: i32,
}

impl NdjsonPump {
    pub fn new(on_line: impl FnMut(&str) + Send + 'static) -> Self {
        Self {
            on_line: Box::new(on_line),
            buf: Vec::new(),
            start: 0,
            pos: 0,
            in_string: false,
            escaped: false,
            depth: 0,
        }
    }

    /// Feed raw bytes; `on_line` fires once per completed top-level object.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        while self.pos < self.buf.len() {
            let b = self.buf[self.pos];
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
            } else {
                match b {
                    b'"' => self.in_string = true,
                    b'{' => self.depth += 1,
                    b'}' => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            let seg =
                                String::from_utf8_lossy(&self.buf[self.start..=self.pos])
                                    .into_owned();
                            self.start = self.pos + 1;
                            self.deliver(&seg);
                        } else if self.depth < 0 {
                            // Stray closing brace; resynchronize.
                            self.depth = 0;
                            self.start = self.pos + 1;
                        }
                    }
                    // A newline at top level terminates non-object residue
                    // ("[DONE]" markers, blank separators) without emission.
                    b'\n' if self.depth == 0 => {
                        self.start = self.pos + 1;
                    }
                    _ => {}
                }
            }
            self.pos += 1;
        }
        self.compact();
    }

    /// Feed a string chunk.
    pub fn push_str(&mut self, chunk: &str) {
        self.push(chunk.as_bytes());
    }

    /// Deliver any complete residue, then reset all state.
    pub fn flush(&mut self) {
        if self.depth == 0 && self.start < self.buf.len() {
            let seg = String::from_utf8_lossy(&self.buf[self.start..]).into_owned();
            if !seg.trim().is_empty() {
                self.deliver(&seg);
            }
        }
        self.buf.clear();
        self.start = 0;
        self.pos = 0;
        self.in_string = false;
        self.escaped = false;
        self.depth = 0;
    }

    fn deliver(&mut self, segment: &str) {
        let mut line = segment.trim();
        if let Some(rest) = line.strip_prefix("data:") {
            line = rest.trim();
        }
        if line.is_empty() || line == "[DONE]" {
            return;
        }
        (self.on_line)(line);
    }

    /// Drop consumed bytes so long streams stay bounded.
    fn compact(&mut self) {
        if self.start > 0 && self.start == self.pos {
            self.buf.drain(..self.start);
            self.pos -= self.start;
            self.start = 0;
        }
    }
}
