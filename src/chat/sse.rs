//! Incremental server-sent-event parser.
//!
//! Bytes arrive in arbitrary network chunks. A multi-byte UTF-8 sequence or a
//! line may be split across chunks, so both are held back until complete.

use log::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

impl SseEvent {
    /// Unnamed events default to `message`, as in the SSE grammar.
    pub fn is_message(&self) -> bool {
        self.event.is_empty() || self.event == "message"
    }
}

#[derive(Debug, Default)]
pub struct SseParser {
    undecoded: Vec<u8>,
    line: String,
    /// Bytes of `line` already known to hold no newline.
    scanned: usize,
    event: String,
    data: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk and return every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.decode(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.line[self.scanned..].find('\n') {
            let line: String = self.line.drain(..=self.scanned + pos).collect();
            self.scanned = 0;
            let line = line.trim_end_matches(&['\n', '\r'][..]);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        self.scanned = self.line.len();
        events
    }

    /// Flush whatever is buffered once the byte stream has ended.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.undecoded.is_empty() {
            let rest = std::mem::take(&mut self.undecoded);
            self.line.push_str(&String::from_utf8_lossy(&rest));
        }
        self.scanned = 0;
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            if let Some(event) = self.process_line(line.trim_end_matches('\r')) {
                events.push(event);
            }
        }
        if let Some(event) = self.flush() {
            events.push(event);
        }
        events
    }

    fn decode(&mut self, chunk: &[u8]) {
        self.undecoded.extend_from_slice(chunk);
        let mut consumed = 0;
        loop {
            match std::str::from_utf8(&self.undecoded[consumed..]) {
                Ok(text) => {
                    self.line.push_str(text);
                    consumed = self.undecoded.len();
                    break;
                }
                Err(err) => {
                    let valid = consumed + err.valid_up_to();
                    // valid_up_to marks a prefix that always decodes.
                    if let Ok(text) = std::str::from_utf8(&self.undecoded[consumed..valid]) {
                        self.line.push_str(text);
                    }
                    match err.error_len() {
                        Some(len) => {
                            self.line.push(char::REPLACEMENT_CHARACTER);
                            consumed = valid + len;
                        }
                        None => {
                            // Incomplete sequence at the tail, wait for more bytes.
                            consumed = valid;
                            break;
                        }
                    }
                }
            }
        }
        self.undecoded.drain(..consumed);
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.trim().is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = value.to_string(),
            "data" => match self.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            other => debug!("Ignoring SSE field: {}", other),
        }
        None
    }

    fn flush(&mut self) -> Option<SseEvent> {
        let event = std::mem::take(&mut self.event);
        let data = self.data.take().unwrap_or_default();
        if event.is_empty() && data.is_empty() {
            return None;
        }
        Some(SseEvent { event, data })
    }
}
