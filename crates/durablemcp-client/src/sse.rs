//! Incremental server-sent-events parsing.

/// One complete SSE frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// The `id:` field, the resumption token.
    pub id: Option<String>,
    /// The `event:` field.
    pub event: Option<String>,
    /// Joined `data:` lines.
    pub data: String,
}

/// Incremental parser: feed it chunks, get complete frames back.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk, returning every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        // A blank line terminates a frame. Handle both \n\n and \r\n\r\n.
        loop {
            let Some((boundary, skip)) = find_frame_boundary(&self.buffer) else {
                break;
            };
            let raw: String = self.buffer.drain(..boundary + skip).collect();
            if let Some(frame) = parse_frame(&raw[..boundary]) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn find_frame_boundary(buffer: &str) -> Option<(usize, usize)> {
    let lf = buffer.find("\n\n").map(|index| (index, 2));
    let crlf = buffer.find("\r\n\r\n").map(|index| (index, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 < b.0 { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut data_lines = Vec::new();

    for line in raw.lines() {
        if line.starts_with(':') {
            // Comment (keep-alive).
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => frame.id = Some(value.to_string()),
            "event" => frame.event = Some(value.to_string()),
            "data" => data_lines.push(value.to_string()),
            _ => {}
        }
    }

    if frame.id.is_none() && frame.event.is_none() && data_lines.is_empty() {
        return None;
    }
    frame.data = data_lines.join("\n");
    Some(frame)
}
