use bytes::{BufMut, BytesMut};

/// One parsed server-sent event from the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
	/// The payload of the event's `data:` line(s), joined with newlines.
	Data(String),
	/// The terminating `data: [DONE]` marker.
	Done,
}

/// Incremental scanner over arriving response bytes. The relay forwards the
/// raw bytes untouched; this only watches them to find usage payloads and the
/// end-of-stream marker, so it must tolerate events split across chunk
/// boundaries and both LF and CRLF framing.
#[derive(Debug, Default)]
pub struct SseScanner {
	buf: BytesMut,
}

impl SseScanner {
	pub fn new() -> Self {
		Self::default()
	}

	/// Feeds one chunk and returns every event completed by it.
	pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
		self.buf.put_slice(chunk);
		let mut out = Vec::new();
		while let Some(end) = find_event_boundary(&self.buf) {
			let block = self.buf.split_to(end.block_end);
			let _ = self.buf.split_to(end.separator_len);
			if let Some(ev) = parse_event(&block) {
				out.push(ev);
			}
		}
		out
	}

	/// Flushes a trailing unterminated event at end of input.
	pub fn finish(&mut self) -> Option<SseEvent> {
		if self.buf.is_empty() {
			return None;
		}
		let block = self.buf.split();
		parse_event(&block)
	}
}

struct Boundary {
	block_end: usize,
	separator_len: usize,
}

// An event ends at a blank line. Scan for \n\n, treating a preceding \r as
// part of the line terminator.
fn find_event_boundary(buf: &[u8]) -> Option<Boundary> {
	let mut i = 0;
	while i + 1 < buf.len() {
		if buf[i] == b'\n' {
			if buf[i + 1] == b'\n' {
				return Some(Boundary { block_end: i + 1, separator_len: 1 });
			}
			if i + 2 < buf.len() && buf[i + 1] == b'\r' && buf[i + 2] == b'\n' {
				return Some(Boundary { block_end: i + 1, separator_len: 2 });
			}
		}
		i += 1;
	}
	None
}

fn parse_event(block: &[u8]) -> Option<SseEvent> {
	let text = std::str::from_utf8(block).ok()?;
	let mut data: Option<String> = None;
	for line in text.lines() {
		// Comments and non-data fields (event:, id:, retry:) are skipped.
		let Some(rest) = line.strip_prefix("data:") else {
			continue;
		};
		let rest = rest.strip_prefix(' ').unwrap_or(rest);
		match &mut data {
			None => data = Some(rest.to_string()),
			Some(d) => {
				d.push('\n');
				d.push_str(rest);
			},
		}
	}
	let data = data?;
	if data == "[DONE]" {
		return Some(SseEvent::Done);
	}
	Some(SseEvent::Data(data))
}
