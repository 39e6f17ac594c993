//! Line framing for streamed exec output.
//!
//! Exec responses are plain text: one output line per `\n`, ending with an
//! exit-code sentinel line. Chunk boundaries on the wire are arbitrary, so
//! consumers reassemble lines with [`LineSplitter`].

/// Prefix used to recognize the sentinel. Matched with `starts_with`.
pub const EXIT_CODE_PREFIX: &str = "__KOMODO_EXIT_CODE";

/// Full sentinel prefix as emitted: `__KOMODO_EXIT_CODE__:<code>`.
pub const EXIT_CODE_SENTINEL: &str = "__KOMODO_EXIT_CODE__:";

/// Marks where command output begins inside a persistent terminal.
pub const START_OF_OUTPUT: &str = "__KOMODO_START_OF_OUTPUT__";

/// Marks where command output ends inside a persistent terminal.
pub const END_OF_OUTPUT: &str = "__KOMODO_END_OF_OUTPUT__";

/// Reported by [`Finish::EarlyExit`].
pub const EARLY_EXIT: &str = "Early exit without code";

/// How an exec stream finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finish {
    /// The sentinel arrived carrying this exit code.
    ExitCode(String),
    /// The stream ended without a sentinel.
    EarlyExit,
}

impl Finish {
    pub fn code(&self) -> Option<&str> {
        match self {
            Finish::ExitCode(code) => Some(code),
            Finish::EarlyExit => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code() == Some("0")
    }
}

impl std::fmt::Display for Finish {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Finish::ExitCode(code) => f.write_str(code),
            Finish::EarlyExit => f.write_str(EARLY_EXIT),
        }
    }
}

/// If `line` is the exit-code sentinel, return the code it carries.
pub fn parse_sentinel(line: &str) -> Option<String> {
    if !line.starts_with(EXIT_CODE_PREFIX) {
        return None;
    }
    let code = line
        .split_once(':')
        .map(|(_, code)| code.trim())
        .unwrap_or_default();
    Some(code.to_string())
}

pub fn sentinel_line(code: i32) -> String {
    format!("{EXIT_CODE_SENTINEL}{code}")
}

/// Wrap `command` so that its output inside an interactive shell is
/// bracketed by start/end markers and followed by the exit-code sentinel.
pub fn wrap_in_session(command: &str) -> String {
    format!(
        "printf '\\n{START_OF_OUTPUT}\\n\\n'; {command}; rc=$?; \
         printf '\\n{EXIT_CODE_SENTINEL}%d\\n{END_OF_OUTPUT}\\n' \"$rc\"\n"
    )
}

/// Tail-carrying line reassembler.
///
/// Bytes after the last terminator are held until the next chunk. Both
/// `\n` and `\r\n` terminate a line. Works on bytes so multi-byte UTF-8
/// sequences split across chunks are decoded whole.
#[derive(Debug, Default)]
pub struct LineSplitter {
    tail: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.tail.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.tail[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            lines.push(decode_line(&self.tail[start..end]));
            start = end + 1;
        }
        self.tail.drain(..start);
        lines
    }

    /// Flush a final unterminated fragment at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.tail.is_empty() {
            return None;
        }
        let line = decode_line(&self.tail);
        self.tail.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
