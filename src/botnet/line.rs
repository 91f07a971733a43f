/// Botnet line parsing and serialization.
///
/// The eggdrop botnet protocol is a flat token stream:
///   opcode SPACE arg SPACE arg ...
///
/// There is no quoting and no trailing-parameter marker. Chat-like opcodes
/// carry free text as their last arguments; it survives because splitting
/// and joining both work on single spaces, so every run of spaces is kept.
///
/// Lines end in LF on the wire (CRLF is accepted on input), but parsing
/// operates on the content without the terminator.
///
/// Partyline text is whatever bytes the users typed. A line that is not
/// valid UTF-8 is read one char per byte (ISO-8859-1) and written back the
/// same way, so relayed bytes come out exactly as they went in.
use std::fmt;

/// How a line's text maps to wire bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Charset {
    #[default]
    Utf8,
    /// One char per byte, U+0000..=U+00FF.
    Latin1,
}

/// A parsed botnet line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// The opcode exactly as received (e.g. `c`, `tb`, `thisbot`).
    pub verb: String,
    /// Arguments in order. Empty strings stand for doubled spaces.
    pub args: Vec<String>,
    pub charset: Charset,
}

/// Errors that can occur during line parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LineError {
    #[error("malformed line: empty")]
    Empty,
    #[error("malformed line: no opcode before first space")]
    MissingVerb,
}

impl Line {
    pub fn new(verb: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            verb: verb.into(),
            args,
            charset: Charset::Utf8,
        }
    }

    /// Parse a line as it came off the wire, terminator already removed.
    pub fn decode(raw: &[u8]) -> Result<Self, LineError> {
        match std::str::from_utf8(raw) {
            Ok(text) => Self::split(text),
            Err(_) => {
                let text: String = raw.iter().copied().map(char::from).collect();
                let mut line = Self::split(&text)?;
                line.charset = Charset::Latin1;
                Ok(line)
            }
        }
    }

    /// Split a raw line into opcode and arguments.
    ///
    /// Trailing CR/LF is stripped first.
    pub fn split(raw: &str) -> Result<Self, LineError> {
        let raw = raw.trim_end_matches(['\r', '\n']);

        if raw.is_empty() {
            return Err(LineError::Empty);
        }

        let mut tokens = raw.split(' ');
        let verb = tokens.next().unwrap_or_default();
        if verb.is_empty() {
            return Err(LineError::MissingVerb);
        }

        Ok(Line {
            verb: verb.to_owned(),
            args: tokens.map(str::to_owned).collect(),
            charset: Charset::Utf8,
        })
    }

    /// The dispatch key: the opcode, lowercased.
    pub fn opcode(&self) -> String {
        self.verb.to_ascii_lowercase()
    }

    /// Argument at `pos`, if present.
    pub fn arg(&self, pos: usize) -> Option<&str> {
        self.args.get(pos).map(String::as_str)
    }

    /// All arguments from `pos` on, rejoined with single spaces.
    pub fn rest(&self, pos: usize) -> String {
        self.args.get(pos..).map(|a| a.join(" ")).unwrap_or_default()
    }

    /// Serialize to the wire format (without the line terminator).
    pub fn to_wire(&self) -> String {
        let mut out = String::with_capacity(
            self.verb.len() + self.args.iter().map(|a| a.len() + 1).sum::<usize>(),
        );
        out.push_str(&self.verb);
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }

    /// Serialize to the wire format, LF-terminated.
    pub fn join(&self) -> String {
        let mut out = self.to_wire();
        out.push('\n');
        out
    }

    /// The wire bytes of this line (without the terminator), in its charset.
    pub fn to_bytes(&self) -> Vec<u8> {
        let wire = self.to_wire();
        match self.charset {
            Charset::Utf8 => wire.into_bytes(),
            Charset::Latin1 => {
                let mut out = Vec::with_capacity(wire.len());
                for c in wire.chars() {
                    match u8::try_from(c) {
                        Ok(b) => out.push(b),
                        // Only text we inserted can fall outside the byte range.
                        Err(_) => out.extend_from_slice(c.encode_utf8(&mut [0; 4]).as_bytes()),
                    }
                }
                out
            }
        }
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}
