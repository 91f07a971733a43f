/// Integer encodings used by botnet arguments.
///
/// Old-style links carry plain decimal. Newnet links (eggdrop 1.x numeric
/// versions) carry channel numbers and stand-alone idx values in eggdrop's
/// own base-64: digits `A-Z a-z 0-9 [ ]`, most significant first, with zero
/// written as a single `A`. This is not RFC 4648 base64.
use std::fmt;

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789[]";

/// First numeric version that speaks newnet.
pub const NEWNET_MIN_VERSION: u32 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntError {
    #[error("empty integer")]
    Empty,
    #[error("invalid {encoding} digit {digit:?}")]
    BadDigit { encoding: IntEncoding, digit: char },
    #[error("integer {0:?} does not fit in 32 bits")]
    Overflow(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntEncoding {
    Decimal,
    NetBase64,
}

impl IntEncoding {
    /// Pick the encoding a peer speaks from its numeric `version`.
    pub fn for_version(numver: u32) -> Self {
        if numver >= NEWNET_MIN_VERSION {
            Self::NetBase64
        } else {
            Self::Decimal
        }
    }

    pub fn encode(self, value: u32) -> String {
        match self {
            Self::Decimal => value.to_string(),
            Self::NetBase64 => {
                if value == 0 {
                    return "A".into();
                }
                let mut digits = Vec::with_capacity(6);
                let mut v = value;
                while v > 0 {
                    digits.push(ALPHABET[(v & 0x3f) as usize]);
                    v >>= 6;
                }
                digits.iter().rev().map(|&b| b as char).collect()
            }
        }
    }

    pub fn decode(self, token: &str) -> Result<u32, IntError> {
        if token.is_empty() {
            return Err(IntError::Empty);
        }
        let mut acc: u64 = 0;
        for c in token.chars() {
            let digit = match self {
                Self::Decimal => c.to_digit(10),
                Self::NetBase64 => base64_digit(c),
            }
            .ok_or(IntError::BadDigit {
                encoding: self,
                digit: c,
            })?;
            let radix = match self {
                Self::Decimal => 10,
                Self::NetBase64 => 64,
            };
            acc = acc * radix + u64::from(digit);
            if acc > u64::from(u32::MAX) {
                return Err(IntError::Overflow(token.to_owned()));
            }
        }
        Ok(acc as u32)
    }
}

fn base64_digit(c: char) -> Option<u32> {
    match c {
        'A'..='Z' => Some(c as u32 - 'A' as u32),
        'a'..='z' => Some(c as u32 - 'a' as u32 + 26),
        '0'..='9' => Some(c as u32 - '0' as u32 + 52),
        '[' => Some(62),
        ']' => Some(63),
        _ => None,
    }
}

impl fmt::Display for IntEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decimal => f.write_str("decimal"),
            Self::NetBase64 => f.write_str("base64"),
        }
    }
}
