/// Botnet addresses: `bot`, `handle@bot` and `idx:handle@bot`.
///
/// The idx inside an address is always decimal, whatever integer encoding
/// the link negotiated.
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Bot { name: String },
    HandleAtBot { handle: String, bot: String },
    Indexed { idx: u32, handle: String, bot: String },
}

/// How much of an address to put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFormat {
    /// Everything present.
    Full,
    /// Drop the idx.
    HandleBot,
    /// Bot name only.
    BotOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address {0:?} has no bot")]
    EmptyBot(String),
    #[error("address {0:?} has a non-numeric idx")]
    BadIndex(String),
    #[error("address {0:?} has an idx but no handle")]
    IndexWithoutHandle(String),
}

/// A canonical decimal idx: digits only, no sign, no leading zero.
fn parse_idx(digits: &str) -> Option<u32> {
    let canonical = !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && (digits == "0" || !digits.starts_with('0'));
    if canonical {
        digits.parse().ok()
    } else {
        None
    }
}

impl Address {
    /// Parse an address token.
    ///
    /// Everything before the first `:` is the idx, everything before the
    /// first `@` after that is the handle, and the remainder is the bot.
    pub fn parse(token: &str) -> Result<Self, AddressError> {
        let (idx, rest) = match token.split_once(':') {
            Some((idx, rest)) => {
                let idx = parse_idx(idx).ok_or_else(|| AddressError::BadIndex(token.to_owned()))?;
                (Some(idx), rest)
            }
            None => (None, token),
        };

        let (handle, bot) = match rest.split_once('@') {
            Some((handle, bot)) => (Some(handle), bot),
            None => (None, rest),
        };

        if bot.is_empty() {
            return Err(AddressError::EmptyBot(token.to_owned()));
        }

        match (idx, handle) {
            (Some(idx), Some(handle)) => Ok(Self::Indexed {
                idx,
                handle: handle.to_owned(),
                bot: bot.to_owned(),
            }),
            (Some(_), None) => Err(AddressError::IndexWithoutHandle(token.to_owned())),
            (None, Some(handle)) => Ok(Self::HandleAtBot {
                handle: handle.to_owned(),
                bot: bot.to_owned(),
            }),
            (None, None) => Ok(Self::Bot {
                name: bot.to_owned(),
            }),
        }
    }

    pub fn bot(&self) -> &str {
        match self {
            Self::Bot { name } => name,
            Self::HandleAtBot { bot, .. } | Self::Indexed { bot, .. } => bot,
        }
    }

    pub fn handle(&self) -> Option<&str> {
        match self {
            Self::Bot { .. } => None,
            Self::HandleAtBot { handle, .. } | Self::Indexed { handle, .. } => Some(handle),
        }
    }

    pub fn idx(&self) -> Option<u32> {
        match self {
            Self::Indexed { idx, .. } => Some(*idx),
            _ => None,
        }
    }

    /// Same shape, different bot.
    pub fn with_bot(&self, bot: impl Into<String>) -> Self {
        let bot = bot.into();
        match self {
            Self::Bot { .. } => Self::Bot { name: bot },
            Self::HandleAtBot { handle, .. } => Self::HandleAtBot {
                handle: handle.clone(),
                bot,
            },
            Self::Indexed { idx, handle, .. } => Self::Indexed {
                idx: *idx,
                handle: handle.clone(),
                bot,
            },
        }
    }

    /// Same address with a new idx. No-op unless the address is indexed.
    pub fn with_idx(&self, idx: u32) -> Self {
        match self {
            Self::Indexed { handle, bot, .. } => Self::Indexed {
                idx,
                handle: handle.clone(),
                bot: bot.clone(),
            },
            other => other.clone(),
        }
    }

    pub fn render(&self, format: AddressFormat) -> String {
        match (self, format) {
            (Self::Indexed { idx, handle, bot }, AddressFormat::Full) => {
                format!("{idx}:{handle}@{bot}")
            }
            (Self::Indexed { handle, bot, .. }, AddressFormat::HandleBot)
            | (Self::HandleAtBot { handle, bot }, AddressFormat::Full)
            | (Self::HandleAtBot { handle, bot }, AddressFormat::HandleBot) => {
                format!("{handle}@{bot}")
            }
            (addr, _) => addr.bot().to_owned(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(AddressFormat::Full))
    }
}
