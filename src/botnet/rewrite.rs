/// Address rewriting between the downstream's real identities and the fake
/// identity presented to the uplink.
use super::address::Address;
use super::mux::{IndexMux, MuxError};

/// idx written in place of one that could not be multiplexed.
///
/// Far outside any block a realistic session assigns, so it cannot alias a
/// live connection of another peer.
pub const OVERFLOW_SENTINEL_IDX: u32 = i32::MAX as u32;

/// Who the relay is pretending to be, and who it is hiding.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Handle presented to the uplink.
    pub fake_handle: String,
    /// The downstream bot's own handle, once it has announced itself.
    pub real_handle: Option<String>,
    /// Mask every downstream bot, not just the one we are connected to.
    pub leaf_mode: bool,
}

impl Identity {
    pub fn new(fake_handle: impl Into<String>, leaf_mode: bool) -> Self {
        Self {
            fake_handle: fake_handle.into(),
            real_handle: None,
            leaf_mode,
        }
    }

    /// Whether traffic from `bot` goes upstream under the fake handle.
    pub fn masks(&self, bot: &str) -> bool {
        self.leaf_mode || self.real_handle.as_deref() == Some(bot)
    }
}

/// Rewrite an address seen in downstream traffic before it goes upstream.
///
/// On [`MuxError`] the caller decides how to degrade; see [`masked_sentinel`].
pub fn rewrite_outbound(
    addr: &Address,
    identity: &Identity,
    mux: &mut IndexMux,
) -> Result<Address, MuxError> {
    if !identity.masks(addr.bot()) {
        return Ok(addr.clone());
    }
    let masked = addr.with_bot(identity.fake_handle.as_str());
    match addr.idx() {
        Some(idx) => Ok(masked.with_idx(mux.encode(addr.bot(), idx)?)),
        None => Ok(masked),
    }
}

/// The fake-identity form of `addr` with its idx replaced by the sentinel.
pub fn masked_sentinel(addr: &Address, identity: &Identity) -> Address {
    addr.with_bot(identity.fake_handle.as_str())
        .with_idx(OVERFLOW_SENTINEL_IDX)
}

/// Rewrite an address seen in uplink traffic before it goes downstream.
///
/// Only addresses naming the fake handle are touched. An indexed one is
/// decoded back to the peer and idx it was multiplexed from; a bare one
/// becomes the real handle. On [`MuxError::UnknownPeerSlot`] the caller
/// passes the address through as received.
pub fn rewrite_inbound(
    addr: &Address,
    identity: &Identity,
    mux: &IndexMux,
) -> Result<Address, MuxError> {
    if addr.bot() != identity.fake_handle {
        return Ok(addr.clone());
    }
    match addr.idx() {
        Some(muxed) => {
            let (peer, idx) = mux.decode(muxed)?;
            Ok(addr.with_bot(peer).with_idx(idx))
        }
        None => Ok(match &identity.real_handle {
            Some(real) => addr.with_bot(real.as_str()),
            None => addr.clone(),
        }),
    }
}
