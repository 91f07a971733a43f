/// Index multiplexer: folds `(peer bot, local idx)` pairs into one idx space.
///
/// Every downstream bot that gets masked behind the fake handle still has
/// its own idx numbering, and those collide. Each peer gets a slot on first
/// sighting and owns the block `slot * block_size .. (slot + 1) * block_size`
/// of the fake bot's idx space. Slots are append-only for the lifetime of a
/// session, so an encoding handed out once always decodes the same way.
use std::collections::HashMap;
use std::num::NonZeroU32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MuxError {
    #[error("idx {idx} on {peer} does not fit a block of {block_size}")]
    IndexOverflow {
        peer: String,
        idx: u32,
        block_size: u32,
    },
    #[error("idx {muxed} points at slot {slot}, which no peer holds")]
    UnknownPeerSlot { muxed: u32, slot: usize },
    #[error("no idx space left for slot {slot} of {peer}")]
    NamespaceExhausted { peer: String, slot: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxConfig {
    pub block_size: NonZeroU32,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            block_size: NonZeroU32::new(0x80).unwrap_or(NonZeroU32::MIN),
        }
    }
}

/// Peer bot names in order of first appearance.
#[derive(Debug, Default, Clone)]
pub struct PeerTable {
    names: Vec<String>,
    slots: HashMap<String, usize>,
}

impl PeerTable {
    /// Slot for `peer`, assigning the next one if it is new.
    pub fn slot_for(&mut self, peer: &str) -> usize {
        if let Some(&slot) = self.slots.get(peer) {
            return slot;
        }
        let slot = self.names.len();
        self.names.push(peer.to_owned());
        self.slots.insert(peer.to_owned(), slot);
        slot
    }

    pub fn slot(&self, peer: &str) -> Option<usize> {
        self.slots.get(peer).copied()
    }

    pub fn peer(&self, slot: usize) -> Option<&str> {
        self.names.get(slot).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct IndexMux {
    table: PeerTable,
    config: MuxConfig,
}

impl IndexMux {
    pub fn new(config: MuxConfig) -> Self {
        Self {
            table: PeerTable::default(),
            config,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.config.block_size.get()
    }

    pub fn peers(&self) -> &PeerTable {
        &self.table
    }

    /// Make sure `peer` holds a slot before any idx traffic names it.
    pub fn register(&mut self, peer: &str) -> usize {
        self.table.slot_for(peer)
    }

    pub fn encode(&mut self, peer: &str, local_idx: u32) -> Result<u32, MuxError> {
        let block_size = self.block_size();
        if local_idx >= block_size {
            return Err(MuxError::IndexOverflow {
                peer: peer.to_owned(),
                idx: local_idx,
                block_size,
            });
        }
        let slot = self.table.slot_for(peer);
        u32::try_from(slot)
            .ok()
            .and_then(|s| s.checked_mul(block_size))
            .and_then(|base| base.checked_add(local_idx))
            .ok_or_else(|| MuxError::NamespaceExhausted {
                peer: peer.to_owned(),
                slot,
            })
    }

    pub fn decode(&self, muxed: u32) -> Result<(&str, u32), MuxError> {
        let block_size = self.block_size();
        let slot = (muxed / block_size) as usize;
        let local_idx = muxed % block_size;
        self.table
            .peer(slot)
            .map(|peer| (peer, local_idx))
            .ok_or(MuxError::UnknownPeerSlot { muxed, slot })
    }
}
