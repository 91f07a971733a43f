/// Opcode dispatch tables and the field-driven rewrite engine.
///
/// Each opcode maps to a [`Rule`]. Most rules are a list of [`Field`]s, one
/// per argument position, telling the engine which tokens are addresses or
/// idx values and which are copied verbatim. Opcodes missing from a table
/// are forwarded untouched.
use std::collections::HashMap;

use tracing::warn;

use super::address::Address;
use super::intenc::IntEncoding;
use super::line::Line;
use super::mux::{IndexMux, MuxError};
use super::rewrite::{self, Identity, OVERFLOW_SENTINEL_IDX};

/// Which way a line travels through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Downstream bot → uplink.
    Outbound,
    /// Uplink → downstream bot.
    Inbound,
}

/// A one-character flag glued to the front of a token (`*12`, `!neph`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    None,
    Always,
    Optional(char),
}

impl Prefix {
    fn split(self, token: &str) -> (&str, &str) {
        match self {
            Prefix::None => ("", token),
            Prefix::Always => match token.chars().next() {
                Some(c) => token.split_at(c.len_utf8()),
                None => ("", ""),
            },
            Prefix::Optional(c) if token.starts_with(c) => token.split_at(c.len_utf8()),
            Prefix::Optional(_) => ("", token),
        }
    }
}

/// How one argument position is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Replaced with a fixed token.
    Literal(&'static str),
    /// Copied verbatim.
    Str,
    /// An integer in the link's encoding; checked, copied verbatim.
    Int,
    /// A `bot`, `handle@bot` or `idx:handle@bot` token.
    Address(Prefix),
    /// A stand-alone idx (link encoding) belonging to the bot named in
    /// argument `owner`.
    Index { owner: usize, prefix: Prefix },
    /// This and every later argument are free text.
    Rest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    Rewrite(Vec<Field>),
    /// Dropped, never forwarded.
    Swallow,
    /// `thisbot`: the sender names itself. Handled by the session.
    ThisBot,
    /// `nlinked`: a bot joined behind the sender. Handled by the session.
    NewLink,
}

/// Everything the engine needs besides the line itself.
pub struct RewriteContext<'a> {
    pub identity: &'a Identity,
    pub mux: &'a mut IndexMux,
    pub encoding: IntEncoding,
}

#[derive(Debug, Clone)]
pub struct OpcodeTable {
    direction: Direction,
    rules: HashMap<String, Rule>,
}

impl OpcodeTable {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            rules: HashMap::new(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Install `rule` under every spelling in `opcodes`.
    pub fn insert(&mut self, opcodes: &[&str], rule: Rule) {
        for op in opcodes {
            self.rules.insert(op.to_ascii_lowercase(), rule.clone());
        }
    }

    pub fn rule(&self, opcode: &str) -> Option<&Rule> {
        self.rules.get(opcode)
    }

    /// Rules for lines from the downstream bot on their way upstream.
    pub fn outbound() -> Self {
        use Field::*;
        let mut t = Self::new(Direction::Outbound);
        // actchan <handle@bot> <chan> <text>
        t.insert(&["a", "actchan"], Rule::Rewrite(vec![Address(Prefix::None), Int, Rest]));
        // away <bot> <idx> [text]
        t.insert(&["aw", "away"], Rule::Rewrite(vec![
            Address(Prefix::None),
            Index { owner: 0, prefix: Prefix::None },
            Rest,
        ]));
        // chan <handle@bot> <chan> <text>
        t.insert(&["c", "chan"], Rule::Rewrite(vec![Address(Prefix::None), Int, Rest]));
        // chat <bot> <text>
        t.insert(&["ct", "chat"], Rule::Rewrite(vec![Address(Prefix::None), Rest]));
        // idle <bot> <idx> <seconds>
        t.insert(&["i", "idle"], Rule::Rewrite(vec![
            Address(Prefix::None),
            Index { owner: 0, prefix: Prefix::None },
            Rest,
        ]));
        // info? <idx:handle@bot>
        t.insert(&["i?", "info?"], Rule::Rewrite(vec![Address(Prefix::None), Rest]));
        // join [!]<bot> <handle> <chan> <flag><idx> <user@host>
        t.insert(&["j", "join"], Rule::Rewrite(vec![
            Address(Prefix::Optional('!')),
            Str,
            Int,
            Index { owner: 0, prefix: Prefix::Always },
            Rest,
        ]));
        // motd [#]<idx:handle@bot> <targetbot>
        t.insert(&["m", "motd"], Rule::Rewrite(vec![Address(Prefix::Optional('#')), Rest]));
        t.insert(&["n", "nlinked"], Rule::NewLink);
        // priv <from> <to> <text>
        t.insert(&["p", "priv"], Rule::Rewrite(vec![Address(Prefix::None), Rest]));
        // part <bot> <handle> <idx> [reason]
        t.insert(&["pt", "part"], Rule::Rewrite(vec![
            Address(Prefix::None),
            Str,
            Index { owner: 0, prefix: Prefix::None },
            Rest,
        ]));
        // reject <handle@bot> <dest> <reason>
        t.insert(&["r", "reject"], Rule::Rewrite(vec![Address(Prefix::None), Rest]));
        t.insert(&["starttls"], Rule::Swallow);
        // trace <idx:handle@bot> <dest> <route>
        t.insert(&["t", "trace"], Rule::Rewrite(vec![Address(Prefix::None), Rest]));
        t.insert(&["tb", "thisbot"], Rule::ThisBot);
        // unlinked <bot> <reason>
        t.insert(&["un", "unlinked"], Rule::Rewrite(vec![Address(Prefix::None), Rest]));
        // version <numver> <handlen> <agent...>
        t.insert(&["v", "version"], Rule::Rewrite(vec![Str, Literal("9"), Rest]));
        // who <idx:handle@bot> <dest> <chan>
        t.insert(&["w", "who"], Rule::Rewrite(vec![Address(Prefix::None), Rest]));
        t
    }

    /// Rules for lines from the uplink on their way downstream.
    pub fn inbound() -> Self {
        use Field::*;
        let to_us = Rule::Rewrite(vec![Str, Address(Prefix::None), Rest]);
        let mut t = Self::new(Direction::Inbound);
        t.insert(&["m", "motd"], to_us.clone());
        t.insert(&["p", "priv"], to_us.clone());
        t.insert(&["r", "reject"], to_us.clone());
        t.insert(&["t", "trace"], to_us.clone());
        // traced <idx:handle@bot> <route>
        t.insert(&["td", "traced"], Rule::Rewrite(vec![Address(Prefix::None), Rest]));
        t.insert(&["v", "version"], Rule::Rewrite(vec![Str, Literal("32"), Rest]));
        t.insert(&["w", "who"], to_us.clone());
        t.insert(&["z", "zapf"], to_us);
        t
    }

    /// Apply `fields` to `line` in this table's direction.
    pub fn rewrite(&self, line: &Line, fields: &[Field], ctx: &mut RewriteContext<'_>) -> Line {
        let opcode = line.opcode();
        let mut args = line.args.clone();

        for (pos, field) in fields.iter().enumerate() {
            let Some(token) = line.args.get(pos) else {
                break;
            };
            match *field {
                Field::Rest => break,
                Field::Str => {}
                Field::Literal(value) => args[pos] = value.to_owned(),
                Field::Int => {
                    if let Err(e) = ctx.encoding.decode(token) {
                        warn!(%opcode, pos, "integer argument {token:?}: {e}");
                    }
                }
                Field::Address(prefix) => {
                    let (flag, body) = prefix.split(token);
                    match Address::parse(body) {
                        Ok(addr) => {
                            let new = self.rewrite_address(&opcode, &addr, ctx);
                            args[pos] = format!("{flag}{new}");
                        }
                        Err(e) => warn!(%opcode, pos, "passing address through: {e}"),
                    }
                }
                Field::Index { owner, prefix } => {
                    let owner_bot = line
                        .args
                        .get(owner)
                        .and_then(|tok| owner_address(fields.get(owner), tok));
                    let Some(owner_bot) = owner_bot else {
                        warn!(%opcode, pos, "idx without a readable owner bot");
                        continue;
                    };
                    let (flag, body) = prefix.split(token);
                    match self.direction {
                        Direction::Outbound => {
                            if let Some(idx) = rewrite_index_outbound(&opcode, &owner_bot, body, ctx) {
                                args[pos] = format!("{flag}{idx}");
                            }
                        }
                        Direction::Inbound => {
                            if let Some((peer, idx)) = rewrite_index_inbound(&opcode, &owner_bot, body, ctx) {
                                args[pos] = format!("{flag}{idx}");
                                let owner_prefix = match fields.get(owner) {
                                    Some(Field::Address(p)) => *p,
                                    _ => Prefix::None,
                                };
                                let (owner_flag, _) = owner_prefix.split(&line.args[owner]);
                                args[owner] = format!("{owner_flag}{}", owner_bot.with_bot(peer));
                            }
                        }
                    }
                }
            }
        }

        Line {
            verb: line.verb.clone(),
            args,
            charset: line.charset,
        }
    }

    fn rewrite_address(&self, opcode: &str, addr: &Address, ctx: &mut RewriteContext<'_>) -> Address {
        match self.direction {
            Direction::Outbound => match rewrite::rewrite_outbound(addr, ctx.identity, ctx.mux) {
                Ok(new) => new,
                Err(e) => {
                    warn!(%opcode, %addr, "{e}; idx replaced with {OVERFLOW_SENTINEL_IDX}");
                    rewrite::masked_sentinel(addr, ctx.identity)
                }
            },
            Direction::Inbound => match rewrite::rewrite_inbound(addr, ctx.identity, ctx.mux) {
                Ok(new) => new,
                Err(e) => {
                    warn!(%opcode, %addr, "{e}; passing address through");
                    addr.clone()
                }
            },
        }
    }
}

/// The pair of tables a session dispatches through.
#[derive(Debug, Clone)]
pub struct Tables {
    pub outbound: OpcodeTable,
    pub inbound: OpcodeTable,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            outbound: OpcodeTable::outbound(),
            inbound: OpcodeTable::inbound(),
        }
    }
}

impl Tables {
    pub fn for_direction(&self, direction: Direction) -> &OpcodeTable {
        match direction {
            Direction::Outbound => &self.outbound,
            Direction::Inbound => &self.inbound,
        }
    }
}

/// The address in an owner argument, with its flag stripped.
fn owner_address(field: Option<&Field>, token: &str) -> Option<Address> {
    let prefix = match field {
        Some(Field::Address(p)) => *p,
        _ => Prefix::None,
    };
    Address::parse(prefix.split(token).1).ok()
}

fn rewrite_index_outbound(
    opcode: &str,
    owner: &Address,
    token: &str,
    ctx: &mut RewriteContext<'_>,
) -> Option<String> {
    if !ctx.identity.masks(owner.bot()) {
        return None;
    }
    let local = match ctx.encoding.decode(token) {
        Ok(v) => v,
        Err(e) => {
            warn!(%opcode, bot = owner.bot(), "idx {token:?}: {e}");
            return None;
        }
    };
    let muxed = match ctx.mux.encode(owner.bot(), local) {
        Ok(v) => v,
        Err(e @ MuxError::IndexOverflow { .. }) | Err(e @ MuxError::NamespaceExhausted { .. }) => {
            warn!(%opcode, "{e}; idx replaced with {OVERFLOW_SENTINEL_IDX}");
            OVERFLOW_SENTINEL_IDX
        }
        Err(e) => {
            warn!(%opcode, "{e}");
            return None;
        }
    };
    Some(ctx.encoding.encode(muxed))
}

fn rewrite_index_inbound(
    opcode: &str,
    owner: &Address,
    token: &str,
    ctx: &mut RewriteContext<'_>,
) -> Option<(String, String)> {
    if owner.bot() != ctx.identity.fake_handle {
        return None;
    }
    let muxed = match ctx.encoding.decode(token) {
        Ok(v) => v,
        Err(e) => {
            warn!(%opcode, "idx {token:?}: {e}");
            return None;
        }
    };
    match ctx.mux.decode(muxed) {
        Ok((peer, local)) => Some((peer.to_owned(), ctx.encoding.encode(local))),
        Err(e) => {
            warn!(%opcode, "{e}; passing idx through");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::botnet::mux::MuxConfig;
    use pretty_assertions::assert_eq;

    struct Fixture {
        identity: Identity,
        mux: IndexMux,
        encoding: IntEncoding,
    }

    impl Fixture {
        fn new(leaf_mode: bool) -> Self {
            let mut mux = IndexMux::new(MuxConfig::default());
            mux.register("realbot");
            Self {
                identity: Identity {
                    fake_handle: "defense".into(),
                    real_handle: Some("realbot".into()),
                    leaf_mode,
                },
                mux,
                encoding: IntEncoding::NetBase64,
            }
        }

        fn run(&mut self, table: &OpcodeTable, raw: &str) -> String {
            let line = Line::split(raw).unwrap();
            let fields = match table.rule(&line.opcode()) {
                Some(Rule::Rewrite(fields)) => fields.clone(),
                None => return raw.to_owned(),
                Some(other) => panic!("not a rewrite rule: {other:?}"),
            };
            let mut ctx = RewriteContext {
                identity: &self.identity,
                mux: &mut self.mux,
                encoding: self.encoding,
            };
            table.rewrite(&line, &fields, &mut ctx).to_wire()
        }
    }

    // ── Table contents ───────────────────────────────────────────

    #[test]
    fn aliases_share_rules() {
        let out = OpcodeTable::outbound();
        assert_eq!(out.rule("c"), out.rule("chan"));
        assert_eq!(out.rule("tb"), Some(&Rule::ThisBot));
        assert_eq!(out.rule("thisbot"), Some(&Rule::ThisBot));
        assert_eq!(out.rule("nlinked"), Some(&Rule::NewLink));
        assert_eq!(out.rule("starttls"), Some(&Rule::Swallow));
        assert_eq!(out.direction(), Direction::Outbound);
        assert_eq!(OpcodeTable::inbound().direction(), Direction::Inbound);
    }

    #[test]
    fn tables_accept_new_opcodes() {
        let mut t = OpcodeTable::new(Direction::Outbound);
        t.insert(&["XC"], Rule::Rewrite(vec![Field::Address(Prefix::None)]));
        assert!(t.rule("xc").is_some());
    }

    // ── Outbound ─────────────────────────────────────────────────

    #[test]
    fn chan_line_is_masked_and_muxed() {
        let mut f = Fixture::new(true);
        let table = OpcodeTable::outbound();
        assert_eq!(
            f.run(&table, "c 3:grawity@realbot A hello world"),
            "c 3:grawity@defense A hello world"
        );
        assert_eq!(
            f.run(&table, "c 3:grawity@leaf2 A hello  world"),
            "c 131:grawity@defense A hello  world"
        );
    }

    #[test]
    fn idle_encodes_standalone_idx() {
        let mut f = Fixture::new(true);
        f.mux.register("leaf2");
        let table = OpcodeTable::outbound();
        // leaf2 holds slot 1: 128 + 5 = 133 = "CF".
        assert_eq!(f.run(&table, "i leaf2 F 30"), "i defense CF 30");
    }

    #[test]
    fn join_keeps_flags() {
        let mut f = Fixture::new(false);
        let table = OpcodeTable::outbound();
        assert_eq!(
            f.run(&table, "j !realbot grawity A *D grawity@host.example"),
            "j !defense grawity A *D grawity@host.example"
        );
    }

    #[test]
    fn part_in_leaf_mode_muxes_idx() {
        let mut f = Fixture::new(true);
        let table = OpcodeTable::outbound();
        assert_eq!(f.run(&table, "pt leaf2 grawity D bye"), "pt defense grawity CD bye");
    }

    #[test]
    fn unmasked_bot_passes_through() {
        let mut f = Fixture::new(false);
        let table = OpcodeTable::outbound();
        for raw in [
            "c 3:grawity@leaf2 A hi",
            "i leaf2 F 30",
            "pt leaf2 grawity D",
            "w 8:grawity@leaf2 hub A",
        ] {
            assert_eq!(f.run(&table, raw), raw);
        }
    }

    #[test]
    fn motd_with_and_without_flag() {
        let mut f = Fixture::new(false);
        let table = OpcodeTable::outbound();
        assert_eq!(f.run(&table, "m #8:grawity@realbot hub"), "m #8:grawity@defense hub");
        assert_eq!(f.run(&table, "m 8:grawity@realbot hub"), "m 8:grawity@defense hub");
    }

    #[test]
    fn overflowing_idx_becomes_sentinel() {
        let mut f = Fixture::new(true);
        let table = OpcodeTable::outbound();
        assert_eq!(
            f.run(&table, "w 200:grawity@realbot hub A"),
            format!("w {OVERFLOW_SENTINEL_IDX}:grawity@defense hub A")
        );
        let sentinel = IntEncoding::NetBase64.encode(OVERFLOW_SENTINEL_IDX);
        assert_eq!(f.run(&table, "i realbot DI 5"), format!("i defense {sentinel} 5"));
    }

    #[test]
    fn version_handlen_is_pinned() {
        let mut f = Fixture::new(true);
        assert_eq!(
            f.run(&OpcodeTable::outbound(), "version 1080003 32 eggdrop v1.8.0"),
            "version 1080003 9 eggdrop v1.8.0"
        );
        assert_eq!(
            f.run(&OpcodeTable::inbound(), "version 1080003 9 eggdrop v1.8.0"),
            "version 1080003 32 eggdrop v1.8.0"
        );
    }

    #[test]
    fn malformed_address_is_left_alone() {
        let mut f = Fixture::new(true);
        let table = OpcodeTable::outbound();
        assert_eq!(f.run(&table, "c x:y@ A hi"), "c x:y@ A hi");
    }

    #[test]
    fn short_lines_are_tolerated() {
        let mut f = Fixture::new(true);
        let table = OpcodeTable::outbound();
        assert_eq!(f.run(&table, "j realbot"), "j defense");
        assert_eq!(f.run(&table, "i?"), "i?");
    }

    #[test]
    fn outbound_masking_rules() {
        let mut f = Fixture::new(true);
        f.mux.register("leaf2");
        let table = OpcodeTable::outbound();
        for (raw, want) in [
            ("a 3:grawity@leaf2 A waves", "a 131:grawity@defense A waves"),
            ("actchan 3:grawity@realbot B waves", "actchan 3:grawity@defense B waves"),
            ("aw leaf2 D gone fishing", "aw defense CD gone fishing"),
            ("away realbot D", "away defense D"),
            ("i? 5:grawity@realbot", "i? 5:grawity@defense"),
            ("r 3:grawity@leaf2 1:bob@hub no thanks", "r 131:grawity@defense 1:bob@hub no thanks"),
            ("t 3:grawity@leaf2 hub :realbot", "t 131:grawity@defense hub :realbot"),
            ("un leaf2 lost connection", "un defense lost connection"),
            ("unlinked realbot bye", "unlinked defense bye"),
        ] {
            assert_eq!(f.run(&table, raw), want, "{raw}");
        }
    }

    #[test]
    fn unknown_opcode_is_verbatim() {
        let mut f = Fixture::new(true);
        assert_eq!(
            f.run(&OpcodeTable::outbound(), "s u? realbot stuff"),
            "s u? realbot stuff"
        );
    }

    // ── Inbound ──────────────────────────────────────────────────

    #[test]
    fn priv_to_muxed_idx_is_decoded() {
        let mut f = Fixture::new(true);
        f.mux.register("leaf2");
        let table = OpcodeTable::inbound();
        assert_eq!(
            f.run(&table, "p 1:bob@hub 131:grawity@defense hi there"),
            "p 1:bob@hub 3:grawity@leaf2 hi there"
        );
    }

    #[test]
    fn who_to_fake_bot_goes_to_real_bot() {
        let mut f = Fixture::new(false);
        assert_eq!(
            f.run(&OpcodeTable::inbound(), "w 1:bob@hub defense A"),
            "w 1:bob@hub realbot A"
        );
    }

    #[test]
    fn inbound_destination_rules() {
        let mut f = Fixture::new(true);
        f.mux.register("leaf2");
        let table = OpcodeTable::inbound();
        for (raw, want) in [
            ("td 131:grawity@defense :hub:defense", "td 3:grawity@leaf2 :hub:defense"),
            ("traced 3:grawity@defense :hub", "traced 3:grawity@realbot :hub"),
            ("t 1:bob@hub 131:grawity@defense :hub", "t 1:bob@hub 3:grawity@leaf2 :hub"),
            ("r 1:bob@hub 3:grawity@defense not now", "r 1:bob@hub 3:grawity@realbot not now"),
            ("z hub defense assoc 1 x", "z hub realbot assoc 1 x"),
            ("zapf hub 131:grawity@defense share", "zapf hub 3:grawity@leaf2 share"),
            ("m 1:bob@hub 131:grawity@defense", "m 1:bob@hub 3:grawity@leaf2"),
            // Addresses of other bots are never decoded.
            ("td 131:grawity@hub :hub", "td 131:grawity@hub :hub"),
            ("t 1:bob@hub 131:grawity@leaf9 :hub", "t 1:bob@hub 131:grawity@leaf9 :hub"),
        ] {
            assert_eq!(f.run(&table, raw), want, "{raw}");
        }
    }

    #[test]
    fn inbound_unknown_slot_passes_through() {
        let mut f = Fixture::new(true);
        assert_eq!(
            f.run(&OpcodeTable::inbound(), "p 1:bob@hub 900:grawity@defense hi"),
            "p 1:bob@hub 900:grawity@defense hi"
        );
    }

    #[test]
    fn inbound_index_field_restores_owner() {
        let mut f = Fixture::new(true);
        f.mux.register("leaf2");
        let mut table = OpcodeTable::new(Direction::Inbound);
        table.insert(&["i"], Rule::Rewrite(vec![
            Field::Address(Prefix::None),
            Field::Index { owner: 0, prefix: Prefix::None },
            Field::Rest,
        ]));
        assert_eq!(f.run(&table, "i defense CD 30"), "i leaf2 D 30");
    }
}
