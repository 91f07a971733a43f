/// Relay session: one downstream bot, one uplink, one masked identity.
///
/// The session logs in to the uplink under the fake handle, greets the
/// downstream bot, and then forwards lines both ways through the opcode
/// tables. Both streams are serviced from a single task, so the index
/// multiplexer needs no lock. Dropping the session closes both sockets.
use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use futures::SinkExt;
use md5::{Digest, Md5};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::codec::{CodecError, LineCodec};
use super::config::{EncodingMode, SessionConfig};
use super::dispatch::{Direction, RewriteContext, Rule, Tables};
use super::error::{RelayError, Side};
use super::intenc::IntEncoding;
use super::line::Line;
use super::mux::IndexMux;
use super::rewrite::Identity;

/// Uplink greeting sent when access is granted, with or without a password.
const HELLO: &str = "*hello!";
const BADPASS: &str = "badpass";
const NO_ACCESS: &str = "You don't have access.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    AwaitingChallenge,
    Authenticating,
    Linking,
    Relaying,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Connecting => "connecting",
            Phase::AwaitingChallenge => "awaiting challenge",
            Phase::Authenticating => "authenticating",
            Phase::Linking => "linking",
            Phase::Relaying => "relaying",
            Phase::Closed => "closed",
        })
    }
}

/// Why a session that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    DownstreamClosed,
    UpstreamClosed,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseReason::DownstreamClosed => "downstream closed",
            CloseReason::UpstreamClosed => "uplink closed",
            CloseReason::Shutdown => "shutdown",
        })
    }
}

/// What happens to a line after dispatch.
enum Verdict {
    Forward(Line),
    Discard,
}

pub struct Session<D, U> {
    downstream: Framed<D, LineCodec>,
    upstream: Framed<U, LineCodec>,
    config: Arc<SessionConfig>,
    tables: Tables,
    identity: Identity,
    mux: IndexMux,
    encoding: IntEncoding,
    encoding_settled: bool,
    phase: Phase,
    /// The downstream bot has sent its handle line.
    greeted: bool,
    last_outbound: Instant,
    /// When the oldest unanswered relay ping went out.
    ping_sent: Option<Instant>,
    pings_outstanding: u32,
    pong_warned: bool,
    /// Pings from the downstream bot still waiting for the uplink's pong.
    downstream_pings: u32,
}

impl<D, U> Session<D, U>
where
    D: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(downstream: D, upstream: U, config: Arc<SessionConfig>) -> Self {
        let (encoding, encoding_settled) = match config.encoding {
            EncodingMode::Auto => (IntEncoding::NetBase64, false),
            EncodingMode::Fixed(encoding) => (encoding, true),
        };
        Self {
            downstream: Framed::new(downstream, LineCodec::new()),
            upstream: Framed::new(upstream, LineCodec::new()),
            identity: Identity::new(config.fake_handle.as_str(), config.leaf_mode),
            mux: IndexMux::new(config.mux),
            tables: Tables::default(),
            config,
            encoding,
            encoding_settled,
            phase: Phase::Connecting,
            greeted: false,
            last_outbound: Instant::now(),
            ping_sent: None,
            pings_outstanding: 0,
            pong_warned: false,
            downstream_pings: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn mux(&self) -> &IndexMux {
        &self.mux
    }

    pub fn encoding(&self) -> IntEncoding {
        self.encoding
    }

    /// Log in, relay until either side goes away, and close.
    ///
    /// Sending `true` on `shutdown` ends the session with
    /// [`CloseReason::Shutdown`] at any phase.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<CloseReason, RelayError> {
        let result = tokio::select! {
            r = self.drive() => r,
            _ = shutdown_requested(&mut shutdown) => Ok(CloseReason::Shutdown),
        };
        let phase = self.phase;
        self.phase = Phase::Closed;
        match &result {
            Ok(reason) => info!(%phase, %reason, "session closed"),
            Err(e) => warn!(%phase, "session failed: {e}"),
        }
        result
    }

    async fn drive(&mut self) -> Result<CloseReason, RelayError> {
        self.login().await?;
        self.relay().await
    }

    /// Present the fake handle to the uplink and answer its password prompt.
    ///
    /// Returns once the uplink has accepted the link; the session is then
    /// in [`Phase::Linking`].
    pub async fn login(&mut self) -> Result<(), RelayError> {
        let handle = Line::new(self.config.fake_handle.as_str(), Vec::new());
        self.send_upstream(handle).await?;
        self.enter(Phase::AwaitingChallenge);

        let challenge = loop {
            let raw = self.recv_upstream().await?;
            let raw = String::from_utf8_lossy(&raw);
            if raw == NO_ACCESS {
                return Err(self.rejected(format!(
                    "{} is not known to the uplink",
                    self.config.fake_handle
                )));
            }
            if raw.ends_with('\x01') {
                return Err(self.rejected(format!(
                    "{} lacks the +b flag on the uplink",
                    self.config.fake_handle
                )));
            }
            if raw == HELLO {
                info!("uplink skipped authentication");
                self.enter(Phase::Linking);
                return Ok(());
            }
            match Line::split(&raw) {
                Ok(line) if line.opcode() == "passreq" => break line.rest(0),
                _ => debug!("<-- {raw:?} (ignored before password prompt)"),
            }
        };

        self.enter(Phase::Authenticating);
        let reply = if challenge.is_empty() {
            info!("authenticating (plain)");
            auth_reply(None, &self.config.password)
        } else {
            info!("authenticating (MD5)");
            auth_reply(Some(&challenge), &self.config.password)
        };
        self.send_upstream(reply).await?;

        let raw = self.recv_upstream().await?;
        let raw = String::from_utf8_lossy(&raw);
        match &*raw {
            HELLO => {
                self.enter(Phase::Linking);
                Ok(())
            }
            BADPASS => Err(self.rejected("password rejected".into())),
            _ => Err(RelayError::Protocol {
                side: Side::Upstream,
                phase: self.phase,
                line: raw.into_owned(),
            }),
        }
    }

    /// Forward lines both ways until a side closes or fails.
    pub async fn relay(&mut self) -> Result<CloseReason, RelayError> {
        loop {
            let keepalive_at = self.last_outbound + self.config.keepalive;
            let relaying = self.phase == Phase::Relaying;

            tokio::select! {
                frame = self.downstream.next() => match frame {
                    Some(Ok(raw)) => self.on_downstream(raw).await?,
                    Some(Err(source)) => return Err(self.transport(Side::Downstream, source)),
                    None => return Ok(CloseReason::DownstreamClosed),
                },
                frame = self.upstream.next() => match frame {
                    Some(Ok(raw)) => self.on_upstream(raw).await?,
                    Some(Err(source)) => return Err(self.transport(Side::Upstream, source)),
                    None => return Ok(CloseReason::UpstreamClosed),
                },
                _ = tokio::time::sleep_until(keepalive_at), if relaying => {
                    self.keepalive().await?;
                }
            }
        }
    }

    async fn on_downstream(&mut self, raw: BytesMut) -> Result<(), RelayError> {
        let line = match Line::decode(&raw) {
            Ok(line) => line,
            Err(e) => {
                warn!(side = %Side::Downstream, "{e}; dropping line");
                return Ok(());
            }
        };

        if !self.greeted {
            return self.greet(line).await;
        }

        match self.dispatch(Direction::Outbound, line) {
            Verdict::Forward(out) => {
                debug!("--> {out}");
                self.send_upstream(out).await
            }
            Verdict::Discard => {
                debug!("--x {}", String::from_utf8_lossy(&raw));
                Ok(())
            }
        }
    }

    async fn on_upstream(&mut self, raw: BytesMut) -> Result<(), RelayError> {
        let line = match Line::decode(&raw) {
            Ok(line) => line,
            Err(e) => {
                warn!(side = %Side::Upstream, "{e}; dropping line");
                return Ok(());
            }
        };

        match self.dispatch(Direction::Inbound, line) {
            Verdict::Forward(out) => {
                debug!("<-- {out}");
                self.downstream
                    .send(out)
                    .await
                    .map_err(|source| self.transport(Side::Downstream, source))
            }
            Verdict::Discard => {
                debug!("--x {}", String::from_utf8_lossy(&raw));
                Ok(())
            }
        }
    }

    /// The downstream bot's opening line is its handle.
    async fn greet(&mut self, line: Line) -> Result<(), RelayError> {
        let handle = line.verb;
        info!(real_handle = %handle, "downstream bot introduced itself");
        self.mux.register(&handle);
        self.identity.real_handle = Some(handle);
        self.greeted = true;
        self.downstream
            .send(Line::new(HELLO, Vec::new()))
            .await
            .map_err(|source| self.transport(Side::Downstream, source))
    }

    fn dispatch(&mut self, direction: Direction, line: Line) -> Verdict {
        let opcode = line.opcode();

        match (direction, opcode.as_str()) {
            (Direction::Outbound, "pi" | "ping") => {
                self.downstream_pings = self.downstream_pings.saturating_add(1);
            }
            // Pongs carry no id; the bot's own pings are answered first.
            (Direction::Inbound, "po" | "pong") if self.downstream_pings > 0 => {
                self.downstream_pings -= 1;
            }
            (Direction::Inbound, "po" | "pong") if self.pings_outstanding > 0 => {
                self.pings_outstanding -= 1;
                if self.pings_outstanding == 0 {
                    self.ping_sent = None;
                    self.pong_warned = false;
                }
                return Verdict::Discard;
            }
            (Direction::Inbound, "v" | "version") => self.settle_encoding(&line),
            (Direction::Inbound, "el") if self.phase == Phase::Linking => {
                self.enter(Phase::Relaying)
            }
            _ => {}
        }

        let table = self.tables.for_direction(direction);
        match table.rule(&opcode) {
            None => Verdict::Forward(line),
            Some(Rule::Swallow) => Verdict::Discard,
            Some(Rule::Rewrite(fields)) => {
                let mut ctx = RewriteContext {
                    identity: &self.identity,
                    mux: &mut self.mux,
                    encoding: self.encoding,
                };
                Verdict::Forward(table.rewrite(&line, fields, &mut ctx))
            }
            Some(Rule::NewLink) => {
                // nlinked <bot> <via> <flag+version>
                match line.arg(0).filter(|bot| !bot.is_empty()) {
                    Some(bot) => {
                        let slot = self.mux.register(bot);
                        info!(peer = bot, slot, "downstream linked a new bot");
                    }
                    None => warn!(%opcode, "new link without a bot name"),
                }
                Verdict::Discard
            }
            Some(Rule::ThisBot) => {
                // thisbot <handle>
                let Some(real) = line.arg(0).filter(|h| !h.is_empty()).map(str::to_owned) else {
                    warn!(%opcode, "thisbot without a handle; passing through");
                    return Verdict::Forward(line);
                };
                if self.identity.real_handle.as_deref() != Some(real.as_str()) {
                    info!(real_handle = %real, "downstream bot renamed itself");
                }
                self.mux.register(&real);
                self.identity.real_handle = Some(real);
                let mut line = line;
                line.args[0] = self.identity.fake_handle.clone();
                Verdict::Forward(line)
            }
        }
    }

    /// Pick the integer encoding from the uplink's first version line.
    fn settle_encoding(&mut self, line: &Line) {
        if self.encoding_settled {
            return;
        }
        match line.arg(0).map(str::parse::<u32>) {
            Some(Ok(numver)) => {
                self.encoding = IntEncoding::for_version(numver);
                self.encoding_settled = true;
                info!(numver, encoding = %self.encoding, "uplink version seen");
            }
            _ => warn!(line = %line, "unreadable uplink version; keeping {}", self.encoding),
        }
    }

    async fn keepalive(&mut self) -> Result<(), RelayError> {
        let now = Instant::now();
        if let Some(since) = self.ping_sent {
            let waited = now.duration_since(since);
            if !self.pong_warned && waited >= self.config.pong_timeout {
                warn!(
                    outstanding = self.pings_outstanding,
                    "uplink has not answered a ping in {}s",
                    waited.as_secs()
                );
                self.pong_warned = true;
            }
        }
        let ping = match self.encoding {
            IntEncoding::NetBase64 => "pi",
            IntEncoding::Decimal => "ping",
        };
        debug!("--> {ping}");
        self.send_upstream(Line::new(ping, Vec::new())).await?;
        self.pings_outstanding = self.pings_outstanding.saturating_add(1);
        self.ping_sent.get_or_insert(now);
        Ok(())
    }

    fn enter(&mut self, phase: Phase) {
        info!(from = %self.phase, to = %phase, "phase change");
        self.phase = phase;
    }

    async fn send_upstream(&mut self, line: Line) -> Result<(), RelayError> {
        self.upstream
            .send(line)
            .await
            .map_err(|source| self.transport(Side::Upstream, source))?;
        self.last_outbound = Instant::now();
        Ok(())
    }

    async fn recv_upstream(&mut self) -> Result<BytesMut, RelayError> {
        match self.upstream.next().await {
            Some(Ok(raw)) => Ok(raw),
            Some(Err(source)) => Err(self.transport(Side::Upstream, source)),
            None => Err(RelayError::PeerClosed {
                side: Side::Upstream,
                phase: self.phase,
            }),
        }
    }

    fn transport(&self, side: Side, source: CodecError) -> RelayError {
        RelayError::Transport {
            side,
            phase: self.phase,
            source,
        }
    }

    fn rejected(&self, reason: String) -> RelayError {
        RelayError::AuthRejected {
            phase: self.phase,
            reason,
        }
    }
}

/// The line that answers an uplink password prompt.
///
/// With a challenge this is `digest <md5(challenge + password)>` in
/// lowercase hex; without one, the password itself.
pub fn auth_reply(challenge: Option<&str>, password: &str) -> Line {
    match challenge {
        Some(challenge) => {
            let mut hasher = Md5::new();
            hasher.update(challenge.as_bytes());
            hasher.update(password.as_bytes());
            Line::new("digest", vec![hex::encode(hasher.finalize())])
        }
        None => Line::new(password, Vec::new()),
    }
}

/// Resolves once `true` is sent. A dropped sender never resolves.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
