//! Topic-addressed document transport over TCP.
//!
//! One side binds the endpoint and accepts any number of peers, the other
//! dials it; which side does which is independent of the role. Roles decide
//! how outgoing documents are routed and whether incoming ones are accepted:
//!
//! | Role        | send                          | receive                      |
//! |-------------|-------------------------------|------------------------------|
//! | `Publish`   | every peer; dropped if none   | —                            |
//! | `Subscribe` | —                             | topics matching the prefix   |
//! | `Push`      | next peer, round robin        | —                            |
//! | `Pull`      | —                             | everything                   |
//! | `Request`   | next peer, then await reply   | the reply                    |
//! | `Reply`     | back to the requester         | one request at a time        |
//!
//! A dialing socket has exactly one peer. Once that peer closes, the channel
//! reports itself disconnected, sends and receives fail with a retryable
//! transport error, and `connect` dials again.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::datagram::resolve;
use super::listener::{Handler, HandlerResult, ListenerTask, STOP_GRACE, dispatch};
use super::peers::{self, Filter, Incoming, PeerContext, PeerId, PeerSet};
use super::{Channel, ChannelState, Lifecycle};
use crate::config::TransportConfig;
use crate::core::Document;
use crate::error::{Error, Result};

pub const KEY_ENDPOINT: &str = "endpoint";
pub const KEY_ROLE: &str = "role";
pub const KEY_SOCKET_TYPE: &str = "socketType";
pub const KEY_BIND: &str = "bind";
pub const KEY_TOPIC: &str = "topic";
pub const KEY_TIMEOUT: &str = "timeout";

const KNOWN_KEYS: &[&str] =
    &[KEY_ENDPOINT, KEY_ROLE, KEY_SOCKET_TYPE, KEY_BIND, KEY_TOPIC, KEY_TIMEOUT];

pub const DEFAULT_ENDPOINT: &str = "tcp://localhost:5555";

const INBOX_CAPACITY: usize = 1024;
const NAME: &str = "pub/sub channel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    Publish,
    #[default]
    Subscribe,
    Request,
    Reply,
    Push,
    Pull,
}

impl Role {
    pub fn can_send(self) -> bool {
        !matches!(self, Role::Subscribe | Role::Pull)
    }

    pub fn can_receive(self) -> bool {
        !matches!(self, Role::Publish | Role::Push)
    }

    fn filter(self, topic: &str) -> Filter {
        match self {
            Role::Subscribe => Filter::Prefix(topic.to_owned()),
            Role::Publish | Role::Push => Filter::Nothing,
            Role::Request | Role::Reply | Role::Pull => Filter::All,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Publish => "PUB",
            Role::Subscribe => "SUB",
            Role::Request => "REQ",
            Role::Reply => "REP",
            Role::Push => "PUSH",
            Role::Pull => "PULL",
        };
        f.write_str(name)
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PUB" | "PUBLISH" => Ok(Role::Publish),
            "SUB" | "SUBSCRIBE" => Ok(Role::Subscribe),
            "REQ" | "REQUEST" => Ok(Role::Request),
            "REP" | "REPLY" => Ok(Role::Reply),
            "PUSH" => Ok(Role::Push),
            "PULL" => Ok(Role::Pull),
            _ => Err(Error::Configuration(format!("unknown socket role '{}'", s))),
        }
    }
}

/// A document together with the topic it was published under.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub document: Document,
}

/// `tcp://host:port`; `*` as host means every interface.
fn parse_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let bad = |why: &str| Error::Configuration(format!("endpoint '{}': {}", endpoint, why));

    let rest = match endpoint.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some((scheme, _)) => return Err(bad(&format!("unsupported scheme '{}'", scheme))),
        None => endpoint,
    };
    let (host, port) = rest.rsplit_once(':').ok_or_else(|| bad("missing port"))?;
    let port: u16 = port.parse().map_err(|_| bad("invalid port"))?;
    let host = match host.trim_start_matches('[').trim_end_matches(']') {
        "" => return Err(bad("missing host")),
        "*" => "0.0.0.0",
        h => h,
    };
    Ok((host.to_owned(), port))
}

#[derive(Debug, Clone, PartialEq)]
struct Settings {
    host: String,
    port: u16,
    role: Role,
    bind: bool,
    topic: String,
    timeout: Option<Duration>,
}

impl Settings {
    fn from_config(config: &TransportConfig) -> Result<Self> {
        config.ensure_known(KNOWN_KEYS)?;
        let (host, port) = parse_endpoint(config.text(KEY_ENDPOINT)?.unwrap_or(DEFAULT_ENDPOINT))?;
        let role = match config.text_any(&[KEY_ROLE, KEY_SOCKET_TYPE])? {
            Some(text) => text.parse()?,
            None => Role::default(),
        };
        let topic = config.text(KEY_TOPIC)?.unwrap_or_default().to_owned();
        if topic.len() > u16::MAX as usize {
            return Err(Error::Configuration("topic is longer than 65535 bytes".into()));
        }

        Ok(Self {
            host,
            port,
            role,
            bind: config.bool(KEY_BIND)?.unwrap_or(false),
            topic,
            timeout: config.millis(KEY_TIMEOUT)?,
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5555,
            role: Role::default(),
            bind: false,
            topic: String::new(),
            timeout: None,
        }
    }
}

/// Request/reply turn taking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exchange {
    Idle,
    AwaitingReply(PeerId),
    Replying(PeerId),
}

type Inbox = mpsc::Receiver<Incoming>;

pub struct PubSubChannel {
    config: TransportConfig,
    settings: Settings,
    lifecycle: Lifecycle,
    peers: Arc<PeerSet>,
    inbox: tokio::sync::Mutex<Option<Inbox>>,
    exchange: Mutex<Exchange>,
    cancel: Option<CancellationToken>,
    local_addr: Option<SocketAddr>,
    listener: Option<ListenerTask<Inbox>>,
    template: Option<Document>,
}

impl PubSubChannel {
    pub fn new() -> Self {
        Self {
            config: TransportConfig::new(),
            settings: Settings::default(),
            lifecycle: Lifecycle::new(NAME),
            peers: Arc::new(PeerSet::default()),
            inbox: tokio::sync::Mutex::new(None),
            exchange: Mutex::new(Exchange::Idle),
            cancel: None,
            local_addr: None,
            listener: None,
            template: Some(Document::sensor_template()),
        }
    }

    pub fn with_config(options: TransportConfig) -> Result<Self> {
        let mut channel = Self::new();
        channel.configure(options)?;
        Ok(channel)
    }

    pub fn role(&self) -> Role {
        self.settings.role
    }

    pub fn topic(&self) -> &str {
        &self.settings.topic
    }

    /// Bound or dialing-side local address; useful after binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_count(&self) -> usize {
        self.peers.count()
    }

    pub fn set_template(&mut self, template: Document) {
        self.template = Some(template);
    }

    pub fn clear_template(&mut self) {
        self.template = None;
    }

    /// Copy of the current template, for callers to fill in and set back.
    pub fn template(&self) -> Option<Document> {
        self.template.clone()
    }

    /// A dialing socket whose single peer has gone away.
    fn link_lost(&self) -> bool {
        !self.settings.bind && self.lifecycle.is_connected() && self.peers.count() == 0
    }

    fn ensure_link(&self) -> Result<()> {
        self.lifecycle.ensure_connected()?;
        if self.link_lost() {
            return Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                format!("{}:{} closed the connection", self.settings.host, self.settings.port),
            )));
        }
        Ok(())
    }

    fn exchange(&self) -> std::sync::MutexGuard<'_, Exchange> {
        self.exchange.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends `document` under the configured topic.
    pub fn send_document(&self, document: &Document) -> Result<()> {
        self.publish(&self.settings.topic, document)
    }

    /// Sends `document` under an explicit topic.
    pub fn publish(&self, topic: &str, document: &Document) -> Result<()> {
        let payload = document.encode()?;
        self.route(peers::encode_envelope(topic, &payload)?)
    }

    /// Sends the template deep-merged with `overrides`.
    pub fn send_templated(&self, overrides: &Document) -> Result<()> {
        let template = self
            .template
            .as_ref()
            .ok_or_else(|| Error::Configuration("no message template set".into()))?;
        self.send_document(&template.merged(overrides))
    }

    fn route(&self, frame: Bytes) -> Result<()> {
        self.ensure_link()?;
        let role = self.settings.role;

        match role {
            Role::Publish => {
                let delivered = self.peers.broadcast(&frame);
                if delivered == 0 {
                    trace!("{}: no subscriber attached, message dropped", NAME);
                }
                Ok(())
            }
            Role::Push => self.peers.send_next(frame).map(|_| ()),
            Role::Request => {
                let mut exchange = self.exchange();
                if *exchange != Exchange::Idle {
                    return Err(Error::Sequence("a request is already awaiting its reply".into()));
                }
                let peer = self.peers.send_next(frame)?;
                *exchange = Exchange::AwaitingReply(peer);
                Ok(())
            }
            Role::Reply => {
                let mut exchange = self.exchange();
                let Exchange::Replying(peer) = *exchange else {
                    return Err(Error::Sequence("no request to reply to".into()));
                };
                *exchange = Exchange::Idle;
                self.peers.send_to(peer, frame)
            }
            Role::Subscribe | Role::Pull => {
                Err(Error::Configuration(format!("{} sockets cannot send", role)))
            }
        }
    }

    fn check_can_receive(&self) -> Result<()> {
        self.ensure_link()?;
        let role = self.settings.role;
        if !role.can_receive() {
            return Err(Error::Configuration(format!("{} sockets cannot receive", role)));
        }
        match (role, *self.exchange()) {
            (Role::Request, Exchange::Idle) => {
                Err(Error::Sequence("send a request before receiving".into()))
            }
            (Role::Reply, Exchange::Replying(_)) => {
                Err(Error::Sequence("reply to the pending request first".into()))
            }
            _ => Ok(()),
        }
    }

    /// Waits for the next accepted message as topic and raw payload.
    pub async fn receive_raw(&self) -> Result<(String, Bytes)> {
        self.check_can_receive()?;

        let mut guard = self.inbox.lock().await;
        let inbox = guard
            .as_mut()
            .ok_or_else(|| Error::ConnectionState("listener owns the receive path".into()))?;

        loop {
            let next = match self.settings.timeout {
                Some(limit) => tokio::time::timeout(limit, inbox.recv()).await.map_err(|_| {
                    Error::Transport(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("no message within {:?}", limit),
                    ))
                })?,
                None => inbox.recv().await,
            };
            let incoming = next.ok_or_else(|| {
                Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "every peer has disconnected",
                ))
            })?;

            let mut exchange = self.exchange();
            match (self.settings.role, *exchange) {
                (Role::Request, Exchange::AwaitingReply(peer)) if peer != incoming.peer => {
                    debug!(
                        "{}: ignoring message from peer {} while awaiting {}",
                        NAME, incoming.peer, peer
                    );
                    continue;
                }
                (Role::Request, _) => *exchange = Exchange::Idle,
                (Role::Reply, _) => *exchange = Exchange::Replying(incoming.peer),
                _ => {}
            }
            return Ok((incoming.topic, incoming.payload));
        }
    }

    /// Waits for the next document.
    pub async fn receive_message(&self) -> Result<Document> {
        let (_, payload) = self.receive_raw().await?;
        Document::decode(&payload)
    }

    /// Decodes every arrival on a background task and hands it to `handler`.
    ///
    /// Only for `Subscribe` and `Pull`; request/reply needs the caller to
    /// answer in turn.
    pub fn start_listener<H>(&mut self, handler: H) -> Result<()>
    where
        H: FnMut(Message) -> HandlerResult + Send + 'static,
    {
        self.lifecycle.ensure_connected()?;
        let role = self.settings.role;
        if !matches!(role, Role::Subscribe | Role::Pull) {
            return Err(Error::Configuration(format!("{} sockets cannot run a listener", role)));
        }
        if self.listener.is_some() {
            return Err(Error::ConnectionState("listener already running".into()));
        }
        let inbox = self
            .inbox
            .get_mut()
            .take()
            .ok_or_else(|| Error::ConnectionState("receive path is unavailable".into()))?;

        let handler: Handler<Message> = Box::new(handler);
        self.listener =
            Some(ListenerTask::spawn(NAME, move |cancel| listen(inbox, handler, cancel)));
        info!("{}: listening for '{}'", NAME, self.settings.topic);
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.listener.as_ref().is_some_and(|l| !l.is_finished())
    }

    pub async fn stop_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            match listener.stop(STOP_GRACE).await {
                Some(inbox) => *self.inbox.get_mut() = Some(inbox),
                None => warn!("{}: receive path lost until reconnect", NAME),
            }
        }
    }
}

impl Default for PubSubChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PubSubChannel {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

async fn listen(
    mut inbox: Inbox,
    mut handler: Handler<Message>,
    cancel: CancellationToken,
) -> Inbox {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = inbox.recv() => {
                let Some(incoming) = next else {
                    debug!("{}: every peer has disconnected", NAME);
                    cancel.cancelled().await;
                    break;
                };
                match Document::decode(&incoming.payload) {
                    Ok(document) => dispatch(
                        NAME,
                        &mut handler,
                        Message { topic: incoming.topic, document },
                    ),
                    Err(e) => warn!("{}: undecodable message on '{}': {}", NAME, incoming.topic, e),
                }
            }
        }
    }
    inbox
}

impl Channel for PubSubChannel {
    fn configure(&mut self, options: TransportConfig) -> Result<()> {
        let merged = self.config.merged(&options);
        let settings = Settings::from_config(&merged)?;
        if self.lifecycle.is_connected() && settings != self.settings {
            debug!("{}: new settings apply on the next connect", NAME);
        }
        self.config = merged;
        self.settings = settings;
        self.lifecycle.configured();
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        if self.link_lost() {
            debug!("{}: peer is gone, redialing", NAME);
            self.disconnect().await?;
        }
        self.lifecycle.begin_connect()?;

        let addr = resolve(&self.settings.host, self.settings.port).await?;
        let cancel = CancellationToken::new();
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let ctx = PeerContext {
            peers: self.peers.clone(),
            inbox: inbox_tx,
            filter: self.settings.role.filter(&self.settings.topic),
            cancel: cancel.clone(),
        };

        let local = if self.settings.bind {
            let listener = TcpListener::bind(addr).await?;
            let local = listener.local_addr()?;
            peers::spawn_acceptor(listener, ctx);
            local
        } else {
            let stream = TcpStream::connect(addr).await?;
            let local = stream.local_addr()?;
            peers::spawn_peer(stream, ctx)?;
            local
        };
        info!(
            "{}: {} {} {} (local {})",
            NAME,
            self.settings.role,
            if self.settings.bind { "bound" } else { "connected to" },
            addr,
            local
        );

        *self.inbox.get_mut() = Some(inbox_rx);
        *self.exchange() = Exchange::Idle;
        self.cancel = Some(cancel);
        self.local_addr = Some(local);
        self.lifecycle.mark_connected();
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if !self.lifecycle.is_connected() {
            return Ok(());
        }
        self.stop_listener().await;
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.peers.clear();
        *self.inbox.get_mut() = None;
        self.local_addr = None;
        self.lifecycle.mark_disconnected();
        info!("{}: disconnected", NAME);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lifecycle.is_connected() && !self.link_lost()
    }

    fn state(&self) -> ChannelState {
        if self.link_lost() {
            ChannelState::Disconnected
        } else {
            self.lifecycle.state()
        }
    }

    fn config(&self) -> &TransportConfig {
        &self.config
    }
}
