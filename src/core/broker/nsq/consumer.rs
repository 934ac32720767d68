use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::core::broker::nsq::connection::NsqConnection;
use crate::core::broker::nsq::lookup::lookup;
use crate::core::broker::nsq::protocol::{Command, Frame, Identify, CLOSE_WAIT, HEARTBEAT};
use crate::core::broker::{
    Acknowledger, InboundMessage, MessageId, MessageSubscriber, Subscription,
};
use crate::core::error::BrokerError;

/// How often dead connections to known nsqd nodes are re-dialed.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// How long a closing connection waits for nsqd's `CLOSE_WAIT`.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub lookupd_http_addresses: Vec<String>,
    pub nsqd_tcp_addresses: Vec<String>,
    pub max_in_flight: u32,
    pub lookupd_poll_interval: Duration,
    pub dial_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            lookupd_http_addresses: Vec::new(),
            nsqd_tcp_addresses: Vec::new(),
            max_in_flight: 32,
            lookupd_poll_interval: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(1),
        }
    }
}

/// Subscribes to a topic on every nsqd that carries it.
///
/// nsqd nodes come from nsqlookupd (polled) and from the static address
/// list. Each node gets its own connection task; all of them feed the one
/// bounded channel behind the returned [`Subscription`].
pub struct NsqConsumer {
    config: ConsumerConfig,
    http: reqwest::Client,
    identify: Identify,
}

impl NsqConsumer {
    pub fn new(config: ConsumerConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            identify: Identify::default(),
        }
    }
}

#[async_trait]
impl MessageSubscriber for NsqConsumer {
    async fn subscribe(&self, topic: &str, channel: &str) -> Result<Subscription, BrokerError> {
        if self.config.lookupd_http_addresses.is_empty() && self.config.nsqd_tcp_addresses.is_empty()
        {
            return Err(BrokerError::Lookup(
                "no nsqlookupd or nsqd addresses configured".to_string(),
            ));
        }

        let capacity = self.config.max_in_flight.max(1) as usize;
        let (tx, rx) = flume::bounded(capacity);
        let (close_tx, close_rx) = watch::channel(false);

        let supervisor = Supervisor {
            ctx: Arc::new(ConnContext {
                topic: topic.to_string(),
                channel: channel.to_string(),
                max_in_flight: self.config.max_in_flight.max(1),
                dial_timeout: self.config.dial_timeout,
                identify: self.identify.clone(),
                out: tx,
            }),
            config: self.config.clone(),
            http: self.http.clone(),
            close_rx,
        };
        tokio::spawn(supervisor.run());

        info!(target: "nsqdelay::nsq", topic, channel, "subscription started");
        Ok(Subscription::new(rx, close_tx))
    }
}

/// Shared by every connection of one subscription.
struct ConnContext {
    topic: String,
    channel: String,
    max_in_flight: u32,
    dial_timeout: Duration,
    identify: Identify,
    out: flume::Sender<InboundMessage>,
}

struct Supervisor {
    ctx: Arc<ConnContext>,
    config: ConsumerConfig,
    http: reqwest::Client,
    close_rx: watch::Receiver<bool>,
}

enum Tick {
    Discover,
    Reconnect,
    Close,
}

impl Supervisor {
    async fn run(mut self) {
        let mut discover = interval(self.config.lookupd_poll_interval);
        discover.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reconnect = interval(RECONNECT_INTERVAL);
        reconnect.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut known: BTreeSet<String> = BTreeSet::new();
        let mut conns: HashMap<String, JoinHandle<()>> = HashMap::new();

        loop {
            let tick = tokio::select! {
                _ = discover.tick() => Tick::Discover,
                _ = reconnect.tick() => Tick::Reconnect,
                _ = self.close_rx.wait_for(|closed| *closed) => Tick::Close,
            };
            match tick {
                Tick::Close => break,
                Tick::Discover => {
                    if let Some(found) = self.discover().await {
                        known = found;
                    }
                }
                Tick::Reconnect => {}
            }

            conns.retain(|_, handle| !handle.is_finished());
            for addr in &known {
                if conns.contains_key(addr) {
                    continue;
                }
                let handle = tokio::spawn(run_connection(
                    self.ctx.clone(),
                    addr.clone(),
                    self.close_rx.clone(),
                ));
                conns.insert(addr.clone(), handle);
            }
        }

        for (_, handle) in conns {
            let _ = handle.await;
        }
        debug!(target: "nsqdelay::nsq", topic = %self.ctx.topic, "subscription closed");
    }

    /// Returns `None` when every lookupd failed, so the caller keeps the
    /// previous address set instead of forgetting live nodes.
    async fn discover(&self) -> Option<BTreeSet<String>> {
        let mut found: BTreeSet<String> = self.config.nsqd_tcp_addresses.iter().cloned().collect();
        if self.config.lookupd_http_addresses.is_empty() {
            return Some(found);
        }

        let mut any_ok = false;
        for base in &self.config.lookupd_http_addresses {
            match lookup(&self.http, base, &self.ctx.topic).await {
                Ok(addrs) => {
                    any_ok = true;
                    found.extend(addrs);
                }
                Err(e) => warn!(target: "nsqdelay::nsq", lookupd = %base, error = %e, "lookup failed"),
            }
        }
        any_ok.then_some(found)
    }
}

async fn run_connection(ctx: Arc<ConnContext>, addr: String, close_rx: watch::Receiver<bool>) {
    match consume(&ctx, &addr, close_rx).await {
        Ok(()) => info!(target: "nsqdelay::nsq", %addr, "connection closed"),
        Err(e) => warn!(target: "nsqdelay::nsq", %addr, error = %e, "connection lost"),
    }
}

struct NsqAcker {
    commands: flume::Sender<Command>,
}

#[async_trait]
impl Acknowledger for NsqAcker {
    async fn finish(&self, id: &MessageId) -> Result<(), BrokerError> {
        self.commands
            .send(Command::Fin(id.clone()))
            .map_err(|_| BrokerError::Closed)
    }
}

enum Event {
    Frame(Result<Frame, BrokerError>),
    Close,
}

async fn consume(
    ctx: &ConnContext,
    addr: &str,
    mut close_rx: watch::Receiver<bool>,
) -> Result<(), BrokerError> {
    let mut conn = NsqConnection::connect(addr, ctx.dial_timeout, &ctx.identify).await?;
    conn.send(&Command::Sub {
        topic: ctx.topic.clone(),
        channel: ctx.channel.clone(),
    })
    .await?;
    conn.expect_ok().await?;
    conn.send(&Command::Rdy(ctx.max_in_flight)).await?;
    info!(target: "nsqdelay::nsq", addr, topic = %ctx.topic, channel = %ctx.channel, "subscribed");

    let (mut reader, mut writer) = conn.into_split();

    // FINs come from whichever task holds the message, so writes are
    // serialized through one channel. The writer outlives this loop until
    // every outstanding message has been finished or dropped.
    let (cmd_tx, cmd_rx) = flume::unbounded::<Command>();
    let writer_addr = addr.to_string();
    tokio::spawn(async move {
        while let Ok(cmd) = cmd_rx.recv_async().await {
            if let Err(e) = writer.send(&cmd).await {
                debug!(target: "nsqdelay::nsq", addr = %writer_addr, error = %e, "write failed");
                break;
            }
        }
    });
    let acker: Arc<dyn Acknowledger> = Arc::new(NsqAcker {
        commands: cmd_tx.clone(),
    });

    let mut closing = false;
    loop {
        let event = if closing {
            match timeout(CLOSE_GRACE, reader.read_frame()).await {
                Ok(frame) => Event::Frame(frame),
                Err(_) => return Ok(()),
            }
        } else {
            tokio::select! {
                frame = reader.read_frame() => Event::Frame(frame),
                _ = close_rx.wait_for(|closed| *closed) => Event::Close,
            }
        };

        let frame = match event {
            Event::Close => {
                closing = true;
                let _ = cmd_tx.send(Command::Cls);
                continue;
            }
            Event::Frame(Err(BrokerError::Closed)) if closing => return Ok(()),
            Event::Frame(frame) => frame?,
        };

        match frame {
            Frame::Response(data) if &data[..] == HEARTBEAT => {
                let _ = cmd_tx.send(Command::Nop);
            }
            Frame::Response(data) if &data[..] == CLOSE_WAIT => return Ok(()),
            Frame::Response(data) => {
                trace!(target: "nsqdelay::nsq", addr, response = %String::from_utf8_lossy(&data), "response");
            }
            Frame::Error(data) => {
                warn!(target: "nsqdelay::nsq", addr, error = %String::from_utf8_lossy(&data), "nsqd error");
            }
            Frame::Message(msg) if closing => {
                trace!(target: "nsqdelay::nsq", addr, id = %msg.id, "message left for requeue");
            }
            Frame::Message(msg) => {
                let inbound = InboundMessage::new(msg.id, msg.body, msg.attempts, acker.clone());
                tokio::select! {
                    res = ctx.out.send_async(inbound) => {
                        if res.is_err() {
                            closing = true;
                            let _ = cmd_tx.send(Command::Cls);
                        }
                    }
                    _ = close_rx.wait_for(|closed| *closed) => {
                        closing = true;
                        let _ = cmd_tx.send(Command::Cls);
                    }
                }
            }
        }
    }
}
