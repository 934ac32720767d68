//! nsqdelay – run the delay service, or submit a delay request.
//
//  $ nsqdelay run --config nsqdelay.toml
//  $ nsqdelay run --redis-address 10.0.0.5:6379 --topic delayed
//  $ nsqdelay send --topic orders --body '{"id":1}' --send-in 30
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};

use nsqdelay::core::broker::nsq::{NsqProducer, ProducerConfig};
use nsqdelay::core::broker::MessagePublisher;
use nsqdelay::core::message::encode_message;
use nsqdelay::logging::init_logging;
use nsqdelay::{Config, DelayedMessage};

#[derive(Debug, Parser)]
#[command(name = "nsqdelay", version, about = "Delayed message delivery for NSQ")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the delay service.
    Run {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Publish one delay request to the source topic.
    Send {
        /// Target topic for the delayed message
        #[arg(long)]
        topic: String,
        /// Message body
        #[arg(long)]
        body: String,
        /// Delay in seconds
        #[arg(long)]
        send_in: i64,
        #[command(flatten)]
        overrides: Overrides,
    },
}

#[derive(Debug, Args)]
struct Overrides {
    /// Path to config TOML (env NSQDELAY_CONFIG)
    #[arg(short, long)]
    config: Option<String>,
    /// nsqlookupd HTTP address; repeat for several
    #[arg(long = "lookupd-http-address")]
    lookupd_http_addresses: Vec<String>,
    #[arg(long)]
    nsqd_tcp_address: Option<String>,
    #[arg(long)]
    redis_address: Option<String>,
    /// Source topic carrying delay requests
    #[arg(long)]
    topic: Option<String>,
}

impl Overrides {
    fn load(&self) -> anyhow::Result<Config> {
        let mut cfg = Config::load(self.config.as_deref())?;
        if !self.lookupd_http_addresses.is_empty() {
            cfg.broker.lookupd_http_addresses = self.lookupd_http_addresses.clone();
        }
        if let Some(addr) = &self.nsqd_tcp_address {
            cfg.broker.nsqd_tcp_address = addr.clone();
        }
        if let Some(addr) = &self.redis_address {
            cfg.store.redis_address = addr.clone();
        }
        if let Some(topic) = &self.topic {
            cfg.broker.source_topic = topic.clone();
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Run { overrides } => {
            let cfg = overrides.load()?;
            init_logging(&cfg.logging.level)?;
            nsqdelay::run(cfg).await?;
        }
        Command::Send {
            topic,
            body,
            send_in,
            overrides,
        } => {
            let cfg = overrides.load()?;
            init_logging(&cfg.logging.level)?;

            let request = DelayedMessage::new(topic, body, send_in);
            request.validate()?;
            let payload = encode_message(&request)?;

            let producer = NsqProducer::connect(
                cfg.broker.nsqd_tcp_address.clone(),
                ProducerConfig {
                    dial_timeout: cfg.broker.dial_timeout(),
                    publish_timeout: cfg.broker.publish_timeout(),
                },
            )
            .await?;
            producer
                .publish(&cfg.broker.source_topic, Bytes::from(payload))
                .await?;
            producer.close().await;
            println!(
                "queued for {} in {}s via {}",
                request.topic, request.send_in, cfg.broker.source_topic
            );
        }
    }
    Ok(())
}
