use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::core::broker::nsq::connection::NsqConnection;
use crate::core::broker::nsq::protocol::{Command, Identify};
use crate::core::broker::MessagePublisher;
use crate::core::error::BrokerError;

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub dial_timeout: Duration,
    /// Bounds one whole publish, including a reconnect.
    pub publish_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(1),
            publish_timeout: Duration::from_secs(5),
        }
    }
}

/// Publishes to a single nsqd over one lazily (re)established connection.
///
/// The connection is taken out of the slot for the duration of a publish
/// and only put back on success, so a timed-out or failed publish never
/// leaves a half-written connection behind.
pub struct NsqProducer {
    addr: String,
    config: ProducerConfig,
    identify: Identify,
    conn: Mutex<Option<NsqConnection>>,
}

impl NsqProducer {
    pub fn new(addr: impl Into<String>, config: ProducerConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
            identify: Identify::default(),
            conn: Mutex::new(None),
        }
    }

    /// Builds a producer and proves nsqd is reachable.
    pub async fn connect(addr: impl Into<String>, config: ProducerConfig) -> Result<Self, BrokerError> {
        let producer = Self::new(addr, config);
        let conn = producer.dial().await?;
        *producer.conn.lock().await = Some(conn);
        info!(target: "nsqdelay::nsq", addr = %producer.addr, "producer connected");
        Ok(producer)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn dial(&self) -> Result<NsqConnection, BrokerError> {
        NsqConnection::connect(&self.addr, self.config.dial_timeout, &self.identify).await
    }

    async fn publish_inner(&self, topic: &str, body: Bytes) -> Result<(), BrokerError> {
        let mut slot = self.conn.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => {
                debug!(target: "nsqdelay::nsq", addr = %self.addr, "dialing nsqd");
                self.dial().await?
            }
        };

        let cmd = Command::Pub {
            topic: topic.to_string(),
            body,
        };
        let res = match conn.send(&cmd).await {
            Ok(()) => conn.expect_ok().await,
            Err(e) => Err(e),
        };

        match &res {
            Ok(()) => *slot = Some(conn),
            Err(e) if !e.is_fatal_for_connection() => *slot = Some(conn),
            Err(_) => {}
        }
        res
    }

    /// Sends `CLS` and drops the connection.
    pub async fn close(&self) {
        if let Some(mut conn) = self.conn.lock().await.take() {
            if let Err(e) = conn.send(&Command::Cls).await {
                warn!(target: "nsqdelay::nsq", addr = %self.addr, error = %e, "CLS failed");
            }
        }
    }
}

#[async_trait]
impl MessagePublisher for NsqProducer {
    async fn publish(&self, topic: &str, body: Bytes) -> Result<(), BrokerError> {
        let limit = self.config.publish_timeout;
        timeout(limit, self.publish_inner(topic, body))
            .await
            .map_err(|_| BrokerError::Timeout(limit))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use crate::core::broker::nsq::fake::{
        accept_handshake, frame, read_line, read_sized, respond_ok,
    };
    use crate::core::broker::nsq::protocol::{FRAME_TYPE_ERROR, FRAME_TYPE_RESPONSE};

    #[tokio::test]
    async fn publishes_and_reports_rejections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            accept_handshake(&mut sock).await;

            assert_eq!(read_line(&mut sock).await, "PUB t1");
            assert_eq!(read_sized(&mut sock).await, b"hello");
            sock.write_all(&frame(FRAME_TYPE_RESPONSE, b"_heartbeat_"))
                .await
                .unwrap();
            assert_eq!(read_line(&mut sock).await, "NOP");
            respond_ok(&mut sock).await;

            assert_eq!(read_line(&mut sock).await, "PUB t1");
            read_sized(&mut sock).await;
            sock.write_all(&frame(FRAME_TYPE_ERROR, b"E_PUB_FAILED"))
                .await
                .unwrap();

            // Rejections keep the connection, so the next publish reuses it.
            assert_eq!(read_line(&mut sock).await, "PUB t2");
            read_sized(&mut sock).await;
            respond_ok(&mut sock).await;
        });

        let producer = NsqProducer::connect(addr, ProducerConfig::default()).await.unwrap();
        producer.publish("t1", Bytes::from_static(b"hello")).await.unwrap();
        let err = producer
            .publish("t1", Bytes::from_static(b"again"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Rejected(ref m) if m == "E_PUB_FAILED"));
        producer.publish("t2", Bytes::from_static(b"x")).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_nsqd_fails_to_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let res = NsqProducer::connect(addr, ProducerConfig::default()).await;
        assert!(res.is_err());
    }
}
