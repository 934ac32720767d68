//! Native NSQ client: TCP protocol V2 plus nsqlookupd discovery.

pub mod connection;
pub mod consumer;
pub mod lookup;
pub mod producer;
pub mod protocol;

#[cfg(test)]
pub(crate) mod fake;

pub use consumer::{ConsumerConfig, NsqConsumer};
pub use producer::{NsqProducer, ProducerConfig};
