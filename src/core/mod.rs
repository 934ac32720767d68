pub mod broker;
pub mod dlq;
pub mod egress;
pub mod error;
pub mod ingress;
pub mod message;
pub mod scanner;
pub mod service;
pub mod shutdown;
pub mod store;
