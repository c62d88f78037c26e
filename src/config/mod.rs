pub mod schema;

pub use schema::{BrokerConfig, Config, ConsumerConfig, ConsumerSettings};
