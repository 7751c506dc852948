pub mod group;
pub mod memory;
pub mod publisher;
pub mod rdkafka_group;
pub mod runner;

pub use group::{
    CoordinationError, Delivery, GroupClient, GroupSession, HandlerError, MessageHandler,
    PartitionClaim, SessionClosed,
};
pub use memory::{MemoryGroupMember, MemoryLog};
pub use publisher::{
    EventPublisher, KafkaStatPublisher, PublishError, PublishReceipt, PublisherSettings,
};
pub use rdkafka_group::{GroupClientSettings, KafkaGroupClient};
pub use runner::{
    Clock, ConsumerGroupRunner, RunnerSettings, RunnerState, ShutdownReport, TokioClock,
};
