//! Event fan-out: typed job lifecycle events inside the process, and the string pub/sub broker
//! shared with workers.

mod broker;
mod bus;

pub use broker::{
    BrokerMessage, CRON_RELOAD_CHANNEL, CRON_REMOVE_CHANNEL, CRON_RUNNOW_CHANNEL, MessageBroker,
    Subscription, WORKER_CONTROL_CHANNEL,
};
pub use bus::{InProcJobEventBus, JobEvent, JobEventKind, JobEventPublisher, JobEventStream};
