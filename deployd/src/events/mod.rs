pub mod bus;
pub mod sink;

pub use bus::{EventBus, EventReceiver, RecvError};
pub use sink::{BusSink, FanoutSink, Progress, ProgressSink, TracingSink};
