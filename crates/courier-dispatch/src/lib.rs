// Courier dispatch engine.
//
// Turns a durable job store into delivered messages: claims due jobs,
// groups them into tenant/channel batches, pushes each batch through a
// bounded worker pool, and settles every job exactly once against the
// store (ack, retry with backoff, throttle-defer, or bury).

pub mod batch;
pub mod dispatcher;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod pool;
pub mod retry;
pub mod sender;

pub use batch::{BatchAggregator, JobBatch};
pub use dispatcher::Dispatcher;
pub use error::DispatchError;
pub use limiter::SlidingWindowLimiter;
pub use metrics::{MetricsRegistry, Outcome};
pub use pool::WorkerPool;
pub use retry::{RetryAction, RetryPolicy};
pub use sender::{
    HttpSender, SendError, SendErrorKind, SendReceipt, Sender, SenderRegistry,
};

pub type Result<T> = std::result::Result<T, DispatchError>;
