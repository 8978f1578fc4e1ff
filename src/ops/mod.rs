//! Operation queue, the worker that drains it, and rebuild backoff.

mod operation;
mod processor;
mod queue;
mod retry;
mod state;

pub use operation::{
    CheckpointOperation, IndexOperation, OperationTicket, QueryOperation, QueryTicket,
    RebuildOperation, ReindexFile, RemoveResource,
};
pub use processor::{OperationProcessor, ProcessorState, ProcessorStateHandle, PROCESSOR_THREAD_NAME};
pub use queue::{Dequeued, OperationQueue};
pub use retry::{RetryHandle, RetryTimer, RETRY_DELAYS_SECS};
pub use state::IndexState;
