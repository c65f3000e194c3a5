pub mod process_worker;
pub mod work_queue;

pub use process_worker::ProcessWorker;
pub use work_queue::{InMemoryWorkQueue, JobStatus, Lane, NewJob, QueueStats, QueuedJob, TerminalEvent, WorkQueue};
