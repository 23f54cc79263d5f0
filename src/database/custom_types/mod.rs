mod etag;
mod group_id;
mod job_id;
mod job_status;
mod job_version;
mod message_id;
mod pop_receipt;
mod queue_type;

pub use etag::{Etag, EtagError};
pub use group_id::GroupId;
pub use job_id::JobId;
pub use job_status::JobStatus;
pub use job_version::JobVersion;
pub use message_id::{MessageId, MessageIdError};
pub use pop_receipt::PopReceipt;
pub use queue_type::{QueueType, QueueTypeError};
