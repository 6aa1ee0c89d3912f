pub mod job;
pub mod job_link;
pub mod job_message;
pub mod user_work;
pub mod work_item;
pub mod workflow_step;

pub use job::{Job, JobId, JobStatus};
pub use job_link::JobLink;
pub use job_message::{JobMessage, MessageLevel};
pub use user_work::UserWork;
pub use work_item::{WorkItem, WorkItemId, WorkItemStatus};
pub use workflow_step::WorkflowStep;
