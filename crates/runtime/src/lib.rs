pub mod event_bus;
pub mod job;
pub mod metrics;
pub mod work_queue;

pub use event_bus::*;
pub use job::*;
pub use metrics::*;
pub use work_queue::*;
