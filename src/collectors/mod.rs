pub mod fanout;
pub mod sampler;
pub mod topology;
pub mod usage;

pub use fanout::{collect_usage, UsageTask};
pub use usage::UsageCollector;
