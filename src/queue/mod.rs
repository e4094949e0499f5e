pub mod balancer;
pub mod priority_queue;

pub use balancer::LoadBalancer;
pub use priority_queue::{Priority, PriorityQueue, QueuedMessage};
