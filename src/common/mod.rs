mod closest_nodes;
mod digest;
mod id;
mod messages;
mod node;
mod registry;
mod routing_table;
mod store;

pub use closest_nodes::*;
pub use digest::*;
pub use id::*;
pub use messages::*;
pub use node::*;
pub use registry::*;
pub use routing_table::*;
pub use store::*;
