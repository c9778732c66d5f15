pub mod lifecycle;
pub mod memory;
pub mod traits;

pub use lifecycle::{ConnectionState, ManagedConnection};
pub use memory::{MemorySource, MemorySourceBuilder};
pub use traits::{Connection, DataSource, StreamRead};
