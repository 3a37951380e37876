pub mod block;
pub mod buffer;
pub mod config;
pub mod error;
pub mod file;
pub mod location;
pub mod policy;

pub mod prelude {
    pub use crate::block::*;
    pub use crate::buffer::BufferPoolManager;
    pub use crate::config::BufferPoolConfig;
    pub use crate::error::*;
    pub use crate::policy::EvictionPolicy;
}
