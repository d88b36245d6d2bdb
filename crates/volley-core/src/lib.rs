pub mod attacker;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod metrics;
pub mod pacer;
pub mod pipeline;
pub mod resolver;
pub mod storage;
pub mod summary;

pub use attacker::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use export::*;
pub use metrics::*;
pub use pacer::*;
pub use pipeline::*;
pub use resolver::*;
pub use storage::*;
pub use summary::*;
