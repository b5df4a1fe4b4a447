pub mod context;
pub mod contract;
pub mod pipeline;
pub mod stages;

pub use context::*;
pub use contract::*;
pub use pipeline::*;
