pub mod build;
pub mod error;
pub mod failure;
pub mod id;
pub mod plan;
pub mod quota;
pub mod spec;
pub mod tenant;

pub use build::*;
pub use error::*;
pub use failure::*;
pub use id::*;
pub use plan::*;
pub use quota::*;
pub use spec::*;
pub use tenant::*;
