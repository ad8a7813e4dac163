pub mod builder;
pub mod cancellation;
pub mod error;
pub mod escape;
pub mod models;
pub mod streams;

pub use builder::*;
pub use cancellation::*;
pub use error::*;
pub use escape::*;
pub use models::*;
pub use streams::*;
