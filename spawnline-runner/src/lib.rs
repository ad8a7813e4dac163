pub mod child;
pub mod executor;
mod logon;
pub mod pipes;
pub mod policy;
pub mod process;
pub mod resolve;

pub use child::RunningProcess;
pub use executor::*;
pub use process::{ProcessCreator, ProcessStartInfo, RedirectRequest, ELEVATION_VERB};
pub use resolve::resolve_target;
