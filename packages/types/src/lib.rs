mod agent;
mod duration;
mod id;
mod protocol;
mod result;
mod run;
mod service;
mod timestamp;

pub use agent::*;
pub use duration::*;
pub use id::*;
pub use protocol::*;
pub use result::*;
pub use run::*;
pub use service::*;
pub use timestamp::*;
