pub mod conflict;
pub mod diagnostics;
pub mod error;
pub mod health;
pub mod identity;
pub mod messages;
pub mod operation;
pub mod ready;

pub use conflict::*;
pub use diagnostics::*;
pub use error::*;
pub use health::*;
pub use identity::*;
pub use messages::*;
pub use operation::*;
pub use ready::*;
