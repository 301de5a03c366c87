pub mod conflict;
pub mod registry;
pub mod room;
pub mod sweeper;
