pub mod common;
pub mod conflicts;
pub mod logs;
pub mod status;
pub mod sync;
