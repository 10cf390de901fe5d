mod undo_log;

pub use undo_log::*;
