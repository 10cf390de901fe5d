mod disk_manager;
mod file_io;
mod free_list;

pub use disk_manager::*;
pub use file_io::*;
pub use free_list::*;
