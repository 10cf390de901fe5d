mod datablock;

pub use datablock::*;
