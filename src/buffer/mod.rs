mod block_access;
mod block_pool;
mod replacer;

pub use block_access::*;
pub use block_pool::*;
pub use replacer::*;
