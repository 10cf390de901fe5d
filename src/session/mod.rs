mod block_dbio;

pub use block_dbio::*;
