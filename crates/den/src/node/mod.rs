//! Encoded storage nodes and their sequential scanner.

pub mod builder;
pub mod scanner;

pub use builder::{build_nodes, EncodedNode, NodeBuilder, DEFAULT_NODE_SIZE, MAX_RECORD_LEN};
pub use scanner::NodeScanner;
