mod node;
mod writer;

pub use node::*;
pub use writer::*;
