pub mod builder;
pub mod embed;
pub mod llm;
pub mod summarize;

pub use builder::{Graph, GraphBuilder};
