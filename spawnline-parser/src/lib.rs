mod grammar;
pub mod parser;

pub use parser::*;
