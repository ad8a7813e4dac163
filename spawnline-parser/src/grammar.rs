use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "arguments.pest"]
pub struct ArgumentParser;
