//! Upgrade file format and the streaming parser that writes it to flash.

pub mod format;
pub mod parser;

pub use format::*;
pub use parser::{ParseEnv, ParseOutcome, ParserState, PartitionDataParser};
