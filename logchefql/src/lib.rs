pub mod ast;
pub mod parser;

pub use ast::{Condition, Expr, Op, Query, Value};
pub use parser::{parse, ErrorCode, ParseError};
