mod dictionary;
mod eval;

pub use dictionary::{Token, TokenDefinition, TokenDictionary, TokenKind};
pub use eval::{parse_expression, ExpressionError};
