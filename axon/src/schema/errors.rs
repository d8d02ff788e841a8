use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::lex::{LexError, StreamLocation};

#[derive(Debug)]
pub enum SchemaError {
	ParseFailed { message: String, filename: String, location: StreamLocation },
	UnknownTypeReference { name: String, referenced_by: String },
	MalformedDirective { message: String, location: StreamLocation },
	IncludeNotFound { path: String },
	IoError(std::io::Error),
}

impl Display for SchemaError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::ParseFailed { message, filename, location } => {
				write!(f, "schema parse failed at {filename}:{location}: {message}")
			}
			Self::UnknownTypeReference { name, referenced_by } => {
				write!(f, "{referenced_by} references unknown type {name:?}")
			}
			Self::MalformedDirective { message, location } => {
				write!(f, "malformed preprocessor directive at {location}: {message}")
			}
			Self::IncludeNotFound { path } => write!(f, "included file {path:?} was not found"),
			Self::IoError(e) => write!(f, "schema i/o failed: {e}"),
		}
	}
}

impl Error for SchemaError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			Self::IoError(e) => Some(e),
			_ => None,
		}
	}
}

impl From<std::io::Error> for SchemaError {
	fn from(value: std::io::Error) -> Self {
		Self::IoError(value)
	}
}

impl From<LexError> for SchemaError {
	fn from(value: LexError) -> Self {
		match value {
			LexError::MalformedDirective { message, location } => Self::MalformedDirective { message, location },
			LexError::IncludeNotFound { path } => Self::IncludeNotFound { path },
			LexError::IncludeFailed { source, .. } => Self::IoError(source),
			LexError::UnterminatedBlockComment { location } => Self::ParseFailed {
				message: "unterminated block comment".to_string(),
				filename: String::new(),
				location,
			},
		}
	}
}
