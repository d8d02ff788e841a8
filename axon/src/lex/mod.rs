use std::error::Error;
use std::fmt::{Debug, Display, Formatter};

use derivative::Derivative;

/// 1-based position within a schema source file.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct StreamLocation {
	pub line: u32,
	pub column: u32,
}

impl Display for StreamLocation {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.line, self.column)
	}
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Token {
	pub value: String,
	pub start: StreamLocation,
	pub end: StreamLocation,
}

#[derive(Debug)]
pub enum LexError {
	MalformedDirective { message: String, location: StreamLocation },
	UnterminatedBlockComment { location: StreamLocation },
	IncludeNotFound { path: String },
	IncludeFailed { path: String, source: std::io::Error },
}

impl Display for LexError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::MalformedDirective { message, location } => {
				write!(f, "malformed preprocessor directive at {location}: {message}")
			}
			Self::UnterminatedBlockComment { location } => {
				write!(f, "unterminated block comment starting at {location}")
			}
			Self::IncludeNotFound { path } => write!(f, "included file {path:?} was not found"),
			Self::IncludeFailed { path, source } => write!(f, "failed to open included file {path:?}: {source}"),
		}
	}
}

impl Error for LexError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			Self::IncludeFailed { source, .. } => Some(source),
			_ => None,
		}
	}
}

/// A file opened on behalf of an `#include` directive.
#[derive(Debug, Clone)]
pub struct IncludedFile {
	pub filename: String,
	pub contents: String,
}

/// Opens included schema sources. Implementations decide how a request string
/// maps onto storage; the returned filename is recorded as a dependency of
/// the parsed schemata.
pub trait IncludeHandler {
	fn open(&mut self, request: &str, requested_from: &str) -> Result<IncludedFile, LexError>;
}

/// One condition frame of the `#if` stack.
///
/// `positive` is the current branch's condition; `negative` is the OR of all
/// prior branches in the same chain, which synthesizes the `#else` condition
/// as "none of the prior branches held".
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Condition {
	pub positive: String,
	pub negative: String,
}

struct FileState {
	contents: Vec<char>,
	filename: String,
	offset: usize,
	location: StreamLocation,
}

impl FileState {
	fn new(contents: &str, filename: &str) -> Self {
		// A UTF-8 BOM is tolerated and skipped.
		let contents = contents.strip_prefix('\u{feff}').unwrap_or(contents);
		Self {
			contents: contents.chars().collect(),
			filename: filename.to_string(),
			offset: 0,
			location: StreamLocation { line: 1, column: 1 },
		}
	}

	fn peek(&self) -> Option<char> {
		self.contents.get(self.offset).copied()
	}

	fn peek_at(&self, ahead: usize) -> Option<char> {
		self.contents.get(self.offset + ahead).copied()
	}

	fn advance(&mut self) -> Option<char> {
		let c = self.peek()?;
		self.offset += 1;
		if c == '\n' {
			self.location.line += 1;
			self.location.column = 1;
		} else {
			self.location.column += 1;
		}
		Some(c)
	}
}

/// A stream of tokens over schema source text that interprets and removes
/// C-preprocessor conditional directives as it goes.
///
/// Every token outside of directives is returned regardless of the `#if`
/// conditions around it; callers interested in conditional inclusion ask for
/// [`Self::current_condition_string`] alongside each token and compile the
/// returned expression themselves.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ConditionalTokenizer<'h> {
	file_states: Vec<FileState>,
	conditions: Vec<Condition>,
	#[derivative(Debug = "ignore")]
	include_handler: Option<&'h mut dyn IncludeHandler>,
	dependent_files: Vec<String>,
	peeked: Option<Token>,
	preproc_valid: bool,
}

impl Debug for FileState {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "FileState({:?} @ {})", self.filename, self.location)
	}
}

const TWO_CHAR_OPERATORS: [&str; 8] = ["<<", ">>", "<=", ">=", "==", "!=", "&&", "||"];

impl<'h> ConditionalTokenizer<'h> {
	pub fn new(input: &str, filename: &str, include_handler: Option<&'h mut dyn IncludeHandler>) -> Self {
		Self {
			file_states: vec![FileState::new(input, filename)],
			conditions: Vec::new(),
			include_handler,
			dependent_files: Vec::new(),
			peeked: None,
			preproc_valid: true,
		}
	}

	pub fn location(&self) -> StreamLocation {
		match &self.peeked {
			Some(token) => token.start,
			None => self.file_states.last().map(|f| f.location).unwrap_or_default(),
		}
	}

	pub fn filename(&self) -> &str {
		self.file_states.last().map(|f| f.filename.as_str()).unwrap_or("")
	}

	/// Files opened through the include handler so far, in open order.
	pub fn dependent_files(&self) -> &[String] {
		&self.dependent_files
	}

	pub fn conditions(&self) -> &[Condition] {
		&self.conditions
	}

	/// Renders the conjunction of all active condition frames as a C-like
	/// expression. Empty when no `#if` is active.
	pub fn current_condition_string(&self) -> String {
		let mut parts = Vec::with_capacity(self.conditions.len());
		for frame in self.conditions.iter().rev() {
			match (frame.positive.is_empty(), frame.negative.is_empty()) {
				(false, true) => parts.push(wrap_compound(&frame.positive)),
				(false, false) => {
					parts.push(format!("{} && !({})", wrap_compound(&frame.positive), frame.negative))
				}
				(true, false) => parts.push(format!("!({})", frame.negative)),
				(true, true) => {}
			}
		}
		parts.join(" && ")
	}

	pub fn peek_token(&mut self) -> Result<Option<Token>, LexError> {
		if self.peeked.is_none() {
			self.peeked = self.read_token()?;
		}
		Ok(self.peeked.clone())
	}

	pub fn next_token(&mut self) -> Result<Option<Token>, LexError> {
		match self.peeked.take() {
			Some(token) => Ok(Some(token)),
			None => self.read_token(),
		}
	}

	fn read_token(&mut self) -> Result<Option<Token>, LexError> {
		loop {
			self.skip_whitespace_and_comments()?;
			let Some(file) = self.file_states.last_mut() else { return Ok(None) };
			match file.peek() {
				None => {
					// End of an included file resumes the including one.
					self.file_states.pop();
					if self.file_states.is_empty() {
						return Ok(None);
					}
					continue;
				}
				Some('#') => {
					if !self.preproc_valid {
						return Err(LexError::MalformedDirective {
							message: "directive does not start at the beginning of a line".to_string(),
							location: file.location,
						});
					}
					self.parse_directive()?;
					continue;
				}
				Some(_) => break,
			}
		}

		let file = self.file_states.last_mut().unwrap();
		let start = file.location;
		let first = file.advance().unwrap();
		let mut value = String::new();
		value.push(first);

		if first.is_ascii_alphanumeric() || first == '_' {
			while let Some(c) = file.peek() {
				if c.is_ascii_alphanumeric() || c == '_' {
					value.push(file.advance().unwrap());
				} else {
					break;
				}
			}
		} else if let Some(next) = file.peek() {
			let mut pair = String::with_capacity(2);
			pair.push(first);
			pair.push(next);
			if TWO_CHAR_OPERATORS.contains(&pair.as_str()) {
				file.advance();
				value = pair;
			}
		}

		let end = file.location;
		self.preproc_valid = false;
		Ok(Some(Token { value, start, end }))
	}

	fn skip_whitespace_and_comments(&mut self) -> Result<(), LexError> {
		loop {
			let Some(file) = self.file_states.last_mut() else { return Ok(()) };
			match file.peek() {
				Some('\n') => {
					file.advance();
					self.preproc_valid = true;
				}
				Some(c) if c.is_whitespace() => {
					file.advance();
				}
				Some('/') if file.peek_at(1) == Some('/') => {
					file.advance();
					file.advance();
					loop {
						match file.peek() {
							// Line continuations extend line comments.
							Some('\\') if matches!(file.peek_at(1), Some('\n')) => {
								file.advance();
								file.advance();
							}
							Some('\\') if file.peek_at(1) == Some('\r') && file.peek_at(2) == Some('\n') => {
								file.advance();
								file.advance();
								file.advance();
							}
							Some('\n') | None => break,
							Some(_) => {
								file.advance();
							}
						}
					}
				}
				Some('/') if file.peek_at(1) == Some('*') => {
					let location = file.location;
					file.advance();
					file.advance();
					loop {
						match (file.peek(), file.peek_at(1)) {
							(Some('*'), Some('/')) => {
								file.advance();
								file.advance();
								break;
							}
							(None, _) => return Err(LexError::UnterminatedBlockComment { location }),
							_ => {
								file.advance();
							}
						}
					}
				}
				_ => return Ok(()),
			}
		}
	}

	/// Reads the remainder of the current directive line, honoring `\`
	/// line continuations. The trailing newline is left unconsumed.
	fn read_directive_line(&mut self) -> String {
		let file = self.file_states.last_mut().unwrap();
		let mut line = String::new();
		loop {
			match file.peek() {
				Some('\\') if matches!(file.peek_at(1), Some('\n')) => {
					file.advance();
					file.advance();
					line.push(' ');
				}
				Some('\\') if file.peek_at(1) == Some('\r') && file.peek_at(2) == Some('\n') => {
					file.advance();
					file.advance();
					file.advance();
					line.push(' ');
				}
				Some('\n') | None => break,
				Some(c) => {
					line.push(c);
					file.advance();
				}
			}
		}
		line
	}

	fn parse_directive(&mut self) -> Result<(), LexError> {
		let location = self.file_states.last().unwrap().location;
		let from_file = self.file_states.last().unwrap().filename.clone();
		self.file_states.last_mut().unwrap().advance(); // '#'
		let line = self.read_directive_line();
		let line = line.trim();
		let (directive, rest) = match line.find(|c: char| c.is_whitespace()) {
			Some(split) => (&line[..split], line[split..].trim()),
			None => (line, ""),
		};

		let malformed = |message: &str| LexError::MalformedDirective {
			message: message.to_string(),
			location,
		};

		match directive {
			"if" => {
				if rest.is_empty() {
					return Err(malformed("#if requires a condition"));
				}
				self.conditions.push(Condition { positive: rest.to_string(), negative: String::new() });
			}
			"ifdef" => {
				if rest.is_empty() {
					return Err(malformed("#ifdef requires a name"));
				}
				self.conditions.push(Condition { positive: format!("defined({rest})"), negative: String::new() });
			}
			"ifndef" => {
				if rest.is_empty() {
					return Err(malformed("#ifndef requires a name"));
				}
				self.conditions.push(Condition { positive: format!("!defined({rest})"), negative: String::new() });
			}
			"elif" => {
				if rest.is_empty() {
					return Err(malformed("#elif requires a condition"));
				}
				let frame = self.conditions.last_mut().ok_or_else(|| malformed("#elif without #if"))?;
				if frame.positive.is_empty() {
					return Err(malformed("#elif after #else"));
				}
				frame.negative = fold_negative(frame);
				frame.positive = rest.to_string();
			}
			"else" => {
				let frame = self.conditions.last_mut().ok_or_else(|| malformed("#else without #if"))?;
				if frame.positive.is_empty() {
					return Err(malformed("duplicate #else"));
				}
				frame.negative = fold_negative(frame);
				frame.positive = String::new();
			}
			"endif" => {
				self.conditions.pop().ok_or_else(|| malformed("#endif without #if"))?;
			}
			"include" => {
				let path = parse_include_path(rest).ok_or_else(|| malformed("#include requires a quoted path"))?;
				let Some(handler) = self.include_handler.as_deref_mut() else {
					return Err(LexError::IncludeNotFound { path: path.to_string() });
				};
				let included = handler.open(path, &from_file)?;
				self.dependent_files.push(included.filename.clone());
				self.file_states.push(FileState::new(&included.contents, &included.filename));
			}
			other => return Err(malformed(&format!("unknown directive #{other}"))),
		}
		Ok(())
	}
}

fn fold_negative(frame: &Condition) -> String {
	match frame.negative.is_empty() {
		true => frame.positive.clone(),
		false => format!("{} || {}", frame.negative, frame.positive),
	}
}

fn parse_include_path(rest: &str) -> Option<&str> {
	let rest = rest.trim();
	rest.strip_prefix('"')
		.and_then(|r| r.strip_suffix('"'))
		.or_else(|| rest.strip_prefix('<').and_then(|r| r.strip_suffix('>')))
		.filter(|path| !path.is_empty())
}

fn wrap_compound(expression: &str) -> String {
	let simple = expression
		.chars()
		.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '(' || c == ')');
	match simple {
		true => expression.to_string(),
		false => format!("({expression})"),
	}
}
