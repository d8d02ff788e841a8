use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::expr::{Token, TokenDictionary, TokenKind};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ExpressionError {
	DivideByZero,
	MalformedExpression,
	MalformedLiteral(String),
	UnexpectedToken(String),
	UnknownToken(Token),
	NonNumericVariable(String),
}

impl Display for ExpressionError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::DivideByZero => f.write_str("division by zero"),
			Self::MalformedExpression => f.write_str("malformed expression"),
			Self::MalformedLiteral(v) => write!(f, "malformed literal {v:?}"),
			Self::UnexpectedToken(v) => write!(f, "unexpected token {v:?} in expression"),
			Self::UnknownToken(t) => write!(f, "token {t} is not present in the dictionary"),
			Self::NonNumericVariable(v) => write!(f, "variable {v:?} holds a non-numeric value"),
		}
	}
}

impl Error for ExpressionError {}

/// A stack slot during evaluation. Errors are deferred so that the
/// short-circuiting operators can discard faults in unselected operands.
type Slot = Result<i64, ExpressionError>;

fn parse_literal(value: &str) -> Result<i64, ExpressionError> {
	let (negative, digits) = match value.strip_prefix('-') {
		Some(rest) => (true, rest),
		None => (false, value),
	};
	let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
		Some(hex) => u64::from_str_radix(hex, 16),
		None => digits.parse::<u64>(),
	};
	let magnitude = magnitude.map_err(|_| ExpressionError::MalformedLiteral(value.to_string()))?;
	let value = magnitude as i64;
	Ok(if negative { value.wrapping_neg() } else { value })
}

fn binary_op(op: &str, a: i64, b: i64) -> Result<i64, ExpressionError> {
	Ok(match op {
		"*" => a.wrapping_mul(b),
		"/" if b == 0 => return Err(ExpressionError::DivideByZero),
		"/" => a.wrapping_div(b),
		"%" if b == 0 => return Err(ExpressionError::DivideByZero),
		"%" => a.wrapping_rem(b),
		"+" => a.wrapping_add(b),
		"-" => a.wrapping_sub(b),
		"<<" => a.wrapping_shl(b as u32),
		">>" => a.wrapping_shr(b as u32),
		"<" => (a < b) as i64,
		"<=" => (a <= b) as i64,
		">" => (a > b) as i64,
		">=" => (a >= b) as i64,
		"==" => (a == b) as i64,
		"!=" => (a != b) as i64,
		"&" => a & b,
		"^" => a ^ b,
		"|" => a | b,
		_ => return Err(ExpressionError::UnexpectedToken(op.to_string())),
	})
}

fn pop(stack: &mut Vec<Slot>) -> Result<Slot, ExpressionError> {
	stack.pop().ok_or(ExpressionError::MalformedExpression)
}

pub(crate) fn evaluate<R>(dict: &TokenDictionary, expr: &[Token], mut resolver: R) -> Result<i64, ExpressionError>
where
	R: FnMut(&crate::expr::TokenDefinition, Token) -> Result<Option<i64>, ExpressionError>,
{
	let mut stack: Vec<Slot> = Vec::with_capacity(8);
	for &token in expr {
		let def = dict.definition(token).ok_or(ExpressionError::UnknownToken(token))?;
		match def.kind {
			TokenKind::Literal => stack.push(parse_literal(&def.value)),
			TokenKind::Variable => stack.push(match resolver(def, token) {
				Ok(value) => Ok(value.unwrap_or(0)),
				Err(e) => Err(e),
			}),
			TokenKind::IsDefinedTest => stack.push(match resolver(def, token) {
				Ok(value) => Ok(value.is_some() as i64),
				Err(e) => Err(e),
			}),
			TokenKind::Operator => match def.value.as_str() {
				"!" => {
					let a = pop(&mut stack)?;
					stack.push(a.map(|v| (v == 0) as i64));
				}
				"~" => {
					let a = pop(&mut stack)?;
					stack.push(a.map(|v| !v));
				}
				"&&" => {
					let b = pop(&mut stack)?;
					let a = pop(&mut stack)?;
					stack.push(match a {
						Ok(0) => Ok(0),
						Ok(_) => b.map(|v| (v != 0) as i64),
						Err(e) => Err(e),
					});
				}
				"||" => {
					let b = pop(&mut stack)?;
					let a = pop(&mut stack)?;
					stack.push(match a {
						Ok(v) if v != 0 => Ok(1),
						Ok(_) => b.map(|v| (v != 0) as i64),
						Err(e) => Err(e),
					});
				}
				"?:" => {
					let otherwise = pop(&mut stack)?;
					let then = pop(&mut stack)?;
					let cond = pop(&mut stack)?;
					stack.push(match cond {
						Ok(v) if v != 0 => then,
						Ok(_) => otherwise,
						Err(e) => Err(e),
					});
				}
				op => {
					let b = pop(&mut stack)?;
					let a = pop(&mut stack)?;
					stack.push(match (a, b) {
						(Ok(a), Ok(b)) => binary_op(op, a, b),
						(Err(e), _) | (_, Err(e)) => Err(e),
					});
				}
			},
			_ => return Err(ExpressionError::UnexpectedToken(def.value.clone())),
		}
	}

	let result = pop(&mut stack)?;
	if !stack.is_empty() {
		return Err(ExpressionError::MalformedExpression);
	}
	result
}

struct FoldOperand {
	start: usize,
	value: Option<i64>,
	/// Pure operands cannot fault for any resolver, so absorbing folds may
	/// drop them.
	pure: bool,
}

/// Constant folding over a postfix expression. Folding never changes the
/// value or error produced by [`evaluate`] for any resolver.
pub(crate) fn simplify(dict: &mut TokenDictionary, expr: &mut Vec<Token>) {
	let mut out: Vec<Token> = Vec::with_capacity(expr.len());
	let mut stack: Vec<FoldOperand> = Vec::new();

	macro_rules! fold_to_literal {
		($start: expr, $value: expr) => {{
			out.truncate($start);
			out.push(dict.get_token(TokenKind::Literal, &$value.to_string()));
			stack.push(FoldOperand { start: $start, value: Some($value), pure: true });
		}};
	}

	for &token in expr.iter() {
		let Some(def) = dict.definition(token).cloned() else { return };
		match def.kind {
			TokenKind::Literal => {
				let value = parse_literal(&def.value).ok();
				let pure = value.is_some();
				out.push(token);
				stack.push(FoldOperand { start: out.len() - 1, value, pure });
			}
			TokenKind::Variable | TokenKind::IsDefinedTest => {
				out.push(token);
				stack.push(FoldOperand { start: out.len() - 1, value: None, pure: true });
			}
			TokenKind::Operator => match def.value.as_str() {
				"!" | "~" => {
					let Some(a) = stack.pop() else { return };
					match a.value {
						Some(v) => {
							let folded = if def.value == "!" { (v == 0) as i64 } else { !v };
							fold_to_literal!(a.start, folded);
						}
						None => {
							out.push(token);
							stack.push(FoldOperand { start: a.start, value: None, pure: a.pure });
						}
					}
				}
				"?:" => {
					let Some(otherwise) = stack.pop() else { return };
					let Some(then) = stack.pop() else { return };
					let Some(cond) = stack.pop() else { return };
					match cond.value {
						Some(v) => {
							let (range, taken) = match v != 0 {
								true => (then.start..otherwise.start, then),
								false => (otherwise.start..out.len(), otherwise),
							};
							let branch: Vec<Token> = out[range].to_vec();
							out.truncate(cond.start);
							out.extend(branch);
							stack.push(FoldOperand { start: cond.start, value: taken.value, pure: taken.pure });
						}
						None => {
							out.push(token);
							let pure = cond.pure && then.pure && otherwise.pure;
							stack.push(FoldOperand { start: cond.start, value: None, pure });
						}
					}
				}
				op => {
					let Some(b) = stack.pop() else { return };
					let Some(a) = stack.pop() else { return };

					// Absorbing operands of the short-circuiting operators.
					let absorbed = match op {
						"&&" if a.value == Some(0) => Some(0),
						"&&" if b.value == Some(0) && a.pure => Some(0),
						"||" if matches!(a.value, Some(v) if v != 0) => Some(1),
						"||" if matches!(b.value, Some(v) if v != 0) && a.pure => Some(1),
						_ => None,
					};
					if let Some(folded) = absorbed {
						fold_to_literal!(a.start, folded);
						continue;
					}

					let folded = match (op, a.value, b.value) {
						("&&", Some(a), Some(b)) => Some(((a != 0) && (b != 0)) as i64),
						("||", Some(a), Some(b)) => Some(((a != 0) || (b != 0)) as i64),
						(op, Some(a), Some(b)) => binary_op(op, a, b).ok(),
						_ => None,
					};
					match folded {
						Some(value) => fold_to_literal!(a.start, value),
						None => {
							out.push(token);
							let pure = a.pure && b.pure && !matches!(op, "/" | "%");
							stack.push(FoldOperand { start: a.start, value: None, pure });
						}
					}
				}
			},
			_ => return,
		}
	}

	if stack.len() == 1 {
		*expr = out;
	}
}

/// Renders a postfix expression as infix text. Operands of compound
/// subexpressions are parenthesized, so the output re-parses to an
/// expression with identical evaluation order.
pub(crate) fn render(dict: &TokenDictionary, expr: &[Token]) -> Option<String> {
	// (text, atomic)
	let mut stack: Vec<(String, bool)> = Vec::new();
	let wrap = |operand: (String, bool)| match operand.1 {
		true => operand.0,
		false => format!("({})", operand.0),
	};
	for &token in expr {
		let def = dict.definition(token)?;
		match def.kind {
			TokenKind::Literal | TokenKind::Variable => stack.push((def.value.clone(), true)),
			TokenKind::IsDefinedTest => stack.push((format!("defined({})", def.value), true)),
			TokenKind::Operator => match def.value.as_str() {
				"!" | "~" => {
					let a = stack.pop()?;
					stack.push((format!("{}{}", def.value, wrap(a)), true));
				}
				"?:" => {
					let otherwise = stack.pop()?;
					let then = stack.pop()?;
					let cond = stack.pop()?;
					stack.push((format!("{} ? {} : {}", wrap(cond), wrap(then), wrap(otherwise)), false));
				}
				op => {
					let b = stack.pop()?;
					let a = stack.pop()?;
					stack.push((format!("{} {op} {}", wrap(a), wrap(b)), false));
				}
			},
			_ => return None,
		}
	}
	match stack.len() {
		1 => Some(stack.pop().unwrap().0),
		_ => None,
	}
}

const UNARY_PRECEDENCE: u8 = 13;
const TERNARY_PRECEDENCE: u8 = 2;

fn binary_precedence(op: &str) -> Option<u8> {
	Some(match op {
		"*" | "/" | "%" => 12,
		"+" | "-" => 11,
		"<<" | ">>" => 10,
		"<" | "<=" | ">" | ">=" => 9,
		"==" | "!=" => 8,
		"&" => 7,
		"^" => 6,
		"|" => 5,
		"&&" => 4,
		"||" => 3,
		_ => return None,
	})
}

#[derive(Debug, Clone, Eq, PartialEq)]
enum InfixTok {
	Ident(String),
	Number(String),
	Op(&'static str),
	Open,
	Close,
	Question,
	Colon,
}

fn lex_infix(text: &str) -> Result<Vec<InfixTok>, ExpressionError> {
	const TWO_CHAR: [&str; 8] = ["<<", ">>", "<=", ">=", "==", "!=", "&&", "||"];
	const ONE_CHAR: [&str; 11] = ["+", "-", "*", "/", "%", "<", ">", "&", "^", "|", "!"];

	let mut tokens = Vec::new();
	let bytes = text.as_bytes();
	let mut i = 0;
	while i < bytes.len() {
		let c = bytes[i] as char;
		if c.is_ascii_whitespace() {
			i += 1;
			continue;
		}
		if c.is_ascii_digit() {
			let start = i;
			while i < bytes.len() && (bytes[i] as char).is_ascii_alphanumeric() {
				i += 1;
			}
			tokens.push(InfixTok::Number(text[start..i].to_string()));
			continue;
		}
		if c.is_ascii_alphabetic() || c == '_' {
			let start = i;
			while i < bytes.len() && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_') {
				i += 1;
			}
			tokens.push(InfixTok::Ident(text[start..i].to_string()));
			continue;
		}
		if i + 1 < bytes.len() {
			let pair = &text[i..i + 2];
			if let Some(op) = TWO_CHAR.iter().find(|&&op| op == pair) {
				tokens.push(InfixTok::Op(op));
				i += 2;
				continue;
			}
		}
		let single = &text[i..i + 1];
		if let Some(op) = ONE_CHAR.iter().find(|&&op| op == single) {
			tokens.push(InfixTok::Op(op));
			i += 1;
			continue;
		}
		match c {
			'~' => tokens.push(InfixTok::Op("~")),
			'(' => tokens.push(InfixTok::Open),
			')' => tokens.push(InfixTok::Close),
			'?' => tokens.push(InfixTok::Question),
			':' => tokens.push(InfixTok::Colon),
			_ => return Err(ExpressionError::UnexpectedToken(c.to_string())),
		}
		i += 1;
	}
	Ok(tokens)
}

enum PendingOp {
	Op { spelling: &'static str, precedence: u8, right_assoc: bool },
	Ternary { armed: bool },
	Open,
}

/// Compiles an infix expression into a postfix token list, interning the
/// operand and operator tokens into `dict`. `defined(X)` (or `defined X`)
/// becomes an is-defined probe; unary minus is rewritten as `0 x -`.
pub fn parse_expression(text: &str, dict: &mut TokenDictionary) -> Result<Vec<Token>, ExpressionError> {
	let tokens = lex_infix(text)?;
	let mut output: Vec<Token> = Vec::new();
	let mut ops: Vec<PendingOp> = Vec::new();
	let mut expect_operand = true;

	fn emit(dict: &mut TokenDictionary, output: &mut Vec<Token>, op: PendingOp) -> Result<(), ExpressionError> {
		match op {
			PendingOp::Op { spelling, .. } => output.push(dict.get_token(TokenKind::Operator, spelling)),
			PendingOp::Ternary { armed: true } => output.push(dict.get_token(TokenKind::Operator, "?:")),
			PendingOp::Ternary { armed: false } => return Err(ExpressionError::MalformedExpression),
			PendingOp::Open => return Err(ExpressionError::MalformedExpression),
		}
		Ok(())
	}

	fn push_binary(
		dict: &mut TokenDictionary,
		output: &mut Vec<Token>,
		ops: &mut Vec<PendingOp>,
		spelling: &'static str,
		precedence: u8,
		right_assoc: bool,
	) -> Result<(), ExpressionError> {
		while let Some(PendingOp::Op { precedence: top, .. }) = ops.last() {
			if *top > precedence || (*top == precedence && !right_assoc) {
				let op = ops.pop().unwrap();
				emit(dict, output, op)?;
			} else {
				break;
			}
		}
		ops.push(PendingOp::Op { spelling, precedence, right_assoc });
		Ok(())
	}

	let mut iter = tokens.into_iter();
	while let Some(tok) = iter.next() {
		match tok {
			InfixTok::Number(value) => {
				if !expect_operand {
					return Err(ExpressionError::MalformedExpression);
				}
				output.push(dict.get_token(TokenKind::Literal, &value));
				expect_operand = false;
			}
			InfixTok::Ident(name) => {
				if !expect_operand {
					return Err(ExpressionError::MalformedExpression);
				}
				if name == "defined" {
					let probed = match iter.next() {
						Some(InfixTok::Open) => {
							let inner = match iter.next() {
								Some(InfixTok::Ident(inner)) => inner,
								_ => return Err(ExpressionError::MalformedExpression),
							};
							if iter.next() != Some(InfixTok::Close) {
								return Err(ExpressionError::MalformedExpression);
							}
							inner
						}
						Some(InfixTok::Ident(inner)) => inner,
						_ => return Err(ExpressionError::MalformedExpression),
					};
					output.push(dict.get_token(TokenKind::IsDefinedTest, &probed));
				} else {
					output.push(dict.get_token(TokenKind::Variable, &name));
				}
				expect_operand = false;
			}
			InfixTok::Op(op) => {
				if expect_operand {
					match op {
						"!" | "~" => {
							ops.push(PendingOp::Op { spelling: op, precedence: UNARY_PRECEDENCE, right_assoc: true });
						}
						"-" => {
							output.push(dict.get_token(TokenKind::Literal, "0"));
							ops.push(PendingOp::Op { spelling: "-", precedence: UNARY_PRECEDENCE, right_assoc: true });
						}
						"+" => {} // unary plus is a no-op
						_ => return Err(ExpressionError::MalformedExpression),
					}
				} else {
					let precedence =
						binary_precedence(op).ok_or_else(|| ExpressionError::UnexpectedToken(op.to_string()))?;
					push_binary(dict, &mut output, &mut ops, op, precedence, false)?;
					expect_operand = true;
				}
			}
			InfixTok::Question => {
				if expect_operand {
					return Err(ExpressionError::MalformedExpression);
				}
				while let Some(PendingOp::Op { precedence: top, .. }) = ops.last() {
					if *top > TERNARY_PRECEDENCE {
						let op = ops.pop().unwrap();
						emit(dict, &mut output, op)?;
					} else {
						break;
					}
				}
				ops.push(PendingOp::Ternary { armed: false });
				expect_operand = true;
			}
			InfixTok::Colon => {
				if expect_operand {
					return Err(ExpressionError::MalformedExpression);
				}
				loop {
					match ops.last_mut() {
						Some(PendingOp::Ternary { armed }) if !*armed => {
							*armed = true;
							break;
						}
						Some(PendingOp::Open) | None => return Err(ExpressionError::MalformedExpression),
						_ => {
							let op = ops.pop().unwrap();
							emit(dict, &mut output, op)?;
						}
					}
				}
				expect_operand = true;
			}
			InfixTok::Open => {
				if !expect_operand {
					// Function-call syntax is not part of the expression language.
					return Err(ExpressionError::MalformedExpression);
				}
				ops.push(PendingOp::Open);
			}
			InfixTok::Close => {
				if expect_operand {
					return Err(ExpressionError::MalformedExpression);
				}
				loop {
					match ops.pop() {
						Some(PendingOp::Open) => break,
						Some(op) => emit(dict, &mut output, op)?,
						None => return Err(ExpressionError::MalformedExpression),
					}
				}
			}
		}
	}

	if expect_operand {
		return Err(ExpressionError::MalformedExpression);
	}
	while let Some(op) = ops.pop() {
		emit(dict, &mut output, op)?;
	}
	Ok(output)
}
