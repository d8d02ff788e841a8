use std::fmt::{Debug, Formatter};

use fxhash::FxHashMap;

use crate::expr::eval;
use crate::expr::ExpressionError;

/// Index of a [`TokenDefinition`] within its owning [`TokenDictionary`].
pub type Token = u32;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TokenKind {
	Variable,
	Literal,
	IsDefinedTest,
	Operator,
	FunctionCall,
	OpenParen,
	CloseParen,
	Comma,
}

#[derive(Clone, Eq, PartialEq, Hash)]
pub struct TokenDefinition {
	pub kind: TokenKind,
	pub value: String,
}

impl Debug for TokenDefinition {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:?}({:?})", self.kind, self.value)
	}
}

/// Ordered set of interned tokens. Expressions are stored as postfix lists of
/// token indices; the dictionary owning an expression must be used to
/// evaluate it.
#[derive(Default, Clone)]
pub struct TokenDictionary {
	definitions: Vec<TokenDefinition>,
	lookup: FxHashMap<(TokenKind, String), Token>,
}

impl TokenDictionary {
	pub fn new() -> Self {
		Self::default()
	}

	/// Interns `(kind, value)`, returning the existing index when present.
	pub fn get_token(&mut self, kind: TokenKind, value: &str) -> Token {
		if let Some(existing) = self.try_get_token(kind, value) {
			return existing;
		}
		let token = self.definitions.len() as Token;
		self.definitions.push(TokenDefinition { kind, value: value.to_string() });
		self.lookup.insert((kind, value.to_string()), token);
		token
	}

	pub fn try_get_token(&self, kind: TokenKind, value: &str) -> Option<Token> {
		self.lookup.get(&(kind, value.to_string())).copied()
	}

	#[inline]
	pub fn definition(&self, token: Token) -> Option<&TokenDefinition> {
		self.definitions.get(token as usize)
	}

	#[inline]
	pub fn definitions(&self) -> &[TokenDefinition] {
		&self.definitions
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.definitions.len()
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.definitions.is_empty()
	}

	/// Copies a token from another dictionary, interning it here.
	pub fn translate_token(&mut self, other: &TokenDictionary, token: Token) -> Option<Token> {
		let def = other.definition(token)?;
		Some(self.get_token(def.kind, &def.value))
	}

	/// Maps a whole postfix expression from another dictionary into this one.
	pub fn translate_expression(&mut self, other: &TokenDictionary, expr: &[Token]) -> Option<Vec<Token>> {
		expr.iter().map(|&t| self.translate_token(other, t)).collect()
	}

	/// Evaluates a postfix expression to a signed 64-bit integer.
	///
	/// The resolver is consulted for `Variable` and `IsDefinedTest` tokens;
	/// returning `Ok(None)` marks the name undefined (variables then read as
	/// 0, `defined(x)` as 0).
	pub fn evaluate_expression<R>(&self, expr: &[Token], resolver: R) -> Result<i64, ExpressionError>
	where
		R: FnMut(&TokenDefinition, Token) -> Result<Option<i64>, ExpressionError>,
	{
		eval::evaluate(self, expr, resolver)
	}

	/// Constant-folds the expression in place. The observable result of
	/// [`Self::evaluate_expression`] is unchanged for every resolver.
	pub fn simplify_expression(&mut self, expr: &mut Vec<Token>) {
		eval::simplify(self, expr)
	}

	/// Renders a postfix expression back into (parenthesized) infix text.
	pub fn render_expression(&self, expr: &[Token]) -> Option<String> {
		eval::render(self, expr)
	}
}

impl Debug for TokenDictionary {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_map();
		for (idx, def) in self.definitions.iter().enumerate() {
			dbg.entry(&idx, def);
		}
		dbg.finish()
	}
}
