use std::error::Error;
use std::fmt::{Display, Formatter, Write};
use std::sync::Arc;

use fxhash::FxHashMap;
use nohash_hasher::IntMap;

use crate::expr::{ExpressionError, Token, TokenDictionary};
use crate::format::typed::{TypeCat, TypeDesc};
use crate::schema::{
	AliasId, BinarySchemata, BlockDefinition, BlockDefinitionId, Cmd, TemplateParameterKind, TypeRef, TypeRefArg,
};
use crate::utilities::hash_name;

pub type EvaluatedTypeId = u32;

#[derive(Debug)]
pub enum EvalError {
	UnknownType { name: String },
	UnsupportedPartialTemplate { name: String },
	Expression(ExpressionError),
	MalformedCommandList { block: String, message: &'static str },
}

impl Display for EvalError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::UnknownType { name } => write!(f, "unknown type {name:?}"),
			Self::UnsupportedPartialTemplate { name } => {
				write!(f, "using partial template {name:?} as a template parameter is unsupported")
			}
			Self::Expression(e) => write!(f, "expression evaluation failed: {e}"),
			Self::MalformedCommandList { block, message } => {
				write!(f, "malformed command list in block {block:?}: {message}")
			}
		}
	}
}

impl Error for EvalError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			Self::Expression(e) => Some(e),
			_ => None,
		}
	}
}

impl From<ExpressionError> for EvalError {
	fn from(value: ExpressionError) -> Self {
		Self::Expression(value)
	}
}

/// A concrete instantiation of a primitive, alias or block with bound
/// template parameters. Bit `i` of `param_type_field` marks `params[i]` as an
/// [`EvaluatedTypeId`] rather than an integer value.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash)]
pub struct EvaluatedType {
	pub value_type: TypeDesc,
	pub block_definition: Option<BlockDefinitionId>,
	pub alias: Option<AliasId>,
	pub params: Vec<i64>,
	pub param_type_field: u32,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
enum CalculatedSize {
	#[default]
	Uncalculated,
	Dynamic,
	Fixed(usize),
}

/// Binds template parameters to produce hash-consed evaluated types, caches
/// per-type fixed sizes, and holds global schema parameters.
///
/// Ids are never reused for the lifetime of a context. The contained
/// schemata is immutable and shared; the context itself expects external
/// serialization when shared between formatters.
#[derive(Debug)]
pub struct EvaluationContext {
	schemata: Arc<BinarySchemata>,
	evaluated_types: Vec<EvaluatedType>,
	cons_lookup: FxHashMap<EvaluatedType, EvaluatedTypeId>,
	calculated_sizes: Vec<CalculatedSize>,
	global_parameters: IntMap<u64, i64>,
}

impl EvaluationContext {
	pub fn new(schemata: Arc<BinarySchemata>) -> Self {
		Self {
			schemata,
			evaluated_types: Vec::new(),
			cons_lookup: Default::default(),
			calculated_sizes: Vec::new(),
			global_parameters: Default::default(),
		}
	}

	#[inline]
	pub fn schemata(&self) -> &Arc<BinarySchemata> {
		&self.schemata
	}

	pub fn evaluated_type(&self, id: EvaluatedTypeId) -> &EvaluatedType {
		&self.evaluated_types[id as usize]
	}

	/// Interns an evaluated type, returning the id of the structurally equal
	/// instance when one exists.
	pub fn intern(&mut self, evaluated: EvaluatedType) -> EvaluatedTypeId {
		if let Some(&existing) = self.cons_lookup.get(&evaluated) {
			return existing;
		}
		let id = self.evaluated_types.len() as EvaluatedTypeId;
		self.evaluated_types.push(evaluated.clone());
		self.cons_lookup.insert(evaluated, id);
		id
	}

	pub fn get_primitive_type(&mut self, cat: TypeCat) -> EvaluatedTypeId {
		self.intern(EvaluatedType { value_type: TypeDesc::new(cat), ..Default::default() })
	}

	/// Resolves `base_name` as a primitive, then an alias, then a block
	/// definition, binding `params` as template arguments.
	pub fn get_evaluated_type(
		&mut self,
		base_name: &str,
		params: &[i64],
		param_type_field: u32,
	) -> Result<EvaluatedTypeId, EvalError> {
		if params.is_empty() {
			if let Some(cat) = TypeCat::from_name(base_name) {
				return Ok(self.get_primitive_type(cat));
			}
		}

		let schemata = self.schemata.clone();
		if let Some(alias_id) = schemata.find_alias(base_name) {
			let alias = schemata.alias(alias_id);
			let target = self.resolve_type_ref(&alias.token_dictionary, &alias.target)?;
			let target = self.evaluated_type(target);
			let evaluated = EvaluatedType {
				value_type: target.value_type,
				block_definition: target.block_definition,
				alias: Some(alias_id),
				params: match params.is_empty() {
					true => target.params.clone(),
					false => params.to_vec(),
				},
				param_type_field: match params.is_empty() {
					true => target.param_type_field,
					false => param_type_field,
				},
			};
			return Ok(self.intern(evaluated));
		}

		if let Some(block_id) = schemata.find_block_definition(base_name) {
			return Ok(self.intern(EvaluatedType {
				value_type: TypeDesc::default(),
				block_definition: Some(block_id),
				alias: None,
				params: params.to_vec(),
				param_type_field,
			}));
		}

		Err(EvalError::UnknownType { name: base_name.to_string() })
	}

	/// Resolves a parsed type reference (an alias target), evaluating
	/// expression arguments against the global parameters.
	fn resolve_type_ref(&mut self, dict: &TokenDictionary, type_ref: &TypeRef) -> Result<EvaluatedTypeId, EvalError> {
		let mut params = Vec::with_capacity(type_ref.args.len());
		let mut field = 0u32;
		for (i, arg) in type_ref.args.iter().enumerate() {
			match arg {
				TypeRefArg::Typename(inner) => {
					params.push(self.resolve_type_ref(dict, inner)? as i64);
					field |= 1 << i;
				}
				TypeRefArg::Expression(expr) => {
					let globals = &self.global_parameters;
					let value = dict.evaluate_expression(expr, |def, _| {
						Ok(globals.get(&hash_name(&def.value)).copied())
					})?;
					params.push(value);
				}
			}
		}
		self.get_evaluated_type(&type_ref.base_name, &params, field)
	}

	/// Resolves the base-name token of a `LookupType` command, consuming its
	/// arguments from the execution stacks.
	pub(crate) fn resolve_type_command(
		&mut self,
		base_name_token: Token,
		param_kind_codes: &[u32],
		def: &BlockDefinition,
		type_stack: &mut Vec<EvaluatedTypeId>,
		value_stack: &mut Vec<i64>,
		parsing_template_params: &[i64],
		parsing_template_params_type_field: u32,
	) -> Result<EvaluatedTypeId, EvalError> {
		// Typename template parameters shadow declared type names.
		for (c, &name) in def.template_parameter_names.iter().enumerate() {
			if name != base_name_token || def.template_parameter_type_field & (1 << c) == 0 {
				continue;
			}
			debug_assert!(parsing_template_params_type_field & (1 << c) != 0);
			let name = def.token_dictionary.definition(name).map(|d| d.value.clone()).unwrap_or_default();
			if !param_kind_codes.is_empty() {
				return Err(EvalError::UnsupportedPartialTemplate { name });
			}
			return Ok(parsing_template_params[c] as EvaluatedTypeId);
		}

		let base_name = def
			.token_dictionary
			.definition(base_name_token)
			.map(|d| d.value.clone())
			.unwrap_or_default();

		if param_kind_codes.is_empty() {
			return self.get_evaluated_type(&base_name, &[], 0);
		}

		// Arguments sit on the stacks in declaration order, so they pop in
		// reverse; kind codes are stored to match the pop order.
		let count = param_kind_codes.len();
		let mut params = vec![0i64; count];
		let mut field = 0u32;
		for (p, &code) in param_kind_codes.iter().enumerate() {
			let slot = count - 1 - p;
			match TemplateParameterKind::from_repr(code) {
				Some(TemplateParameterKind::Typename) => {
					params[slot] = type_stack.pop().ok_or(EvalError::MalformedCommandList {
						block: base_name.clone(),
						message: "type stack underflow in LookupType",
					})? as i64;
					field |= 1 << slot;
				}
				Some(TemplateParameterKind::Expression) => {
					params[slot] = value_stack.pop().ok_or(EvalError::MalformedCommandList {
						block: base_name.clone(),
						message: "value stack underflow in LookupType",
					})?;
				}
				None => {
					return Err(EvalError::MalformedCommandList {
						block: base_name,
						message: "unknown template parameter kind",
					})
				}
			}
		}
		self.get_evaluated_type(&base_name, &params, field)
	}

	pub fn set_global_parameter(&mut self, name: &str, value: i64) {
		self.global_parameters.insert(hash_name(name), value);
		// Fixed sizes may depend on globals referenced from expressions.
		self.calculated_sizes.clear();
	}

	pub fn global_parameter(&self, name_hash: u64) -> Option<i64> {
		self.global_parameters.get(&name_hash).copied()
	}

	fn set_size_state(&mut self, id: EvaluatedTypeId, state: CalculatedSize) {
		if self.calculated_sizes.len() < self.evaluated_types.len() {
			self.calculated_sizes.resize(self.evaluated_types.len(), CalculatedSize::Uncalculated);
		}
		self.calculated_sizes[id as usize] = state;
	}

	/// Computes the in-buffer size of a type when it is determined purely by
	/// the type and its template parameters. Types whose size depends on
	/// content read at runtime report `None` and are remembered as dynamic.
	pub fn try_calculate_fixed_size(&mut self, id: EvaluatedTypeId) -> Result<Option<usize>, EvalError> {
		if let Some(state) = self.calculated_sizes.get(id as usize) {
			match state {
				CalculatedSize::Fixed(size) => return Ok(Some(*size)),
				CalculatedSize::Dynamic => return Ok(None),
				CalculatedSize::Uncalculated => {}
			}
		}

		let evaluated = self.evaluated_type(id).clone();
		let Some(block_id) = evaluated.block_definition else {
			let size = evaluated.value_type.size();
			self.set_size_state(id, CalculatedSize::Fixed(size));
			return Ok(Some(size));
		};

		let schemata = self.schemata.clone();
		let def = schemata.block_definition(block_id);
		let block_name = schemata.block_definition_name(block_id);
		let cmds = &def.cmd_list;

		let mut cursor = 0usize;
		let mut type_stack: Vec<EvaluatedTypeId> = Vec::new();
		let mut value_stack: Vec<i64> = Vec::new();
		let mut local_members: Vec<Token> = Vec::new();
		let mut result = 0usize;

		let malformed = |message: &'static str| EvalError::MalformedCommandList {
			block: block_name.to_string(),
			message,
		};

		while cursor < cmds.len() {
			let cmd = Cmd::from_repr(cmds[cursor]).ok_or_else(|| malformed("unknown command"))?;
			cursor += 1;
			match cmd {
				Cmd::LookupType => {
					let base = *cmds.get(cursor).ok_or_else(|| malformed("truncated LookupType"))?;
					let count = *cmds.get(cursor + 1).ok_or_else(|| malformed("truncated LookupType"))? as usize;
					let codes = cmds
						.get(cursor + 2..cursor + 2 + count)
						.ok_or_else(|| malformed("truncated LookupType"))?;
					cursor += 2 + count;
					let resolved = self.resolve_type_command(
						base,
						codes,
						def,
						&mut type_stack,
						&mut value_stack,
						&evaluated.params,
						evaluated.param_type_field,
					)?;
					type_stack.push(resolved);
				}

				Cmd::EvaluateExpression => {
					let length = *cmds.get(cursor).ok_or_else(|| malformed("truncated expression"))? as usize;
					let expr = cmds
						.get(cursor + 1..cursor + 1 + length)
						.ok_or_else(|| malformed("truncated expression"))?;
					cursor += 1 + length;

					// Locally-read members get a stand-in value; if one is
					// actually consulted, the whole type is dynamic.
					let mut used_local = false;
					let globals = &self.global_parameters;
					let outcome = def.token_dictionary.evaluate_expression(expr, |token, token_id| {
						if local_members.contains(&token_id) {
							used_local = true;
							return Ok(Some(1));
						}
						for (p, &name) in def.template_parameter_names.iter().enumerate() {
							if name == token_id {
								return Ok(evaluated.params.get(p).copied());
							}
						}
						Ok(globals.get(&hash_name(&token.value)).copied())
					});
					if used_local {
						self.set_size_state(id, CalculatedSize::Dynamic);
						return Ok(None);
					}
					value_stack.push(outcome?);
				}

				Cmd::InlineIndividualMember | Cmd::InlineArrayMember => {
					let name = *cmds.get(cursor).ok_or_else(|| malformed("truncated member"))?;
					cursor += 1;
					let member_type = type_stack.pop().ok_or_else(|| malformed("type stack underflow"))?;
					let Some(member_size) = self.try_calculate_fixed_size(member_type)? else {
						self.set_size_state(id, CalculatedSize::Dynamic);
						return Ok(None);
					};
					if cmd == Cmd::InlineArrayMember {
						let count = value_stack.pop().ok_or_else(|| malformed("value stack underflow"))?;
						result += member_size * count.max(0) as usize;
					} else {
						result += member_size;
					}
					local_members.push(name);
				}

				Cmd::IfFalseThenJump => {
					let target = *cmds.get(cursor).ok_or_else(|| malformed("truncated jump"))? as usize;
					cursor += 1;
					let condition = value_stack.pop().ok_or_else(|| malformed("value stack underflow"))?;
					if target > cmds.len() {
						return Err(malformed("jump target out of range"));
					}
					if condition == 0 {
						cursor = target;
					}
				}
			}
		}

		self.set_size_state(id, CalculatedSize::Fixed(result));
		Ok(Some(result))
	}

	/// Renders an evaluated type the way it would be spelled in a schema.
	pub fn format_type(&self, id: EvaluatedTypeId) -> String {
		let mut out = String::new();
		self.write_type(&mut out, id);
		out
	}

	fn write_type(&self, out: &mut String, id: EvaluatedTypeId) {
		let evaluated = self.evaluated_type(id);
		if let Some(alias) = evaluated.alias {
			let _ = write!(out, "{}", self.schemata.alias_name(alias));
		} else if let Some(block) = evaluated.block_definition {
			let _ = write!(out, "{}", self.schemata.block_definition_name(block));
		} else {
			let _ = write!(out, "{}", evaluated.value_type.cat.name());
			if evaluated.value_type.array_count > 1 {
				let _ = write!(out, "[{}]", evaluated.value_type.array_count);
			}
			return;
		}

		if !evaluated.params.is_empty() {
			let _ = write!(out, "(");
			for (i, &param) in evaluated.params.iter().enumerate() {
				if i != 0 {
					let _ = write!(out, ", ");
				}
				if evaluated.param_type_field & (1 << i) != 0 {
					self.write_type(out, param as EvaluatedTypeId);
				} else {
					let _ = write!(out, "{param}");
				}
			}
			let _ = write!(out, ")");
		}
	}
}
