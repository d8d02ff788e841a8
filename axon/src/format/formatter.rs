use std::error::Error;
use std::fmt::{Display, Formatter};

use nohash_hasher::IntMap;

use crate::expr::ExpressionError;
use crate::format::context::{EvalError, EvaluatedTypeId, EvaluationContext};
use crate::format::typed::{self, TypeDesc, TypeHint};
use crate::format::Blob;
use crate::schema::{BlockDefinitionId, Cmd};
use crate::utilities::hash_name;

#[derive(Debug)]
pub enum FormatError {
	UnexpectedEnd { block: String, member: String, offset: usize },
	JumpOutOfRange { block: String, offset: usize },
	NonNumericLocalInExpression { name: String, block: String, offset: usize },
	UnknownCommand { command: u32, block: String, offset: usize },
	Expression { error: ExpressionError, block: String, offset: usize },
	Eval { error: EvalError, offset: usize },
	UnexpectedBlob { expected: &'static str, found: Blob, offset: usize },
	SkipOutOfRange { requested: u32, remaining: u32, offset: usize },
	Faulted,
}

impl Display for FormatError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::UnexpectedEnd { block, member, offset } => {
				write!(f, "read past the end of data at offset {offset} while reading block {block:?}, member {member:?}")
			}
			Self::JumpOutOfRange { block, offset } => {
				write!(f, "conditional jump target out of range in block {block:?} at offset {offset}")
			}
			Self::NonNumericLocalInExpression { name, block, offset } => {
				write!(f, "expression in block {block:?} at offset {offset} references non-numeric member {name:?}")
			}
			Self::UnknownCommand { command, block, offset } => {
				write!(f, "unknown command {command:#x} in block {block:?} at offset {offset}")
			}
			Self::Expression { error, block, offset } => {
				write!(f, "expression in block {block:?} at offset {offset} failed: {error}")
			}
			Self::Eval { error, offset } => write!(f, "type evaluation failed at offset {offset}: {error}"),
			Self::UnexpectedBlob { expected, found, offset } => {
				write!(f, "expected {expected} at offset {offset}, found {found:?}")
			}
			Self::SkipOutOfRange { requested, remaining, offset } => {
				write!(f, "cannot skip {requested} array elements at offset {offset}, only {remaining} remain")
			}
			Self::Faulted => f.write_str("formatter is in a failed state"),
		}
	}
}

impl Error for FormatError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			Self::Expression { error, .. } => Some(error),
			Self::Eval { error, .. } => Some(error),
			_ => None,
		}
	}
}

/// One value event read out of the buffer.
#[derive(Debug, Copy, Clone)]
pub struct ValueItem<'d> {
	pub data: &'d [u8],
	pub type_desc: TypeDesc,
	pub evaluated_type: EvaluatedTypeId,
}

struct BlockFrame {
	definition: BlockDefinitionId,
	block_name: String,
	cmd_cursor: usize,
	type_stack: Vec<EvaluatedTypeId>,
	value_stack: Vec<i64>,
	template_params: Vec<i64>,
	template_params_type_field: u32,
	pending_array_members: u32,
	pending_array_type: EvaluatedTypeId,
	pending_end_array: bool,
	/// Values of members read so far, keyed by name hash; expressions later
	/// in the block may reference them.
	local_context: IntMap<u64, i64>,
	non_integer_locals: Vec<u64>,
}

/// Streaming cursor over a byte buffer, driven by a block definition's
/// command list. Events are produced in on-disk order; after any successful
/// `try_*` call the cursor has advanced past exactly the bytes of that event.
///
/// A hard fault (out-of-bounds read, malformed command stream) leaves the
/// formatter in a terminal failed state; subsequent calls return
/// [`FormatError::Faulted`] without further side effects.
pub struct BinaryFormatter<'c, 'd> {
	ctx: &'c mut EvaluationContext,
	data: &'d [u8],
	offset: usize,
	frames: Vec<BlockFrame>,
	queued: Blob,
	faulted: bool,
}

impl<'c, 'd> BinaryFormatter<'c, 'd> {
	pub fn new(ctx: &'c mut EvaluationContext, data: &'d [u8]) -> Self {
		Self {
			ctx,
			data,
			offset: 0,
			frames: Vec::new(),
			queued: Blob::None,
			faulted: false,
		}
	}

	/// Pushes a pattern frame; subsequent events walk `data` as one instance
	/// of the given block definition.
	pub fn push_pattern(&mut self, block: BlockDefinitionId, template_params: &[i64], template_params_type_field: u32) {
		self.queued = Blob::None;
		let block_name = self.ctx.schemata().block_definition_name(block).to_string();
		self.frames.push(BlockFrame {
			definition: block,
			block_name,
			cmd_cursor: 0,
			type_stack: Vec::new(),
			value_stack: Vec::new(),
			template_params: template_params.to_vec(),
			template_params_type_field,
			pending_array_members: 0,
			pending_array_type: 0,
			pending_end_array: false,
			local_context: Default::default(),
			non_integer_locals: Vec::new(),
		});
	}

	#[inline]
	pub fn context(&self) -> &EvaluationContext {
		self.ctx
	}

	#[inline]
	pub fn context_mut(&mut self) -> &mut EvaluationContext {
		self.ctx
	}

	#[inline]
	pub fn data(&self) -> &'d [u8] {
		self.data
	}

	#[inline]
	pub fn offset(&self) -> usize {
		self.offset
	}

	#[inline]
	pub fn remaining_data(&self) -> &'d [u8] {
		let buffer = self.data;
		&buffer[self.offset..]
	}

	#[inline]
	fn slice(&self, from: usize, to: usize) -> &'d [u8] {
		let buffer = self.data;
		&buffer[from..to]
	}

	fn guard(&self) -> Result<(), FormatError> {
		match self.faulted {
			true => Err(FormatError::Faulted),
			false => Ok(()),
		}
	}

	fn poison(&mut self, error: FormatError) -> FormatError {
		self.faulted = true;
		error
	}

	/// Advances command execution up to the next event boundary without
	/// consuming the event.
	pub fn peek_next(&mut self) -> Result<Blob, FormatError> {
		self.guard()?;
		self.peek_inner().map_err(|e| self.poison(e))
	}

	pub fn try_keyed_item(&mut self) -> Result<Option<String>, FormatError> {
		self.guard()?;
		self.keyed_item_inner().map_err(|e| self.poison(e))
	}

	pub fn try_begin_block(&mut self) -> Result<Option<EvaluatedTypeId>, FormatError> {
		self.guard()?;
		self.begin_block_inner().map_err(|e| self.poison(e))
	}

	pub fn try_end_block(&mut self) -> Result<bool, FormatError> {
		self.guard()?;
		self.end_block_inner().map_err(|e| self.poison(e))
	}

	pub fn try_begin_array(&mut self) -> Result<Option<(u32, EvaluatedTypeId)>, FormatError> {
		self.guard()?;
		self.begin_array_inner().map_err(|e| self.poison(e))
	}

	pub fn try_end_array(&mut self) -> Result<bool, FormatError> {
		self.guard()?;
		self.end_array_inner().map_err(|e| self.poison(e))
	}

	pub fn try_value(&mut self) -> Result<Option<ValueItem<'d>>, FormatError> {
		self.guard()?;
		self.value_inner().map_err(|e| self.poison(e))
	}

	/// Skips `count` elements of the pending array, taking the fixed-size
	/// fast path when the element size is content-independent.
	pub fn skip_array_elements(&mut self, count: u32) -> Result<&'d [u8], FormatError> {
		self.guard()?;
		self.skip_array_elements_inner(count).map_err(|e| self.poison(e))
	}

	/// Reads and discards the next complete blob (value, block or array),
	/// returning the bytes it covered.
	pub fn skip_next_blob(&mut self) -> Result<&'d [u8], FormatError> {
		self.guard()?;
		self.skip_blob_inner().map_err(|e| self.poison(e))
	}

	fn peek_inner(&mut self) -> Result<Blob, FormatError> {
		if self.frames.is_empty() {
			return Ok(Blob::None);
		}
		if self.queued != Blob::None {
			return Ok(self.queued);
		}

		let schemata = self.ctx.schemata().clone();
		let frame = self.frames.last_mut().unwrap();
		let def = schemata.block_definition(frame.definition);
		let cmds = &def.cmd_list;

		if frame.pending_array_members > 0 {
			let is_block = self.ctx.evaluated_type(frame.pending_array_type).block_definition.is_some();
			self.queued = if is_block { Blob::BeginBlock } else { Blob::ValueMember };
			return Ok(self.queued);
		} else if frame.pending_end_array {
			self.queued = Blob::EndArray;
			return Ok(self.queued);
		}

		while frame.cmd_cursor < cmds.len() {
			let offset = self.offset;
			let command = cmds[frame.cmd_cursor];
			let cmd = Cmd::from_repr(command).ok_or_else(|| FormatError::UnknownCommand {
				command,
				block: frame.block_name.clone(),
				offset,
			})?;
			match cmd {
				Cmd::LookupType => {
					let base = cmds[frame.cmd_cursor + 1];
					let count = cmds[frame.cmd_cursor + 2] as usize;
					let codes = &cmds[frame.cmd_cursor + 3..frame.cmd_cursor + 3 + count];
					frame.cmd_cursor += 3 + count;

					let resolved = self
						.ctx
						.resolve_type_command(
							base,
							codes,
							def,
							&mut frame.type_stack,
							&mut frame.value_stack,
							&frame.template_params,
							frame.template_params_type_field,
						)
						.map_err(|error| FormatError::Eval { error, offset })?;
					frame.type_stack.push(resolved);
				}

				Cmd::EvaluateExpression => {
					let length = cmds[frame.cmd_cursor + 1] as usize;
					let expr = &cmds[frame.cmd_cursor + 2..frame.cmd_cursor + 2 + length];
					frame.cmd_cursor += 2 + length;

					// Resolution order: members read earlier in this block,
					// then template parameters, then global parameters.
					let local_context = &frame.local_context;
					let non_integer_locals = &frame.non_integer_locals;
					let template_params = &frame.template_params;
					let ctx = &*self.ctx;
					let outcome = def.token_dictionary.evaluate_expression(expr, |token, token_id| {
						let hash = hash_name(&token.value);
						if let Some(&value) = local_context.get(&hash) {
							return Ok(Some(value));
						}
						if non_integer_locals.contains(&hash) {
							return Err(ExpressionError::NonNumericVariable(token.value.clone()));
						}
						for (p, &name) in def.template_parameter_names.iter().enumerate() {
							if name == token_id {
								return Ok(template_params.get(p).copied());
							}
						}
						Ok(ctx.global_parameter(hash))
					});
					let value = outcome.map_err(|error| match error {
						ExpressionError::NonNumericVariable(name) => FormatError::NonNumericLocalInExpression {
							name,
							block: frame.block_name.clone(),
							offset,
						},
						error => FormatError::Expression { error, block: frame.block_name.clone(), offset },
					})?;
					frame.value_stack.push(value);
				}

				Cmd::InlineIndividualMember | Cmd::InlineArrayMember => {
					self.queued = Blob::KeyedItem;
					return Ok(self.queued);
				}

				Cmd::IfFalseThenJump => {
					let target = cmds[frame.cmd_cursor + 1] as usize;
					frame.cmd_cursor += 2;
					let condition = frame.value_stack.pop().ok_or_else(|| FormatError::Eval {
						error: EvalError::MalformedCommandList {
							block: frame.block_name.clone(),
							message: "value stack underflow in conditional",
						},
						offset,
					})?;
					if target > cmds.len() {
						return Err(FormatError::JumpOutOfRange { block: frame.block_name.clone(), offset });
					}
					if condition == 0 {
						frame.cmd_cursor = target;
					}
				}
			}
		}

		if self.frames.len() == 1 {
			return Ok(Blob::None);
		}
		self.queued = Blob::EndBlock;
		Ok(self.queued)
	}

	fn current_command(&self) -> Option<(Cmd, u32)> {
		let frame = self.frames.last()?;
		let def = self.ctx.schemata().block_definition(frame.definition);
		let cmd = Cmd::from_repr(*def.cmd_list.get(frame.cmd_cursor)?)?;
		let operand = *def.cmd_list.get(frame.cmd_cursor + 1)?;
		Some((cmd, operand))
	}

	fn is_char_alias(&self, id: EvaluatedTypeId) -> bool {
		let evaluated = self.ctx.evaluated_type(id);
		match evaluated.alias {
			Some(alias) => {
				evaluated.block_definition.is_none()
					&& evaluated.value_type.array_count <= 1
					&& self.ctx.schemata().alias_name(alias) == "char"
			}
			None => false,
		}
	}

	fn keyed_item_inner(&mut self) -> Result<Option<String>, FormatError> {
		if self.peek_inner()? != Blob::KeyedItem {
			return Ok(None);
		}
		let frame = self.frames.last().unwrap();
		if frame.pending_array_members > 0 || frame.pending_end_array {
			return Ok(None);
		}
		let Some((cmd, name_token)) = self.current_command() else { return Ok(None) };

		let frame = self.frames.last().unwrap();
		let &type_id = frame.type_stack.last().ok_or_else(|| FormatError::Eval {
			error: EvalError::MalformedCommandList {
				block: frame.block_name.clone(),
				message: "type stack underflow at member",
			},
			offset: self.offset,
		})?;

		self.queued = match cmd {
			Cmd::InlineIndividualMember => {
				match self.ctx.evaluated_type(type_id).block_definition.is_some() {
					true => Blob::BeginBlock,
					false => Blob::ValueMember,
				}
			}
			Cmd::InlineArrayMember => {
				// Arrays of the `char` alias compress into one string value.
				match self.is_char_alias(type_id) {
					true => Blob::ValueMember,
					false => Blob::BeginArray,
				}
			}
			_ => return Ok(None),
		};

		let frame = self.frames.last().unwrap();
		let def = self.ctx.schemata().block_definition(frame.definition);
		let name = def.token_dictionary.definition(name_token).map(|d| d.value.clone()).unwrap_or_default();
		Ok(Some(name))
	}

	fn begin_block_inner(&mut self) -> Result<Option<EvaluatedTypeId>, FormatError> {
		if self.frames.is_empty() {
			return Ok(None);
		}
		self.peek_inner()?;

		let frame = self.frames.last().unwrap();
		if frame.pending_array_members == 0 {
			if frame.pending_end_array {
				return Ok(None);
			}
			let Some((Cmd::InlineIndividualMember, name_token)) = self.current_command() else {
				return Ok(None);
			};
			let frame = self.frames.last().unwrap();
			let Some(&type_id) = frame.type_stack.last() else { return Ok(None) };

			let evaluated = self.ctx.evaluated_type(type_id);
			let Some(block_id) = evaluated.block_definition else { return Ok(None) };
			let template_params = evaluated.params.clone();
			let template_params_type_field = evaluated.param_type_field;

			let def = self.ctx.schemata().block_definition(frame.definition);
			let member_name = def.token_dictionary.definition(name_token).map(|d| d.value.clone()).unwrap_or_default();

			let frame = self.frames.last_mut().unwrap();
			frame.cmd_cursor += 2;
			frame.type_stack.pop();

			self.frames.push(BlockFrame {
				definition: block_id,
				block_name: member_name,
				cmd_cursor: 0,
				type_stack: Vec::new(),
				value_stack: Vec::new(),
				template_params,
				template_params_type_field,
				pending_array_members: 0,
				pending_array_type: 0,
				pending_end_array: false,
				local_context: Default::default(),
				non_integer_locals: Vec::new(),
			});
			self.queued = Blob::None;
			Ok(Some(type_id))
		} else {
			let type_id = frame.pending_array_type;
			let evaluated = self.ctx.evaluated_type(type_id);
			let Some(block_id) = evaluated.block_definition else { return Ok(None) };
			let template_params = evaluated.params.clone();
			let template_params_type_field = evaluated.param_type_field;
			let block_name = self.ctx.schemata().block_definition_name(block_id).to_string();

			let frame = self.frames.last_mut().unwrap();
			frame.pending_array_members -= 1;

			self.frames.push(BlockFrame {
				definition: block_id,
				block_name,
				cmd_cursor: 0,
				type_stack: Vec::new(),
				value_stack: Vec::new(),
				template_params,
				template_params_type_field,
				pending_array_members: 0,
				pending_array_type: 0,
				pending_end_array: false,
				local_context: Default::default(),
				non_integer_locals: Vec::new(),
			});
			self.queued = Blob::None;
			Ok(Some(type_id))
		}
	}

	fn end_block_inner(&mut self) -> Result<bool, FormatError> {
		if self.frames.len() <= 1 {
			return Ok(false);
		}
		let frame = self.frames.last().unwrap();
		if frame.pending_array_members > 0 || frame.pending_end_array {
			return Ok(false);
		}
		if self.peek_inner()? != Blob::EndBlock {
			return Ok(false);
		}
		self.frames.pop();
		self.queued = Blob::None;
		Ok(true)
	}

	fn begin_array_inner(&mut self) -> Result<Option<(u32, EvaluatedTypeId)>, FormatError> {
		if self.frames.is_empty() {
			return Ok(None);
		}
		self.peek_inner()?;

		let frame = self.frames.last().unwrap();
		if frame.pending_array_members > 0 || frame.pending_end_array {
			return Ok(None);
		}
		let Some((Cmd::InlineArrayMember, _)) = self.current_command() else {
			return Ok(None);
		};

		let frame = self.frames.last().unwrap();
		let Some(&type_id) = frame.type_stack.last() else { return Ok(None) };
		let Some(&count) = frame.value_stack.last() else { return Ok(None) };
		let count = count.max(0) as u32;
		let is_block = self.ctx.evaluated_type(type_id).block_definition.is_some();

		let frame = self.frames.last_mut().unwrap();
		frame.cmd_cursor += 2;
		frame.type_stack.pop();
		frame.value_stack.pop();
		frame.pending_array_members = count;
		frame.pending_array_type = type_id;
		frame.pending_end_array = true;

		self.queued = match count {
			0 => Blob::EndArray,
			_ if is_block => Blob::BeginBlock,
			_ => Blob::ValueMember,
		};
		Ok(Some((count, type_id)))
	}

	fn end_array_inner(&mut self) -> Result<bool, FormatError> {
		let Some(frame) = self.frames.last_mut() else { return Ok(false) };
		if !frame.pending_end_array || frame.pending_array_members != 0 {
			return Ok(false);
		}
		frame.pending_end_array = false;
		self.queued = Blob::None;
		Ok(true)
	}

	fn value_inner(&mut self) -> Result<Option<ValueItem<'d>>, FormatError> {
		if self.frames.is_empty() {
			return Ok(None);
		}
		self.peek_inner()?;
		let offset = self.offset;

		let frame = self.frames.last().unwrap();
		if frame.pending_array_members == 0 {
			if frame.pending_end_array {
				return Ok(None);
			}
			let Some((cmd, name_token)) = self.current_command() else { return Ok(None) };
			if cmd != Cmd::InlineIndividualMember && cmd != Cmd::InlineArrayMember {
				return Ok(None);
			}

			let frame = self.frames.last().unwrap();
			let Some(&type_id) = frame.type_stack.last() else { return Ok(None) };
			let evaluated = self.ctx.evaluated_type(type_id);
			if evaluated.block_definition.is_some() {
				return Ok(None);
			}
			let mut type_desc = evaluated.value_type;

			if cmd == Cmd::InlineArrayMember {
				if !self.is_char_alias(type_id) {
					return Ok(None);
				}
				let frame = self.frames.last().unwrap();
				let count = frame.value_stack.last().copied().unwrap_or(0);
				type_desc.array_count = count.max(0) as u32;
				type_desc.hint = TypeHint::String;
			}

			let frame = self.frames.last().unwrap();
			let def = self.ctx.schemata().block_definition(frame.definition);
			let member_name =
				def.token_dictionary.definition(name_token).map(|d| d.value.clone()).unwrap_or_default();

			let size = type_desc.size();
			if self.offset + size > self.data.len() {
				return Err(FormatError::UnexpectedEnd {
					block: frame.block_name.clone(),
					member: member_name,
					offset,
				});
			}
			let data = self.slice(self.offset, self.offset + size);

			let frame = self.frames.last_mut().unwrap();
			match typed::cast_to_i64(data, &type_desc) {
				Some(value) => {
					frame.local_context.insert(hash_name(&member_name), value);
				}
				None => frame.non_integer_locals.push(hash_name(&member_name)),
			}

			frame.cmd_cursor += 2;
			frame.type_stack.pop();
			if cmd == Cmd::InlineArrayMember {
				frame.value_stack.pop();
			}
			self.offset += size;
			self.queued = Blob::None;
			Ok(Some(ValueItem { data, type_desc, evaluated_type: type_id }))
		} else {
			let type_id = frame.pending_array_type;
			let evaluated = self.ctx.evaluated_type(type_id);
			if evaluated.block_definition.is_some() {
				return Ok(None);
			}
			let type_desc = evaluated.value_type;

			let size = type_desc.size();
			if self.offset + size > self.data.len() {
				return Err(FormatError::UnexpectedEnd {
					block: frame.block_name.clone(),
					member: "<array element>".to_string(),
					offset,
				});
			}
			let data = self.slice(self.offset, self.offset + size);

			let frame = self.frames.last_mut().unwrap();
			frame.pending_array_members -= 1;
			self.offset += size;
			self.queued = match frame.pending_array_members {
				0 => Blob::EndArray,
				_ => Blob::ValueMember,
			};
			Ok(Some(ValueItem { data, type_desc, evaluated_type: type_id }))
		}
	}

	fn skip_array_elements_inner(&mut self, count: u32) -> Result<&'d [u8], FormatError> {
		let offset = self.offset;
		let Some(frame) = self.frames.last() else {
			return Err(FormatError::UnexpectedBlob { expected: "a pending array", found: Blob::None, offset });
		};
		if count > frame.pending_array_members {
			return Err(FormatError::SkipOutOfRange {
				requested: count,
				remaining: frame.pending_array_members,
				offset,
			});
		}

		let element_type = frame.pending_array_type;
		let fixed = self
			.ctx
			.try_calculate_fixed_size(element_type)
			.map_err(|error| FormatError::Eval { error, offset })?;

		match fixed {
			Some(element_size) => {
				let total = element_size * count as usize;
				if self.offset + total > self.data.len() {
					let frame = self.frames.last().unwrap();
					return Err(FormatError::UnexpectedEnd {
						block: frame.block_name.clone(),
						member: "<array element>".to_string(),
						offset,
					});
				}
				let result = self.slice(self.offset, self.offset + total);
				self.offset += total;
				let frame = self.frames.last_mut().unwrap();
				frame.pending_array_members -= count;
				self.queued = Blob::None;
				Ok(result)
			}
			None => {
				// Dynamic element sizes degrade to per-element walking.
				let start = self.offset;
				for _ in 0..count {
					self.skip_blob_inner()?;
				}
				Ok(self.slice(start, self.offset))
			}
		}
	}

	fn skip_blob_inner(&mut self) -> Result<&'d [u8], FormatError> {
		let start = self.offset;
		match self.peek_inner()? {
			Blob::BeginArray => {
				let Some((count, _)) = self.begin_array_inner()? else {
					return Err(self.unexpected("an array", Blob::BeginArray));
				};
				self.skip_array_elements_inner(count)?;
				if !self.end_array_inner()? {
					return Err(self.unexpected("the end of an array", Blob::EndArray));
				}
				Ok(self.slice(start, self.offset))
			}
			Blob::BeginBlock => {
				let Some(type_id) = self.begin_block_inner()? else {
					return Err(self.unexpected("a block", Blob::BeginBlock));
				};
				let offset = self.offset;
				let fixed = self
					.ctx
					.try_calculate_fixed_size(type_id)
					.map_err(|error| FormatError::Eval { error, offset })?;
				match fixed {
					Some(size) => {
						if self.offset + size > self.data.len() {
							let frame = self.frames.last().unwrap();
							return Err(FormatError::UnexpectedEnd {
								block: frame.block_name.clone(),
								member: String::new(),
								offset,
							});
						}
						self.offset += size;
						self.frames.pop();
						self.queued = Blob::None;
					}
					None => {
						while self.peek_inner()? != Blob::EndBlock {
							self.skip_blob_inner()?;
						}
						if !self.end_block_inner()? {
							return Err(self.unexpected("the end of a block", Blob::EndBlock));
						}
					}
				}
				Ok(self.slice(start, self.offset))
			}
			Blob::ValueMember => {
				let Some(item) = self.value_inner()? else {
					return Err(self.unexpected("a value", Blob::ValueMember));
				};
				Ok(item.data)
			}
			Blob::KeyedItem => {
				self.keyed_item_inner()?;
				self.skip_blob_inner()?;
				Ok(self.slice(start, self.offset))
			}
			found => Err(self.unexpected("an array, block or member", found)),
		}
	}

	fn unexpected(&self, expected: &'static str, found: Blob) -> FormatError {
		FormatError::UnexpectedBlob { expected, found, offset: self.offset }
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::format::typed::TypeCat;
	use crate::schema::BinarySchemata;

	fn context(source: &str) -> EvaluationContext {
		let schemata = BinarySchemata::parse(source, "test.schema", None, None).unwrap();
		EvaluationContext::new(Arc::new(schemata))
	}

	fn formatter<'c, 'd>(
		ctx: &'c mut EvaluationContext,
		block: &str,
		data: &'d [u8],
	) -> BinaryFormatter<'c, 'd> {
		let block = ctx.schemata().find_block_definition(block).unwrap();
		let mut formatter = BinaryFormatter::new(ctx, data);
		formatter.push_pattern(block, &[], 0);
		formatter
	}

	// Flattened event stream, for walking whole patterns in tests.
	#[derive(Debug, Clone, PartialEq)]
	enum Ev {
		Key(String),
		Int(i64),
		Str(String),
		Begin,
		End,
		BeginArray(u32),
		EndArray,
	}

	fn drain(formatter: &mut BinaryFormatter) -> Vec<Ev> {
		let mut events = Vec::new();
		loop {
			match formatter.peek_next().unwrap() {
				Blob::None => return events,
				Blob::KeyedItem => {
					events.push(Ev::Key(formatter.try_keyed_item().unwrap().unwrap()));
				}
				Blob::ValueMember => {
					let item = formatter.try_value().unwrap().unwrap();
					match item.type_desc.hint {
						TypeHint::String => events.push(Ev::Str(
							String::from_utf8_lossy(item.data).into_owned(),
						)),
						TypeHint::None => events.push(Ev::Int(
							typed::cast_to_i64(item.data, &item.type_desc).unwrap_or(-1),
						)),
					}
				}
				Blob::BeginBlock => {
					formatter.try_begin_block().unwrap().unwrap();
					events.push(Ev::Begin);
				}
				Blob::EndBlock => {
					assert!(formatter.try_end_block().unwrap());
					events.push(Ev::End);
				}
				Blob::BeginArray => {
					let (count, _) = formatter.try_begin_array().unwrap().unwrap();
					events.push(Ev::BeginArray(count));
				}
				Blob::EndArray => {
					assert!(formatter.try_end_array().unwrap());
					events.push(Ev::EndArray);
				}
			}
		}
	}

	#[test]
	fn walks_a_primitive_fixed_block() {
		let mut ctx = context("block P { uint32 a; uint16 b; };");
		let mut formatter = formatter(&mut ctx, "P", &[0x01, 0x00, 0x00, 0x00, 0x02, 0x00]);
		let events = drain(&mut formatter);
		assert_eq!(events, vec![
			Ev::Key("a".into()),
			Ev::Int(1),
			Ev::Key("b".into()),
			Ev::Int(2),
		]);
		assert_eq!(formatter.offset(), 6);

		let p = ctx.get_evaluated_type("P", &[], 0).unwrap();
		assert_eq!(ctx.try_calculate_fixed_size(p).unwrap(), Some(6));
	}

	#[test]
	fn collapses_char_arrays_into_strings() {
		let mut ctx = context("alias char = uint8; block S { uint16 len; char text[len]; };");
		let mut formatter =
			formatter(&mut ctx, "S", &[0x05, 0x00, 0x48, 0x65, 0x6C, 0x6C, 0x6F]);
		let events = drain(&mut formatter);
		assert_eq!(events, vec![
			Ev::Key("len".into()),
			Ev::Int(5),
			Ev::Key("text".into()),
			Ev::Str("Hello".into()),
		]);
		assert_eq!(formatter.offset(), 7);

		let s = ctx.get_evaluated_type("S", &[], 0).unwrap();
		assert_eq!(ctx.try_calculate_fixed_size(s).unwrap(), None);
	}

	#[test]
	fn conditional_members_follow_earlier_values() {
		let source = "block C { uint8 flag;\n#if flag\nuint32 payload;\n#endif\nuint8 tail; };";

		let mut ctx = context(source);
		let mut low = formatter(&mut ctx, "C", &[0x00, 0xAA]);
		assert_eq!(drain(&mut low), vec![
			Ev::Key("flag".into()),
			Ev::Int(0),
			Ev::Key("tail".into()),
			Ev::Int(0xAA),
		]);

		let mut high = formatter(&mut ctx, "C", &[0x01, 0xEF, 0xBE, 0xAD, 0xDE, 0x7F]);
		assert_eq!(drain(&mut high), vec![
			Ev::Key("flag".into()),
			Ev::Int(1),
			Ev::Key("payload".into()),
			Ev::Int(0xDEADBEEF),
			Ev::Key("tail".into()),
			Ev::Int(0x7F),
		]);
	}

	#[test]
	fn template_instantiation_walks_nested_blocks() {
		let source = "block template(expr N) V { uint16 data[N]; }; block W { V(expr 3) v; };";
		let mut ctx = context(source);
		let mut formatter = formatter(&mut ctx, "W", &[0x01, 0x00, 0x02, 0x00, 0x03, 0x00]);
		assert_eq!(drain(&mut formatter), vec![
			Ev::Key("v".into()),
			Ev::Begin,
			Ev::Key("data".into()),
			Ev::BeginArray(3),
			Ev::Int(1),
			Ev::Int(2),
			Ev::Int(3),
			Ev::EndArray,
			Ev::End,
		]);
	}

	#[test]
	fn empty_block_on_empty_buffer_is_none() {
		let mut ctx = context("block E { };");
		let mut formatter = formatter(&mut ctx, "E", &[]);
		assert_eq!(formatter.peek_next().unwrap(), Blob::None);
	}

	#[test]
	fn zero_length_arrays_begin_and_end_back_to_back() {
		let mut ctx = context("block Z { uint16 count; uint32 data[count]; };");
		let mut formatter = formatter(&mut ctx, "Z", &[0x00, 0x00]);
		assert_eq!(drain(&mut formatter), vec![
			Ev::Key("count".into()),
			Ev::Int(0),
			Ev::Key("data".into()),
			Ev::BeginArray(0),
			Ev::EndArray,
		]);
	}

	#[test]
	fn reading_past_the_end_faults_terminally() {
		let mut ctx = context("block P { uint32 a; };");
		let mut formatter = formatter(&mut ctx, "P", &[0x01, 0x00]);
		assert_eq!(formatter.try_keyed_item().unwrap().unwrap(), "a");
		let error = formatter.try_value().unwrap_err();
		match &error {
			FormatError::UnexpectedEnd { block, member, offset } => {
				assert_eq!(block, "P");
				assert_eq!(member, "a");
				assert_eq!(*offset, 0);
			}
			other => panic!("expected UnexpectedEnd, got {other:?}"),
		}
		assert!(matches!(formatter.peek_next(), Err(FormatError::Faulted)));
	}

	#[test]
	fn non_numeric_locals_are_rejected_in_expressions() {
		let source = "alias char = uint8; block B { uint8 len; char text[len]; uint8 extra[text]; };";
		let mut ctx = context(source);
		let mut formatter = formatter(&mut ctx, "B", &[0x02, 0x41, 0x42, 0x00]);
		assert_eq!(formatter.try_keyed_item().unwrap().unwrap(), "len");
		formatter.try_value().unwrap().unwrap();
		assert_eq!(formatter.try_keyed_item().unwrap().unwrap(), "text");
		formatter.try_value().unwrap().unwrap();
		let error = formatter.peek_next().unwrap_err();
		assert!(matches!(error, FormatError::NonNumericLocalInExpression { name, .. } if name == "text"));
	}

	#[test]
	fn skip_matches_a_full_walk() {
		let source = "\
alias char = uint8;
block Inner { uint16 len; char text[len]; };
block Outer { uint8 head; Inner body; uint16 tail[2]; };
";
		let data: &[u8] = &[0x09, 0x03, 0x00, 0x41, 0x42, 0x43, 0x01, 0x00, 0x02, 0x00];

		let mut ctx = context(source);
		let mut walked = formatter(&mut ctx, "Outer", data);
		drain(&mut walked);
		let end_of_walk = walked.offset();
		assert_eq!(end_of_walk, data.len());

		let mut ctx = context(source);
		let mut skipping = formatter(&mut ctx, "Outer", data);
		while skipping.peek_next().unwrap() != Blob::None {
			skipping.skip_next_blob().unwrap();
		}
		assert_eq!(skipping.offset(), end_of_walk);
	}

	#[test]
	fn skip_array_elements_takes_the_fixed_fast_path() {
		let source = "block A { uint16 count; uint32 data[count]; uint8 tail; };";
		let data: &[u8] = &[
			0x03, 0x00, // count = 3
			0x0A, 0x00, 0x00, 0x00, 0x0B, 0x00, 0x00, 0x00, 0x0C, 0x00, 0x00, 0x00, 0x99,
		];
		let mut ctx = context(source);
		let mut formatter = formatter(&mut ctx, "A", data);

		assert_eq!(formatter.try_keyed_item().unwrap().unwrap(), "count");
		formatter.try_value().unwrap().unwrap();
		assert_eq!(formatter.try_keyed_item().unwrap().unwrap(), "data");
		let (count, _) = formatter.try_begin_array().unwrap().unwrap();
		let skipped = formatter.skip_array_elements(count).unwrap();
		assert_eq!(skipped.len(), 12);
		assert!(formatter.try_end_array().unwrap());

		assert_eq!(formatter.try_keyed_item().unwrap().unwrap(), "tail");
		let tail = formatter.try_value().unwrap().unwrap();
		assert_eq!(typed::cast_to_i64(tail.data, &tail.type_desc), Some(0x99));
	}

	#[test]
	fn skip_zero_elements_is_a_no_op() {
		let source = "block A { uint16 count; uint32 data[count]; };";
		let mut ctx = context(source);
		let mut formatter = formatter(&mut ctx, "A", &[0x00, 0x00]);
		formatter.try_keyed_item().unwrap();
		formatter.try_value().unwrap();
		formatter.try_keyed_item().unwrap();
		formatter.try_begin_array().unwrap().unwrap();
		let offset = formatter.offset();
		let skipped = formatter.skip_array_elements(0).unwrap();
		assert!(skipped.is_empty());
		assert_eq!(formatter.offset(), offset);
		assert!(formatter.try_end_array().unwrap());
	}

	#[test]
	fn fixed_size_agreement_with_the_walk() {
		let source = "block F { uint32 a; uint16 b; uint8 c[3]; };";
		let mut ctx = context(source);
		let id = ctx.get_evaluated_type("F", &[], 0).unwrap();
		// The inline `[3]` is an array member with a constant count.
		let size = ctx.try_calculate_fixed_size(id).unwrap().unwrap();
		assert_eq!(size, 9);

		let data = vec![0u8; size];
		let mut formatter = formatter(&mut ctx, "F", &data);
		drain(&mut formatter);
		assert_eq!(formatter.offset(), size);
	}

	#[test]
	fn global_parameters_resolve_in_member_expressions() {
		let mut ctx = context("block G { uint16 data[COUNT]; };");
		ctx.set_global_parameter("COUNT", 2);
		let mut formatter = formatter(&mut ctx, "G", &[0x01, 0x00, 0x02, 0x00]);
		assert_eq!(drain(&mut formatter), vec![
			Ev::Key("data".into()),
			Ev::BeginArray(2),
			Ev::Int(1),
			Ev::Int(2),
			Ev::EndArray,
		]);
	}

	#[test]
	fn typename_template_parameters_substitute_into_members() {
		let source = "\
block template(typename T) Holder { T value; };
block Pair { Holder(typename uint16) a; Holder(typename uint32) b; };
";
		let mut ctx = context(source);
		let mut formatter = formatter(&mut ctx, "Pair", &[0x05, 0x00, 0x07, 0x00, 0x00, 0x00]);
		assert_eq!(drain(&mut formatter), vec![
			Ev::Key("a".into()),
			Ev::Begin,
			Ev::Key("value".into()),
			Ev::Int(5),
			Ev::End,
			Ev::Key("b".into()),
			Ev::Begin,
			Ev::Key("value".into()),
			Ev::Int(7),
			Ev::End,
		]);

		let holder_u16 = {
			let inner = ctx.get_evaluated_type("uint16", &[], 0).unwrap();
			ctx.get_evaluated_type("Holder", &[inner as i64], 1).unwrap()
		};
		assert_eq!(ctx.try_calculate_fixed_size(holder_u16).unwrap(), Some(2));
	}

	#[test]
	fn arrays_of_blocks_walk_each_element() {
		let source = "block Item { uint8 v; }; block L { uint8 n; Item items[n]; };";
		let mut ctx = context(source);
		let mut formatter = formatter(&mut ctx, "L", &[0x02, 0x0A, 0x0B]);
		assert_eq!(drain(&mut formatter), vec![
			Ev::Key("n".into()),
			Ev::Int(2),
			Ev::Key("items".into()),
			Ev::BeginArray(2),
			Ev::Begin,
			Ev::Key("v".into()),
			Ev::Int(0x0A),
			Ev::End,
			Ev::Begin,
			Ev::Key("v".into()),
			Ev::Int(0x0B),
			Ev::End,
			Ev::EndArray,
		]);
	}

	#[test]
	fn validation_indexes_do_not_change_formatter_state() {
		// A formatter with no pattern yields nothing.
		let mut ctx = context("block P { uint32 a; };");
		let mut formatter = BinaryFormatter::new(&mut ctx, &[1, 2, 3]);
		assert_eq!(formatter.peek_next().unwrap(), Blob::None);
		assert_eq!(formatter.try_keyed_item().unwrap(), None);
		assert!(!formatter.try_end_block().unwrap());
	}
}
