use std::fmt::Write;

use fxhash::FxHashMap;

use crate::depval::DependencyValidation;
use crate::expr::{Token, TokenDictionary};
use crate::lex::{ConditionalTokenizer, IncludeHandler};

mod errors;
mod ops;
mod parser;

pub use errors::SchemaError;
pub use ops::{Cmd, TemplateParameterKind};

pub type BlockDefinitionId = u32;
pub type AliasId = u32;
pub type BitFieldId = u32;
pub type LiteralsId = u32;

/// Compiled form of a `block` declaration: a flat command stream plus the
/// dictionary its name and expression tokens live in.
#[derive(Debug, Clone, Default)]
pub struct BlockDefinition {
	pub token_dictionary: TokenDictionary,
	pub cmd_list: Vec<u32>,
	pub template_parameter_names: Vec<Token>,
	/// Bit `i` set means template parameter `i` is a typename parameter.
	pub template_parameter_type_field: u32,
}

/// A textual type reference, e.g. `Vertex(expr stride, typename Position)`.
#[derive(Debug, Clone)]
pub struct TypeRef {
	pub base_name: String,
	pub args: Vec<TypeRefArg>,
}

#[derive(Debug, Clone)]
pub enum TypeRefArg {
	Typename(TypeRef),
	/// Postfix expression in the owning declaration's dictionary.
	Expression(Vec<Token>),
}

#[derive(Debug, Clone)]
pub struct Alias {
	pub target: TypeRef,
	pub token_dictionary: TokenDictionary,
	pub bit_field: Option<BitFieldId>,
	pub literals: Option<LiteralsId>,
}

#[derive(Debug, Clone)]
pub struct BitRange {
	pub min_bit: u32,
	pub bit_count: u32,
	pub name: String,
	pub storage_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BitFieldDefinition {
	pub ranges: Vec<BitRange>,
}

impl BitFieldDefinition {
	/// Extracts every declared bit range from `value`, in declaration order.
	pub fn decode(&self, value: u64) -> impl Iterator<Item = (&str, u64)> + '_ {
		self.ranges.iter().map(move |range| {
			let mask = match range.bit_count {
				64 => u64::MAX,
				count => (1u64 << count) - 1,
			};
			(range.name.as_str(), (value >> range.min_bit) & mask)
		})
	}
}

/// Named integer constants, e.g. an enumerant table.
#[derive(Debug, Clone, Default)]
pub struct LiteralTable {
	values: Vec<(String, i64)>,
}

impl LiteralTable {
	pub(crate) fn insert(&mut self, name: &str, value: i64) {
		match self.values.iter_mut().find(|(n, _)| n == name) {
			Some(entry) => entry.1 = value,
			None => self.values.push((name.to_string(), value)),
		}
	}

	pub fn find(&self, name: &str) -> Option<i64> {
		self.values.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
	}

	/// First name bound to `value`, in declaration order.
	pub fn name_of(&self, value: i64) -> Option<&str> {
		self.values.iter().find(|(_, v)| *v == value).map(|(n, _)| n.as_str())
	}

	pub fn values(&self) -> impl Iterator<Item = (&str, i64)> + '_ {
		self.values.iter().map(|(n, v)| (n.as_str(), *v))
	}

	pub fn len(&self) -> usize {
		self.values.len()
	}

	pub fn is_empty(&self) -> bool {
		self.values.is_empty()
	}
}

/// The parsed form of a schema source file: block definitions, type aliases,
/// bitfield layouts and literal tables. Immutable once parsed; share freely.
#[derive(Debug, Default)]
pub struct BinarySchemata {
	aliases: Vec<(String, Alias)>,
	block_definitions: Vec<(String, BlockDefinition)>,
	bit_fields: Vec<(String, BitFieldDefinition)>,
	literals: Vec<(String, LiteralTable)>,

	alias_lookup: FxHashMap<String, AliasId>,
	block_lookup: FxHashMap<String, BlockDefinitionId>,
	bit_field_lookup: FxHashMap<String, BitFieldId>,
	literals_lookup: FxHashMap<String, LiteralsId>,
}

impl BinarySchemata {
	/// Parses schema source text. Included files are opened through
	/// `include_handler` and, along with `filename`, registered on `depval`.
	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	pub fn parse(
		source: &str,
		filename: &str,
		include_handler: Option<&mut dyn IncludeHandler>,
		depval: Option<&DependencyValidation>,
	) -> Result<Self, SchemaError> {
		let mut tokenizer = ConditionalTokenizer::new(source, filename, include_handler);
		let mut schemata = Self::default();
		parser::parse_unit(&mut schemata, &mut tokenizer)?;

		if let Some(depval) = depval {
			if !filename.is_empty() {
				depval.register_file(filename);
			}
			for file in tokenizer.dependent_files() {
				depval.register_file(file);
			}
		}
		Ok(schemata)
	}

	#[cfg(feature = "memmap2")]
	pub fn parse_file(
		path: impl AsRef<std::path::Path>,
		include_handler: Option<&mut dyn IncludeHandler>,
		depval: Option<&DependencyValidation>,
	) -> Result<Self, SchemaError> {
		let file = std::fs::File::open(&path)?;
		let bytes = unsafe { memmap2::Mmap::map(&file) }?;
		let source = std::str::from_utf8(&bytes).map_err(|_| SchemaError::ParseFailed {
			message: "schema source is not valid UTF-8".to_string(),
			filename: path.as_ref().to_string_lossy().into_owned(),
			location: Default::default(),
		})?;
		Self::parse(source, &path.as_ref().to_string_lossy(), include_handler, depval)
	}

	pub fn find_block_definition(&self, name: &str) -> Option<BlockDefinitionId> {
		self.block_lookup.get(name).copied()
	}

	pub fn find_alias(&self, name: &str) -> Option<AliasId> {
		self.alias_lookup.get(name).copied()
	}

	pub fn find_bit_field(&self, name: &str) -> Option<BitFieldId> {
		self.bit_field_lookup.get(name).copied()
	}

	pub fn find_literals(&self, name: &str) -> Option<LiteralsId> {
		self.literals_lookup.get(name).copied()
	}

	pub fn block_definition(&self, id: BlockDefinitionId) -> &BlockDefinition {
		&self.block_definitions[id as usize].1
	}

	pub fn alias(&self, id: AliasId) -> &Alias {
		&self.aliases[id as usize].1
	}

	pub(crate) fn alias_mut(&mut self, id: AliasId) -> &mut Alias {
		&mut self.aliases[id as usize].1
	}

	pub fn bit_field(&self, id: BitFieldId) -> &BitFieldDefinition {
		&self.bit_fields[id as usize].1
	}

	pub fn literals(&self, id: LiteralsId) -> &LiteralTable {
		&self.literals[id as usize].1
	}

	pub fn block_definition_name(&self, id: BlockDefinitionId) -> &str {
		&self.block_definitions[id as usize].0
	}

	pub fn alias_name(&self, id: AliasId) -> &str {
		&self.aliases[id as usize].0
	}

	pub fn bit_field_name(&self, id: BitFieldId) -> &str {
		&self.bit_fields[id as usize].0
	}

	pub fn literals_name(&self, id: LiteralsId) -> &str {
		&self.literals[id as usize].0
	}

	pub fn block_definitions(&self) -> impl Iterator<Item = (&str, &BlockDefinition)> + '_ {
		self.block_definitions.iter().map(|(n, d)| (n.as_str(), d))
	}

	pub fn aliases(&self) -> impl Iterator<Item = (&str, &Alias)> + '_ {
		self.aliases.iter().map(|(n, d)| (n.as_str(), d))
	}

	pub fn bit_fields(&self) -> impl Iterator<Item = (&str, &BitFieldDefinition)> + '_ {
		self.bit_fields.iter().map(|(n, d)| (n.as_str(), d))
	}

	pub fn literal_tables(&self) -> impl Iterator<Item = (&str, &LiteralTable)> + '_ {
		self.literals.iter().map(|(n, d)| (n.as_str(), d))
	}

	pub(crate) fn insert_block_definition(&mut self, name: &str, def: BlockDefinition) -> BlockDefinitionId {
		let id = self.block_definitions.len() as BlockDefinitionId;
		self.block_definitions.push((name.to_string(), def));
		self.block_lookup.insert(name.to_string(), id);
		id
	}

	pub(crate) fn insert_alias(&mut self, name: &str, alias: Alias) -> AliasId {
		let id = self.aliases.len() as AliasId;
		self.aliases.push((name.to_string(), alias));
		self.alias_lookup.insert(name.to_string(), id);
		id
	}

	pub(crate) fn insert_bit_field(&mut self, name: &str, def: BitFieldDefinition) -> BitFieldId {
		let id = self.bit_fields.len() as BitFieldId;
		self.bit_fields.push((name.to_string(), def));
		self.bit_field_lookup.insert(name.to_string(), id);
		id
	}

	pub(crate) fn insert_literals(&mut self, name: &str, table: LiteralTable) -> LiteralsId {
		let id = self.literals.len() as LiteralsId;
		self.literals.push((name.to_string(), table));
		self.literals_lookup.insert(name.to_string(), id);
		id
	}

	pub(crate) fn contains_name(&self, name: &str) -> bool {
		self.block_lookup.contains_key(name)
			|| self.alias_lookup.contains_key(name)
			|| self.bit_field_lookup.contains_key(name)
			|| self.literals_lookup.contains_key(name)
	}

	/// Renders an equivalent schema source. Parsing the output yields a
	/// schemata with the same declarations and the same walk behavior;
	/// conditional regions reappear as plain `#if` blocks.
	pub fn write_source(&self, out: &mut String) {
		for (name, table) in self.literal_tables() {
			let _ = writeln!(out, "literals {name} {{");
			for (literal, value) in table.values() {
				let _ = writeln!(out, "\t{literal} = {value};");
			}
			let _ = writeln!(out, "}};");
		}

		for (name, def) in self.bit_fields() {
			let _ = writeln!(out, "bitfield {name} {{");
			for range in &def.ranges {
				let _ = write!(out, "\t{} : {} {}", range.min_bit, range.bit_count, range.name);
				if let Some(storage) = &range.storage_type {
					let _ = write!(out, " : {storage}");
				}
				let _ = writeln!(out, ";");
			}
			let _ = writeln!(out, "}};");
		}

		for (name, alias) in self.aliases() {
			let _ = write!(out, "alias {name} = ");
			render_type_ref(out, &alias.target, &alias.token_dictionary);
			match (alias.bit_field, alias.literals) {
				(Some(id), _) => {
					let _ = write!(out, " : {}", self.bit_field_name(id));
				}
				(_, Some(id)) => {
					let _ = write!(out, " : {}", self.literals_name(id));
				}
				_ => {}
			}
			let _ = writeln!(out, ";");
		}

		for (name, def) in self.block_definitions() {
			render_block_definition(out, name, def);
		}
	}
}

fn render_type_ref(out: &mut String, type_ref: &TypeRef, dict: &TokenDictionary) {
	let _ = write!(out, "{}", type_ref.base_name);
	if type_ref.args.is_empty() {
		return;
	}
	let _ = write!(out, "(");
	for (i, arg) in type_ref.args.iter().enumerate() {
		if i != 0 {
			let _ = write!(out, ", ");
		}
		match arg {
			TypeRefArg::Typename(inner) => {
				let _ = write!(out, "typename ");
				render_type_ref(out, inner, dict);
			}
			TypeRefArg::Expression(expr) => {
				let rendered = dict.render_expression(expr).unwrap_or_default();
				let _ = write!(out, "expr {rendered}");
			}
		}
	}
	let _ = write!(out, ")");
}

/// Decompiles a block's command list back into declaration statements.
fn render_block_definition(out: &mut String, name: &str, def: &BlockDefinition) {
	let dict = &def.token_dictionary;
	let _ = write!(out, "block ");
	if !def.template_parameter_names.is_empty() {
		let _ = write!(out, "template(");
		for (i, &param) in def.template_parameter_names.iter().enumerate() {
			if i != 0 {
				let _ = write!(out, ", ");
			}
			let kind = match def.template_parameter_type_field & (1 << i) {
				0 => "expr",
				_ => "typename",
			};
			let param_name = dict.definition(param).map(|d| d.value.as_str()).unwrap_or("?");
			let _ = write!(out, "{kind} {param_name}");
		}
		let _ = write!(out, ") ");
	}
	let _ = writeln!(out, "{name} {{");

	let cmds = &def.cmd_list;
	let mut cursor = 0usize;
	let mut type_stack: Vec<String> = Vec::new();
	let mut value_stack: Vec<String> = Vec::new();
	let mut pending_endifs: Vec<usize> = Vec::new();

	while cursor < cmds.len() {
		while pending_endifs.last() == Some(&cursor) {
			pending_endifs.pop();
			let _ = writeln!(out, "#endif");
		}

		let Some(cmd) = Cmd::from_repr(cmds[cursor]) else { break };
		cursor += 1;
		match cmd {
			Cmd::LookupType => {
				let base = cmds[cursor] as Token;
				let param_count = cmds[cursor + 1] as usize;
				let kinds = &cmds[cursor + 2..cursor + 2 + param_count];
				cursor += 2 + param_count;

				let base_name = dict.definition(base).map(|d| d.value.clone()).unwrap_or_default();
				if param_count == 0 {
					type_stack.push(base_name);
				} else {
					// Kind codes are stored in reverse argument order.
					let mut args = Vec::with_capacity(param_count);
					for &kind in kinds {
						match TemplateParameterKind::from_repr(kind) {
							Some(TemplateParameterKind::Typename) => {
								args.push(format!("typename {}", type_stack.pop().unwrap_or_default()));
							}
							_ => args.push(format!("expr {}", value_stack.pop().unwrap_or_default())),
						}
					}
					args.reverse();
					type_stack.push(format!("{base_name}({})", args.join(", ")));
				}
			}
			Cmd::EvaluateExpression => {
				let length = cmds[cursor] as usize;
				let expr: Vec<Token> = cmds[cursor + 1..cursor + 1 + length].to_vec();
				cursor += 1 + length;
				value_stack.push(dict.render_expression(&expr).unwrap_or_default());
			}
			Cmd::InlineIndividualMember => {
				let member = dict.definition(cmds[cursor] as Token).map(|d| d.value.clone()).unwrap_or_default();
				cursor += 1;
				let ty = type_stack.pop().unwrap_or_default();
				let _ = writeln!(out, "\t{ty} {member};");
			}
			Cmd::InlineArrayMember => {
				let member = dict.definition(cmds[cursor] as Token).map(|d| d.value.clone()).unwrap_or_default();
				cursor += 1;
				let ty = type_stack.pop().unwrap_or_default();
				let count = value_stack.pop().unwrap_or_default();
				let _ = writeln!(out, "\t{ty} {member}[{count}];");
			}
			Cmd::IfFalseThenJump => {
				let target = cmds[cursor] as usize;
				cursor += 1;
				let condition = value_stack.pop().unwrap_or_default();
				let _ = writeln!(out, "#if {condition}");
				pending_endifs.push(target);
			}
		}
	}
	while pending_endifs.pop().is_some() {
		let _ = writeln!(out, "#endif");
	}
	let _ = writeln!(out, "}};");
}
