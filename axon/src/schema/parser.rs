use crate::expr::{parse_expression, TokenDictionary, TokenKind};
use crate::format::typed::TypeCat;
use crate::lex::{ConditionalTokenizer, Token as LexToken};
use crate::schema::{
	Alias, AliasId, BinarySchemata, BitFieldDefinition, BitRange, BlockDefinition, Cmd, LiteralTable, SchemaError,
	TemplateParameterKind, TypeRef, TypeRefArg,
};

fn parse_failed(tokenizer: &ConditionalTokenizer, message: impl Into<String>) -> SchemaError {
	SchemaError::ParseFailed {
		message: message.into(),
		filename: tokenizer.filename().to_string(),
		location: tokenizer.location(),
	}
}

fn next_required(tokenizer: &mut ConditionalTokenizer) -> Result<LexToken, SchemaError> {
	match tokenizer.next_token()? {
		Some(token) => Ok(token),
		None => Err(parse_failed(tokenizer, "unexpected end of schema source")),
	}
}

fn expect(tokenizer: &mut ConditionalTokenizer, value: &str) -> Result<(), SchemaError> {
	let token = next_required(tokenizer)?;
	match token.value == value {
		true => Ok(()),
		false => Err(parse_failed(tokenizer, format!("expected {value:?}, found {:?}", token.value))),
	}
}

fn expect_identifier(tokenizer: &mut ConditionalTokenizer) -> Result<LexToken, SchemaError> {
	let token = next_required(tokenizer)?;
	let is_identifier = token
		.value
		.chars()
		.next()
		.map(|c| c.is_ascii_alphabetic() || c == '_')
		.unwrap_or(false);
	match is_identifier {
		true => Ok(token),
		false => Err(parse_failed(tokenizer, format!("expected an identifier, found {:?}", token.value))),
	}
}

fn parse_int(text: &str) -> Option<i64> {
	let (negative, digits) = match text.strip_prefix('-') {
		Some(rest) => (true, rest),
		None => (false, text),
	};
	let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
		Some(hex) => u64::from_str_radix(hex, 16).ok()?,
		None => digits.parse::<u64>().ok()?,
	};
	let value = magnitude as i64;
	Some(if negative { value.wrapping_neg() } else { value })
}

pub(crate) fn parse_unit(
	schemata: &mut BinarySchemata,
	tokenizer: &mut ConditionalTokenizer,
) -> Result<(), SchemaError> {
	let mut pending_decoders: Vec<(AliasId, String)> = Vec::new();
	while let Some(token) = tokenizer.next_token()? {
		match token.value.as_str() {
			"block" => parse_block(schemata, tokenizer)?,
			"alias" => parse_alias(schemata, tokenizer, &mut pending_decoders)?,
			"bitfield" => parse_bit_field(schemata, tokenizer)?,
			"literals" => parse_literals(schemata, tokenizer)?,
			other => return Err(parse_failed(tokenizer, format!("expected a declaration, found {other:?}"))),
		}
	}
	resolve_decoders(schemata, pending_decoders)?;
	validate_references(schemata)
}

fn check_duplicate(
	schemata: &BinarySchemata,
	tokenizer: &ConditionalTokenizer,
	name: &str,
) -> Result<(), SchemaError> {
	match schemata.contains_name(name) {
		true => Err(parse_failed(tokenizer, format!("duplicate definition of {name:?}"))),
		false => Ok(()),
	}
}

fn parse_block(schemata: &mut BinarySchemata, tokenizer: &mut ConditionalTokenizer) -> Result<(), SchemaError> {
	let mut def = BlockDefinition::default();

	let first = expect_identifier(tokenizer)?;
	let name = if first.value == "template" {
		expect(tokenizer, "(")?;
		loop {
			let kind = expect_identifier(tokenizer)?;
			let is_typename = match kind.value.as_str() {
				"typename" => true,
				"expr" => false,
				other => {
					return Err(parse_failed(tokenizer, format!("expected \"typename\" or \"expr\", found {other:?}")))
				}
			};
			let param = expect_identifier(tokenizer)?;
			let param_token = def.token_dictionary.get_token(TokenKind::Variable, &param.value);
			if is_typename {
				def.template_parameter_type_field |= 1 << def.template_parameter_names.len();
			}
			def.template_parameter_names.push(param_token);

			let separator = next_required(tokenizer)?;
			match separator.value.as_str() {
				"," => continue,
				")" => break,
				other => return Err(parse_failed(tokenizer, format!("expected ',' or ')', found {other:?}"))),
			}
		}
		expect_identifier(tokenizer)?.value
	} else {
		first.value
	};
	check_duplicate(schemata, tokenizer, &name)?;
	expect(tokenizer, "{")?;

	// Conditional regions are compiled as runs of members sharing one
	// condition string; each run is guarded by a single conditional jump.
	let mut active_condition = String::new();
	let mut open_patches: Vec<usize> = Vec::new();

	loop {
		let Some(first) = tokenizer.peek_token()? else {
			return Err(parse_failed(tokenizer, "unexpected end of schema source inside a block"));
		};
		if first.value == "}" {
			tokenizer.next_token()?;
			break;
		}

		let member_condition = tokenizer.current_condition_string();
		if member_condition != active_condition {
			close_condition_region(&mut def, &mut open_patches);
			if !member_condition.is_empty() {
				open_condition_region(&mut def, &member_condition, &mut open_patches, tokenizer)?;
			}
			active_condition = member_condition;
		}

		parse_member(&mut def, tokenizer)?;
	}
	close_condition_region(&mut def, &mut open_patches);
	expect(tokenizer, ";")?;

	schemata.insert_block_definition(&name, def);
	Ok(())
}

fn open_condition_region(
	def: &mut BlockDefinition,
	condition: &str,
	open_patches: &mut Vec<usize>,
	tokenizer: &ConditionalTokenizer,
) -> Result<(), SchemaError> {
	let mut expr = parse_expression(condition, &mut def.token_dictionary)
		.map_err(|e| parse_failed(tokenizer, format!("bad condition {condition:?}: {e}")))?;
	def.token_dictionary.simplify_expression(&mut expr);
	push_expression_cmd(def, &expr);
	def.cmd_list.push(Cmd::IfFalseThenJump as u32);
	open_patches.push(def.cmd_list.len());
	def.cmd_list.push(0);
	Ok(())
}

fn close_condition_region(def: &mut BlockDefinition, open_patches: &mut Vec<usize>) {
	let target = def.cmd_list.len() as u32;
	for patch in open_patches.drain(..) {
		def.cmd_list[patch] = target;
	}
}

fn push_expression_cmd(def: &mut BlockDefinition, expr: &[crate::expr::Token]) {
	def.cmd_list.push(Cmd::EvaluateExpression as u32);
	def.cmd_list.push(expr.len() as u32);
	def.cmd_list.extend_from_slice(expr);
}

fn parse_member(def: &mut BlockDefinition, tokenizer: &mut ConditionalTokenizer) -> Result<(), SchemaError> {
	let type_ref = parse_type_ref(tokenizer, &mut def.token_dictionary)?;
	emit_type_ref(def, &type_ref);

	let member = expect_identifier(tokenizer)?;
	let name_token = def.token_dictionary.get_token(TokenKind::Variable, &member.value);

	let next = next_required(tokenizer)?;
	match next.value.as_str() {
		";" => {
			def.cmd_list.push(Cmd::InlineIndividualMember as u32);
			def.cmd_list.push(name_token);
		}
		"[" => {
			let (text, _) = read_expression_text(tokenizer, &["]"])?;
			let mut expr = parse_expression(&text, &mut def.token_dictionary)
				.map_err(|e| parse_failed(tokenizer, format!("bad array count {text:?}: {e}")))?;
			def.token_dictionary.simplify_expression(&mut expr);
			push_expression_cmd(def, &expr);
			def.cmd_list.push(Cmd::InlineArrayMember as u32);
			def.cmd_list.push(name_token);
			expect(tokenizer, ";")?;
		}
		other => return Err(parse_failed(tokenizer, format!("expected ';' or '[', found {other:?}"))),
	}
	Ok(())
}

fn parse_type_ref(tokenizer: &mut ConditionalTokenizer, dict: &mut TokenDictionary) -> Result<TypeRef, SchemaError> {
	let base = expect_identifier(tokenizer)?;
	let mut type_ref = TypeRef { base_name: base.value, args: Vec::new() };

	if !matches!(tokenizer.peek_token()?, Some(token) if token.value == "(") {
		return Ok(type_ref);
	}
	tokenizer.next_token()?;

	loop {
		let kind = expect_identifier(tokenizer)?;
		let terminator = match kind.value.as_str() {
			"typename" => {
				type_ref.args.push(TypeRefArg::Typename(parse_type_ref(tokenizer, dict)?));
				next_required(tokenizer)?.value
			}
			"expr" => {
				let (text, terminator) = read_expression_text(tokenizer, &[",", ")"])?;
				let mut expr = parse_expression(&text, dict)
					.map_err(|e| parse_failed(tokenizer, format!("bad template argument {text:?}: {e}")))?;
				dict.simplify_expression(&mut expr);
				type_ref.args.push(TypeRefArg::Expression(expr));
				terminator
			}
			other => {
				return Err(parse_failed(tokenizer, format!("expected \"typename\" or \"expr\", found {other:?}")))
			}
		};
		match terminator.as_str() {
			"," => continue,
			")" => break,
			other => return Err(parse_failed(tokenizer, format!("expected ',' or ')', found {other:?}"))),
		}
	}
	Ok(type_ref)
}

/// Collects raw token text until one of `terminators` at bracket depth zero,
/// returning the text and the terminator found.
fn read_expression_text(
	tokenizer: &mut ConditionalTokenizer,
	terminators: &[&str],
) -> Result<(String, String), SchemaError> {
	let mut depth = 0u32;
	let mut text = String::new();
	loop {
		let token = next_required(tokenizer)?;
		if depth == 0 && terminators.contains(&token.value.as_str()) {
			return Ok((text, token.value));
		}
		match token.value.as_str() {
			"(" | "[" => depth += 1,
			")" | "]" => {
				depth = depth
					.checked_sub(1)
					.ok_or_else(|| parse_failed(tokenizer, "unbalanced brackets in expression"))?;
			}
			_ => {}
		}
		if !text.is_empty() {
			text.push(' ');
		}
		text.push_str(&token.value);
	}
}

fn emit_type_ref(def: &mut BlockDefinition, type_ref: &TypeRef) {
	for arg in &type_ref.args {
		match arg {
			TypeRefArg::Typename(inner) => emit_type_ref(def, inner),
			TypeRefArg::Expression(expr) => push_expression_cmd(def, expr),
		}
	}
	let base_token = def.token_dictionary.get_token(TokenKind::Variable, &type_ref.base_name);
	def.cmd_list.push(Cmd::LookupType as u32);
	def.cmd_list.push(base_token);
	def.cmd_list.push(type_ref.args.len() as u32);
	// Kind codes pair with stack pops, so they are stored in reverse
	// argument order.
	for arg in type_ref.args.iter().rev() {
		def.cmd_list.push(match arg {
			TypeRefArg::Typename(_) => TemplateParameterKind::Typename as u32,
			TypeRefArg::Expression(_) => TemplateParameterKind::Expression as u32,
		});
	}
}

fn parse_alias(
	schemata: &mut BinarySchemata,
	tokenizer: &mut ConditionalTokenizer,
	pending_decoders: &mut Vec<(AliasId, String)>,
) -> Result<(), SchemaError> {
	let name = expect_identifier(tokenizer)?.value;
	check_duplicate(schemata, tokenizer, &name)?;
	expect(tokenizer, "=")?;

	let mut dict = TokenDictionary::new();
	let target = parse_type_ref(tokenizer, &mut dict)?;

	let mut decoder = None;
	let next = next_required(tokenizer)?;
	match next.value.as_str() {
		";" => {}
		":" => {
			decoder = Some(expect_identifier(tokenizer)?.value);
			expect(tokenizer, ";")?;
		}
		other => return Err(parse_failed(tokenizer, format!("expected ';' or ':', found {other:?}"))),
	}

	let id = schemata.insert_alias(&name, Alias { target, token_dictionary: dict, bit_field: None, literals: None });
	if let Some(decoder) = decoder {
		pending_decoders.push((id, decoder));
	}
	Ok(())
}

fn parse_bit_field(schemata: &mut BinarySchemata, tokenizer: &mut ConditionalTokenizer) -> Result<(), SchemaError> {
	let name = expect_identifier(tokenizer)?.value;
	check_duplicate(schemata, tokenizer, &name)?;
	expect(tokenizer, "{")?;

	let mut def = BitFieldDefinition::default();
	loop {
		let token = next_required(tokenizer)?;
		if token.value == "}" {
			break;
		}
		let min_bit = parse_int(&token.value)
			.filter(|v| (0..=63).contains(v))
			.ok_or_else(|| parse_failed(tokenizer, format!("expected a bit index, found {:?}", token.value)))?;
		expect(tokenizer, ":")?;
		let count_token = next_required(tokenizer)?;
		let bit_count = parse_int(&count_token.value)
			.filter(|v| (1..=64).contains(v))
			.ok_or_else(|| parse_failed(tokenizer, format!("expected a bit count, found {:?}", count_token.value)))?;
		let range_name = expect_identifier(tokenizer)?.value;

		let mut storage_type = None;
		let next = next_required(tokenizer)?;
		match next.value.as_str() {
			";" => {}
			":" => {
				storage_type = Some(expect_identifier(tokenizer)?.value);
				expect(tokenizer, ";")?;
			}
			other => return Err(parse_failed(tokenizer, format!("expected ';' or ':', found {other:?}"))),
		}

		def.ranges.push(BitRange {
			min_bit: min_bit as u32,
			bit_count: bit_count as u32,
			name: range_name,
			storage_type,
		});
	}
	expect(tokenizer, ";")?;

	schemata.insert_bit_field(&name, def);
	Ok(())
}

fn parse_literals(schemata: &mut BinarySchemata, tokenizer: &mut ConditionalTokenizer) -> Result<(), SchemaError> {
	let name = expect_identifier(tokenizer)?.value;
	check_duplicate(schemata, tokenizer, &name)?;
	expect(tokenizer, "{")?;

	let mut table = LiteralTable::default();
	loop {
		let token = next_required(tokenizer)?;
		if token.value == "}" {
			break;
		}
		expect(tokenizer, "=")?;
		let mut value_token = next_required(tokenizer)?;
		let negative = value_token.value == "-";
		if negative {
			value_token = next_required(tokenizer)?;
		}
		let mut value = parse_int(&value_token.value)
			.ok_or_else(|| parse_failed(tokenizer, format!("expected an integer, found {:?}", value_token.value)))?;
		if negative {
			value = value.wrapping_neg();
		}
		expect(tokenizer, ";")?;
		table.insert(&token.value, value);
	}
	expect(tokenizer, ";")?;

	schemata.insert_literals(&name, table);
	Ok(())
}

fn resolve_decoders(
	schemata: &mut BinarySchemata,
	pending_decoders: Vec<(AliasId, String)>,
) -> Result<(), SchemaError> {
	for (alias_id, decoder) in pending_decoders {
		if let Some(id) = schemata.find_bit_field(&decoder) {
			schemata.alias_mut(alias_id).bit_field = Some(id);
		} else if let Some(id) = schemata.find_literals(&decoder) {
			schemata.alias_mut(alias_id).literals = Some(id);
		} else {
			return Err(SchemaError::UnknownTypeReference {
				name: decoder,
				referenced_by: format!("alias {}", schemata.alias_name(alias_id)),
			});
		}
	}
	Ok(())
}

fn is_known_type(schemata: &BinarySchemata, name: &str) -> bool {
	TypeCat::from_name(name).is_some()
		|| schemata.find_alias(name).is_some()
		|| schemata.find_block_definition(name).is_some()
}

fn check_type_ref(schemata: &BinarySchemata, type_ref: &TypeRef, referenced_by: &str) -> Result<(), SchemaError> {
	if !is_known_type(schemata, &type_ref.base_name) {
		return Err(SchemaError::UnknownTypeReference {
			name: type_ref.base_name.clone(),
			referenced_by: referenced_by.to_string(),
		});
	}
	for arg in &type_ref.args {
		if let TypeRefArg::Typename(inner) = arg {
			check_type_ref(schemata, inner, referenced_by)?;
		}
	}
	Ok(())
}

/// Post-parse pass: every type name a declaration references must resolve,
/// now that forward references have had a chance to appear.
fn validate_references(schemata: &BinarySchemata) -> Result<(), SchemaError> {
	for (name, alias) in schemata.aliases() {
		check_type_ref(schemata, &alias.target, &format!("alias {name}"))?;
	}

	for (name, def) in schemata.bit_fields() {
		for range in &def.ranges {
			if let Some(storage) = &range.storage_type {
				if TypeCat::from_name(storage).is_none() && schemata.find_alias(storage).is_none() {
					return Err(SchemaError::UnknownTypeReference {
						name: storage.clone(),
						referenced_by: format!("bitfield {name}"),
					});
				}
			}
		}
	}

	for (name, def) in schemata.block_definitions() {
		let cmds = &def.cmd_list;
		let mut cursor = 0usize;
		while cursor < cmds.len() {
			let Some(cmd) = Cmd::from_repr(cmds[cursor]) else { break };
			cursor += 1;
			match cmd {
				Cmd::LookupType => {
					let base = cmds[cursor];
					let param_count = cmds[cursor + 1] as usize;
					cursor += 2 + param_count;
					if def.template_parameter_names.contains(&base) {
						continue;
					}
					let base_name = def.token_dictionary.definition(base).map(|d| d.value.as_str()).unwrap_or("");
					if !is_known_type(schemata, base_name) {
						return Err(SchemaError::UnknownTypeReference {
							name: base_name.to_string(),
							referenced_by: format!("block {name}"),
						});
					}
				}
				Cmd::EvaluateExpression => cursor += 1 + cmds[cursor] as usize,
				Cmd::InlineIndividualMember | Cmd::InlineArrayMember | Cmd::IfFalseThenJump => cursor += 1,
			}
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::expr::Token;

	fn parse(source: &str) -> Result<BinarySchemata, SchemaError> {
		BinarySchemata::parse(source, "test.schema", None, None)
	}

	fn tok(def: &BlockDefinition, value: &str) -> Token {
		def.token_dictionary.try_get_token(TokenKind::Variable, value).unwrap()
	}

	#[test]
	fn compiles_plain_members() {
		let schemata = parse("block P { uint32 a; uint16 b; };").unwrap();
		let id = schemata.find_block_definition("P").unwrap();
		let def = schemata.block_definition(id);
		assert_eq!(def.cmd_list, vec![
			Cmd::LookupType as u32, tok(def, "uint32"), 0,
			Cmd::InlineIndividualMember as u32, tok(def, "a"),
			Cmd::LookupType as u32, tok(def, "uint16"), 0,
			Cmd::InlineIndividualMember as u32, tok(def, "b"),
		]);
		assert!(def.template_parameter_names.is_empty());
	}

	#[test]
	fn compiles_array_members() {
		let schemata = parse("alias char = uint8; block S { uint16 len; char text[len]; };").unwrap();
		let id = schemata.find_block_definition("S").unwrap();
		let def = schemata.block_definition(id);
		let len_var = tok(def, "len");
		assert_eq!(def.cmd_list, vec![
			Cmd::LookupType as u32, tok(def, "uint16"), 0,
			Cmd::InlineIndividualMember as u32, len_var,
			Cmd::LookupType as u32, tok(def, "char"), 0,
			Cmd::EvaluateExpression as u32, 1, len_var,
			Cmd::InlineArrayMember as u32, tok(def, "text"),
		]);
	}

	#[test]
	fn compiles_template_blocks_and_arguments() {
		let schemata = parse("block template(expr N) V { uint16 data[N]; }; block W { V(expr 3) v; };").unwrap();

		let v = schemata.block_definition(schemata.find_block_definition("V").unwrap());
		assert_eq!(v.template_parameter_names, vec![tok(v, "N")]);
		assert_eq!(v.template_parameter_type_field, 0);

		let w = schemata.block_definition(schemata.find_block_definition("W").unwrap());
		let three = w.token_dictionary.try_get_token(TokenKind::Literal, "3").unwrap();
		assert_eq!(w.cmd_list, vec![
			Cmd::EvaluateExpression as u32, 1, three,
			Cmd::LookupType as u32, tok(w, "V"), 1, TemplateParameterKind::Expression as u32,
			Cmd::InlineIndividualMember as u32, tok(w, "v"),
		]);
	}

	#[test]
	fn typename_parameters_set_the_type_field() {
		let schemata =
			parse("block template(typename T, expr N) Pair { T first; uint16 data[N]; };").unwrap();
		let def = schemata.block_definition(schemata.find_block_definition("Pair").unwrap());
		assert_eq!(def.template_parameter_names.len(), 2);
		assert_eq!(def.template_parameter_type_field, 0b01);
	}

	#[test]
	fn conditional_members_compile_to_jumps() {
		let schemata = parse(
			"block C { uint8 flag;\n#if flag\nuint32 payload;\n#endif\nuint8 tail; };",
		)
		.unwrap();
		let def = schemata.block_definition(schemata.find_block_definition("C").unwrap());
		let flag = tok(def, "flag");
		let tail_start = 15u32;
		assert_eq!(def.cmd_list, vec![
			Cmd::LookupType as u32, tok(def, "uint8"), 0,
			Cmd::InlineIndividualMember as u32, flag,
			Cmd::EvaluateExpression as u32, 1, flag,
			Cmd::IfFalseThenJump as u32, tail_start,
			Cmd::LookupType as u32, tok(def, "uint32"), 0,
			Cmd::InlineIndividualMember as u32, tok(def, "payload"),
			Cmd::LookupType as u32, tok(def, "uint8"), 0,
			Cmd::InlineIndividualMember as u32, tok(def, "tail"),
		]);
		assert_eq!(def.cmd_list[tail_start as usize], Cmd::LookupType as u32);
	}

	#[test]
	fn else_regions_reevaluate_negated_conditions() {
		let schemata = parse(
			"block C { uint8 kind;\n#if kind\nuint32 big;\n#else\nuint8 small;\n#endif\n };",
		)
		.unwrap();
		let def = schemata.block_definition(schemata.find_block_definition("C").unwrap());
		// Two conditional regions: one for `kind`, one for `!(kind)`.
		let jumps = def
			.cmd_list
			.iter()
			.filter(|&&c| c == Cmd::IfFalseThenJump as u32)
			.count();
		assert_eq!(jumps, 2);
	}

	#[test]
	fn literals_tables_parse_signed_values() {
		let schemata = parse("literals Levels { low = 1; high = 0x10; floor = -3; };").unwrap();
		let table = schemata.literals(schemata.find_literals("Levels").unwrap());
		assert_eq!(table.find("low"), Some(1));
		assert_eq!(table.find("high"), Some(16));
		assert_eq!(table.find("floor"), Some(-3));
		assert_eq!(table.name_of(16), Some("high"));
	}

	#[test]
	fn bitfields_parse_ranges() {
		let schemata = parse("bitfield Packed { 0 : 4 kind; 4 : 12 size : uint16; };").unwrap();
		let def = schemata.bit_field(schemata.find_bit_field("Packed").unwrap());
		assert_eq!(def.ranges.len(), 2);
		assert_eq!(def.ranges[0].min_bit, 0);
		assert_eq!(def.ranges[0].bit_count, 4);
		assert_eq!(def.ranges[0].name, "kind");
		assert_eq!(def.ranges[1].storage_type.as_deref(), Some("uint16"));

		let decoded: Vec<_> = def.decode(0x0123).collect();
		assert_eq!(decoded, vec![("kind", 0x3), ("size", 0x12)]);
	}

	#[test]
	fn alias_decoders_resolve_late() {
		let schemata = parse(
			"alias Flags = uint32 : FlagBits; bitfield FlagBits { 0 : 1 visible; 1 : 1 dirty; };",
		)
		.unwrap();
		let alias = schemata.alias(schemata.find_alias("Flags").unwrap());
		assert_eq!(alias.bit_field, schemata.find_bit_field("FlagBits"));
		assert_eq!(alias.literals, None);
	}

	#[test]
	fn unknown_alias_target_is_rejected() {
		match parse("alias broken = NotDeclared;") {
			Err(SchemaError::UnknownTypeReference { name, .. }) => assert_eq!(name, "NotDeclared"),
			other => panic!("expected UnknownTypeReference, got {other:?}"),
		}
	}

	#[test]
	fn unknown_member_type_is_rejected() {
		assert!(matches!(
			parse("block B { Missing m; };"),
			Err(SchemaError::UnknownTypeReference { .. })
		));
	}

	#[test]
	fn forward_references_are_allowed() {
		assert!(parse("block Outer { Inner i; }; block Inner { uint8 v; };").is_ok());
	}

	#[test]
	fn duplicate_definitions_are_rejected() {
		assert!(matches!(
			parse("block B { uint8 a; }; block B { uint8 b; };"),
			Err(SchemaError::ParseFailed { .. })
		));
	}

	#[test]
	fn template_parameters_are_valid_member_types() {
		assert!(parse("block template(typename T) Holder { T value; };").is_ok());
	}

	#[test]
	fn source_round_trips() {
		let source = "\
literals Levels { low = 1; high = 16; };
bitfield Packed { 0 : 4 kind; };
alias char = uint8;
block template(expr N) V { uint16 data[N]; };
block S { uint16 len; char text[len * 2]; V(expr 3) v; };
";
		let schemata = parse(source).unwrap();
		let mut rendered = String::new();
		schemata.write_source(&mut rendered);
		let reparsed = parse(&rendered).unwrap_or_else(|e| panic!("round-trip failed: {e}\n{rendered}"));

		assert_eq!(schemata.find_block_definition("S").is_some(), reparsed.find_block_definition("S").is_some());
		assert_eq!(schemata.find_block_definition("V").is_some(), reparsed.find_block_definition("V").is_some());
		assert_eq!(schemata.find_alias("char").is_some(), reparsed.find_alias("char").is_some());
		let original = schemata.block_definition(schemata.find_block_definition("S").unwrap());
		let round_tripped = reparsed.block_definition(reparsed.find_block_definition("S").unwrap());
		assert_eq!(original.cmd_list.len(), round_tripped.cmd_list.len());
		let table = reparsed.literals(reparsed.find_literals("Levels").unwrap());
		assert_eq!(table.find("high"), Some(16));
	}
}
