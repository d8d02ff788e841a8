use crate::utilities::define_repr_enum;

define_repr_enum! {
	/// Opcodes of the flat command stream a block body compiles into.
	///
	/// Operand layout:
	/// - `LookupType`: base-name token, parameter count, then one
	///   [`TemplateParameterKind`] per parameter in reverse argument order
	///   (matching stack pop order).
	/// - `EvaluateExpression`: token count, then that many postfix tokens.
	/// - `InlineIndividualMember` / `InlineArrayMember`: member-name token.
	/// - `IfFalseThenJump`: absolute jump target within the command list.
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub enum Cmd: u32 {
		LookupType = 0x00,
		EvaluateExpression = 0x01,
		InlineIndividualMember = 0x02,
		InlineArrayMember = 0x03,
		IfFalseThenJump = 0x04,
	}
}

define_repr_enum! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub enum TemplateParameterKind: u32 {
		Typename = 0x00,
		Expression = 0x01,
	}
}
