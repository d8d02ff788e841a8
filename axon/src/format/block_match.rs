use crate::format::context::EvaluatedTypeId;
use crate::format::formatter::{BinaryFormatter, FormatError};
use crate::format::typed::{FromBinaryValue, TypeDesc, TypeHint};
use crate::format::Blob;
use crate::utilities::hash_name;

/// One member of an eagerly-parsed block, linked to its parent by index.
#[derive(Debug, Clone)]
pub struct Member<'d> {
	pub name_hash: u64,
	pub name: String,
	pub data: &'d [u8],
	pub type_desc: TypeDesc,
	pub evaluated_type: EvaluatedTypeId,
	pub parent: u32,
	pub array_count: u32,
	pub is_array: bool,
}

impl Member<'_> {
	pub const ROOT_PARENT: u32 = u32::MAX;
}

/// Eager-tree variant of the streaming walk: drains one block into an
/// indexed, navigable member table. Iteration order matches on-disk order.
#[derive(Debug, Default)]
pub struct BinaryBlockMatch<'d> {
	members: Vec<Member<'d>>,
}

impl<'d> BinaryBlockMatch<'d> {
	pub fn new(formatter: &mut BinaryFormatter<'_, 'd>) -> Result<Self, FormatError> {
		let mut parsed = Self::default();
		parsed.parse_block(formatter, Member::ROOT_PARENT)?;
		Ok(parsed)
	}

	fn parse_block(&mut self, formatter: &mut BinaryFormatter<'_, 'd>, parent: u32) -> Result<(), FormatError> {
		loop {
			match formatter.peek_next()? {
				Blob::KeyedItem => {
					let name = formatter.try_keyed_item()?.expect("peeked a keyed item");
					self.parse_value(formatter, name, parent)?;
				}
				Blob::EndBlock | Blob::None => return Ok(()),
				found => {
					return Err(FormatError::UnexpectedBlob {
						expected: "a keyed item",
						found,
						offset: formatter.offset(),
					})
				}
			}
		}
	}

	fn parse_value(
		&mut self,
		formatter: &mut BinaryFormatter<'_, 'd>,
		name: String,
		parent: u32,
	) -> Result<(), FormatError> {
		let start = formatter.offset();
		if let Some(evaluated_type) = formatter.try_begin_block()? {
			let index = self.push(Member {
				name_hash: hash_name(&name),
				name,
				data: &[],
				type_desc: TypeDesc::default(),
				evaluated_type,
				parent,
				array_count: 0,
				is_array: false,
			});
			self.parse_block(formatter, index)?;
			if !formatter.try_end_block()? {
				return Err(FormatError::UnexpectedBlob {
					expected: "the end of a block",
					found: formatter.peek_next()?,
					offset: formatter.offset(),
				});
			}
			self.members[index as usize].data = &formatter.data()[start..formatter.offset()];
		} else if let Some(item) = formatter.try_value()? {
			self.push(Member {
				name_hash: hash_name(&name),
				name,
				data: item.data,
				type_desc: item.type_desc,
				evaluated_type: item.evaluated_type,
				parent,
				array_count: 0,
				is_array: false,
			});
		} else if let Some((count, evaluated_type)) = formatter.try_begin_array()? {
			let index = self.push(Member {
				name_hash: hash_name(&name),
				name,
				data: &[],
				type_desc: TypeDesc::default(),
				evaluated_type,
				parent,
				array_count: count,
				is_array: true,
			});
			for element in 0..count {
				self.parse_value(formatter, format!("<Element {element}>"), index)?;
			}
			if !formatter.try_end_array()? {
				return Err(FormatError::UnexpectedBlob {
					expected: "the end of an array",
					found: formatter.peek_next()?,
					offset: formatter.offset(),
				});
			}
			self.members[index as usize].data = &formatter.data()[start..formatter.offset()];
		} else {
			return Err(FormatError::UnexpectedBlob {
				expected: "a block, value or array",
				found: formatter.peek_next()?,
				offset: formatter.offset(),
			});
		}
		Ok(())
	}

	fn push(&mut self, member: Member<'d>) -> u32 {
		let index = self.members.len() as u32;
		self.members.push(member);
		index
	}

	pub fn members(&self) -> impl Iterator<Item = MemberToken<'_, 'd>> + '_ {
		self.children_of(Member::ROOT_PARENT)
	}

	fn children_of(&self, parent: u32) -> impl Iterator<Item = MemberToken<'_, 'd>> + '_ {
		self.members
			.iter()
			.enumerate()
			.filter(move |(_, m)| m.parent == parent)
			.map(|(index, _)| MemberToken { members: &self.members, index })
	}

	pub fn find(&self, name: &str) -> Option<MemberToken<'_, 'd>> {
		let hash = hash_name(name);
		self.members().find(|m| m.member().name_hash == hash && m.member().name == name)
	}

	pub fn get(&self, index: usize) -> Option<MemberToken<'_, 'd>> {
		self.members().nth(index)
	}

	pub fn len(&self) -> usize {
		self.members.len()
	}

	pub fn is_empty(&self) -> bool {
		self.members.is_empty()
	}
}

/// Cursor into a [`BinaryBlockMatch`] member table.
#[derive(Debug, Copy, Clone)]
pub struct MemberToken<'m, 'd> {
	members: &'m [Member<'d>],
	index: usize,
}

impl<'m, 'd> MemberToken<'m, 'd> {
	pub fn member(&self) -> &'m Member<'d> {
		&self.members[self.index]
	}

	pub fn name(&self) -> &'m str {
		&self.member().name
	}

	pub fn data(&self) -> &'d [u8] {
		self.member().data
	}

	pub fn type_desc(&self) -> TypeDesc {
		self.member().type_desc
	}

	pub fn evaluated_type(&self) -> EvaluatedTypeId {
		self.member().evaluated_type
	}

	pub fn is_array(&self) -> bool {
		self.member().is_array
	}

	pub fn array_count(&self) -> u32 {
		self.member().array_count
	}

	pub fn children(&self) -> impl Iterator<Item = MemberToken<'m, 'd>> + '_ {
		let parent = self.index as u32;
		self.members
			.iter()
			.enumerate()
			.filter(move |(_, m)| m.parent == parent)
			.map(|(index, _)| MemberToken { members: self.members, index })
	}

	pub fn find(&self, name: &str) -> Option<MemberToken<'m, 'd>> {
		let hash = hash_name(name);
		self.children().find(|c| c.member().name_hash == hash && c.member().name == name)
	}

	pub fn get(&self, index: usize) -> Option<MemberToken<'m, 'd>> {
		self.children().nth(index)
	}

	/// Reads the member's value with numeric conversion; `None` when the
	/// stored category cannot represent the request.
	pub fn decode<T: FromBinaryValue>(&self) -> Option<T> {
		T::read(self.data(), &self.member().type_desc)
	}

	pub fn as_str(&self) -> Option<&'d str> {
		let member = self.member();
		match member.type_desc.hint {
			TypeHint::String => std::str::from_utf8(member.data).ok(),
			TypeHint::None => None,
		}
	}
}
