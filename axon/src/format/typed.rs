/// Category of a primitive value as it appears in a walked buffer.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TypeCat {
	#[default]
	Void,
	Bool,
	Int8,
	UInt8,
	Int16,
	UInt16,
	Int32,
	UInt32,
	Int64,
	UInt64,
	Float,
	Double,
}

impl TypeCat {
	pub fn size(self) -> usize {
		match self {
			TypeCat::Void => 0,
			TypeCat::Bool | TypeCat::Int8 | TypeCat::UInt8 => 1,
			TypeCat::Int16 | TypeCat::UInt16 => 2,
			TypeCat::Int32 | TypeCat::UInt32 | TypeCat::Float => 4,
			TypeCat::Int64 | TypeCat::UInt64 | TypeCat::Double => 8,
		}
	}

	/// Maps schema-source primitive names. `float16` is stored as two bytes;
	/// its decode is left to downstream consumers.
	pub fn from_name(name: &str) -> Option<TypeCat> {
		Some(match name {
			"void" => TypeCat::Void,
			"bool" => TypeCat::Bool,
			"int8" => TypeCat::Int8,
			"uint8" => TypeCat::UInt8,
			"int16" => TypeCat::Int16,
			"uint16" => TypeCat::UInt16,
			"int32" => TypeCat::Int32,
			"uint32" => TypeCat::UInt32,
			"int64" => TypeCat::Int64,
			"uint64" => TypeCat::UInt64,
			"float16" => TypeCat::UInt16,
			"float32" => TypeCat::Float,
			"float64" => TypeCat::Double,
			_ => return None,
		})
	}

	pub fn name(self) -> &'static str {
		match self {
			TypeCat::Void => "void",
			TypeCat::Bool => "bool",
			TypeCat::Int8 => "int8",
			TypeCat::UInt8 => "uint8",
			TypeCat::Int16 => "int16",
			TypeCat::UInt16 => "uint16",
			TypeCat::Int32 => "int32",
			TypeCat::UInt32 => "uint32",
			TypeCat::Int64 => "int64",
			TypeCat::UInt64 => "uint64",
			TypeCat::Float => "float32",
			TypeCat::Double => "float64",
		}
	}
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TypeHint {
	#[default]
	None,
	String,
}

/// Shape of one value in a buffer: a primitive category, an inline array
/// count (1 for scalars) and an optional presentation hint.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TypeDesc {
	pub cat: TypeCat,
	pub array_count: u32,
	pub hint: TypeHint,
}

impl Default for TypeDesc {
	fn default() -> Self {
		Self { cat: TypeCat::Void, array_count: 1, hint: TypeHint::None }
	}
}

impl TypeDesc {
	pub fn new(cat: TypeCat) -> Self {
		Self { cat, ..Default::default() }
	}

	pub fn size(&self) -> usize {
		self.cat.size() * self.array_count as usize
	}
}

pub(crate) enum Scalar {
	Signed(i64),
	Unsigned(u64),
	Float(f64),
}

/// Little-endian decode of one scalar of category `cat`.
pub(crate) fn read_scalar(data: &[u8], cat: TypeCat) -> Option<Scalar> {
	if data.len() < cat.size() {
		return None;
	}
	Some(match cat {
		TypeCat::Void => return None,
		TypeCat::Bool => Scalar::Unsigned((data[0] != 0) as u64),
		TypeCat::Int8 => Scalar::Signed(data[0] as i8 as i64),
		TypeCat::UInt8 => Scalar::Unsigned(data[0] as u64),
		TypeCat::Int16 => Scalar::Signed(i16::from_le_bytes([data[0], data[1]]) as i64),
		TypeCat::UInt16 => Scalar::Unsigned(u16::from_le_bytes([data[0], data[1]]) as u64),
		TypeCat::Int32 => Scalar::Signed(i32::from_le_bytes([data[0], data[1], data[2], data[3]]) as i64),
		TypeCat::UInt32 => Scalar::Unsigned(u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as u64),
		TypeCat::Int64 => Scalar::Signed(i64::from_le_bytes(data[..8].try_into().ok()?)),
		TypeCat::UInt64 => Scalar::Unsigned(u64::from_le_bytes(data[..8].try_into().ok()?)),
		TypeCat::Float => Scalar::Float(f32::from_le_bytes([data[0], data[1], data[2], data[3]]) as f64),
		TypeCat::Double => Scalar::Float(f64::from_le_bytes(data[..8].try_into().ok()?)),
	})
}

/// Casts a scalar value to `i64`, the representation member values take in
/// expression contexts. Arrays and `void` have no integral reading.
pub(crate) fn cast_to_i64(data: &[u8], desc: &TypeDesc) -> Option<i64> {
	if desc.array_count != 1 {
		return None;
	}
	Some(match read_scalar(data, desc.cat)? {
		Scalar::Signed(v) => v,
		Scalar::Unsigned(v) => v as i64,
		Scalar::Float(v) => v as i64,
	})
}

/// Typed reads out of walked buffer data, with numeric conversion between
/// the stored category and the requested type.
pub trait FromBinaryValue: Sized {
	fn read(data: &[u8], desc: &TypeDesc) -> Option<Self>;
}

macro_rules! impl_from_binary_int {
	($($ty: ty),*) => {$(
		impl FromBinaryValue for $ty {
			fn read(data: &[u8], desc: &TypeDesc) -> Option<Self> {
				if desc.array_count != 1 {
					return None;
				}
				match read_scalar(data, desc.cat)? {
					Scalar::Signed(v) => <$ty>::try_from(v).ok(),
					Scalar::Unsigned(v) => <$ty>::try_from(v).ok(),
					Scalar::Float(v) => Some(v as $ty),
				}
			}
		}
	)*};
}

impl_from_binary_int!(u8, i8, u16, i16, u32, i32, u64, i64);

macro_rules! impl_from_binary_float {
	($($ty: ty),*) => {$(
		impl FromBinaryValue for $ty {
			fn read(data: &[u8], desc: &TypeDesc) -> Option<Self> {
				if desc.array_count != 1 {
					return None;
				}
				match read_scalar(data, desc.cat)? {
					Scalar::Signed(v) => Some(v as $ty),
					Scalar::Unsigned(v) => Some(v as $ty),
					Scalar::Float(v) => Some(v as $ty),
				}
			}
		}
	)*};
}

impl_from_binary_float!(f32, f64);

impl FromBinaryValue for bool {
	fn read(data: &[u8], desc: &TypeDesc) -> Option<Self> {
		cast_to_i64(data, desc).map(|v| v != 0)
	}
}

impl FromBinaryValue for String {
	fn read(data: &[u8], desc: &TypeDesc) -> Option<Self> {
		match desc.hint {
			TypeHint::String => std::str::from_utf8(&data[..desc.size().min(data.len())]).ok().map(str::to_string),
			TypeHint::None => Some(render_value(data, desc)),
		}
	}
}

/// Renders a value for diagnostic output. String-hinted data prints as text,
/// arrays as `{a, b, ...}`.
pub fn render_value(data: &[u8], desc: &TypeDesc) -> String {
	if desc.hint == TypeHint::String {
		return String::from_utf8_lossy(&data[..desc.size().min(data.len())]).into_owned();
	}

	let render_one = |at: usize| -> String {
		let element = &data[at * desc.cat.size()..];
		match read_scalar(element, desc.cat) {
			Some(Scalar::Signed(v)) => v.to_string(),
			Some(Scalar::Unsigned(v)) => v.to_string(),
			Some(Scalar::Float(v)) => v.to_string(),
			None => "<void>".to_string(),
		}
	};

	match desc.array_count {
		0 => "{}".to_string(),
		1 => render_one(0),
		count => {
			let rendered: Vec<String> = (0..count as usize)
				.filter(|i| (i + 1) * desc.cat.size() <= data.len())
				.map(render_one)
				.collect();
			format!("{{{}}}", rendered.join(", "))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sizes_are_deterministic() {
		assert_eq!(TypeDesc::new(TypeCat::UInt32).size(), 4);
		assert_eq!(TypeDesc::new(TypeCat::Void).size(), 0);
		assert_eq!(TypeDesc { cat: TypeCat::UInt16, array_count: 3, hint: TypeHint::None }.size(), 6);
	}

	#[test]
	fn primitive_names_resolve() {
		assert_eq!(TypeCat::from_name("uint32"), Some(TypeCat::UInt32));
		assert_eq!(TypeCat::from_name("float16"), Some(TypeCat::UInt16));
		assert_eq!(TypeCat::from_name("float32"), Some(TypeCat::Float));
		assert_eq!(TypeCat::from_name("char"), None);
	}

	#[test]
	fn scalar_casts() {
		let desc = TypeDesc::new(TypeCat::UInt32);
		assert_eq!(cast_to_i64(&[0xEF, 0xBE, 0xAD, 0xDE], &desc), Some(0xDEADBEEF));

		let desc = TypeDesc::new(TypeCat::Int8);
		assert_eq!(cast_to_i64(&[0xFF], &desc), Some(-1));

		let desc = TypeDesc { cat: TypeCat::UInt8, array_count: 2, hint: TypeHint::None };
		assert_eq!(cast_to_i64(&[1, 2], &desc), None);
	}

	#[test]
	fn typed_reads_convert() {
		let desc = TypeDesc::new(TypeCat::UInt16);
		assert_eq!(u32::read(&[0x05, 0x00], &desc), Some(5));
		assert_eq!(u8::read(&[0x05, 0x00], &desc), Some(5));
		assert_eq!(u8::read(&[0x00, 0x10], &desc), None); // out of range
		assert_eq!(f32::read(&[0x02, 0x00], &desc), Some(2.0));
	}

	#[test]
	fn string_hinted_data_reads_as_text() {
		let desc = TypeDesc { cat: TypeCat::UInt8, array_count: 5, hint: TypeHint::String };
		assert_eq!(String::read(b"Hello", &desc), Some("Hello".to_string()));
		assert_eq!(render_value(b"Hello", &desc), "Hello");
	}

	#[test]
	fn arrays_render_braced() {
		let desc = TypeDesc { cat: TypeCat::UInt16, array_count: 3, hint: TypeHint::None };
		assert_eq!(render_value(&[1, 0, 2, 0, 3, 0], &desc), "{1, 2, 3}");
	}
}
