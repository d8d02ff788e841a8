use std::fmt::Write;

use crate::format::formatter::{BinaryFormatter, FormatError};
use crate::format::typed::render_value;
use crate::format::Blob;

/// Renders the remaining events of the current block as indented
/// `type name = value` lines. Diagnostic output; the walk consumes the
/// formatter like any other client.
pub fn dump_block(out: &mut String, formatter: &mut BinaryFormatter, indent: usize) -> Result<(), FormatError> {
	loop {
		match formatter.peek_next()? {
			Blob::KeyedItem => {
				let name = formatter.try_keyed_item()?.expect("peeked a keyed item");
				dump_value(out, formatter, &name, indent)?;
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

fn dump_value(
	out: &mut String,
	formatter: &mut BinaryFormatter,
	name: &str,
	indent: usize,
) -> Result<(), FormatError> {
	if let Some(type_id) = formatter.try_begin_block()? {
		let _ = writeln!(out, "{:indent$}{} {name}", "", formatter.context().format_type(type_id));
		dump_block(out, formatter, indent + 4)?;
		if !formatter.try_end_block()? {
			return Err(FormatError::UnexpectedBlob {
				expected: "the end of a block",
				found: formatter.peek_next()?,
				offset: formatter.offset(),
			});
		}
	} else if let Some(item) = formatter.try_value()? {
		let rendered = render_value(item.data, &item.type_desc);
		let type_name = formatter.context().format_type(item.evaluated_type);
		let _ = writeln!(out, "{:indent$}{type_name} {name} = {rendered}", "");
	} else if let Some((count, type_id)) = formatter.try_begin_array()? {
		let _ = writeln!(out, "{:indent$}{} {name}[{count}]", "", formatter.context().format_type(type_id));
		for element in 0..count {
			dump_value(out, formatter, &format!("<Element {element}>"), indent + 4)?;
		}
		if !formatter.try_end_array()? {
			return Err(FormatError::UnexpectedBlob {
				expected: "the end of an array",
				found: formatter.peek_next()?,
				offset: formatter.offset(),
			});
		}
	} else {
		return Err(FormatError::UnexpectedBlob {
			expected: "a block, value or array",
			found: formatter.peek_next()?,
			offset: formatter.offset(),
		});
	}
	Ok(())
}
