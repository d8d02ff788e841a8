use std::sync::Arc;

use axon::format::{dump_block, BinaryBlockMatch, BinaryFormatter, Blob, EvaluationContext};
use axon::schema::BinarySchemata;

const MODEL_SCHEMA: &str = "\
alias char = uint8;

literals VertexFormats {
	position_only = 1;
	position_normal = 2;
};

block template(expr Stride) VertexRun {
	uint16 count;
	uint8 payload[count * Stride];
};

block NamedEntry {
	uint16 nameLength;
	char name[nameLength];
	uint32 offset;
};

block ModelFile {
	uint32 magic;
	uint8 format;
#if format == 2
	uint32 normalSection;
#endif
	uint8 entryCount;
	NamedEntry entries[entryCount];
	VertexRun(expr 4) vertices;
};
";

fn context() -> EvaluationContext {
	let schemata = BinarySchemata::parse(MODEL_SCHEMA, "model.schema", None, None).unwrap();
	EvaluationContext::new(Arc::new(schemata))
}

fn model_buffer(format: u8) -> Vec<u8> {
	let mut data = Vec::new();
	data.extend_from_slice(&0x4D4F444Cu32.to_le_bytes()); // magic
	data.push(format);
	if format == 2 {
		data.extend_from_slice(&0x100u32.to_le_bytes()); // normalSection
	}
	data.push(2); // entryCount
	for (name, offset) in [("body", 0x10u32), ("wing", 0x40u32)] {
		data.extend_from_slice(&(name.len() as u16).to_le_bytes());
		data.extend_from_slice(name.as_bytes());
		data.extend_from_slice(&offset.to_le_bytes());
	}
	data.extend_from_slice(&3u16.to_le_bytes()); // vertices.count
	data.extend_from_slice(&[0xAB; 12]); // 3 * stride 4
	data
}

#[test]
fn walks_a_model_file_end_to_end() {
	let mut ctx = context();
	let block = ctx.schemata().find_block_definition("ModelFile").unwrap();
	let data = model_buffer(2);

	let mut formatter = BinaryFormatter::new(&mut ctx, &data);
	formatter.push_pattern(block, &[], 0);

	let parsed = BinaryBlockMatch::new(&mut formatter).unwrap();
	assert_eq!(formatter.offset(), data.len());

	assert_eq!(parsed.find("magic").unwrap().decode::<u32>(), Some(0x4D4F444C));
	assert_eq!(parsed.find("format").unwrap().decode::<u8>(), Some(2));
	assert_eq!(parsed.find("normalSection").unwrap().decode::<u32>(), Some(0x100));

	let entries = parsed.find("entries").unwrap();
	assert!(entries.is_array());
	assert_eq!(entries.array_count(), 2);
	let first = entries.get(0).unwrap();
	assert_eq!(first.find("name").unwrap().as_str(), Some("body"));
	assert_eq!(first.find("offset").unwrap().decode::<u32>(), Some(0x10));
	let second = entries.get(1).unwrap();
	assert_eq!(second.find("name").unwrap().as_str(), Some("wing"));

	let vertices = parsed.find("vertices").unwrap();
	assert_eq!(vertices.find("count").unwrap().decode::<u16>(), Some(3));
	assert_eq!(vertices.find("payload").unwrap().array_count(), 12);
}

#[test]
fn conditional_sections_react_to_content() {
	let mut ctx = context();
	let block = ctx.schemata().find_block_definition("ModelFile").unwrap();
	let data = model_buffer(1);

	let mut formatter = BinaryFormatter::new(&mut ctx, &data);
	formatter.push_pattern(block, &[], 0);
	let parsed = BinaryBlockMatch::new(&mut formatter).unwrap();

	assert!(parsed.find("normalSection").is_none());
	assert_eq!(parsed.find("format").unwrap().decode::<u8>(), Some(1));
	assert_eq!(formatter.offset(), data.len());
}

#[test]
fn skipping_entries_matches_walking_them() {
	let data = model_buffer(2);

	let walked_end = {
		let mut ctx = context();
		let block = ctx.schemata().find_block_definition("ModelFile").unwrap();
		let mut formatter = BinaryFormatter::new(&mut ctx, &data);
		formatter.push_pattern(block, &[], 0);
		BinaryBlockMatch::new(&mut formatter).unwrap();
		formatter.offset()
	};

	let mut ctx = context();
	let block = ctx.schemata().find_block_definition("ModelFile").unwrap();
	let mut formatter = BinaryFormatter::new(&mut ctx, &data);
	formatter.push_pattern(block, &[], 0);
	while formatter.peek_next().unwrap() != Blob::None {
		formatter.skip_next_blob().unwrap();
	}
	assert_eq!(formatter.offset(), walked_end);
	assert_eq!(walked_end, data.len());
}

#[test]
fn dump_renders_the_whole_tree() {
	let mut ctx = context();
	let block = ctx.schemata().find_block_definition("ModelFile").unwrap();
	let data = model_buffer(2);

	let mut formatter = BinaryFormatter::new(&mut ctx, &data);
	formatter.push_pattern(block, &[], 0);

	let mut out = String::new();
	dump_block(&mut out, &mut formatter, 0).unwrap();
	assert!(out.contains("uint8 format = 2"));
	assert!(out.contains("char name = body"));
	assert!(out.contains("NamedEntry entries[2]"));
	assert!(out.contains("VertexRun(4) vertices"));
}

#[test]
fn rendered_sources_walk_identically() {
	let schemata = BinarySchemata::parse(MODEL_SCHEMA, "model.schema", None, None).unwrap();
	let mut rendered = String::new();
	schemata.write_source(&mut rendered);
	let reparsed = BinarySchemata::parse(&rendered, "model-rendered.schema", None, None)
		.unwrap_or_else(|e| panic!("round-trip parse failed: {e}\n{rendered}"));

	let data = model_buffer(2);

	let mut original_dump = String::new();
	{
		let mut ctx = EvaluationContext::new(Arc::new(schemata));
		let block = ctx.schemata().find_block_definition("ModelFile").unwrap();
		let mut formatter = BinaryFormatter::new(&mut ctx, &data);
		formatter.push_pattern(block, &[], 0);
		dump_block(&mut original_dump, &mut formatter, 0).unwrap();
	}

	let mut round_trip_dump = String::new();
	{
		let mut ctx = EvaluationContext::new(Arc::new(reparsed));
		let block = ctx.schemata().find_block_definition("ModelFile").unwrap();
		let mut formatter = BinaryFormatter::new(&mut ctx, &data);
		formatter.push_pattern(block, &[], 0);
		dump_block(&mut round_trip_dump, &mut formatter, 0).unwrap();
	}

	assert_eq!(original_dump, round_trip_dump);
}

#[test]
fn literal_tables_expose_enumerants() {
	let schemata = BinarySchemata::parse(MODEL_SCHEMA, "model.schema", None, None).unwrap();
	let id = schemata.find_literals("VertexFormats").unwrap();
	let table = schemata.literals(id);
	assert_eq!(table.find("position_normal"), Some(2));
	assert_eq!(table.name_of(1), Some("position_only"));
}
