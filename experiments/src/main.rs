use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;
use std::time::SystemTime;

use memory_stats::memory_stats;
use tracing_flame::FlameLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

use axon::depval::{DependencyValidationSystem, PassiveFileHost};
use axon::format::{dump_block, BinaryFormatter, EvaluationContext};
use axon::schema::BinarySchemata;

const SCHEMA: &str = "\
alias char = uint8;

block NamedEntry {
	uint16 nameLength;
	char name[nameLength];
	uint32 offset;
};

block ModelFile {
	uint32 magic;
	uint8 entryCount;
	NamedEntry entries[entryCount];
	uint16 vertexCount;
	uint8 vertexData[vertexCount * 4];
};
";

fn setup_global_subscriber() -> impl Drop {
	let file = File::create("./trace.folded").unwrap();
	let flame_layer = FlameLayer::new(BufWriter::new(file)).with_file_and_line(false);
	let guard = flame_layer.flush_on_drop();

	let subscriber = Registry::default()
		.with(flame_layer);

	tracing::subscriber::set_global_default(subscriber).expect("Could not set global default");
	guard
}

fn synthesize_buffer(entries: usize, vertices: u16) -> Vec<u8> {
	let mut data = Vec::new();
	data.extend_from_slice(&0x4C444F4Du32.to_le_bytes());
	data.push(entries as u8);
	for i in 0..entries {
		let name = format!("mesh_{i}");
		data.extend_from_slice(&(name.len() as u16).to_le_bytes());
		data.extend_from_slice(name.as_bytes());
		data.extend_from_slice(&(i as u32 * 0x40).to_le_bytes());
	}
	data.extend_from_slice(&vertices.to_le_bytes());
	data.extend_from_slice(&vec![0x5A; vertices as usize * 4]);
	data
}

fn main() {
	let _guard = setup_global_subscriber();

	let mut start = SystemTime::now();
	let schemata = BinarySchemata::parse(SCHEMA, "model.schema", None, None).unwrap();
	let mut ctx = EvaluationContext::new(Arc::new(schemata));

	println! {
		"Schema parse time: {:?}, RAM: {}MB",
		start.elapsed().unwrap(),
		memory_stats().unwrap().virtual_mem as f32 / 1000000.0,
	}

	start = SystemTime::now();

	let data = synthesize_buffer(24, 4096);
	let block = ctx.schemata().find_block_definition("ModelFile").unwrap();
	let mut formatter = BinaryFormatter::new(&mut ctx, &data);
	formatter.push_pattern(block, &[], 0);

	let mut dump = String::new();
	dump_block(&mut dump, &mut formatter, 0).unwrap();

	println! {
		"Walk time: {:?}, RAM: {}MB",
		start.elapsed().unwrap(),
		memory_stats().unwrap().virtual_mem as f32 / 1000000.0,
	}
	println!("Walked {} bytes, dump is {} lines", formatter.offset(), dump.lines().count());

	// Invalidation round trip: shadowing the schema source bumps the marker.
	let system = DependencyValidationSystem::new(PassiveFileHost::new());
	let depval = system.make();
	depval.register_file("model.schema");
	println!("Validation index before shadow: {}", depval.validation_index());
	system.shadow_file("model.schema");
	println!("Validation index after shadow: {}", depval.validation_index());
}
