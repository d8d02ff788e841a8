use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};

use derivative::Derivative;
use fxhash::FxHashMap;
use rust_search::SearchBuilder;

use crate::lex::{IncludeHandler, IncludedFile, LexError};

/// Include resolution for schema sources.
///
/// Registered directories are indexed up front; `#include` requests resolve
/// first relative to the including file, then against the index by file name.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct SearchRules {
	extension: String,
	#[derivative(Debug(format_with = "SearchRules::fmt_indexed"))]
	indexed: FxHashMap<String, Vec<PathBuf>>,
}

impl SearchRules {
	pub fn new<T: AsRef<Path>>(directories: impl IntoIterator<Item = T>, extension: &str) -> Self {
		let mut rules = SearchRules {
			extension: extension.to_string(),
			indexed: Default::default(),
		};
		for directory in directories {
			rules.register_directory(directory.as_ref());
		}
		rules
	}

	pub fn register_directory(&mut self, directory: &Path) {
		for entry in SearchBuilder::default()
			.location(directory)
			.depth(usize::MAX)
			.ext(&self.extension)
			.build()
		{
			let path = PathBuf::from(&entry);
			let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
			self.indexed.entry(name.to_ascii_lowercase()).or_default().push(path);
		}
	}

	fn resolve(&self, request: &str, requested_from: &str) -> Option<PathBuf> {
		if let Some(parent) = Path::new(requested_from).parent() {
			let sibling = parent.join(request);
			if sibling.is_file() {
				return Some(sibling);
			}
		}

		let name = Path::new(request).file_name()?.to_str()?.to_ascii_lowercase();
		let candidates = self.indexed.get(&name)?;
		candidates.iter().find(|c| c.ends_with(request)).or_else(|| candidates.first()).cloned()
	}

	fn fmt_indexed(indexed: &FxHashMap<String, Vec<PathBuf>>, fmt: &mut Formatter) -> std::fmt::Result {
		let name = format!("[{}]", indexed.len());
		let mut dbg = fmt.debug_struct(&name);
		for (key, paths) in indexed {
			dbg.field(key, &format_args!("{paths:?}"));
		}
		dbg.finish()
	}
}

impl IncludeHandler for SearchRules {
	fn open(&mut self, request: &str, requested_from: &str) -> Result<IncludedFile, LexError> {
		let Some(path) = self.resolve(request, requested_from) else {
			return Err(LexError::IncludeNotFound { path: request.to_string() });
		};
		let contents = std::fs::read_to_string(&path).map_err(|source| LexError::IncludeFailed {
			path: path.to_string_lossy().into_owned(),
			source,
		})?;
		Ok(IncludedFile {
			filename: path.to_string_lossy().into_owned(),
			contents,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolves_from_registered_directories() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("common.schema"), "alias char = uint8;").unwrap();

		let mut rules = SearchRules::new([dir.path()], "schema");
		let included = rules.open("common.schema", "root.schema").unwrap();
		assert!(included.contents.contains("alias char"));
		assert!(included.filename.ends_with("common.schema"));
	}

	#[test]
	fn prefers_files_next_to_the_including_file() {
		let dir = tempfile::tempdir().unwrap();
		let nested = dir.path().join("nested");
		std::fs::create_dir(&nested).unwrap();
		std::fs::write(dir.path().join("shared.schema"), "// outer").unwrap();
		std::fs::write(nested.join("shared.schema"), "// sibling").unwrap();

		let mut rules = SearchRules::new([dir.path()], "schema");
		let from = nested.join("root.schema");
		let included = rules.open("shared.schema", from.to_str().unwrap()).unwrap();
		assert_eq!(included.contents, "// sibling");
	}

	#[test]
	fn missing_files_are_reported() {
		let dir = tempfile::tempdir().unwrap();
		let mut rules = SearchRules::new([dir.path()], "schema");
		assert!(matches!(
			rules.open("absent.schema", "root.schema"),
			Err(LexError::IncludeNotFound { .. })
		));
	}
}
