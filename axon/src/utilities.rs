use std::ops::Range;

/// Hash for identifier names. Local member contexts, template parameters and
/// global parameters all key into the same 64-bit space.
#[inline]
pub fn hash_name(name: &str) -> u64 {
	fxhash::hash64(name.as_bytes())
}

/// Hash for file paths. Separators and ASCII case are folded so that
/// equivalent spellings of the same path coalesce onto one monitored file.
pub fn hash_file_path(path: &str) -> u64 {
	let mut normalized = Vec::with_capacity(path.len());
	for b in path.bytes() {
		match b {
			b'\\' => normalized.push(b'/'),
			b'A'..=b'Z' => normalized.push(b + 0x20),
			b => normalized.push(b),
		}
	}
	fxhash::hash64(&normalized)
}

/// Range of entries in a slice sorted by `key(entry)` that compare equal to `key`.
pub(crate) fn equal_range_by_key<T, K: Ord>(slice: &[T], key: K, f: impl Fn(&T) -> K) -> Range<usize> {
	let start = slice.partition_point(|t| f(t) < key);
	let end = start + slice[start..].partition_point(|t| f(t) == key);
	start..end
}

pub(crate) fn in_sorted_range<T: Ord + Copy>(slice: &[T], value: T) -> bool {
	slice.binary_search(&value).is_ok()
}

macro_rules! define_repr_enum {
	(
		$(#[$attr: meta])*
		$vis: vis enum $name: ident: $repr: ty {
			$(
				$(#[$vattr: meta])*
				$variant: ident = $discriminant: literal
			),* $(,)?
		}
	) => {
		$(#[$attr])*
		#[repr($repr)]
		$vis enum $name {
			$(
				$(#[$vattr])*
				$variant = $discriminant
			),*
		}

		impl $name {
			pub fn from_repr(discriminant: $repr) -> Option<Self> {
				match discriminant {
					$($discriminant => Some(Self::$variant),)*
					_ => None,
				}
			}
		}
	};
}

pub(crate) use define_repr_enum;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn path_hash_folds_case_and_separators() {
		assert_eq!(hash_file_path("Assets\\Config.dat"), hash_file_path("assets/config.dat"));
		assert_ne!(hash_file_path("assets/config.dat"), hash_file_path("assets/config2.dat"));
	}

	#[test]
	fn equal_range_finds_runs() {
		let links = [(1u32, 'a'), (1, 'b'), (3, 'c'), (7, 'd')];
		assert_eq!(equal_range_by_key(&links, 1, |l| l.0), 0..2);
		assert_eq!(equal_range_by_key(&links, 3, |l| l.0), 2..3);
		assert_eq!(equal_range_by_key(&links, 4, |l| l.0), 3..3);
		assert_eq!(equal_range_by_key(&links, 9, |l| l.0), 4..4);
	}
}
