use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Weak};

use derivative::Derivative;
use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::utilities::{equal_range_by_key, hash_file_path, in_sorted_range};

mod monitor;

pub use monitor::{FileDesc, FileDescState, FileHost, FileMonitor, FileState, FileStatus, PassiveFileHost};

/// Opaque handle index into the dependency graph.
pub type MarkerId = u32;
pub const MARKER_INVALID: MarkerId = MarkerId::MAX;

type MonitoredFileId = u32;

#[derive(Debug)]
pub enum DepValError {
	InvalidMarker(MarkerId),
	CycleDetected { dependent: MarkerId, dependency: MarkerId },
}

impl Display for DepValError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::InvalidMarker(marker) => write!(f, "dependency validation marker {marker} is not allocated"),
			Self::CycleDetected { dependent, dependency } => {
				write!(f, "registering {dependent} -> {dependency} would create a dependency cycle")
			}
		}
	}
}

impl Error for DepValError {}

#[derive(Debug, Default, Copy, Clone)]
struct Entry {
	ref_count: u32,
	validation_index: u32,
}

#[derive(Debug)]
struct MonitoredFile {
	path: String,
	states: Vec<FileState>,
}

#[derive(Debug, Default)]
struct Tables {
	entries: Vec<Entry>,
	free_markers: Vec<MarkerId>,

	files: Vec<MonitoredFile>,
	file_lookup: FxHashMap<u64, MonitoredFileId>,

	/// `(dependent, dependency)`, sorted by dependent.
	asset_links: Vec<(MarkerId, MarkerId)>,
	/// `marker -> (file, observed state index)`, sorted by marker.
	file_links: Vec<(MarkerId, (MonitoredFileId, u32))>,
}

impl Tables {
	fn entry(&self, marker: MarkerId) -> Result<&Entry, DepValError> {
		self.entries
			.get(marker as usize)
			.filter(|e| e.ref_count > 0)
			.ok_or(DepValError::InvalidMarker(marker))
	}

	fn entry_mut(&mut self, marker: MarkerId) -> Result<&mut Entry, DepValError> {
		self.entries
			.get_mut(marker as usize)
			.filter(|e| e.ref_count > 0)
			.ok_or(DepValError::InvalidMarker(marker))
	}
}

/// Process-wide graph associating artifacts with the files and artifacts
/// they were built from, propagating an invalidation index bump to every
/// transitive dependent when an input changes.
///
/// Every public operation is free-threaded; one internal lock is held for
/// the duration of a call, and neither host I/O nor host callbacks run
/// under it.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct DependencyValidationSystem {
	tables: Mutex<Tables>,
	#[derivative(Debug = "ignore")]
	host: Arc<dyn FileHost>,
	self_ref: Weak<DependencyValidationSystem>,
}

/// Per-file observer registered with the host; re-enters the owning system
/// when the host reports a change.
struct MonitoredFileObserver {
	system: Weak<DependencyValidationSystem>,
	file: MonitoredFileId,
}

impl FileMonitor for MonitoredFileObserver {
	fn on_change(&self) {
		if let Some(system) = self.system.upgrade() {
			system.handle_file_change(self.file);
		}
	}
}

impl DependencyValidationSystem {
	pub fn new(host: Arc<dyn FileHost>) -> Arc<Self> {
		Arc::new_cyclic(|self_ref| Self {
			tables: Mutex::new(Tables::default()),
			host,
			self_ref: self_ref.clone(),
		})
	}

	/// Allocates a marker with no dependencies.
	pub fn make(self: &Arc<Self>) -> DependencyValidation {
		let marker = Self::allocate(&mut self.tables.lock());
		DependencyValidation { system: self.clone(), marker }
	}

	/// Allocates a marker and registers every path in one step.
	pub fn make_with_files<I, P>(self: &Arc<Self>, paths: I) -> DependencyValidation
	where
		I: IntoIterator<Item = P>,
		P: AsRef<str>,
	{
		// File observation may touch the filesystem, so resolve ids first;
		// the marker and its links then appear atomically.
		let files: Vec<MonitoredFileId> = paths.into_iter().map(|p| self.monitored_file_id(p.as_ref())).collect();
		let mut tables = self.tables.lock();
		let marker = Self::allocate(&mut tables);
		for file in files {
			Self::link_file_locked(&mut tables, marker, file);
		}
		drop(tables);
		DependencyValidation { system: self.clone(), marker }
	}

	/// Allocates a marker registered against the files of previously
	/// captured states.
	pub fn make_with_file_states<'s>(
		self: &Arc<Self>,
		states: impl IntoIterator<Item = &'s FileState>,
	) -> DependencyValidation {
		self.make_with_files(states.into_iter().map(|s| s.filename.as_str()))
	}

	fn allocate(tables: &mut Tables) -> MarkerId {
		let marker = match tables.free_markers.pop() {
			Some(recycled) => recycled,
			None => {
				tables.entries.push(Entry::default());
				(tables.entries.len() - 1) as MarkerId
			}
		};
		tables.entries[marker as usize] = Entry { ref_count: 1, validation_index: 0 };
		marker
	}

	pub fn add_ref(&self, marker: MarkerId) -> Result<(), DepValError> {
		let mut tables = self.tables.lock();
		tables.entry_mut(marker)?.ref_count += 1;
		Ok(())
	}

	pub fn release(&self, marker: MarkerId) -> Result<(), DepValError> {
		let mut tables = self.tables.lock();
		tables.entry(marker)?;
		Self::release_locked(&mut tables, marker);
		Ok(())
	}

	fn release_locked(tables: &mut Tables, marker: MarkerId) {
		let entry = &mut tables.entries[marker as usize];
		entry.ref_count -= 1;
		if entry.ref_count > 0 {
			return;
		}

		let asset_range = equal_range_by_key(&tables.asset_links, marker, |l| l.0);
		let dependencies: Vec<MarkerId> = tables.asset_links[asset_range.clone()].iter().map(|l| l.1).collect();
		tables.asset_links.drain(asset_range);

		let file_range = equal_range_by_key(&tables.file_links, marker, |l| l.0);
		tables.file_links.drain(file_range);

		// Dependencies are released only after the link tables are stable.
		for dependency in dependencies {
			Self::release_locked(tables, dependency);
		}
		tables.free_markers.push(marker);
	}

	pub fn get_validation_index(&self, marker: MarkerId) -> Result<u32, DepValError> {
		Ok(self.tables.lock().entry(marker)?.validation_index)
	}

	/// Registers a dependency on a file path. Idempotent; re-registration
	/// refreshes the observed state version. A missing file is not an error:
	/// a `DoesNotExist` version is recorded and later transitions propagate.
	pub fn register_file_dependency(&self, marker: MarkerId, path: &str) -> Result<(), DepValError> {
		let file = self.monitored_file_id(path);
		let mut tables = self.tables.lock();
		tables.entry(marker)?;
		Self::link_file_locked(&mut tables, marker, file);
		Ok(())
	}

	fn link_file_locked(tables: &mut Tables, marker: MarkerId, file: MonitoredFileId) {
		let latest_state = (tables.files[file as usize].states.len() - 1) as u32;
		let range = equal_range_by_key(&tables.file_links, marker, |l| l.0);
		for link in &mut tables.file_links[range.clone()] {
			if link.1 .0 == file {
				link.1 .1 = latest_state;
				return;
			}
		}
		tables.file_links.insert(range.end, (marker, (file, latest_state)));
	}

	/// Registers `dependent` as invalidated whenever `dependency` is.
	/// Idempotent. The dependency's refcount is held until the dependent's
	/// last release.
	pub fn register_asset_dependency(&self, dependent: MarkerId, dependency: MarkerId) -> Result<(), DepValError> {
		let mut tables = self.tables.lock();
		tables.entry(dependent)?;
		tables.entry(dependency)?;

		let range = equal_range_by_key(&tables.asset_links, dependent, |l| l.0);
		if tables.asset_links[range.clone()].iter().any(|l| l.1 == dependency) {
			return Ok(());
		}

		if dependent == dependency || Self::depends_on_locked(&tables, dependency, dependent) {
			return Err(DepValError::CycleDetected { dependent, dependency });
		}

		tables.entries[dependency as usize].ref_count += 1;
		tables.asset_links.insert(range.start, (dependent, dependency));
		Ok(())
	}

	/// Whether `from` transitively depends on `target` via asset links.
	fn depends_on_locked(tables: &Tables, from: MarkerId, target: MarkerId) -> bool {
		let mut stack = vec![from];
		let mut visited: Vec<MarkerId> = Vec::new();
		while let Some(current) = stack.pop() {
			if current == target {
				return true;
			}
			if visited.contains(&current) {
				continue;
			}
			visited.push(current);
			let range = equal_range_by_key(&tables.asset_links, current, |l| l.0);
			stack.extend(tables.asset_links[range].iter().map(|l| l.1));
		}
		false
	}

	/// Snapshot of the current known state of `path`, monitoring it from
	/// here on if it was not already.
	pub fn get_dependent_file_state(&self, path: &str) -> FileState {
		let file = self.monitored_file_id(path);
		let tables = self.tables.lock();
		tables.files[file as usize].states.last().expect("state history is never empty").clone()
	}

	/// Appends a synthetic `Shadowed` version of `path` and propagates
	/// invalidation, forcing downstream rebuilds without touching the file.
	pub fn shadow_file(&self, path: &str) {
		let file = self.monitored_file_id(path);
		{
			let mut tables = self.tables.lock();
			let mut state = tables.files[file as usize].states.last().expect("state history is never empty").clone();
			state.status = FileStatus::Shadowed;
			tables.files[file as usize].states.push(state);
			Self::propagate_file_change_locked(&mut tables, file);
		}
		// Raised after the lock drops; the host callback re-enters the graph.
		self.host.try_fake_change(path);
	}

	/// Resolves the monitored-file id for a path, observing and watching the
	/// file on first contact. Host I/O happens outside the lock.
	fn monitored_file_id(&self, path: &str) -> MonitoredFileId {
		let hash = hash_file_path(path);
		if let Some(&file) = self.tables.lock().file_lookup.get(&hash) {
			return file;
		}

		let desc = self.host.try_get_desc(path);
		let initial = FileState {
			filename: path.to_string(),
			time_marker: desc.modification_time,
			status: match desc.state {
				FileDescState::Normal => FileStatus::Normal,
				FileDescState::DoesNotExist => FileStatus::DoesNotExist,
			},
		};

		let (file, inserted) = {
			let mut tables = self.tables.lock();
			match tables.file_lookup.get(&hash) {
				Some(&existing) => (existing, false),
				None => {
					let file = tables.files.len() as MonitoredFileId;
					tables.files.push(MonitoredFile { path: path.to_string(), states: vec![initial] });
					tables.file_lookup.insert(hash, file);
					(file, true)
				}
			}
		};

		if inserted {
			let observer = Arc::new(MonitoredFileObserver { system: self.self_ref.clone(), file });
			self.host.monitor(path, observer);
		}
		file
	}

	/// Host-event entry point: records the file's new state and bumps every
	/// transitively dependent marker.
	fn handle_file_change(&self, file: MonitoredFileId) {
		let path = self.tables.lock().files[file as usize].path.clone();
		let desc = self.host.try_get_desc(&path);

		let mut tables = self.tables.lock();
		tables.files[file as usize].states.push(FileState {
			filename: path,
			time_marker: desc.modification_time,
			status: match desc.state {
				FileDescState::Normal => FileStatus::Normal,
				FileDescState::DoesNotExist => FileStatus::DoesNotExist,
			},
		});
		Self::propagate_file_change_locked(&mut tables, file);
	}

	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	fn propagate_file_change_locked(tables: &mut Tables, file: MonitoredFileId) {
		let mut frontier: Vec<MarkerId> =
			tables.file_links.iter().filter(|l| l.1 .0 == file).map(|l| l.0).collect();
		frontier.sort_unstable();
		frontier.dedup();

		let mut closure: Vec<MarkerId> = Vec::new();
		let mut next: Vec<MarkerId> = Vec::new();
		while !frontier.is_empty() {
			for &(dependent, dependency) in &tables.asset_links {
				if in_sorted_range(&frontier, dependency)
					&& !in_sorted_range(&frontier, dependent)
					&& !in_sorted_range(&closure, dependent)
				{
					next.push(dependent);
				}
			}

			let middle = closure.len();
			closure.extend_from_slice(&frontier);
			merge_sorted(&mut closure, middle);

			next.sort_unstable();
			next.dedup();
			frontier = std::mem::take(&mut next);
		}

		#[cfg(feature = "tracing")]
		tracing::debug!(file, reached = closure.len(), "propagating file change");

		for marker in closure {
			tables.entries[marker as usize].validation_index += 1;
		}
	}
}

/// Merges two sorted runs `[..middle]` and `[middle..]` in place.
fn merge_sorted(values: &mut [MarkerId], middle: usize) {
	// The runs are disjoint and individually sorted; rotation keeps the
	// merge allocation-free.
	let mut left = 0;
	let mut right = middle;
	while left < right && right < values.len() {
		if values[left] <= values[right] {
			left += 1;
		} else {
			values[left..=right].rotate_right(1);
			left += 1;
			right += 1;
		}
	}
}

/// RAII handle over a marker: clones add a reference, dropping the last
/// handle releases the marker and its outgoing links.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct DependencyValidation {
	#[derivative(Debug = "ignore")]
	system: Arc<DependencyValidationSystem>,
	marker: MarkerId,
}

impl DependencyValidation {
	#[inline]
	pub fn marker(&self) -> MarkerId {
		self.marker
	}

	#[inline]
	pub fn system(&self) -> &Arc<DependencyValidationSystem> {
		&self.system
	}

	pub fn validation_index(&self) -> u32 {
		self.system.get_validation_index(self.marker).expect("handle holds a reference")
	}

	pub fn register_file(&self, path: &str) {
		self.system
			.register_file_dependency(self.marker, path)
			.expect("handle holds a reference");
	}

	pub fn register_dependency(&self, dependency: &DependencyValidation) -> Result<(), DepValError> {
		self.system.register_asset_dependency(self.marker, dependency.marker)
	}
}

impl Clone for DependencyValidation {
	fn clone(&self) -> Self {
		self.system.add_ref(self.marker).expect("handle holds a reference");
		Self { system: self.system.clone(), marker: self.marker }
	}
}

impl Drop for DependencyValidation {
	fn drop(&mut self) {
		let _ = self.system.release(self.marker);
	}
}

impl PartialEq for DependencyValidation {
	fn eq(&self, other: &Self) -> bool {
		self.marker == other.marker && Arc::ptr_eq(&self.system, &other.system)
	}
}

impl Eq for DependencyValidation {}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Default)]
	struct MockHost {
		files: Mutex<FxHashMap<String, FileDesc>>,
		monitors: Mutex<FxHashMap<String, Vec<Arc<dyn FileMonitor>>>>,
	}

	impl MockHost {
		fn new() -> Arc<Self> {
			Arc::new(Self::default())
		}

		fn put(&self, path: &str, modification_time: u64) {
			self.files.lock().insert(
				path.to_string(),
				FileDesc { state: FileDescState::Normal, modification_time, size: 1 },
			);
		}

		fn remove(&self, path: &str) {
			self.files.lock().remove(path);
		}

		fn touch(&self, path: &str) {
			{
				let mut files = self.files.lock();
				let desc = files.entry(path.to_string()).or_insert(FileDesc {
					state: FileDescState::Normal,
					modification_time: 0,
					size: 1,
				});
				desc.state = FileDescState::Normal;
				desc.modification_time += 1;
			}
			self.notify(path);
		}

		fn notify(&self, path: &str) {
			let monitors = self.monitors.lock().get(path).cloned().unwrap_or_default();
			for monitor in monitors {
				monitor.on_change();
			}
		}
	}

	impl FileHost for MockHost {
		fn monitor(&self, path: &str, monitor: Arc<dyn FileMonitor>) {
			self.monitors.lock().entry(path.to_string()).or_default().push(monitor);
		}

		fn try_get_desc(&self, path: &str) -> FileDesc {
			self.files.lock().get(path).copied().unwrap_or_default()
		}

		fn try_fake_change(&self, path: &str) {
			self.notify(path);
		}
	}

	#[test]
	fn file_changes_propagate_through_asset_links() {
		let host = MockHost::new();
		host.put("x", 1);
		let system = DependencyValidationSystem::new(host.clone());

		let a = system.make();
		let b = system.make();
		a.register_file("x");
		b.register_dependency(&a).unwrap();
		assert_eq!((a.validation_index(), b.validation_index()), (0, 0));

		host.touch("x");
		assert_eq!((a.validation_index(), b.validation_index()), (1, 1));

		host.touch("x");
		assert_eq!((a.validation_index(), b.validation_index()), (2, 2));

		let b_marker = b.marker();
		drop(b);
		host.touch("x");
		assert_eq!(a.validation_index(), 3);
		assert!(matches!(
			system.get_validation_index(b_marker),
			Err(DepValError::InvalidMarker(_))
		));
	}

	#[test]
	fn propagation_reaches_transitive_dependents() {
		let host = MockHost::new();
		host.put("x", 1);
		let system = DependencyValidationSystem::new(host.clone());

		// c -> b -> a -> file, d independent.
		let a = system.make();
		let b = system.make();
		let c = system.make();
		let d = system.make();
		a.register_file("x");
		b.register_dependency(&a).unwrap();
		c.register_dependency(&b).unwrap();

		host.touch("x");
		assert_eq!(a.validation_index(), 1);
		assert_eq!(b.validation_index(), 1);
		assert_eq!(c.validation_index(), 1);
		assert_eq!(d.validation_index(), 0);
	}

	#[test]
	fn registration_is_idempotent() {
		let host = MockHost::new();
		host.put("x", 1);
		let system = DependencyValidationSystem::new(host.clone());

		let a = system.make();
		let b = system.make();
		for _ in 0..5 {
			a.register_file("x");
			b.register_dependency(&a).unwrap();
		}

		host.touch("x");
		// One link each: a single bump per marker.
		assert_eq!(a.validation_index(), 1);
		assert_eq!(b.validation_index(), 1);

		// Releasing the dependent still releases the dependency cleanly.
		let a_marker = a.marker();
		drop(b);
		drop(a);
		assert!(matches!(
			system.get_validation_index(a_marker),
			Err(DepValError::InvalidMarker(_))
		));
	}

	#[test]
	fn dependents_keep_dependencies_alive() {
		let host = MockHost::new();
		host.put("x", 1);
		let system = DependencyValidationSystem::new(host.clone());

		let a = system.make();
		let b = system.make();
		a.register_file("x");
		b.register_dependency(&a).unwrap();

		let a_marker = a.marker();
		drop(a);
		// Still alive through b's link.
		assert!(system.get_validation_index(a_marker).is_ok());
		host.touch("x");
		assert_eq!(b.validation_index(), 1);

		drop(b);
		assert!(matches!(
			system.get_validation_index(a_marker),
			Err(DepValError::InvalidMarker(_))
		));
	}

	#[test]
	fn released_markers_are_recycled_independently() {
		let host = MockHost::new();
		host.put("x", 1);
		let system = DependencyValidationSystem::new(host.clone());

		let a = system.make();
		a.register_file("x");
		host.touch("x");
		assert_eq!(a.validation_index(), 1);
		let old_marker = a.marker();
		drop(a);

		let fresh = system.make();
		assert_eq!(fresh.marker(), old_marker);
		assert_eq!(fresh.validation_index(), 0);
		// The recycled marker has no file links left over.
		host.touch("x");
		assert_eq!(fresh.validation_index(), 0);
	}

	#[test]
	fn missing_files_register_and_later_appear() {
		let host = MockHost::new();
		let system = DependencyValidationSystem::new(host.clone());

		let a = system.make();
		a.register_file("late.bin");
		assert_eq!(system.get_dependent_file_state("late.bin").status, FileStatus::DoesNotExist);
		assert_eq!(a.validation_index(), 0);

		host.touch("late.bin");
		assert_eq!(a.validation_index(), 1);
		assert_eq!(system.get_dependent_file_state("late.bin").status, FileStatus::Normal);

		host.remove("late.bin");
		host.notify("late.bin");
		assert_eq!(a.validation_index(), 2);
		assert_eq!(system.get_dependent_file_state("late.bin").status, FileStatus::DoesNotExist);
	}

	#[test]
	fn shadowing_appends_a_version_and_propagates() {
		let host = MockHost::new();
		host.put("x", 7);
		let system = DependencyValidationSystem::new(host.clone());

		let a = system.make();
		a.register_file("x");
		system.shadow_file("x");

		assert!(a.validation_index() >= 1);
		// The synthetic version is visible in the file's history until the
		// host raises the fake change's real event.
		let state = system.get_dependent_file_state("x");
		assert_eq!(state.status, FileStatus::Normal); // fake change re-read the descriptor
	}

	#[test]
	fn cycles_are_rejected() {
		let host = MockHost::new();
		let system = DependencyValidationSystem::new(host);

		let a = system.make();
		let b = system.make();
		let c = system.make();
		b.register_dependency(&a).unwrap();
		c.register_dependency(&b).unwrap();

		assert!(matches!(
			a.register_dependency(&c),
			Err(DepValError::CycleDetected { .. })
		));
		assert!(matches!(
			a.register_dependency(&a),
			Err(DepValError::CycleDetected { .. })
		));
	}

	#[test]
	fn clones_share_the_marker() {
		let host = MockHost::new();
		host.put("x", 1);
		let system = DependencyValidationSystem::new(host.clone());

		let a = system.make();
		let a2 = a.clone();
		assert_eq!(a, a2);
		a.register_file("x");
		drop(a);

		// Still alive through the clone.
		host.touch("x");
		assert_eq!(a2.validation_index(), 1);
	}

	#[test]
	fn validation_indices_are_monotone_under_concurrency() {
		let host = MockHost::new();
		host.put("x", 1);
		let system = DependencyValidationSystem::new(host.clone());

		let a = system.make();
		a.register_file("x");

		let reader = {
			let a = a.clone();
			std::thread::spawn(move || {
				let mut last = 0;
				for _ in 0..1000 {
					let index = a.validation_index();
					assert!(index >= last);
					last = index;
				}
			})
		};
		let churn = {
			let system = system.clone();
			std::thread::spawn(move || {
				for _ in 0..200 {
					let m = system.make();
					drop(m);
				}
			})
		};
		for _ in 0..50 {
			host.touch("x");
		}
		reader.join().unwrap();
		churn.join().unwrap();
		assert_eq!(a.validation_index(), 50);
	}
}
