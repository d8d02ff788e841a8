use std::sync::Arc;
use std::time::UNIX_EPOCH;

use derivative::Derivative;
use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::utilities::hash_file_path;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum FileDescState {
	Normal,
	#[default]
	DoesNotExist,
}

/// Snapshot of a file as reported by the host filesystem.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct FileDesc {
	pub state: FileDescState,
	pub modification_time: u64,
	pub size: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FileStatus {
	Normal,
	Shadowed,
	DoesNotExist,
}

/// One observed version of a monitored file. Versions accumulate in an
/// append-only history; a new version is what propagates invalidation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FileState {
	pub filename: String,
	pub time_marker: u64,
	pub status: FileStatus,
}

/// Receives change events for one watched path.
pub trait FileMonitor: Send + Sync {
	fn on_change(&self);
}

/// The file access and change-notification capability the host supplies.
///
/// Implementations must not call back into the dependency graph from within
/// a graph operation; events raised from `monitor` callbacks re-enter it.
pub trait FileHost: Send + Sync {
	/// Watches `path`, invoking `monitor` whenever the file is created,
	/// modified or deleted. Multiple calls for one path coalesce.
	fn monitor(&self, path: &str, monitor: Arc<dyn FileMonitor>);

	fn try_get_desc(&self, path: &str) -> FileDesc;

	/// Raises a synthetic change event for `path`. Hosts that cannot fake
	/// events may ignore this.
	fn try_fake_change(&self, _path: &str) {}
}

/// Reference [`FileHost`] backed by `std::fs` metadata.
///
/// No operating-system watcher is attached; change events fire only through
/// [`FileHost::try_fake_change`]. Hosts with real watch infrastructure wrap
/// it behind the same trait.
#[derive(Derivative, Default)]
#[derivative(Debug)]
pub struct PassiveFileHost {
	#[derivative(Debug = "ignore")]
	monitors: Mutex<FxHashMap<u64, Vec<Arc<dyn FileMonitor>>>>,
}

impl PassiveFileHost {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}
}

impl FileHost for PassiveFileHost {
	fn monitor(&self, path: &str, monitor: Arc<dyn FileMonitor>) {
		self.monitors.lock().entry(hash_file_path(path)).or_default().push(monitor);
	}

	fn try_get_desc(&self, path: &str) -> FileDesc {
		let Ok(metadata) = std::fs::metadata(path) else { return FileDesc::default() };
		let modification_time = metadata
			.modified()
			.ok()
			.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
			.map(|d| d.as_millis() as u64)
			.unwrap_or(0);
		FileDesc {
			state: FileDescState::Normal,
			modification_time,
			size: metadata.len(),
		}
	}

	fn try_fake_change(&self, path: &str) {
		let monitors = self.monitors.lock().get(&hash_file_path(path)).cloned().unwrap_or_default();
		for monitor in monitors {
			monitor.on_change();
		}
	}
}
