use super::*;
use log::debug;
use std::fs::{self as sfs, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    my_info: BTreeMap<u32, MyInfoRecord>,
    #[serde(default)]
    nodes: BTreeMap<u32, NodeRecord>,
    #[serde(default)]
    positions: BTreeMap<u32, Vec<PositionRecord>>,
    #[serde(default)]
    telemetry: BTreeMap<u32, Vec<TelemetryRecord>>,
    #[serde(default)]
    pax: BTreeMap<u32, Vec<PaxRecord>>,
    #[serde(default)]
    node_configs: BTreeMap<u32, NodeConfigRecord>,
    #[serde(default)]
    messages: BTreeMap<u32, MessageRecord>,
    #[serde(default)]
    waypoints: BTreeMap<u32, WaypointRecord>,
    #[serde(default)]
    trace_routes: BTreeMap<u32, TraceRouteRecord>,
}

/// In-memory [`Store`] with an optional JSON snapshot file.
///
/// `working` takes every mutation; `flush` writes it out and promotes it to
/// `committed`; `rollback` copies `committed` back over `working`.
#[derive(Debug, Default)]
pub struct MeshStore {
    committed: Snapshot,
    working: Snapshot,
    dirty: bool,
    /// Bumped on every mutation.
    generation: u64,
    committed_generation: u64,
    path: Option<PathBuf>,
}

/// What [`MeshStore::begin_flush`] hands to the writer.
#[derive(Debug)]
pub struct SnapshotJob {
    data: Snapshot,
    path: Option<PathBuf>,
}

impl MeshStore {
    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open (or start) a snapshot-backed store. A missing file is an empty store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            let content = sfs::read_to_string(&path)?;
            // Guard against leading NULs left by a partial write
            let cleaned = content.trim_start_matches('\0');
            let snap: Snapshot = serde_json::from_str(cleaned)?;
            debug!(
                "Loaded snapshot {} ({} nodes, {} messages)",
                path.display(),
                snap.nodes.len(),
                snap.messages.len()
            );
            snap
        } else {
            Snapshot::default()
        };
        Ok(Self {
            committed: snapshot.clone(),
            working: snapshot,
            dirty: false,
            generation: 0,
            committed_generation: 0,
            path: Some(path),
        })
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.generation = self.generation.wrapping_add(1);
    }

    fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(snapshot)?;

        if let Some(parent) = path.parent() {
            let _ = sfs::create_dir_all(parent);
        }

        // Unique temp file in the same directory so the rename stays atomic
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let base = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("meshlink.json");
        let mut counter = 0u32;
        let tmp_path = loop {
            let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
            {
                Ok(mut tmp) => {
                    tmp.write_all(content.as_bytes())?;
                    tmp.flush()?;
                    let _ = tmp.sync_all();
                    break candidate;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    counter = counter.saturating_add(1);
                    continue;
                }
                Err(e) => return Err(StoreError::Io(e)),
            }
        };

        sfs::rename(&tmp_path, path)?;
        if let Ok(dir_file) = File::open(&dir) {
            let _ = dir_file.sync_all();
        }
        Ok(())
    }
}

impl Store for MeshStore {
    fn my_info(&self, num: u32) -> Option<MyInfoRecord> {
        self.working.my_info.get(&num).cloned()
    }

    fn upsert_my_info(&mut self, info: MyInfoRecord) {
        self.working.my_info.insert(info.my_node_num, info);
        self.touch();
    }

    fn node(&self, num: u32) -> Option<NodeRecord> {
        self.working.nodes.get(&num).cloned()
    }

    fn upsert_node(&mut self, node: NodeRecord) {
        self.working.nodes.insert(node.num, node);
        self.touch();
    }

    fn nodes(&self) -> Vec<NodeRecord> {
        self.working.nodes.values().cloned().collect()
    }

    fn append_position(&mut self, position: PositionRecord) {
        self.working
            .positions
            .entry(position.node_num)
            .or_default()
            .push(position);
        self.touch();
    }

    fn latest_position(&self, num: u32) -> Option<PositionRecord> {
        self.working
            .positions
            .get(&num)
            .and_then(|list| list.iter().max_by_key(|p| p.time))
            .cloned()
    }

    fn append_telemetry(&mut self, telemetry: TelemetryRecord) {
        self.working
            .telemetry
            .entry(telemetry.node_num)
            .or_default()
            .push(telemetry);
        self.touch();
    }

    fn telemetry(&self, num: u32) -> Vec<TelemetryRecord> {
        self.working.telemetry.get(&num).cloned().unwrap_or_default()
    }

    fn append_pax(&mut self, pax: PaxRecord) {
        self.working.pax.entry(pax.node_num).or_default().push(pax);
        self.touch();
    }

    fn pax(&self, num: u32) -> Vec<PaxRecord> {
        self.working.pax.get(&num).cloned().unwrap_or_default()
    }

    fn node_config(&self, num: u32) -> Option<NodeConfigRecord> {
        self.working.node_configs.get(&num).cloned()
    }

    fn upsert_node_config(&mut self, num: u32, config: NodeConfigRecord) {
        self.working.node_configs.insert(num, config);
        self.touch();
    }

    fn message(&self, id: u32) -> Option<MessageRecord> {
        self.working.messages.get(&id).cloned()
    }

    fn upsert_message(&mut self, message: MessageRecord) {
        self.working.messages.insert(message.message_id, message);
        self.touch();
    }

    fn messages(&self) -> Vec<MessageRecord> {
        self.working.messages.values().cloned().collect()
    }

    fn waypoint(&self, id: u32) -> Option<WaypointRecord> {
        self.working.waypoints.get(&id).cloned()
    }

    fn upsert_waypoint(&mut self, waypoint: WaypointRecord) {
        self.working.waypoints.insert(waypoint.id, waypoint);
        self.touch();
    }

    fn trace_route(&self, request_id: u32) -> Option<TraceRouteRecord> {
        self.working.trace_routes.get(&request_id).cloned()
    }

    fn upsert_trace_route(&mut self, trace: TraceRouteRecord) {
        self.working.trace_routes.insert(trace.request_id, trace);
        self.touch();
    }

    fn has_changes(&self) -> bool {
        self.dirty
    }

    type Snapshot = SnapshotJob;

    fn begin_flush(&mut self) -> Option<FlushTicket<SnapshotJob>> {
        if !self.dirty {
            return None;
        }
        Some(FlushTicket {
            generation: self.generation,
            snapshot: SnapshotJob {
                data: self.working.clone(),
                path: self.path.clone(),
            },
        })
    }

    fn persist(job: &SnapshotJob) -> Result<(), StoreError> {
        match &job.path {
            Some(path) => Self::write_snapshot(path, &job.data),
            None => Ok(()),
        }
    }

    fn commit_flush(&mut self, ticket: FlushTicket<SnapshotJob>) {
        // an older write finishing late must not replace a newer commit
        if ticket.generation < self.committed_generation {
            return;
        }
        self.committed = ticket.snapshot.data;
        self.committed_generation = ticket.generation;
        if self.generation == ticket.generation {
            self.dirty = false;
        }
    }

    fn abort_flush(&mut self, generation: u64) -> bool {
        if self.generation != generation {
            return false;
        }
        self.rollback();
        true
    }

    fn rollback(&mut self) {
        self.working = self.committed.clone();
        // a capture taken before the rollback no longer matches the working set
        self.generation = self.generation.wrapping_add(1);
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn message(id: u32) -> MessageRecord {
        MessageRecord {
            message_id: id,
            text: format!("m{}", id),
            ..Default::default()
        }
    }

    #[test]
    fn flush_persists_and_reopen_loads() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("snap.json");
        let mut store = MeshStore::open(&path).unwrap();
        store.upsert_node(NodeRecord::new(42));
        store.upsert_message(message(7));
        assert!(store.has_changes());
        store.flush().unwrap();
        assert!(!store.has_changes());

        let reopened = MeshStore::open(&path).unwrap();
        assert_eq!(reopened.node(42).unwrap().num, 42);
        assert_eq!(reopened.message(7).unwrap().text, "m7");
    }

    #[test]
    fn rollback_restores_last_flush() {
        let mut store = MeshStore::in_memory();
        store.upsert_message(message(1));
        store.flush().unwrap();
        store.upsert_message(message(2));
        store.rollback();
        assert!(store.message(1).is_some());
        assert!(store.message(2).is_none());
        assert!(!store.has_changes());
    }

    #[test]
    fn failed_write_keeps_working_set_dirty() {
        let tmp = TempDir::new().unwrap();
        // parent "directory" is a regular file, so the temp file cannot be created
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let mut store = MeshStore::open(blocker.join("snap.json")).unwrap();
        store.upsert_node(NodeRecord::new(5));
        assert!(store.flush().is_err());
        assert!(store.has_changes());
        store.rollback();
        assert!(store.node(5).is_none());
    }

    #[test]
    fn mutation_during_write_stays_pending() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("snap.json");
        let mut store = MeshStore::open(&path).unwrap();
        store.upsert_message(message(1));
        let ticket = store.begin_flush().unwrap();
        store.upsert_message(message(2));

        MeshStore::persist(&ticket.snapshot).unwrap();
        store.commit_flush(ticket);
        assert!(store.has_changes());
        assert!(store.message(2).is_some());
        assert!(MeshStore::open(&path).unwrap().message(2).is_none());

        store.flush().unwrap();
        assert!(!store.has_changes());
        assert!(MeshStore::open(&path).unwrap().message(2).is_some());
    }

    #[test]
    fn failed_write_keeps_newer_mutations() {
        let mut store = MeshStore::in_memory();
        store.upsert_message(message(1));
        let ticket = store.begin_flush().unwrap();
        store.upsert_message(message(2));
        assert!(!store.abort_flush(ticket.generation));
        assert!(store.message(1).is_some());
        assert!(store.message(2).is_some());
        assert!(store.has_changes());

        let ticket = store.begin_flush().unwrap();
        assert!(store.abort_flush(ticket.generation));
        assert!(store.message(1).is_none());
        assert!(!store.has_changes());
    }

    #[test]
    fn clean_store_has_nothing_to_capture() {
        let mut store = MeshStore::in_memory();
        assert!(store.begin_flush().is_none());
    }

    #[test]
    fn latest_position_picks_newest_sample() {
        let mut store = MeshStore::in_memory();
        let t0 = Utc::now() - chrono::Duration::minutes(5);
        store.append_position(PositionRecord {
            node_num: 9,
            latitude_i: 1,
            time: t0,
            ..Default::default()
        });
        store.append_position(PositionRecord {
            node_num: 9,
            latitude_i: 2,
            time: Utc::now(),
            ..Default::default()
        });
        assert_eq!(store.latest_position(9).unwrap().latitude_i, 2);
        assert!(store.latest_position(10).is_none());
    }

    #[test]
    fn unread_counts_split_direct_and_channel() {
        let mut store = MeshStore::in_memory();
        store.upsert_message(MessageRecord {
            message_id: 1,
            to_num: Some(100),
            ..Default::default()
        });
        store.upsert_message(MessageRecord {
            message_id: 2,
            channel: 1,
            ..Default::default()
        });
        store.upsert_message(MessageRecord {
            message_id: 3,
            channel: 1,
            read: true,
            ..Default::default()
        });
        let counts = store.unread_counts(100);
        assert_eq!(counts.direct, 1);
        assert_eq!(counts.channels.get(&1), Some(&1));
    }
}
