//! The acquisition engine.
//!
//! One engine drives one backend: poll, diff against the previous poll, and
//! reap an item once its state has stayed unchanged for a configured number
//! of consecutive polls. Completed and discarded items are remembered (and
//! optionally persisted) so they are never reaped twice; repeatedly failing
//! items are eventually parked rather than retried forever.

use crate::backend::{Backend, ReapOutcome};
use crate::sink::IngestSink;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const DEFAULT_STABLE_CYCLES: u32 = 2;
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub poll_interval: Duration,
    /// Consecutive polls an item's state must remain unchanged before it is
    /// considered ready. The minimum useful value is 2; 1 reaps on sight.
    pub stable_cycles: u32,
    /// Failed attempts before an item is parked permanently.
    pub max_retries: u32,
    /// Parent for per-reap scratch directories.
    pub workspace_root: PathBuf,
    /// Where the reaped/failed sets survive restarts. `None` disables
    /// persistence.
    pub state_file: Option<PathBuf>,
}

struct Tracked<S> {
    state: S,
    /// Consecutive polls (after the first) with an unchanged state.
    stable: u32,
    retries: u32,
    /// Monotonic discovery order; ready items are reaped oldest first.
    first_seen: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    reaped: BTreeSet<String>,
    failed: BTreeSet<String>,
}

pub struct Engine<B: Backend> {
    backend: B,
    sink: Box<dyn IngestSink>,
    opts: EngineOptions,
    shutdown: Arc<AtomicBool>,
    tracked: HashMap<String, Tracked<B::State>>,
    reaped: BTreeSet<String>,
    failed: BTreeSet<String>,
    seen_counter: u64,
}

impl<B: Backend> Engine<B> {
    pub fn new(backend: B, sink: Box<dyn IngestSink>, opts: EngineOptions) -> io::Result<Engine<B>> {
        fs::create_dir_all(&opts.workspace_root)?;
        let persisted = match &opts.state_file {
            Some(path) => load_state(path),
            None => PersistedState::default(),
        };
        Ok(Engine {
            backend,
            sink,
            opts,
            shutdown: Arc::new(AtomicBool::new(false)),
            tracked: HashMap::new(),
            reaped: persisted.reaped,
            failed: persisted.failed,
            seen_counter: 0,
        })
    }

    /// Flag that stops the run loop; wire it to signal handlers.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Poll until the shutdown flag is raised. The inter-poll sleep is
    /// chunked so shutdown takes effect promptly.
    pub fn run(&mut self) {
        info!(
            backend = self.backend.name(),
            poll_interval_secs = self.opts.poll_interval.as_secs(),
            "engine started"
        );
        while !self.shutdown.load(Ordering::Relaxed) {
            self.cycle();
            let mut remaining = self.opts.poll_interval;
            let step = Duration::from_millis(250);
            while !remaining.is_zero() && !self.shutdown.load(Ordering::Relaxed) {
                let nap = remaining.min(step);
                std::thread::sleep(nap);
                remaining -= nap;
            }
        }
        info!(backend = self.backend.name(), "engine stopped");
    }

    /// One poll-diff-reap pass.
    pub fn cycle(&mut self) {
        let snapshot = match self.backend.query() {
            Ok(snapshot) => snapshot,
            Err(error) => {
                // Transient by contract: nothing tracked is touched.
                warn!(backend = self.backend.name(), %error, "query failed; will retry");
                return;
            }
        };

        // Items gone from the source stop being tracked; if one reappears it
        // starts over as new.
        self.tracked.retain(|id, _| snapshot.contains_key(id));

        let mut ready: Vec<(String, u64)> = Vec::new();
        for (id, state) in snapshot {
            if self.reaped.contains(&id) || self.failed.contains(&id) {
                continue;
            }
            match self.tracked.get_mut(&id) {
                Some(tracked) if tracked.state == state => {
                    tracked.stable += 1;
                    if tracked.stable + 1 >= self.opts.stable_cycles {
                        ready.push((id, tracked.first_seen));
                    }
                }
                Some(tracked) => {
                    tracked.state = state;
                    tracked.stable = 0;
                }
                None => {
                    self.seen_counter += 1;
                    let first_seen = self.seen_counter;
                    self.tracked.insert(
                        id.clone(),
                        Tracked {
                            state,
                            stable: 0,
                            retries: 0,
                            first_seen,
                        },
                    );
                    if self.opts.stable_cycles <= 1 {
                        ready.push((id, first_seen));
                    }
                }
            }
        }

        ready.sort_by_key(|(_, first_seen)| *first_seen);
        for (id, _) in ready {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            self.reap_one(&id);
        }
    }

    fn reap_one(&mut self, id: &str) {
        let Some(tracked) = self.tracked.get(id) else {
            return;
        };
        let state = tracked.state.clone();

        // Exclusive scratch space, removed on every exit path when dropped.
        let workspace = match tempfile::Builder::new()
            .prefix("reap-")
            .tempdir_in(&self.opts.workspace_root)
        {
            Ok(dir) => dir,
            Err(error) => {
                error!(%error, "cannot create reap workspace");
                return;
            }
        };

        match self.backend.reap(id, &state, workspace.path()) {
            Ok(ReapOutcome::Complete(archives)) => {
                let mut delivered = true;
                for archive in &archives {
                    if let Err(error) = self.sink.deliver(&archive.path, &archive.metadata) {
                        error!(item = %id, archive = %archive.name, %error, "delivery failed");
                        delivered = false;
                        break;
                    }
                }
                if delivered {
                    info!(item = %id, archives = archives.len(), "item committed");
                    self.commit(id);
                } else {
                    self.note_failure(id);
                }
            }
            Ok(ReapOutcome::Discarded) => {
                info!(item = %id, "item discarded");
                self.commit(id);
            }
            Ok(ReapOutcome::Incomplete) => {
                self.note_failure(id);
            }
            Err(error) => {
                warn!(item = %id, %error, "reap failed");
                self.note_failure(id);
            }
        }
    }

    /// Terminal success (or deliberate discard): never look at this id again.
    fn commit(&mut self, id: &str) {
        self.tracked.remove(id);
        self.reaped.insert(id.to_string());
        self.persist();
    }

    fn note_failure(&mut self, id: &str) {
        let Some(tracked) = self.tracked.get_mut(id) else {
            return;
        };
        tracked.retries += 1;
        if tracked.retries >= self.opts.max_retries {
            error!(item = %id, retries = tracked.retries, "giving up on item");
            self.tracked.remove(id);
            self.failed.insert(id.to_string());
            self.persist();
        } else {
            warn!(
                item = %id,
                attempt = tracked.retries,
                max = self.opts.max_retries,
                "reap incomplete; will retry"
            );
        }
    }

    fn persist(&self) {
        let Some(path) = &self.opts.state_file else {
            return;
        };
        let state = PersistedState {
            reaped: self.reaped.clone(),
            failed: self.failed.clone(),
        };
        let result = serde_json::to_vec_pretty(&state)
            .map_err(io::Error::other)
            .and_then(|bytes| fs::write(path, bytes));
        if let Err(error) = result {
            // Persistence is best-effort; the reap itself already succeeded.
            warn!(file = %path.display(), %error, "could not write state file");
        }
    }
}

fn load_state(path: &Path) -> PersistedState {
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(error) => {
                warn!(file = %path.display(), %error, "ignoring corrupt state file");
                PersistedState::default()
            }
        },
        Err(error) if error.kind() == io::ErrorKind::NotFound => PersistedState::default(),
        Err(error) => {
            warn!(file = %path.display(), %error, "cannot read state file; starting fresh");
            PersistedState::default()
        }
    }
}
