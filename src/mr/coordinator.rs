//! The coordinator's task-lifecycle engine: the authoritative registries,
//! the derived phase state machine, the lease expiration sweeper, and the
//! `tarpc` RPC surface workers poll against.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tarpc::context;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::mr::rpc::{CoordinatorService, TaskAssignment};

/// A lease record: born unleased, flips to leased on assignment, reverts to
/// unleased on expiration, and is removed from its registry on completion.
#[derive(Debug, Clone, Copy)]
struct TaskInfo {
    in_progress: bool,
    start_time: Instant,
}

impl TaskInfo {
    fn fresh() -> Self {
        Self {
            in_progress: false,
            start_time: Instant::now(),
        }
    }

    fn lease(&mut self) {
        self.in_progress = true;
        self.start_time = Instant::now();
    }

    fn is_expired(&self, timeout: Duration) -> bool {
        self.in_progress && self.start_time.elapsed() > timeout
    }
}

/// The coordinator's derived high-level state. Never stored; always
/// recomputed from the two registries so a write to one registry can never
/// leave a stale cached phase behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Mapping,
    Busy,
    Reducing,
    Finished,
}

struct Inner {
    map_tasks: HashMap<String, TaskInfo>,
    reduce_tasks: HashMap<u32, TaskInfo>,
    next_map_id: u32,
}

impl Inner {
    fn phase(&self) -> Phase {
        let available_maps = self.map_tasks.values().filter(|t| !t.in_progress).count();
        let available_reduces = self
            .reduce_tasks
            .values()
            .filter(|t| !t.in_progress)
            .count();

        if !self.map_tasks.is_empty() {
            if available_maps > 0 {
                Phase::Mapping
            } else {
                Phase::Busy
            }
        } else if !self.reduce_tasks.is_empty() {
            if available_reduces > 0 {
                Phase::Reducing
            } else {
                Phase::Busy
            }
        } else {
            Phase::Finished
        }
    }
}

/// Owns the authoritative task registry and serves the RPC surface workers
/// poll. Cheap to clone: the registries live behind a shared `Arc<Mutex<_>>`,
/// which is what lets `tarpc` hand a fresh clone to every connection.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Mutex<Inner>>,
    n_reduce: u32,
}

impl Coordinator {
    /// Registers one map task per input file and one reduce task per
    /// `0..n_reduce`, all unleased.
    pub fn new(files: impl IntoIterator<Item = String>, n_reduce: u32) -> Self {
        let map_tasks = files
            .into_iter()
            .map(|f| (f, TaskInfo::fresh()))
            .collect::<HashMap<_, _>>();
        let reduce_tasks = (0..n_reduce)
            .map(|id| (id, TaskInfo::fresh()))
            .collect::<HashMap<_, _>>();

        Coordinator {
            inner: Arc::new(Mutex::new(Inner {
                map_tasks,
                reduce_tasks,
                next_map_id: 0,
            })),
            n_reduce,
        }
    }

    /// True iff both registries are empty. Safe to call while serving.
    pub fn done(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.map_tasks.is_empty() && inner.reduce_tasks.is_empty()
    }

    /// Spawns the lease-expiration sweeper as a background task. The
    /// returned receiver yields the identifiers reclaimed on each tick that
    /// found at least one expired lease; it is purely informational (for
    /// logging) and carries no control-flow meaning of its own.
    pub fn spawn_expiration_sweeper(
        &self,
        check_period: Duration,
        lease_timeout: Duration,
    ) -> mpsc::Receiver<Vec<String>> {
        let inner = Arc::clone(&self.inner);
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_period);
            loop {
                ticker.tick().await;
                let mut expired = Vec::new();
                {
                    let mut inner = inner.lock().unwrap();
                    for (file, task) in inner.map_tasks.iter_mut() {
                        if task.is_expired(lease_timeout) {
                            task.in_progress = false;
                            expired.push(file.clone());
                        }
                    }
                    for (id, task) in inner.reduce_tasks.iter_mut() {
                        if task.is_expired(lease_timeout) {
                            task.in_progress = false;
                            expired.push(format!("reduce-{id}"));
                        }
                    }
                }
                if !expired.is_empty() && tx.send(expired).await.is_err() {
                    // Receiver dropped; the driver loop has exited, nothing more to report.
                    break;
                }
            }
        });

        rx
    }
}

#[tarpc::server]
impl CoordinatorService for Coordinator {
    async fn get_task(self, _: context::Context) -> TaskAssignment {
        let mut inner = self.inner.lock().unwrap();

        match inner.phase() {
            Phase::Mapping => {
                let next = inner
                    .map_tasks
                    .iter()
                    .find(|(_, t)| !t.in_progress)
                    .map(|(f, _)| f.clone());
                match next {
                    Some(file) => {
                        let map_id = inner.next_map_id;
                        inner.next_map_id += 1;
                        inner.map_tasks.get_mut(&file).unwrap().lease();
                        info!(file = %file, map_id, "assigned map task");
                        TaskAssignment::Map {
                            file,
                            map_id,
                            n_reduce: self.n_reduce,
                        }
                    }
                    None => TaskAssignment::Retry,
                }
            }
            Phase::Reducing => {
                let next = inner
                    .reduce_tasks
                    .iter()
                    .find(|(_, t)| !t.in_progress)
                    .map(|(id, _)| *id);
                match next {
                    Some(reduce_id) => {
                        inner.reduce_tasks.get_mut(&reduce_id).unwrap().lease();
                        info!(reduce_id, "assigned reduce task");
                        TaskAssignment::Reduce { reduce_id }
                    }
                    None => TaskAssignment::Retry,
                }
            }
            Phase::Busy | Phase::Finished => TaskAssignment::Retry,
        }
    }

    async fn complete_map_task(self, _: context::Context, file: String) {
        let mut inner = self.inner.lock().unwrap();
        if inner.map_tasks.remove(&file).is_some() {
            debug!(file = %file, "map task completed");
        } else {
            debug!(file = %file, "duplicate or unknown map completion, ignoring");
        }
    }

    async fn complete_reduce_task(self, _: context::Context, reduce_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        if inner.reduce_tasks.remove(&reduce_id).is_some() {
            debug!(reduce_id, "reduce task completed");
        } else {
            debug!(reduce_id, "duplicate or unknown reduce completion, ignoring");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn files(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("pg-{i}.txt")).collect()
    }

    #[test]
    fn initial_phase_is_mapping_with_nonempty_input() {
        let c = Coordinator::new(files(3), 2);
        assert_eq!(c.inner.lock().unwrap().phase(), Phase::Mapping);
        assert!(!c.done());
    }

    #[test]
    fn degenerate_empty_input_is_finished() {
        let c = Coordinator::new(Vec::<String>::new(), 0);
        assert!(c.done());
        assert_eq!(c.inner.lock().unwrap().phase(), Phase::Finished);
    }

    #[tokio::test]
    async fn leasing_every_map_task_moves_to_busy_then_reducing() {
        let c = Coordinator::new(files(2), 1);
        let ctx = context::current();

        let a = c.clone().get_task(ctx).await;
        let b = c.clone().get_task(ctx).await;
        assert!(matches!(a, TaskAssignment::Map { .. }));
        assert!(matches!(b, TaskAssignment::Map { .. }));

        // Both map tasks leased: no more map work until one completes or expires.
        assert_eq!(c.inner.lock().unwrap().phase(), Phase::Busy);
        assert!(matches!(c.clone().get_task(ctx).await, TaskAssignment::Retry));

        let (fa, fb) = match (a, b) {
            (TaskAssignment::Map { file: fa, .. }, TaskAssignment::Map { file: fb, .. }) => {
                (fa, fb)
            }
            _ => unreachable!(),
        };
        c.clone().complete_map_task(ctx, fa).await;
        c.clone().complete_map_task(ctx, fb).await;

        assert_eq!(c.inner.lock().unwrap().phase(), Phase::Reducing);
        let r = c.clone().get_task(ctx).await;
        assert!(matches!(r, TaskAssignment::Reduce { reduce_id: 0 }));
    }

    #[tokio::test]
    async fn concurrent_map_leases_get_distinct_ids() {
        let c = Coordinator::new(files(5), 3);
        let ctx = context::current();
        let mut ids = Vec::new();
        for _ in 0..5 {
            if let TaskAssignment::Map { map_id, .. } = c.clone().get_task(ctx).await {
                ids.push(map_id);
            }
        }
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len(), "map ids must be pairwise distinct");
    }

    #[tokio::test]
    async fn duplicate_completion_is_a_no_op() {
        let c = Coordinator::new(files(1), 1);
        let ctx = context::current();
        let a = c.clone().get_task(ctx).await;
        let file = match a {
            TaskAssignment::Map { file, .. } => file,
            _ => unreachable!(),
        };
        c.clone().complete_map_task(ctx, file.clone()).await;
        // Second completion of an already-removed entry must not panic or
        // change subsequent GetTask behavior.
        c.clone().complete_map_task(ctx, file).await;
        assert_eq!(c.inner.lock().unwrap().phase(), Phase::Reducing);
    }

    #[test]
    fn expired_lease_is_detected() {
        let c = Coordinator::new(files(1), 1);
        {
            let mut inner = c.inner.lock().unwrap();
            let task = inner.map_tasks.get_mut("pg-0.txt").unwrap();
            task.lease();
            // Rewind start_time far enough in the past to have expired already.
            task.start_time = Instant::now() - Duration::from_secs(11);
        }
        assert!(c
            .inner
            .lock()
            .unwrap()
            .map_tasks
            .get("pg-0.txt")
            .unwrap()
            .is_expired(Duration::from_secs(10)));
        sleep(Duration::from_millis(1));
    }

    #[tokio::test]
    async fn sweeper_resets_expired_leases() {
        let c = Coordinator::new(files(1), 1);
        let ctx = context::current();
        let a = c.clone().get_task(ctx).await;
        assert!(matches!(a, TaskAssignment::Map { .. }));
        {
            let mut inner = c.inner.lock().unwrap();
            for task in inner.map_tasks.values_mut() {
                task.start_time = Instant::now() - Duration::from_secs(11);
            }
        }
        let mut expired_rx =
            c.spawn_expiration_sweeper(Duration::from_millis(10), Duration::from_secs(10));
        let expired = expired_rx.recv().await.expect("sweeper tick");
        assert_eq!(expired, vec!["pg-0.txt".to_string()]);
        // The lease is unleased again, so a fresh GetTask can reassign it.
        assert!(matches!(
            c.clone().get_task(ctx).await,
            TaskAssignment::Map { .. }
        ));
    }
}
