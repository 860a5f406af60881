use std::io;
use std::time::Instant;

use balance::{
    rebalance, BalanceSettings, BudgetGenerator, EndpointMap, EndpointMetrics, Sample,
    IDLE_WATTS_PER_NODE,
};
use log::{error, info};
use parking_lot::Mutex;
use powermodel::{ModelBook, POWER_MAX};
use tokio::sync::watch;

use crate::config::Config;
use crate::sched::{JobScheduler, Launch};
use crate::trace::ClusterTrace;

/// Everything the synchronized tick reads and writes, behind one mutex:
/// the endpoint map, the barrier counters, the budget cursor, the job
/// queue, and the trace file.
struct ClusterState {
    endpoints: EndpointMap,
    arrivals: usize,
    generation: u64,
    pending_new_hosts: i64,
    budget: BudgetGenerator,
    scheduler: Option<JobScheduler>,
    trace: ClusterTrace,
}

/// The single shared coordinator value. Each session task holds an `Arc`
/// and interacts only through these methods; no coordination state lives
/// anywhere else.
///
/// The tick barrier is a generation counter broadcast over a watch
/// channel: a session arrives under the mutex, and whichever arrival (or
/// teardown) completes the round runs the rebalance in that same critical
/// section and bumps the generation. Waiters simply wait for a generation
/// greater than the one they arrived in, so a release can never be missed.
pub struct Coordinator {
    settings: BalanceSettings,
    book: ModelBook,
    state: Mutex<ClusterState>,
    release_tx: watch::Sender<u64>,
    release_rx: watch::Receiver<u64>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    started: Instant,
    clock_offset_secs: i64,
}

impl Coordinator {
    pub fn new(config: Config) -> io::Result<Self> {
        let now = Instant::now();
        let trace = ClusterTrace::create(&config.trace_path)?;
        // With a replayed job queue the experiment clock fast-forwards to
        // the first recorded submission.
        let clock_offset_secs = config
            .scheduler
            .as_ref()
            .and_then(JobScheduler::earliest_start)
            .unwrap_or(0);
        let budget = BudgetGenerator::new(
            config.total_nodes,
            config.average_power_target,
            config.reserve,
            config.power_trace,
            now,
        );
        let (release_tx, release_rx) = watch::channel(0u64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            settings: BalanceSettings {
                total_nodes: config.total_nodes,
                cross_job_sharing: config.cross_job_sharing,
            },
            book: config.book,
            state: Mutex::new(ClusterState {
                endpoints: EndpointMap::new(),
                arrivals: 0,
                generation: 0,
                pending_new_hosts: 0,
                budget,
                scheduler: config.scheduler,
                trace,
            }),
            release_tx,
            release_rx,
            shutdown_tx,
            shutdown_rx,
            started: now,
            clock_offset_secs,
        })
    }

    /// Launch whatever the replayed job queue already considers ready,
    /// staggered a few seconds apart. Called once before serving.
    pub fn bootstrap_jobs(&self) {
        let mut st = self.state.lock();
        let st = &mut *st;
        let elapsed = self.elapsed_secs();
        let total = self.settings.total_nodes as i64;
        if let Some(scheduler) = st.scheduler.as_mut() {
            let launches = scheduler.ready_jobs(total, elapsed, &mut st.pending_new_hosts);
            for (i, launch) in launches.iter().enumerate() {
                spawn_job(launch, Some(3 * i as u64));
            }
        }
    }

    /// Register a freshly handshaken session. Hosts the scheduler reserved
    /// for this launch are released, and the job starts uncapped.
    pub fn register_endpoint(&self, peer: &str, host_count: u32, profile: &str) -> f64 {
        let mut st = self.state.lock();
        st.pending_new_hosts = (st.pending_new_hosts - host_count as i64).max(0);
        st.endpoints.insert(
            peer.to_string(),
            EndpointMetrics::new(host_count, POWER_MAX, profile.to_string()),
        );
        POWER_MAX
    }

    /// Fold a session's sample into its endpoint and enter the barrier.
    /// Returns the generation the session arrived in (to be awaited via
    /// [`wait_release`](Self::wait_release)), or `None` if the endpoint is
    /// gone. The arrival that completes the round fires the tick before
    /// returning.
    pub fn sample_arrived(&self, peer: &str, sample: &Sample) -> Option<u64> {
        let mut st = self.state.lock();
        let st = &mut *st;
        let endpoint = st.endpoints.get_mut(peer)?;
        endpoint.record_sample(sample);
        endpoint.maybe_refit();
        st.arrivals += 1;
        let generation = st.generation;
        if st.arrivals == st.endpoints.len() {
            self.fire_tick(st);
        }
        Some(generation)
    }

    /// Block until the round the session arrived in has been rebalanced.
    /// Returns false when released by shutdown instead.
    pub async fn wait_release(&self, seen_generation: u64) -> bool {
        let mut release = self.release_rx.clone();
        let mut shutdown = self.shutdown_rx.clone();
        tokio::select! {
            changed = release.wait_for(|g| *g > seen_generation) => changed.is_ok(),
            _ = shutdown.wait_for(|s| *s) => false,
        }
    }

    pub fn current_cap(&self, peer: &str) -> Option<f64> {
        self.state.lock().endpoints.get(peer).map(|e| e.current_cap)
    }

    /// Drop a departed session's endpoint. If every remaining session is
    /// already waiting at the barrier, the departure completes the round
    /// and must fire the tick itself, or the waiters would stall.
    pub fn remove_endpoint(&self, peer: &str) {
        let mut st = self.state.lock();
        let st = &mut *st;
        if st.endpoints.shift_remove(peer).is_none() {
            return;
        }
        if st.arrivals > 0 && st.arrivals == st.endpoints.len() {
            self.fire_tick(st);
        }
    }

    /// One synchronized round: refresh the budget, rebalance, top up the
    /// cluster from the job queue, write the trace line, release the
    /// waiters. Runs entirely inside the state critical section so every
    /// session in the round observes the same caps and no two rounds
    /// interleave.
    fn fire_tick(&self, st: &mut ClusterState) {
        let target = st.budget.cluster_target(Instant::now());
        rebalance(&self.settings, &self.book, target, &mut st.endpoints);

        let active_hosts: i64 = st.endpoints.values().map(|e| e.host_count as i64).sum();
        if let Some(scheduler) = st.scheduler.as_mut() {
            let wanted = ((target / POWER_MAX).ceil() as i64).min(self.settings.total_nodes as i64);
            let headroom = wanted - active_hosts;
            if headroom > 0 {
                let elapsed = self.started.elapsed().as_secs() as i64 + self.clock_offset_secs;
                let launches = scheduler.ready_jobs(headroom, elapsed, &mut st.pending_new_hosts);
                for launch in launches {
                    spawn_job(&launch, None);
                }
            }
        }

        let idle_power =
            (self.settings.total_nodes as f64 - active_hosts as f64) * IDLE_WATTS_PER_NODE;
        let cap: f64 = st.endpoints.values().map(|e| e.total_cap()).sum::<f64>() + idle_power;
        let measured: f64 =
            st.endpoints.values().map(|e| e.total_measured()).sum::<f64>() + idle_power;
        st.trace.append(target, cap, measured);

        st.generation += 1;
        st.arrivals = 0;
        let _ = self.release_tx.send(st.generation);
    }

    pub fn begin_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn flush_trace(&self) {
        self.state.lock().trace.flush();
    }

    fn elapsed_secs(&self) -> i64 {
        self.started.elapsed().as_secs() as i64 + self.clock_offset_secs
    }

    #[cfg(test)]
    pub fn arrivals(&self) -> usize {
        self.state.lock().arrivals
    }

    #[cfg(test)]
    pub fn endpoint_count(&self) -> usize {
        self.state.lock().endpoints.len()
    }
}

/// Hand a launcher script to the batch system. The coordinator does not
/// track the child beyond logging the attempt; the job announces itself by
/// dialing back in.
fn spawn_job(launch: &Launch, begin_offset_secs: Option<u64>) {
    let mut command = tokio::process::Command::new("sbatch");
    if let Some(secs) = begin_offset_secs {
        command.arg(format!("--begin=now+{}", secs));
    }
    command.arg(&launch.launcher);
    match command.spawn() {
        Ok(_) => info!("launched job {} via {}", launch.job_id, launch.launcher),
        Err(e) => error!("failed to launch {}: {}", launch.launcher, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use powermodel::POWER_MIN;
    use std::path::Path;
    use tempdir::TempDir;

    fn config(dir: &Path, total_nodes: u32, target: f64) -> Config {
        Config {
            bind_host: "127.0.0.1".to_string(),
            port: 0,
            total_nodes,
            cross_job_sharing: true,
            average_power_target: Some(target),
            reserve: Some(0.0),
            power_trace: None,
            book: ModelBook::disabled(),
            scheduler: None,
            trace_path: dir.join("trace.csv"),
        }
    }

    fn quiet_sample() -> Sample {
        Sample {
            power: 150.0,
            epoch: f64::NAN,
            epoch_cap: f64::NAN,
            epoch_duration: f64::NAN,
            progress: f64::NAN,
            progress_cap: f64::NAN,
            progress_duration: f64::NAN,
        }
    }

    #[tokio::test]
    async fn lone_endpoint_completes_a_round_inline() {
        let dir = TempDir::new("gridwatt-coord").unwrap();
        let coord = Coordinator::new(config(dir.path(), 2, 400.0)).unwrap();
        assert_eq!(coord.register_endpoint("a", 2, "p"), POWER_MAX);
        let generation = coord.sample_arrived("a", &quiet_sample()).unwrap();
        assert_eq!(generation, 0);
        // The arrival completed the round, so the release is already out.
        assert!(coord.wait_release(generation).await);
        let cap = coord.current_cap("a").unwrap();
        assert!(cap >= POWER_MIN && cap <= POWER_MAX);
        assert_eq!(coord.arrivals(), 0);
    }

    #[tokio::test]
    async fn teardown_fires_the_round_for_the_waiters() {
        let dir = TempDir::new("gridwatt-coord").unwrap();
        let coord = Coordinator::new(config(dir.path(), 4, 800.0)).unwrap();
        coord.register_endpoint("a", 2, "p");
        coord.register_endpoint("b", 2, "p");
        let generation = coord.sample_arrived("a", &quiet_sample()).unwrap();
        assert_eq!(coord.arrivals(), 1);
        // "b" goes away without ever sampling; its teardown must complete
        // the round "a" is parked in.
        coord.remove_endpoint("b");
        assert!(coord.wait_release(generation).await);
        assert_eq!(coord.endpoint_count(), 1);
        let cap = coord.current_cap("a").unwrap();
        assert!(cap >= POWER_MIN && cap <= POWER_MAX);
    }

    #[tokio::test]
    async fn removing_unknown_or_idle_endpoints_is_harmless() {
        let dir = TempDir::new("gridwatt-coord").unwrap();
        let coord = Coordinator::new(config(dir.path(), 4, 800.0)).unwrap();
        coord.remove_endpoint("ghost");
        coord.register_endpoint("a", 2, "p");
        coord.remove_endpoint("a");
        assert_eq!(coord.endpoint_count(), 0);
        assert_eq!(coord.arrivals(), 0);
    }

    #[tokio::test]
    async fn shutdown_releases_barrier_waiters() {
        let dir = TempDir::new("gridwatt-coord").unwrap();
        let coord = Coordinator::new(config(dir.path(), 4, 800.0)).unwrap();
        coord.register_endpoint("a", 2, "p");
        coord.register_endpoint("b", 2, "p");
        let generation = coord.sample_arrived("a", &quiet_sample()).unwrap();
        coord.begin_shutdown();
        assert!(!coord.wait_release(generation).await);
    }

    #[tokio::test]
    async fn registration_resolves_pending_host_reservations() {
        let dir = TempDir::new("gridwatt-coord").unwrap();
        let coord = Coordinator::new(config(dir.path(), 4, 800.0)).unwrap();
        {
            let mut st = coord.state.lock();
            st.pending_new_hosts = 3;
        }
        coord.register_endpoint("a", 2, "p");
        assert_eq!(coord.state.lock().pending_new_hosts, 1);
        // An unsolicited endpoint cannot push the reservation negative.
        coord.register_endpoint("b", 2, "p");
        assert_eq!(coord.state.lock().pending_new_hosts, 0);
    }
}
