use std::path::Path;

use log::warn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobTraceError {
    #[error("cannot read job trace {path}: {source}")]
    Csv {
        path: String,
        source: csv::Error,
    },
    #[error("job trace row {row} names job type {job_type}, but only {known} are configured")]
    UnknownJobType {
        row: usize,
        job_type: usize,
        known: usize,
    },
    #[error("job type {0:?} has a zero node count")]
    ZeroSizedJobType(String),
}

/// One dispatchable application class, in `jobTypeID` order.
#[derive(Debug, Clone)]
pub struct JobType {
    pub name: String,
    pub launcher: String,
    pub size: u32,
    pub weight: f64,
}

#[derive(Debug, Deserialize)]
struct TraceRow {
    #[serde(rename = "jobTypeID")]
    job_type: usize,
    #[serde(rename = "startTime")]
    start_time: i64,
    #[serde(rename = "queueTime")]
    queue_time: i64,
    #[serde(rename = "jobID")]
    job_id: i64,
}

#[derive(Debug)]
struct QueuedJob {
    job_type: usize,
    start_time: i64,
    queue_time: i64,
    job_id: i64,
    scheduled: bool,
}

/// A job the scheduler decided to dispatch this round.
#[derive(Debug, Clone, PartialEq)]
pub struct Launch {
    pub launcher: String,
    pub job_id: i64,
}

/// Replays a recorded job-submission trace, dispatching jobs whenever the
/// cluster budget calls for more active hosts.
///
/// Two disciplines: replaying the recorded start times verbatim, or
/// weighted fair queues keyed by job type. Hosts handed to a job count
/// against `pending_new_hosts` until that job's handshake arrives, so one
/// round's grant cannot be re-promised in the next.
pub struct JobScheduler {
    jobs: Vec<QueuedJob>,
    types: Vec<JobType>,
    replay_start_time: bool,
    rng: StdRng,
}

impl JobScheduler {
    pub fn load(
        path: &Path,
        types: Vec<JobType>,
        replay_start_time: bool,
    ) -> Result<Self, JobTraceError> {
        let as_string = path.display().to_string();
        let mut reader = csv::Reader::from_path(path).map_err(|source| JobTraceError::Csv {
            path: as_string.clone(),
            source,
        })?;
        let mut jobs = Vec::new();
        for (row, record) in reader.deserialize::<TraceRow>().enumerate() {
            let record = record.map_err(|source| JobTraceError::Csv {
                path: as_string.clone(),
                source,
            })?;
            if record.job_type >= types.len() {
                return Err(JobTraceError::UnknownJobType {
                    row,
                    job_type: record.job_type,
                    known: types.len(),
                });
            }
            jobs.push(QueuedJob {
                job_type: record.job_type,
                start_time: record.start_time,
                queue_time: record.queue_time,
                job_id: record.job_id,
                scheduled: false,
            });
        }
        if let Some(bad) = types.iter().find(|t| t.size == 0) {
            return Err(JobTraceError::ZeroSizedJobType(bad.name.clone()));
        }
        jobs.sort_by_key(|job| job.start_time);
        Ok(Self {
            jobs,
            types,
            replay_start_time,
            rng: StdRng::from_entropy(),
        })
    }

    /// Earliest recorded start time, used to fast-forward the experiment
    /// clock at startup.
    pub fn earliest_start(&self) -> Option<i64> {
        self.jobs.first().map(|job| job.start_time)
    }

    /// Pick jobs to dispatch given `ready_hosts` of headroom at
    /// `elapsed_secs` on the experiment clock. Marks the picked jobs
    /// scheduled and reserves their hosts in `pending_new_hosts`.
    pub fn ready_jobs(
        &mut self,
        ready_hosts: i64,
        elapsed_secs: i64,
        pending_new_hosts: &mut i64,
    ) -> Vec<Launch> {
        if self.replay_start_time {
            self.replay_by_start_time(ready_hosts, elapsed_secs, pending_new_hosts)
        } else {
            self.weighted_fair_dispatch(ready_hosts, elapsed_secs, pending_new_hosts)
        }
    }

    /// Launch in recorded order; stop at the first queued job that does not
    /// fit the remaining unreserved hosts.
    fn replay_by_start_time(
        &mut self,
        ready_hosts: i64,
        elapsed_secs: i64,
        pending_new_hosts: &mut i64,
    ) -> Vec<Launch> {
        let mut free = ready_hosts;
        let mut launches = Vec::new();
        for job in self.jobs.iter_mut() {
            if job.scheduled || job.start_time < 0 {
                continue;
            }
            if job.start_time > elapsed_secs {
                break;
            }
            let size = self.types[job.job_type].size as i64;
            if size > free - *pending_new_hosts {
                break;
            }
            free -= size;
            *pending_new_hosts += size;
            job.scheduled = true;
            launches.push(Launch {
                launcher: self.types[job.job_type].launcher.clone(),
                job_id: job.job_id,
            });
        }
        launches
    }

    /// Split the ready hosts across the job types that have queued work, in
    /// proportion to their configured weights, then dispatch FIFO within
    /// each type's share.
    fn weighted_fair_dispatch(
        &mut self,
        ready_hosts: i64,
        elapsed_secs: i64,
        pending_new_hosts: &mut i64,
    ) -> Vec<Launch> {
        let ready = (ready_hosts - *pending_new_hosts).max(0);
        if ready == 0 {
            return Vec::new();
        }

        let mut queues: Vec<Vec<usize>> = vec![Vec::new(); self.types.len()];
        for (idx, job) in self.jobs.iter().enumerate() {
            if !job.scheduled && job.start_time >= 0 && job.queue_time <= elapsed_secs {
                queues[job.job_type].push(idx);
            }
        }
        let waiting: Vec<usize> = (0..queues.len())
            .filter(|&q| !queues[q].is_empty())
            .collect();
        if waiting.is_empty() {
            return Vec::new();
        }

        let total_weight: f64 = waiting.iter().map(|&q| self.types[q].weight).sum();
        if !(total_weight > 0.0) {
            warn!("queued jobs exist but every waiting job type has zero weight");
            return Vec::new();
        }

        // Whole-host shares per queue; the rounding residue moves one host
        // at a time to randomly chosen waiting queues.
        let mut hosts_by_queue = vec![0i64; queues.len()];
        for &q in &waiting {
            hosts_by_queue[q] = (ready as f64 * self.types[q].weight / total_weight).round() as i64;
        }
        let mut residue = ready - hosts_by_queue.iter().sum::<i64>();
        while residue != 0 {
            let takeable: Vec<usize> = if residue > 0 {
                waiting.clone()
            } else {
                waiting
                    .iter()
                    .copied()
                    .filter(|&q| hosts_by_queue[q] > 0)
                    .collect()
            };
            if takeable.is_empty() {
                break;
            }
            let pick = takeable[self.rng.gen_range(0..takeable.len())];
            hosts_by_queue[pick] += residue.signum();
            residue -= residue.signum();
        }

        let mut launches = Vec::new();
        for &q in &waiting {
            let size = self.types[q].size as i64;
            let runnable = (hosts_by_queue[q] / size).min(queues[q].len() as i64);
            for &job_idx in queues[q].iter().take(runnable.max(0) as usize) {
                self.jobs[job_idx].scheduled = true;
                *pending_new_hosts += size;
                launches.push(Launch {
                    launcher: self.types[q].launcher.clone(),
                    job_id: self.jobs[job_idx].job_id,
                });
            }
        }
        launches
    }
}
