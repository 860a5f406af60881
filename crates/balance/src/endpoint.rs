// Copyright 2024 Mazze Foundation. All rights reserved.
// Mazze is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use std::collections::VecDeque;
use std::time::Instant;

use log::{info, warn};
use powermodel::{ModelBook, RuntimeModel};

/// Maximum retained `(cap, duration)` pairs per series; the oldest pair is
/// dropped first.
pub const SERIES_CAP: usize = 1024;
/// A model is refit once the training series has grown by this many samples
/// since the last successful fit.
pub const REFIT_GAP: usize = 10;
/// Epoch data trains the model once this many epoch samples exist; below
/// that the finer-grained progress series is used instead.
pub const EPOCH_SERIES_MIN: usize = 20;

/// One decoded per-tick report from a job.
///
/// Every field except `power` describes a cumulative counter (`epoch`,
/// `progress`) together with the mean cap and duration over the counter's
/// most recent completed unit. NaN marks a quantity the job could not
/// report this tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub power: f64,
    pub epoch: f64,
    pub epoch_cap: f64,
    pub epoch_duration: f64,
    pub progress: f64,
    pub progress_cap: f64,
    pub progress_duration: f64,
}

/// Coordinator-side state for one connected job.
pub struct EndpointMetrics {
    pub host_count: u32,
    pub profile: String,
    /// The cap most recently computed for this job, watts per host.
    pub current_cap: f64,
    /// Last reported per-host power draw; NaN until the first report.
    pub measured_power: f64,
    epoch_caps: VecDeque<f64>,
    epoch_times: VecDeque<f64>,
    progress_caps: VecDeque<f64>,
    progress_times: VecDeque<f64>,
    /// Dedup cursor: epoch counter value already accounted for. Starts at
    /// 1.0 so the first epoch, which includes pre-epoch startup time, never
    /// trains the model.
    pub last_epoch: f64,
    pub last_epoch_time: Instant,
    /// Dedup cursor for the progress counter; NaN until the first report.
    pub last_progress: f64,
    pub last_progress_time: Instant,
    samples_in_last_model: usize,
    pub model: Option<RuntimeModel>,
}

impl EndpointMetrics {
    pub fn new(host_count: u32, initial_cap: f64, profile: String) -> Self {
        let now = Instant::now();
        Self {
            host_count,
            profile,
            current_cap: initial_cap,
            measured_power: f64::NAN,
            epoch_caps: VecDeque::new(),
            epoch_times: VecDeque::new(),
            progress_caps: VecDeque::new(),
            progress_times: VecDeque::new(),
            last_epoch: 1.0,
            last_epoch_time: now,
            last_progress: f64::NAN,
            last_progress_time: now,
            samples_in_last_model: 0,
            model: None,
        }
    }

    /// Cap summed over all hosts this job owns.
    pub fn total_cap(&self) -> f64 {
        self.host_count as f64 * self.current_cap
    }

    /// Measured power summed over all hosts this job owns.
    pub fn total_measured(&self) -> f64 {
        self.host_count as f64 * self.measured_power
    }

    /// Fold one wire sample into the series and cursors.
    ///
    /// A series only grows when its counter strictly advanced, the reported
    /// duration is positive, and the cap it ran under is finite; the cursors
    /// themselves never move backwards.
    pub fn record_sample(&mut self, sample: &Sample) {
        self.measured_power = sample.power;
        let now = Instant::now();

        if !sample.progress.is_nan() {
            if sample.progress > self.last_progress
                && sample.progress_duration > 0.0
                && sample.progress_cap.is_finite()
            {
                push_bounded(&mut self.progress_caps, sample.progress_cap);
                push_bounded(&mut self.progress_times, sample.progress_duration);
            }
            self.last_progress = self.last_progress.max(sample.progress);
            self.last_progress_time = now;
        }

        if !sample.epoch.is_nan() {
            if sample.epoch > self.last_epoch
                && sample.epoch_duration > 0.0
                && sample.epoch_cap.is_finite()
            {
                push_bounded(&mut self.epoch_caps, sample.epoch_cap);
                push_bounded(&mut self.epoch_times, sample.epoch_duration);
            }
            self.last_epoch = self.last_epoch.max(sample.epoch);
            self.last_epoch_time = now;
        }
    }

    fn active_series(&self) -> (&VecDeque<f64>, &VecDeque<f64>) {
        if self.epoch_times.len() >= EPOCH_SERIES_MIN {
            (&self.epoch_caps, &self.epoch_times)
        } else {
            (&self.progress_caps, &self.progress_times)
        }
    }

    /// Shortest duration in the active training series, the stand-in for
    /// full-speed time when a model's own floor is unusable.
    pub fn min_observed_duration(&self) -> Option<f64> {
        let (_, times) = self.active_series();
        times
            .iter()
            .copied()
            .fold(None, |acc: Option<f64>, t| match acc {
                Some(best) if best <= t => Some(best),
                _ => Some(t),
            })
    }

    /// Refit the runtime model when the active series has grown enough; a
    /// fit that fails validation drops the model rather than keeping a
    /// stale one.
    pub fn maybe_refit(&mut self) {
        let (caps, times) = self.active_series();
        if times.len() < self.samples_in_last_model + REFIT_GAP {
            return;
        }
        let trained = times.len();
        let fitted = powermodel::fit(caps.iter().copied().zip(times.iter().copied()));
        match fitted {
            Some(model) => {
                if self.model.is_none() {
                    info!("new runtime model for {}: {:?}", self.profile.trim(), model);
                }
                self.model = Some(model);
                self.samples_in_last_model = trained;
            }
            None => {
                warn!(
                    "rejected runtime model for {} over {} samples",
                    self.profile.trim(),
                    trained
                );
                self.model = None;
            }
        }
    }

    /// Cap predicted to hold this job at `slowdown`, consulting the static
    /// book when no online model applies.
    pub fn cap_at_slowdown(&self, book: &ModelBook, slowdown: f64) -> f64 {
        book.cap_at_slowdown(
            &self.profile,
            self.model.as_ref(),
            slowdown,
            self.min_observed_duration(),
        )
    }
}

fn push_bounded(series: &mut VecDeque<f64>, value: f64) {
    if series.len() == SERIES_CAP {
        series.pop_front();
    }
    series.push_back(value);
}
