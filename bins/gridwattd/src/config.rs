use std::env;
use std::fs;
use std::num::ParseIntError;
use std::path::PathBuf;

use clap::Parser;
use powermodel::{AppInfo, AppInfoError, ModelBook};
use thiserror::Error;

use crate::sched::{JobScheduler, JobTraceError, JobType};

/// TCP port jobs dial to reach the coordinator.
pub const LISTEN_PORT: u16 = 63094;

pub const SERVER_HOST_ENV: &str = "GEOPM_ENDPOINT_SERVER_HOST";
pub const TOTAL_NODES_ENV: &str = "EXPERIMENT_TOTAL_NODES";

#[derive(Debug, Parser)]
#[clap(
    name = "gridwattd",
    about = "Launch the cluster-management side of the power-balancing endpoint."
)]
pub struct Options {
    /// Split the budget evenly per host instead of balancing slowdowns.
    #[clap(long)]
    pub no_cross_job_sharing: bool,

    /// Average power target for the whole cluster, in watts.
    #[clap(long)]
    pub average_power_target: Option<f64>,

    /// Sweep amplitude above and below the average target, in watts.
    #[clap(long)]
    pub reserve: Option<f64>,

    /// CSV of job submissions to replay. Columns: jobTypeID, startTime,
    /// queueTime, jobID. jobTypeID indexes into --job-names; startTime and
    /// queueTime are seconds on the experiment clock.
    #[clap(long)]
    pub replay_job_trace: Option<PathBuf>,

    /// Application names, in jobTypeID order, as defined in --app-info.
    #[clap(long, multiple_values = true)]
    pub job_names: Vec<String>,

    /// Comma-separated per-type weights for the fair-queue scheduler.
    #[clap(long, default_value = "")]
    pub job_weights: String,

    /// Replay recorded job start times instead of fair queueing.
    #[clap(long)]
    pub replay_start_time: bool,

    /// Consult the static model table when a job has no online model.
    #[clap(long)]
    pub use_pre_characterized: bool,

    /// Always use the static model table, even over fitted models.
    #[clap(long)]
    pub ignore_run_time_models: bool,

    /// Plan one application with another's model, e.g. bt.D.x=ep.D.x.
    #[clap(long, multiple_values = true)]
    pub confuse_jobs: Vec<String>,

    /// Application characterization data.
    #[clap(long, default_value = "app_properties.yaml")]
    pub app_info: PathBuf,

    /// CSV of normalized [-1, 1] budget targets to replay instead of the
    /// triangular sweep.
    #[clap(long)]
    pub power_trace: Option<PathBuf>,

    /// Where to append the per-round cluster trace.
    #[clap(long, default_value = "cluster_server_trace.csv")]
    pub trace_file: PathBuf,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} must be set")]
    MissingEnv(&'static str),
    #[error("{0} must be a node count: {1}")]
    BadNodeCount(&'static str, ParseIntError),
    #[error("--replay-job-trace requires --job-names")]
    MissingJobNames,
    #[error("--job-weights must list one weight per job name in fair-queue mode")]
    WeightCountMismatch,
    #[error("bad job weight {0:?}")]
    BadWeight(String),
    #[error("bad job confusion {0:?}, expected ACTUAL=MODELED")]
    BadConfusion(String),
    #[error("{0:?} is not in the app info")]
    UnknownApplication(String),
    #[error(transparent)]
    AppInfo(#[from] AppInfoError),
    #[error(transparent)]
    JobTrace(#[from] JobTraceError),
    #[error("cannot read power trace {path}: {source}")]
    PowerTraceIo {
        path: String,
        source: std::io::Error,
    },
    #[error("bad power trace value {0:?}")]
    BadPowerTraceValue(String),
    #[error("power trace is empty")]
    EmptyPowerTrace,
}

/// Fully resolved runtime configuration; built from CLI options plus the
/// environment, with every referenced file loaded and validated before the
/// listening socket is bound.
pub struct Config {
    pub bind_host: String,
    pub port: u16,
    pub total_nodes: u32,
    pub cross_job_sharing: bool,
    pub average_power_target: Option<f64>,
    pub reserve: Option<f64>,
    pub power_trace: Option<Vec<f64>>,
    pub book: ModelBook,
    pub scheduler: Option<JobScheduler>,
    pub trace_path: PathBuf,
}

impl Config {
    pub fn resolve(opts: Options) -> Result<Self, ConfigError> {
        let bind_host =
            env::var(SERVER_HOST_ENV).map_err(|_| ConfigError::MissingEnv(SERVER_HOST_ENV))?;
        let total_nodes: u32 = env::var(TOTAL_NODES_ENV)
            .map_err(|_| ConfigError::MissingEnv(TOTAL_NODES_ENV))?
            .trim()
            .parse()
            .map_err(|e| ConfigError::BadNodeCount(TOTAL_NODES_ENV, e))?;

        if opts.replay_job_trace.is_some() && opts.job_names.is_empty() {
            return Err(ConfigError::MissingJobNames);
        }

        let confusions = parse_confusions(&opts.confuse_jobs)?;
        let weights = parse_weights(&opts.job_weights)?;

        let needs_app_info = !opts.job_names.is_empty()
            || opts.use_pre_characterized
            || !confusions.is_empty();
        let app_info = if needs_app_info {
            Some(AppInfo::load(&opts.app_info)?)
        } else {
            None
        };

        let book = match &app_info {
            Some(info) => ModelBook::from_app_info(
                info,
                &confusions,
                opts.use_pre_characterized,
                opts.ignore_run_time_models,
            )?,
            None => ModelBook::disabled(),
        };

        let scheduler = match (&opts.replay_job_trace, &app_info) {
            (Some(trace_path), Some(info)) => {
                if !opts.replay_start_time && weights.len() != opts.job_names.len() {
                    return Err(ConfigError::WeightCountMismatch);
                }
                let mut types = Vec::with_capacity(opts.job_names.len());
                for (i, name) in opts.job_names.iter().enumerate() {
                    let spec = info
                        .applications
                        .get(name)
                        .ok_or_else(|| ConfigError::UnknownApplication(name.clone()))?;
                    types.push(JobType {
                        name: name.clone(),
                        launcher: spec.launcher.clone(),
                        size: spec.nodes,
                        weight: weights.get(i).copied().unwrap_or(0.0),
                    });
                }
                Some(JobScheduler::load(trace_path, types, opts.replay_start_time)?)
            }
            _ => None,
        };

        let power_trace = match &opts.power_trace {
            Some(path) => Some(load_power_trace(path)?),
            None => None,
        };

        Ok(Self {
            bind_host,
            port: LISTEN_PORT,
            total_nodes,
            cross_job_sharing: !opts.no_cross_job_sharing,
            average_power_target: opts.average_power_target,
            reserve: opts.reserve,
            power_trace,
            book,
            scheduler,
            trace_path: opts.trace_file,
        })
    }
}

/// Parse `--job-weights 1,2,0.5`; weights are clipped at zero.
fn parse_weights(raw: &str) -> Result<Vec<f64>, ConfigError> {
    raw.split(',')
        .filter(|w| !w.is_empty())
        .map(|w| {
            w.trim()
                .parse::<f64>()
                .map(|v| v.max(0.0))
                .map_err(|_| ConfigError::BadWeight(w.to_string()))
        })
        .collect()
}

/// Parse `--confuse-jobs actual=modeled` pairs.
fn parse_confusions(raw: &[String]) -> Result<Vec<(String, String)>, ConfigError> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(actual, modeled)| (actual.to_string(), modeled.to_string()))
                .ok_or_else(|| ConfigError::BadConfusion(pair.clone()))
        })
        .collect()
}

fn load_power_trace(path: &PathBuf) -> Result<Vec<f64>, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::PowerTraceIo {
        path: path.display().to_string(),
        source,
    })?;
    let mut values = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        values.push(
            line.parse::<f64>()
                .map_err(|_| ConfigError::BadPowerTraceValue(line.to_string()))?,
        );
    }
    if values.is_empty() {
        return Err(ConfigError::EmptyPowerTrace);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_are_parsed_and_clipped() {
        assert_eq!(parse_weights("").unwrap(), Vec::<f64>::new());
        assert_eq!(parse_weights("1,2.5,-3").unwrap(), vec![1.0, 2.5, 0.0]);
        assert!(parse_weights("1,heavy").is_err());
    }

    #[test]
    fn confusions_are_parsed() {
        let parsed = parse_confusions(&["bt.D.x=ep.D.x".to_string()]).unwrap();
        assert_eq!(parsed, vec![("bt.D.x".to_string(), "ep.D.x".to_string())]);
        assert!(parse_confusions(&["bt.D.x".to_string()]).is_err());
    }

    #[test]
    fn power_trace_rejects_junk_and_empty() {
        use std::io::Write;
        let dir = tempdir::TempDir::new("gridwatt-config").unwrap();
        let good = dir.path().join("trace.csv");
        let mut f = std::fs::File::create(&good).unwrap();
        writeln!(f, "-1.0\n\n0.25\n1.0").unwrap();
        drop(f);
        assert_eq!(load_power_trace(&good).unwrap(), vec![-1.0, 0.25, 1.0]);

        let empty = dir.path().join("empty.csv");
        std::fs::File::create(&empty).unwrap();
        assert!(matches!(
            load_power_trace(&empty),
            Err(ConfigError::EmptyPowerTrace)
        ));

        let junk = dir.path().join("junk.csv");
        std::fs::write(&junk, "watts\n").unwrap();
        assert!(load_power_trace(&junk).is_err());
    }

    #[test]
    fn cli_surface_parses() {
        let opts = Options::parse_from([
            "gridwattd",
            "--no-cross-job-sharing",
            "--average-power-target",
            "1200",
            "--reserve",
            "300",
            "--job-names",
            "bt.D.x",
            "sp.C.x",
            "--job-weights",
            "2,1",
            "--use-pre-characterized",
            "--confuse-jobs",
            "bt.D.x=sp.C.x",
        ]);
        assert!(opts.no_cross_job_sharing);
        assert_eq!(opts.average_power_target, Some(1200.0));
        assert_eq!(opts.reserve, Some(300.0));
        assert_eq!(opts.job_names, vec!["bt.D.x", "sp.C.x"]);
        assert_eq!(opts.job_weights, "2,1");
        assert!(opts.use_pre_characterized);
        assert!(!opts.ignore_run_time_models);
        assert_eq!(opts.confuse_jobs, vec!["bt.D.x=sp.C.x"]);
        assert_eq!(opts.app_info, PathBuf::from("app_properties.yaml"));
    }
}
