// Copyright 2024 Mazze Foundation. All rights reserved.
// Mazze is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use log::debug;
use serde::Deserialize;
use thiserror::Error;

use crate::model::{heuristic_cap_at_slowdown, RuntimeModel};

/// Pre-characterized model coefficients for one application.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coef {
    pub a: f64,
    pub c: f64,
}

/// Application characterization data, as loaded from the app-info YAML file.
///
/// ```yaml
/// applications:
///   bt.D.x:
///     launcher: jobs/bt_D.sbatch
///     nodes: 4
///     model: {A: 5.4e-5, C: 1.48}
///     min_time: 120
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct AppInfo {
    pub applications: BTreeMap<String, AppSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppSpec {
    pub launcher: String,
    pub nodes: u32,
    pub model: ModelCoef,
    #[serde(default)]
    pub min_time: Option<f64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ModelCoef {
    #[serde(rename = "A")]
    pub a: f64,
    #[serde(rename = "C")]
    pub c: f64,
}

#[derive(Debug, Error)]
pub enum AppInfoError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Yaml {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("job confusion {0:?} names unknown application {1:?}")]
    UnknownConfusionTarget(String, String),
}

impl AppInfo {
    pub fn load(path: &Path) -> Result<Self, AppInfoError> {
        let text = fs::read_to_string(path).map_err(|source| AppInfoError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| AppInfoError::Yaml {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Static model table consulted when a job has no usable online model, keyed
/// by the tail of the job's reported profile string.
#[derive(Debug, Clone, Default)]
pub struct ModelBook {
    use_pre_characterized: bool,
    ignore_run_time_models: bool,
    coefficients: HashMap<String, Coef>,
}

impl ModelBook {
    /// A book that never overrides online models. Jobs without a model get
    /// the slowdown heuristic.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Build the table from app-info data, then apply job confusions of the
    /// form `actual=modeled`: the `actual` application is planned with the
    /// `modeled` application's coefficients.
    pub fn from_app_info(
        info: &AppInfo,
        confusions: &[(String, String)],
        use_pre_characterized: bool,
        ignore_run_time_models: bool,
    ) -> Result<Self, AppInfoError> {
        let mut coefficients: HashMap<String, Coef> = info
            .applications
            .iter()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    Coef {
                        a: spec.model.a,
                        c: spec.model.c,
                    },
                )
            })
            .collect();
        for (actual, modeled) in confusions {
            let coef = *coefficients.get(modeled).ok_or_else(|| {
                AppInfoError::UnknownConfusionTarget(actual.clone(), modeled.clone())
            })?;
            coefficients.insert(actual.clone(), coef);
        }
        Ok(Self {
            use_pre_characterized,
            ignore_run_time_models,
            coefficients,
        })
    }

    /// Resolve the model source for a job and predict the cap that holds it
    /// at `slowdown`.
    ///
    /// The static table wins only when pre-characterization is enabled and
    /// the online model is absent or explicitly ignored; otherwise the
    /// online model is used, and a job with neither gets the heuristic.
    pub fn cap_at_slowdown(
        &self,
        profile: &str,
        online: Option<&RuntimeModel>,
        slowdown: f64,
        min_observed_duration: Option<f64>,
    ) -> f64 {
        if slowdown < 1.0 {
            return crate::POWER_MAX;
        }
        if self.use_pre_characterized && (online.is_none() || self.ignore_run_time_models) {
            let tail = profile_tail(profile);
            match self.coefficients.get(tail) {
                Some(coef) => {
                    let model = RuntimeModel {
                        a: coef.a,
                        c: coef.c,
                    };
                    return model.cap_at_slowdown(slowdown, min_observed_duration);
                }
                None => {
                    debug!("no pre-characterized model for profile tail {:?}", tail);
                }
            }
        }
        match online {
            Some(model) => model.cap_at_slowdown(slowdown, min_observed_duration),
            None => heuristic_cap_at_slowdown(slowdown),
        }
    }
}

/// The application name embedded in a profile string: everything after the
/// last `=`, stripped of quoting. Launchers report profiles like
/// `--geopm-profile="bt.D.x"`.
pub fn profile_tail(profile: &str) -> &str {
    let tail = match profile.rsplit_once('=') {
        Some((_, tail)) => tail,
        None => profile,
    };
    tail.trim().trim_matches('"')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{POWER_MAX, POWER_MIN};

    fn book_with(entries: &[(&str, Coef)], use_pre: bool, ignore_online: bool) -> ModelBook {
        ModelBook {
            use_pre_characterized: use_pre,
            ignore_run_time_models: ignore_online,
            coefficients: entries
                .iter()
                .map(|(name, coef)| (name.to_string(), *coef))
                .collect(),
        }
    }

    #[test]
    fn profile_tail_strips_launcher_prefix_and_quotes() {
        assert_eq!(profile_tail("--geopm-profile=\"bt.D.x\""), "bt.D.x");
        assert_eq!(profile_tail("profile=sp.C.x"), "sp.C.x");
        assert_eq!(profile_tail("plain-name"), "plain-name");
        assert_eq!(profile_tail("a=b=c "), "c");
    }

    #[test]
    fn disabled_book_uses_online_model() {
        let book = ModelBook::disabled();
        let online = RuntimeModel { a: 1e-4, c: 1.0 };
        let cap = book.cap_at_slowdown("x", Some(&online), 1.0, None);
        assert_eq!(cap, POWER_MAX);
        let fallback = book.cap_at_slowdown("x", None, 2.0, None);
        assert_eq!(fallback, heuristic_cap_at_slowdown(2.0));
    }

    #[test]
    fn pre_characterized_fills_in_for_missing_online_model() {
        let book = book_with(&[("bt.D.x", Coef { a: 1e-4, c: 1.0 })], true, false);
        let cap = book.cap_at_slowdown("profile=\"bt.D.x\"", None, 1.0, None);
        // t0 = c = 1, target duration 1.0, cap = POWER_MAX.
        assert_eq!(cap, POWER_MAX);
    }

    #[test]
    fn ignore_run_time_models_overrides_online_fit() {
        let online = RuntimeModel { a: 0.0, c: 5.0 };
        let book = book_with(&[("bt.D.x", Coef { a: 1e-4, c: 1.0 })], true, true);
        let cap = book.cap_at_slowdown("profile=bt.D.x", Some(&online), 1.5, None);
        let expected = (RuntimeModel { a: 1e-4, c: 1.0 }).cap_at_slowdown(1.5, None);
        assert_eq!(cap, expected);
        assert!(cap > POWER_MIN && cap < POWER_MAX);
    }

    #[test]
    fn unknown_tail_falls_back_to_online_then_heuristic() {
        let book = book_with(&[("bt.D.x", Coef { a: 1e-4, c: 1.0 })], true, false);
        let cap = book.cap_at_slowdown("profile=unknown", None, 2.0, None);
        assert_eq!(cap, heuristic_cap_at_slowdown(2.0));
    }

    #[test]
    fn confusions_reuse_other_application_coefficients() {
        let yaml = r#"
applications:
  bt.D.x:
    launcher: jobs/bt.sbatch
    nodes: 4
    model: {A: 5.0e-5, C: 1.5}
  ep.D.x:
    launcher: jobs/ep.sbatch
    nodes: 2
    model: {A: 1.0e-6, C: 0.5}
"#;
        let info: AppInfo = serde_yaml::from_str(yaml).unwrap();
        let confusions = vec![("bt.D.x".to_string(), "ep.D.x".to_string())];
        let book = ModelBook::from_app_info(&info, &confusions, true, true).unwrap();
        assert_eq!(
            book.coefficients.get("bt.D.x"),
            Some(&Coef { a: 1.0e-6, c: 0.5 })
        );

        let missing = vec![("bt.D.x".to_string(), "nope".to_string())];
        assert!(ModelBook::from_app_info(&info, &missing, true, true).is_err());
    }

    #[test]
    fn app_info_parses_optional_min_time() {
        let yaml = r#"
applications:
  sp.C.x:
    launcher: jobs/sp.sbatch
    nodes: 8
    model: {A: 2.0e-5, C: 2.1}
    min_time: 90.0
"#;
        let info: AppInfo = serde_yaml::from_str(yaml).unwrap();
        let spec = &info.applications["sp.C.x"];
        assert_eq!(spec.nodes, 8);
        assert_eq!(spec.min_time, Some(90.0));
        assert_eq!(spec.launcher, "jobs/sp.sbatch");
    }
}
