//! Bayesian hyperparameter search driver

use std::time::Instant;

use ndarray::{Array1, Array2};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::config::{InitialPoints, SearchConfig};
use super::gaussian_process::{GaussianProcess, KernelType};
use super::search_space::{SearchSpace, TrialParams};
use crate::error::{MolPropError, Result};

/// Outcome of a single objective evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Completed,
    /// Training diverged or the score was not finite; the score is a penalty
    Diverged,
}

/// Result of a single trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub index: usize,
    pub params: TrialParams,
    /// Point in the unit hypercube the surrogate saw
    pub unit_point: Vec<f64>,
    /// Observed score, or the penalty for a diverged trial
    pub score: f64,
    pub status: TrialStatus,
    pub duration_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Full search record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub best_index: usize,
    pub best_params: TrialParams,
    pub best_score: f64,
    pub trials: Vec<Trial>,
}

impl SearchResult {
    pub fn best_trial(&self) -> &Trial {
        &self.trials[self.best_index]
    }

    pub fn n_diverged(&self) -> usize {
        self.trials
            .iter()
            .filter(|t| t.status == TrialStatus::Diverged)
            .count()
    }
}

/// Minimises an expensive objective over a [`SearchSpace`]
#[derive(Debug)]
pub struct BayesianSearch {
    space: SearchSpace,
    config: SearchConfig,
    rng: Xoshiro256PlusPlus,
}

struct Observation {
    params: TrialParams,
    unit_point: Vec<f64>,
    /// `None` while a diverged trial waits for the first finite score
    score: Option<f64>,
    status: TrialStatus,
    duration_secs: f64,
    failure: Option<String>,
}

impl BayesianSearch {
    pub fn new(space: SearchSpace, config: SearchConfig) -> Result<Self> {
        space.validate()?;
        config.validate()?;
        let rng = Xoshiro256PlusPlus::seed_from_u64(config.seed);
        Ok(Self { space, config, rng })
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    fn initial_design(&mut self) -> Vec<Vec<f64>> {
        let n = self.config.n_initial_points.min(self.config.n_calls);
        match self.config.initial_points {
            InitialPoints::Random => (0..n).map(|_| self.space.sample_unit(&mut self.rng)).collect(),
            InitialPoints::LatinHypercube => self.space.latin_hypercube(n, &mut self.rng),
        }
    }

    /// Next point from the surrogate, or a random point while it has too little data
    fn propose(&mut self, observed: &[(&[f64], f64)]) -> Result<Vec<f64>> {
        if observed.len() < 2 {
            return Ok(self.space.sample_unit(&mut self.rng));
        }

        let d = self.space.len();
        let x = Array2::from_shape_vec(
            (observed.len(), d),
            observed.iter().flat_map(|(u, _)| u.iter().copied()).collect(),
        )?;
        let y: Array1<f64> = observed.iter().map(|(_, s)| *s).collect();

        let mut gp = GaussianProcess::new(KernelType::default())
            .with_noise(self.config.noise)
            .with_length_scales(self.config.length_scales.clone());
        gp.fit(&x, &y)?;

        let (incumbent, best) = observed
            .iter()
            .fold(None::<&(&[f64], f64)>, |acc, o| match acc {
                Some(b) if b.1 <= o.1 => Some(b),
                _ => Some(o),
            })
            .map(|(u, s)| (u.to_vec(), *s))
            .ok_or_else(|| MolPropError::OptimizationError("no observations to fit".to_string()))?;

        let mut candidates: Vec<Vec<f64>> = (0..self.config.n_candidates)
            .map(|_| self.space.sample_unit(&mut self.rng))
            .collect();
        for _ in 0..self.config.n_local_candidates {
            let local = incumbent
                .iter()
                .map(|&u| (u + (self.rng.gen::<f64>() - 0.5) * 0.1).clamp(0.0, 1.0))
                .collect();
            candidates.push(local);
        }

        let grid = Array2::from_shape_vec(
            (candidates.len(), d),
            candidates.iter().flatten().copied().collect(),
        )?;
        let (mean, var) = gp.predict(&grid)?;

        let mut best_idx = 0;
        let mut best_acq = f64::NEG_INFINITY;
        for i in 0..candidates.len() {
            let acq = self.config.acquisition.value(mean[i], var[i], best);
            if acq > best_acq {
                best_acq = acq;
                best_idx = i;
            }
        }
        debug!(
            length_scale = gp.kernel().length_scale(),
            acquisition = best_acq,
            "surrogate proposal"
        );

        Ok(candidates.swap_remove(best_idx))
    }

    /// Run `n_calls` evaluations of `objective`
    ///
    /// A trial whose objective fails with a divergence, or returns a
    /// non-finite score, is scored as the worst finite score so far plus
    /// `failure_penalty`. Any other error aborts the search. The returned best
    /// trial is the lowest observed score, earliest on ties.
    pub fn minimize<F>(&mut self, mut objective: F) -> Result<SearchResult>
    where
        F: FnMut(&TrialParams) -> Result<f64>,
    {
        let start = Instant::now();
        let initial = self.initial_design();
        let mut observations: Vec<Observation> = Vec::with_capacity(self.config.n_calls);

        for index in 0..self.config.n_calls {
            let raw_point = match initial.get(index) {
                Some(point) => point.clone(),
                None => {
                    let observed: Vec<(&[f64], f64)> = observations
                        .iter()
                        .filter_map(|o| o.score.map(|s| (o.unit_point.as_slice(), s)))
                        .collect();
                    self.propose(&observed)?
                }
            };
            let params = self.space.from_unit(&raw_point);
            let unit_point = self.space.to_unit(&params)?.to_vec();

            let trial_start = Instant::now();
            let (score, failure) = match objective(&params) {
                Ok(score) if score.is_finite() => (Some(score), None),
                Ok(score) => (None, Some(format!("non-finite score {}", score))),
                Err(e) if e.is_recoverable_in_search() => (None, Some(e.to_string())),
                Err(e) => return Err(e),
            };
            let duration_secs = trial_start.elapsed().as_secs_f64();

            let worst = worst_finite(&observations, score);
            let penalty = self.config.failure_penalty;
            let (status, score) = match score {
                Some(s) => (TrialStatus::Completed, Some(s)),
                None => (TrialStatus::Diverged, worst.map(|w| w + penalty)),
            };

            match (&status, &failure) {
                (TrialStatus::Completed, _) => info!(
                    trial = index,
                    params = ?params,
                    score = score.unwrap_or(f64::NAN),
                    elapsed_secs = duration_secs,
                    "search trial completed"
                ),
                (TrialStatus::Diverged, reason) => warn!(
                    trial = index,
                    params = ?params,
                    reason = reason.as_deref().unwrap_or(""),
                    "search trial diverged, scoring with penalty"
                ),
            }

            observations.push(Observation {
                params,
                unit_point,
                score,
                status,
                duration_secs,
                failure,
            });

            // The first finite score also settles earlier diverged trials
            if let Some(w) = worst {
                for o in observations.iter_mut().filter(|o| o.score.is_none()) {
                    o.score = Some(w + penalty);
                }
            }
        }

        let best = observations
            .iter()
            .enumerate()
            .filter(|(_, o)| o.status == TrialStatus::Completed)
            .fold(None::<(usize, f64)>, |acc, (i, o)| {
                let score = o.score.unwrap_or(f64::INFINITY);
                match acc {
                    Some((_, b)) if b <= score => acc,
                    _ => Some((i, score)),
                }
            });
        let (best_index, best_score) = best.ok_or_else(|| {
            MolPropError::OptimizationError(format!(
                "all {} search trials diverged",
                observations.len()
            ))
        })?;

        let trials: Vec<Trial> = observations
            .into_iter()
            .enumerate()
            .map(|(index, o)| Trial {
                index,
                params: o.params,
                unit_point: o.unit_point,
                score: o.score.unwrap_or(f64::INFINITY),
                status: o.status,
                duration_secs: o.duration_secs,
                failure: o.failure,
            })
            .collect();
        let best_params = trials[best_index].params.clone();

        info!(
            best_trial = best_index,
            best_score,
            params = ?best_params,
            elapsed_secs = start.elapsed().as_secs_f64(),
            "search finished"
        );

        Ok(SearchResult {
            best_index,
            best_params,
            best_score,
            trials,
        })
    }
}

/// Largest finite score among completed trials, including a fresh one
fn worst_finite(observations: &[Observation], fresh: Option<f64>) -> Option<f64> {
    observations
        .iter()
        .filter(|o| o.status == TrialStatus::Completed)
        .filter_map(|o| o.score)
        .chain(fresh)
        .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.max(s))))
}
