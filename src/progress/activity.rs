//! Activity-weighted progress model.
//!
//! Overall progress is the weighted sum of each activity's own progress,
//! with completed activities counting for their full weight.

use crate::models::{PerduraError, Result};
use serde::{Deserialize, Serialize};

/// Allowed drift of the weight sum from 1.0.
const WEIGHT_TOLERANCE: f64 = 0.01;

/// One named sub-phase of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub name: String,
    /// Fraction of the whole task (0.0-1.0)
    pub weight: f64,
    /// Progress within this activity (0-100)
    pub progress_pct: f64,
    pub started: bool,
    pub completed: bool,
}

/// Ordered set of activities whose weights sum to 1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivitySet {
    activities: Vec<Activity>,
}

impl ActivitySet {
    pub fn new<S: Into<String>>(weights: impl IntoIterator<Item = (S, f64)>) -> Result<Self> {
        let activities: Vec<Activity> = weights
            .into_iter()
            .map(|(name, weight)| Activity {
                name: name.into(),
                weight,
                progress_pct: 0.0,
                started: false,
                completed: false,
            })
            .collect();

        if activities.is_empty() {
            return Err(PerduraError::InvalidInput(
                "activity set must not be empty".to_string(),
            ));
        }
        if let Some(a) = activities.iter().find(|a| a.weight.is_nan() || a.weight <= 0.0) {
            return Err(PerduraError::InvalidInput(format!(
                "activity '{}' has non-positive weight {}",
                a.name, a.weight
            )));
        }
        for (i, a) in activities.iter().enumerate() {
            if activities[..i].iter().any(|b| b.name == a.name) {
                return Err(PerduraError::InvalidInput(format!(
                    "duplicate activity '{}'",
                    a.name
                )));
            }
        }
        let sum: f64 = activities.iter().map(|a| a.weight).sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(PerduraError::InvalidInput(format!(
                "activity weights must sum to 1.0, got {sum:.3}"
            )));
        }

        Ok(Self { activities })
    }

    /// Four-stage research breakdown.
    pub fn research_default() -> Self {
        Self {
            activities: [
                ("initial_research", 0.25),
                ("source_gathering", 0.35),
                ("analysis", 0.30),
                ("synthesis", 0.10),
            ]
            .into_iter()
            .map(|(name, weight)| Activity {
                name: name.to_string(),
                weight,
                progress_pct: 0.0,
                started: false,
                completed: false,
            })
            .collect(),
        }
    }

    /// Set progress within one activity; 100% completes it.
    pub fn update(&mut self, name: &str, progress_pct: f64) -> Result<&Activity> {
        if !(0.0..=100.0).contains(&progress_pct) {
            return Err(PerduraError::InvalidInput(format!(
                "activity progress must be within [0, 100], got {progress_pct}"
            )));
        }
        let activity = self
            .activities
            .iter_mut()
            .find(|a| a.name == name)
            .ok_or_else(|| PerduraError::InvalidInput(format!("unknown activity '{name}'")))?;

        activity.started = true;
        activity.progress_pct = progress_pct;
        activity.completed = progress_pct >= 100.0;
        Ok(activity)
    }

    pub fn complete(&mut self, name: &str) -> Result<&Activity> {
        self.update(name, 100.0)
    }

    /// Weighted overall progress (0-100).
    pub fn overall_pct(&self) -> f64 {
        if self.activities.iter().all(|a| a.completed) {
            return 100.0;
        }
        let sum: f64 = self
            .activities
            .iter()
            .map(|a| {
                if a.completed {
                    a.weight * 100.0
                } else {
                    a.weight * a.progress_pct
                }
            })
            .sum();
        ((sum * 1e6).round() / 1e6).clamp(0.0, 100.0)
    }

    /// Activity in flight: the first started but unfinished one, else the
    /// first not yet started.
    pub fn current(&self) -> Option<&Activity> {
        self.activities
            .iter()
            .find(|a| a.started && !a.completed)
            .or_else(|| self.activities.iter().find(|a| !a.started))
    }

    pub fn get(&self, name: &str) -> Option<&Activity> {
        self.activities.iter().find(|a| a.name == name)
    }

    pub fn activities(&self) -> &[Activity] {
        &self.activities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_progress() {
        let mut set = ActivitySet::research_default();
        set.update("initial_research", 50.0).unwrap();
        assert_eq!(set.overall_pct(), 12.5);

        set.complete("initial_research").unwrap();
        set.update("source_gathering", 50.0).unwrap();
        assert_eq!(set.overall_pct(), 42.5);
    }

    #[test]
    fn test_all_complete_is_exactly_100() {
        let mut set = ActivitySet::new([("a", 0.3), ("b", 0.3), ("c", 0.4)]).unwrap();
        for name in ["a", "b", "c"] {
            set.complete(name).unwrap();
        }
        assert_eq!(set.overall_pct(), 100.0);

        let mut set = ActivitySet::research_default();
        for name in ["initial_research", "source_gathering", "analysis", "synthesis"] {
            set.complete(name).unwrap();
        }
        assert_eq!(set.overall_pct(), 100.0);
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        assert!(ActivitySet::new([("a", 0.5), ("b", 0.4)]).is_err());
        assert!(ActivitySet::new([("a", 0.5), ("b", 0.495)]).is_ok());
        assert!(ActivitySet::new([("a", 1.0), ("b", 0.0)]).is_err());
        assert!(ActivitySet::new([("a", 0.5), ("a", 0.5)]).is_err());
        assert!(ActivitySet::new(Vec::<(String, f64)>::new()).is_err());
    }

    #[test]
    fn test_current_activity() {
        let mut set = ActivitySet::research_default();
        assert_eq!(set.current().unwrap().name, "initial_research");

        set.complete("initial_research").unwrap();
        assert_eq!(set.current().unwrap().name, "source_gathering");

        set.update("analysis", 10.0).unwrap();
        assert_eq!(set.current().unwrap().name, "analysis");
    }

    #[test]
    fn test_rejects_unknown_or_out_of_range() {
        let mut set = ActivitySet::research_default();
        assert!(set.update("nope", 10.0).is_err());
        assert!(set.update("analysis", 120.0).is_err());
    }
}
