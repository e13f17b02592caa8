//! Exemplars and the observation capability traits.
//!
//! Only some primitives can attach an exemplar to an observation. Callers
//! holding a `&dyn Observer` ask for the capability through
//! [`Observer::as_exemplar_observer`] instead of inspecting concrete types.

use chrono::{DateTime, Utc};
use stathe_common::{
    error::{Result, StatheError},
    time,
};

use crate::types::is_valid_label_name;

/// Combined length limit, in characters, of exemplar label names and values.
pub const EXEMPLAR_MAX_RUNES: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub struct Exemplar {
    pub labels: Vec<(String, String)>,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Exemplar {
    pub fn new(value: f64, labels: &[(&str, &str)]) -> Result<Self> {
        let mut runes = 0;
        for (name, label_value) in labels {
            if !is_valid_label_name(name) {
                return Err(StatheError::InvalidArgument(format!(
                    "exemplar label name {name:?} is invalid"
                )));
            }
            runes += name.chars().count() + label_value.chars().count();
        }
        if runes > EXEMPLAR_MAX_RUNES {
            return Err(StatheError::InvalidArgument(format!(
                "exemplar labels have {runes} runes, exceeding the limit of {EXEMPLAR_MAX_RUNES}"
            )));
        }

        let mut labels = labels
            .iter()
            .map(|(name, label_value)| ((*name).to_string(), (*label_value).to_string()))
            .collect::<Vec<_>>();
        labels.sort_by(|left, right| left.0.cmp(&right.0));

        Ok(Self {
            labels,
            value,
            timestamp: time::now(),
        })
    }
}

/// Anything that accepts individual observations.
pub trait Observer: Send + Sync {
    fn observe(&self, value: f64);

    fn as_exemplar_observer(&self) -> Option<&dyn ExemplarObserver> {
        None
    }
}

pub trait ExemplarObserver: Observer {
    /// Observes `value` and keeps the exemplar for the bucket it lands in.
    /// Invalid exemplar labels are reported and the observation is not recorded.
    fn observe_with_exemplar(&self, value: f64, labels: &[(&str, &str)]) -> Result<()>;
}

pub trait ExemplarAdder: Send + Sync {
    fn add_with_exemplar(&self, delta: f64, labels: &[(&str, &str)]) -> Result<()>;
}

/// Observes through the exemplar capability when the target has it.
pub fn observe_maybe_with_exemplar(
    observer: &dyn Observer,
    value: f64,
    labels: &[(&str, &str)],
) -> Result<()> {
    match observer.as_exemplar_observer() {
        Some(exemplar_observer) => exemplar_observer.observe_with_exemplar(value, labels),
        None => {
            observer.observe(value);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_sorted_and_limited() {
        let exemplar = Exemplar::new(0.5, &[("trace_id", "abc"), ("dummyID", "42")]).unwrap();
        assert_eq!(exemplar.labels[0].0, "dummyID");
        assert_eq!(exemplar.value, 0.5);

        let long = "x".repeat(EXEMPLAR_MAX_RUNES);
        let err = Exemplar::new(1.0, &[("id", long.as_str())]).unwrap_err();
        assert!(matches!(err, StatheError::InvalidArgument(_)));

        assert!(Exemplar::new(1.0, &[("bad-name", "v")]).is_err());
    }
}
