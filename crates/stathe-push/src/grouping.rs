use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use stathe_common::error::{Result, StatheError};
use stathe_metrics::{Snapshot, types::is_valid_label_name};
use url::Url;

pub const JOB_LABEL: &str = "job";
pub const INSTANCE_LABEL: &str = "instance";

/// Job name plus the extra labels that identify a pushed group.
///
/// `instance`, when present, always comes first in the URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grouping {
    job: String,
    labels: Vec<(String, String)>,
}

impl Grouping {
    pub fn new(job: impl Into<String>) -> Result<Self> {
        let job = job.into();
        if job.is_empty() {
            return Err(StatheError::InvalidArgument(
                "push job name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            job,
            labels: Vec::new(),
        })
    }

    /// Adds or replaces a grouping label.
    pub fn label(mut self, name: &str, value: impl Into<String>) -> Result<Self> {
        if name == JOB_LABEL {
            return Err(StatheError::InvalidArgument(
                "job is set at construction and cannot be a grouping label".to_string(),
            ));
        }
        if !is_valid_label_name(name) {
            return Err(StatheError::InvalidArgument(format!(
                "{name:?} is not a valid grouping label name"
            )));
        }

        let value = value.into();
        match self.labels.iter_mut().find(|(label, _)| label == name) {
            Some(entry) => entry.1 = value,
            None if name == INSTANCE_LABEL => self.labels.insert(0, (name.to_string(), value)),
            None => self.labels.push((name.to_string(), value)),
        }
        Ok(self)
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn labels(&self) -> &[(String, String)] {
        &self.labels
    }

    /// `job` followed by every grouping label name.
    pub fn label_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(JOB_LABEL).chain(self.labels.iter().map(|(name, _)| name.as_str()))
    }

    pub fn url(&self, gateway: &Url) -> Result<Url> {
        let mut url = gateway.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                StatheError::InvalidArgument(format!("push gateway url {gateway} cannot be a base"))
            })?;
            segments.pop_if_empty().push("metrics");
            push_label(&mut segments, JOB_LABEL, &self.job);
            for (name, value) in &self.labels {
                push_label(&mut segments, name, value);
            }
        }
        Ok(url)
    }

    /// Pushed samples must not carry labels the gateway attaches itself.
    pub fn check_conflicts(&self, snapshot: &Snapshot) -> Result<()> {
        for family in &snapshot.families {
            for sample in &family.samples {
                for (label, _) in &sample.labels {
                    if self.label_names().any(|name| name == label) {
                        return Err(StatheError::GroupingLabelConflict {
                            family: family.name().to_string(),
                            label: label.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn push_label(segments: &mut url::PathSegmentsMut<'_>, name: &str, value: &str) {
    if value.is_empty() {
        segments.push(&format!("{name}@base64")).push("=");
    } else if value.contains('/') {
        segments
            .push(&format!("{name}@base64"))
            .push(&URL_SAFE_NO_PAD.encode(value));
    } else {
        segments.push(name).push(value);
    }
}
