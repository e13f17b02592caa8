use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatheError {
    #[error("duplicate metric descriptor {name}: {reason}")]
    DuplicateDescriptor { name: String, reason: String },
    #[error("metric already registered: {0}")]
    AlreadyRegistered(String),
    #[error("invalid metric descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("{name}: expected {expected} label values, got {got}")]
    LabelArity {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("{name}: label set does not match declared labels: {reason}")]
    InconsistentLabels { name: String, reason: String },
    #[error("counter {name} cannot decrease (delta {delta})")]
    NegativeCounterDelta { name: String, delta: f64 },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("sampling failed: {0}")]
    Sampling(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("render error: {0}")]
    Render(String),
    #[error("pushed metric {family} already contains grouping label {label}")]
    GroupingLabelConflict { family: String, label: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StatheError {
    /// Short stable code, used as a `cause` label value and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateDescriptor { .. }
            | Self::AlreadyRegistered(_)
            | Self::InvalidDescriptor(_) => "registration",
            Self::LabelArity { .. } | Self::InconsistentLabels { .. } => "label_arity",
            Self::NegativeCounterDelta { .. } | Self::InvalidArgument(_) => "invalid_argument",
            Self::Sampling(_) => "sampling",
            Self::Transport(_) => "transport",
            Self::Render(_) => "render",
            Self::GroupingLabelConflict { .. } => "grouping",
            Self::Io(_) => "io",
        }
    }

    /// Registration conflicts are the only errors that should abort startup.
    pub fn is_registration(&self) -> bool {
        self.kind() == "registration"
    }
}

pub type Result<T> = std::result::Result<T, StatheError>;
