//! Trace events consumed by the aggregators.

use std::time::Duration;

use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSecondsWithFrac};

/// Outcome of a transaction, as reported by the agent that recorded it.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The transaction succeeded.
    Success,

    /// The transaction failed.
    Failure,

    /// The outcome was not reported.
    #[default]
    Unknown,
}

impl Outcome {
    /// Returns the canonical string form of the outcome.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Unknown => "unknown",
        }
    }
}

const fn default_sampled() -> bool {
    true
}

/// A completed transaction.
///
/// Durations are given in fractional milliseconds on the wire. Negative durations fail to deserialize.
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Transaction {
    /// Name of the service that recorded the transaction.
    pub service_name: String,

    /// Environment the service runs in, if any.
    #[serde(default)]
    pub environment: String,

    /// Name of the transaction, such as `GET /users/{id}`.
    pub name: String,

    /// Type of the transaction, such as `request`.
    #[serde(rename = "type")]
    pub transaction_type: String,

    /// Result of the transaction, such as `HTTP 2xx`.
    #[serde(default)]
    pub result: String,

    /// Outcome of the transaction.
    #[serde(default)]
    pub outcome: Outcome,

    /// Whether the tracer kept the full transaction.
    ///
    /// Unsampled transactions are aggregated all the same. Aggregation never reads this field; it is kept so that
    /// tracer payloads carrying it deserialize into the same shape they were produced from.
    #[serde(default = "default_sampled")]
    pub sampled: bool,

    /// Rate at which transactions like this one were sampled, if known.
    #[serde(default)]
    pub sample_rate: Option<f64>,

    /// How long the transaction took.
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub duration: Duration,
}

impl Transaction {
    /// Creates a new `Transaction` with the given identity and duration.
    ///
    /// The transaction is sampled, has an unknown outcome, and carries no environment, result, or sample rate.
    pub fn new<S, N, T>(service_name: S, name: N, transaction_type: T, duration: Duration) -> Self
    where
        S: Into<String>,
        N: Into<String>,
        T: Into<String>,
    {
        Self {
            service_name: service_name.into(),
            environment: String::new(),
            name: name.into(),
            transaction_type: transaction_type.into(),
            result: String::new(),
            outcome: Outcome::Unknown,
            sampled: true,
            sample_rate: None,
            duration,
        }
    }

    /// Sets the environment.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Sets the result.
    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = result.into();
        self
    }

    /// Sets the outcome.
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Sets whether the transaction was sampled.
    pub fn with_sampled(mut self, sampled: bool) -> Self {
        self.sampled = sampled;
        self
    }

    /// Sets the sample rate.
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }
}

/// An exit span: a call from a service to a downstream destination.
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Span {
    /// Name of the service that owns the parent transaction.
    pub service_name: String,

    /// Environment the service runs in, if any.
    #[serde(default)]
    pub environment: String,

    /// Name of the destination service, such as `postgresql`.
    #[serde(default)]
    pub destination_name: String,

    /// Resource identifier of the destination, such as `db.internal:5432`.
    ///
    /// Spans without a destination resource are not aggregated.
    #[serde(default)]
    pub destination_resource: String,

    /// Rate at which spans like this one were sampled, if known.
    #[serde(default)]
    pub sample_rate: Option<f64>,

    /// How long the span took.
    #[serde_as(as = "DurationMilliSecondsWithFrac<f64>")]
    pub duration: Duration,
}

impl Span {
    /// Creates a new `Span` with the given identity and duration.
    pub fn new<S, N, R>(service_name: S, destination_name: N, destination_resource: R, duration: Duration) -> Self
    where
        S: Into<String>,
        N: Into<String>,
        R: Into<String>,
    {
        Self {
            service_name: service_name.into(),
            environment: String::new(),
            destination_name: destination_name.into(),
            destination_resource: destination_resource.into(),
            sample_rate: None,
            duration,
        }
    }

    /// Sets the environment.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Sets the sample rate.
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }
}

/// A single trace event.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    /// A transaction.
    Transaction(Transaction),

    /// A span.
    Span(Span),
}
