//! Aggregation keys and weights.

use std::hash::Hash;

use hashbrown::Equivalent;

use crate::{
    document::DocumentKey,
    error::IngestError,
    event::{Outcome, Span, Transaction},
};

/// An aggregation key.
///
/// Keys are derived from events, never mutated, and ordered so that flushed documents come out in a stable order.
pub trait AggregationKey: Clone + Eq + Hash + Ord + Send + Sync + 'static {
    /// Builds the identity fields of a document for this key.
    fn to_document_key(&self) -> DocumentKey;

    /// Builds the identity fields of the overflow document.
    fn overflow_document_key() -> DocumentKey;
}

/// A borrowed view of an aggregation key.
///
/// Implementations must hash identically to the owned key they stand in for, so that a lookup which hits an existing
/// group never allocates.
pub trait KeyLookup<K>: Hash + Equivalent<K> {
    /// Creates the owned key.
    fn to_owned_key(&self) -> K;
}

impl<K> KeyLookup<K> for K
where
    K: AggregationKey,
{
    fn to_owned_key(&self) -> K {
        self.clone()
    }
}

/// Placeholder used for every identity field of an overflow document.
pub const OVERFLOW_FIELD_VALUE: &str = "_other";

/// Aggregation key for transaction metrics.
// Field order and types must stay in lockstep with `TransactionKeyRef`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TransactionKey {
    service_name: String,
    environment: String,
    name: String,
    transaction_type: String,
    outcome: Outcome,
}

impl TransactionKey {
    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the environment.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Returns the transaction name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the transaction type.
    pub fn transaction_type(&self) -> &str {
        &self.transaction_type
    }

    /// Returns the outcome.
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }
}

impl AggregationKey for TransactionKey {
    fn to_document_key(&self) -> DocumentKey {
        DocumentKey::Transaction {
            service_name: self.service_name.clone(),
            environment: self.environment.clone(),
            name: self.name.clone(),
            transaction_type: self.transaction_type.clone(),
            outcome: self.outcome.as_str().to_string(),
        }
    }

    fn overflow_document_key() -> DocumentKey {
        DocumentKey::Transaction {
            service_name: OVERFLOW_FIELD_VALUE.to_string(),
            environment: OVERFLOW_FIELD_VALUE.to_string(),
            name: OVERFLOW_FIELD_VALUE.to_string(),
            transaction_type: OVERFLOW_FIELD_VALUE.to_string(),
            outcome: OVERFLOW_FIELD_VALUE.to_string(),
        }
    }
}

/// Borrowed form of [`TransactionKey`].
#[derive(Debug, Hash)]
pub struct TransactionKeyRef<'a> {
    service_name: &'a str,
    environment: &'a str,
    name: &'a str,
    transaction_type: &'a str,
    outcome: Outcome,
}

impl<'a> TransactionKeyRef<'a> {
    /// Derives the key for the given transaction.
    ///
    /// # Errors
    ///
    /// If the service name, transaction name, or transaction type is empty, an error is returned.
    pub fn from_transaction(tx: &'a Transaction) -> Result<Self, IngestError> {
        require_field("service_name", &tx.service_name)?;
        require_field("name", &tx.name)?;
        require_field("type", &tx.transaction_type)?;

        Ok(Self {
            service_name: &tx.service_name,
            environment: &tx.environment,
            name: &tx.name,
            transaction_type: &tx.transaction_type,
            outcome: tx.outcome,
        })
    }
}

impl Equivalent<TransactionKey> for TransactionKeyRef<'_> {
    fn equivalent(&self, key: &TransactionKey) -> bool {
        self.service_name == key.service_name
            && self.environment == key.environment
            && self.name == key.name
            && self.transaction_type == key.transaction_type
            && self.outcome == key.outcome
    }
}

impl KeyLookup<TransactionKey> for TransactionKeyRef<'_> {
    fn to_owned_key(&self) -> TransactionKey {
        TransactionKey {
            service_name: self.service_name.to_string(),
            environment: self.environment.to_string(),
            name: self.name.to_string(),
            transaction_type: self.transaction_type.to_string(),
            outcome: self.outcome,
        }
    }
}

/// Aggregation key for service destination metrics.
// Field order and types must stay in lockstep with `ServiceDestinationKeyRef`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ServiceDestinationKey {
    service_name: String,
    environment: String,
    destination_name: String,
    destination_resource: String,
}

impl ServiceDestinationKey {
    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the environment.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Returns the destination service name.
    pub fn destination_name(&self) -> &str {
        &self.destination_name
    }

    /// Returns the destination resource.
    pub fn destination_resource(&self) -> &str {
        &self.destination_resource
    }
}

impl AggregationKey for ServiceDestinationKey {
    fn to_document_key(&self) -> DocumentKey {
        DocumentKey::ServiceDestination {
            service_name: self.service_name.clone(),
            environment: self.environment.clone(),
            destination_name: self.destination_name.clone(),
            destination_resource: self.destination_resource.clone(),
        }
    }

    fn overflow_document_key() -> DocumentKey {
        DocumentKey::ServiceDestination {
            service_name: OVERFLOW_FIELD_VALUE.to_string(),
            environment: OVERFLOW_FIELD_VALUE.to_string(),
            destination_name: OVERFLOW_FIELD_VALUE.to_string(),
            destination_resource: OVERFLOW_FIELD_VALUE.to_string(),
        }
    }
}

/// Borrowed form of [`ServiceDestinationKey`].
#[derive(Debug, Hash)]
pub struct ServiceDestinationKeyRef<'a> {
    service_name: &'a str,
    environment: &'a str,
    destination_name: &'a str,
    destination_resource: &'a str,
}

impl<'a> ServiceDestinationKeyRef<'a> {
    /// Derives the key for the given span.
    ///
    /// Returns `Ok(None)` if the span has no destination resource, as such spans are not aggregated.
    ///
    /// # Errors
    ///
    /// If the service name is empty, an error is returned.
    pub fn from_span(span: &'a Span) -> Result<Option<Self>, IngestError> {
        if span.destination_resource.is_empty() {
            return Ok(None);
        }
        require_field("service_name", &span.service_name)?;

        Ok(Some(Self {
            service_name: &span.service_name,
            environment: &span.environment,
            destination_name: &span.destination_name,
            destination_resource: &span.destination_resource,
        }))
    }
}

impl Equivalent<ServiceDestinationKey> for ServiceDestinationKeyRef<'_> {
    fn equivalent(&self, key: &ServiceDestinationKey) -> bool {
        self.service_name == key.service_name
            && self.environment == key.environment
            && self.destination_name == key.destination_name
            && self.destination_resource == key.destination_resource
    }
}

impl KeyLookup<ServiceDestinationKey> for ServiceDestinationKeyRef<'_> {
    fn to_owned_key(&self) -> ServiceDestinationKey {
        ServiceDestinationKey {
            service_name: self.service_name.to_string(),
            environment: self.environment.to_string(),
            destination_name: self.destination_name.to_string(),
            destination_resource: self.destination_resource.to_string(),
        }
    }
}

fn require_field(field: &'static str, value: &str) -> Result<(), IngestError> {
    if value.is_empty() {
        Err(IngestError::InvalidEvent { field })
    } else {
        Ok(())
    }
}

/// Returns the number of events an event stands for, given the rate it was sampled at.
///
/// Rates outside of `(0, 1]`, or a missing rate, count the event once.
pub fn weight(sample_rate: Option<f64>) -> u64 {
    match sample_rate {
        Some(rate) if rate > 0.0 && rate <= 1.0 => (1.0 / rate).round().max(1.0) as u64,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        hash::{BuildHasher as _, Hash},
        time::Duration,
    };

    use super::*;

    fn hash_of<T: Hash + ?Sized>(value: &T) -> u64 {
        foldhash::fast::FixedState::with_seed(0).hash_one(value)
    }

    #[test]
    fn weight_from_sample_rate() {
        assert_eq!(weight(None), 1);
        assert_eq!(weight(Some(-1.0)), 1);
        assert_eq!(weight(Some(0.0)), 1);
        assert_eq!(weight(Some(0.25)), 4);
        assert_eq!(weight(Some(1.0)), 1);
        assert_eq!(weight(Some(1.5)), 1);
        assert_eq!(weight(Some(0.3)), 3);
        assert_eq!(weight(Some(f64::NAN)), 1);
    }

    #[test]
    fn transaction_ref_matches_owned_key() {
        let tx = Transaction::new("checkout", "GET /cart", "request", Duration::from_millis(5))
            .with_environment("prod")
            .with_outcome(Outcome::Success);
        let key_ref = TransactionKeyRef::from_transaction(&tx).unwrap();
        let key = key_ref.to_owned_key();

        assert!(key_ref.equivalent(&key));
        assert_eq!(hash_of(&key_ref), hash_of(&key));
        assert_eq!(key.service_name(), "checkout");
        assert_eq!(key.environment(), "prod");
        assert_eq!(key.outcome(), Outcome::Success);
    }

    #[test]
    fn transaction_key_ignores_duration_and_result() {
        let a = Transaction::new("svc", "op", "request", Duration::from_millis(1)).with_result("HTTP 2xx");
        let b = Transaction::new("svc", "op", "request", Duration::from_secs(3)).with_result("HTTP 5xx");

        let key_a = TransactionKeyRef::from_transaction(&a).unwrap().to_owned_key();
        assert!(TransactionKeyRef::from_transaction(&b).unwrap().equivalent(&key_a));
    }

    #[test]
    fn transaction_key_separates_outcomes() {
        let a = Transaction::new("svc", "op", "request", Duration::ZERO).with_outcome(Outcome::Success);
        let b = Transaction::new("svc", "op", "request", Duration::ZERO).with_outcome(Outcome::Failure);

        let key_a = TransactionKeyRef::from_transaction(&a).unwrap().to_owned_key();
        assert!(!TransactionKeyRef::from_transaction(&b).unwrap().equivalent(&key_a));
    }

    #[test]
    fn transaction_missing_fields() {
        let tx = Transaction::new("", "op", "request", Duration::ZERO);
        assert_eq!(
            TransactionKeyRef::from_transaction(&tx).unwrap_err(),
            IngestError::InvalidEvent { field: "service_name" }
        );

        let tx = Transaction::new("svc", "op", "", Duration::ZERO);
        assert_eq!(
            TransactionKeyRef::from_transaction(&tx).unwrap_err(),
            IngestError::InvalidEvent { field: "type" }
        );
    }

    #[test]
    fn span_ref_matches_owned_key() {
        let span = Span::new("checkout", "postgresql", "db:5432", Duration::from_millis(2));
        let key_ref = ServiceDestinationKeyRef::from_span(&span).unwrap().unwrap();
        let key = key_ref.to_owned_key();

        assert!(key_ref.equivalent(&key));
        assert_eq!(hash_of(&key_ref), hash_of(&key));
        assert_eq!(key.destination_resource(), "db:5432");
    }

    #[test]
    fn span_without_resource_is_skipped() {
        let span = Span::new("", "postgresql", "", Duration::ZERO);
        assert!(matches!(ServiceDestinationKeyRef::from_span(&span), Ok(None)));

        let span = Span::new("", "postgresql", "db:5432", Duration::ZERO);
        assert_eq!(
            ServiceDestinationKeyRef::from_span(&span).map(|key| key.is_some()),
            Err(IngestError::InvalidEvent { field: "service_name" })
        );
    }

    #[test]
    fn overflow_key_uses_placeholder() {
        match ServiceDestinationKey::overflow_document_key() {
            DocumentKey::ServiceDestination { destination_resource, .. } => {
                assert_eq!(destination_resource, OVERFLOW_FIELD_VALUE)
            }
            other => panic!("unexpected key: {:?}", other),
        }
    }
}
