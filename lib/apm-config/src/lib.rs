//! Layered configuration loading for the aggregation service.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, collections::HashSet, sync::Arc};

use figment::{
    error::Kind,
    providers::{Env, Serialized},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tracing::debug;

mod provider;
use self::provider::FileProvider;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Help text listing the keys that would satisfy the lookup.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// Field was present but held a value of the wrong type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Field was present and well-typed, but its value is not acceptable.
    #[snafu(display("Invalid value for field '{}': {}", field, reason))]
    InvalidValue {
        /// Period-separated path to the field.
        field: String,

        /// Why the value was rejected.
        reason: String,
    },

    /// Any other error raised while loading or querying configuration.
    #[snafu(display("Failed to load or query configuration."))]
    Generic {
        /// Error source.
        source: figment::Error,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        match e.kind {
            Kind::InvalidType(actual_ty, expected_ty) => Self::InvalidFieldType {
                field: e.path.join("."),
                expected_ty,
                actual_ty: actual_ty.to_string(),
            },
            _ => Self::Generic { source: e },
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct EnvironmentPrefix(String);

impl EnvironmentPrefix {
    fn variable_for(&self, key: &str) -> String {
        format!("{}{}", self.0, key.replace('.', "_").to_uppercase())
    }
}

struct BoxedProvider(Box<dyn Provider + Send + Sync>);

impl Provider for BoxedProvider {
    fn metadata(&self) -> figment::Metadata {
        self.0.metadata()
    }

    fn data(&self) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        self.0.data()
    }
}

/// Loads configuration from a stack of sources.
///
/// Sources added later take precedence over sources added earlier. Supported sources:
///
/// - YAML files
/// - JSON files
/// - environment variables sharing a common prefix (see [`from_environment`][Self::from_environment])
/// - in-memory serializable values (see [`from_serialized`][Self::from_serialized])
#[derive(Default)]
pub struct ConfigurationLoader {
    prefixes: HashSet<EnvironmentPrefix>,
    providers: Vec<BoxedProvider>,
}

impl ConfigurationLoader {
    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or is not valid YAML, an error will be returned.
    pub fn from_yaml<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<std::path::Path>,
    {
        let provider = FileProvider::from_yaml(path)?;
        self.providers.push(BoxedProvider(Box::new(provider)));
        Ok(self)
    }

    /// Attempts to load the given YAML configuration file, ignoring it if it cannot be read or parsed.
    pub fn try_from_yaml<P>(mut self, path: P) -> Self
    where
        P: AsRef<std::path::Path>,
    {
        match FileProvider::from_yaml(&path) {
            Ok(provider) => self.providers.push(BoxedProvider(Box::new(provider))),
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().to_string_lossy(), "Unable to read YAML configuration file. Ignoring.");
            }
        }
        self
    }

    /// Loads the given JSON configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or is not valid JSON, an error will be returned.
    pub fn from_json<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<std::path::Path>,
    {
        let provider = FileProvider::from_json(path)?;
        self.providers.push(BoxedProvider(Box::new(provider)));
        Ok(self)
    }

    /// Loads configuration from environment variables starting with `prefix`.
    ///
    /// An underscore is appended to the prefix if it does not already end with one, so a prefix of `apm` matches
    /// `APM_LOG_LEVEL`. Matching is case-insensitive, and the prefix is stripped from the resulting keys.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error will be returned.
    pub fn from_environment(mut self, prefix: &'static str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        // `Env` is not `Send + Sync`, so snapshot its values now.
        let values = Env::prefixed(&prefix).data()?;
        if let Some(dict) = values.get(&figment::Profile::Default) {
            self.providers
                .push(BoxedProvider(Box::new(Serialized::defaults(dict.clone()))));
        }
        self.prefixes.insert(EnvironmentPrefix(prefix));
        Ok(self)
    }

    /// Adds an in-memory value as a configuration source.
    pub fn from_serialized<T>(mut self, value: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.providers.push(BoxedProvider(Box::new(Serialized::defaults(value))));
        self
    }

    /// Consumes the loader, deserializing the merged configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.into_generic().as_typed()
    }

    /// Consumes the loader, returning the merged configuration in its generic form.
    pub fn into_generic(self) -> GenericConfiguration {
        let figment = self
            .providers
            .into_iter()
            .fold(Figment::new(), |figment, provider| figment.admerge(provider));

        GenericConfiguration {
            inner: Arc::new(Inner {
                figment,
                prefixes: self.prefixes,
            }),
        }
    }
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    prefixes: HashSet<EnvironmentPrefix>,
}

/// Merged configuration, queryable by key.
///
/// Keys use periods to address nested values: given `{"aggregation": {"transactions": {"enabled": true}}}`, the key
/// `aggregation.transactions.enabled` resolves to `true`. When a nested key is missing, the lookup is retried with the
/// periods replaced by underscores, which is the shape environment variables take once their prefix is stripped.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    fn get<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.inner.figment.extract_inner(key) {
            Ok(value) => Ok(value),
            Err(e) if matches!(e.kind, Kind::MissingField(_)) => {
                let fallback_key = key.replace('.', "_");
                self.inner
                    .figment
                    .extract_inner(&fallback_key)
                    .map_err(|fallback_e| self.convert_error(key, fallback_e))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Gets a configuration value by key.
    ///
    /// # Errors
    ///
    /// If the key does not exist, or the value could not be deserialized into `T`, an error will be returned.
    pub fn get_typed<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.get(key)
    }

    /// Gets a configuration value by key, falling back to `T::default()` if it is missing or invalid.
    pub fn get_typed_or_default<'a, T>(&self, key: &str) -> T
    where
        T: Default + Deserialize<'a>,
    {
        self.get(key).unwrap_or_default()
    }

    /// Gets a configuration value by key, if it exists.
    ///
    /// # Errors
    ///
    /// If the key exists but the value could not be deserialized into `T`, an error will be returned.
    pub fn try_get_typed<'a, T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deserializes the entire configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn as_typed<'a, T>(&self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.inner
            .figment
            .extract()
            .map_err(|e| self.convert_error("", e))
    }

    fn convert_error(&self, key: &str, e: figment::Error) -> ConfigurationError {
        match e.kind {
            Kind::MissingField(field) => {
                let field = if key.is_empty() { field } else { Cow::Owned(key.to_string()) };

                let mut candidates = vec![field.to_string()];
                let mut variables = self
                    .inner
                    .prefixes
                    .iter()
                    .map(|prefix| prefix.variable_for(&field))
                    .collect::<Vec<_>>();
                variables.sort();
                candidates.extend(variables);

                let help_text = format!("Try setting `{}`.", candidates.join("` or `"));
                ConfigurationError::MissingField { help_text, field }
            }
            Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
                field: if e.path.is_empty() {
                    key.to_string()
                } else {
                    e.path.join(".")
                },
                expected_ty,
                actual_ty: actual_ty.to_string(),
            },
            _ => ConfigurationError::Generic { source: e },
        }
    }
}
