//! Typed records for the NewRelic v2 responses and the flattened [`Sample`].
//!
//! Paginated responses arrive as several JSON documents back to back, so
//! every record implements [`Document`] and is decoded with
//! [`decode_documents`], which merges the list fields of each page.

use std::collections::BTreeMap;

use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;

pub const APPLICATION_SUMMARY: &str = "application_summary";
pub const END_USER_SUMMARY: &str = "end_user_summary";

/// One flattened observation handed from the scraper to the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub app: String,
    pub name: String,
    pub value: f64,
    pub category: String,
}

/// A response record that may span several pages.
pub trait Document: DeserializeOwned + Default {
    /// Fold the list-valued fields of a later page into `self`.
    fn merge(&mut self, other: Self);
}

/// Decode a byte stream of consecutive JSON documents into one record.
///
/// Empty input yields `T::default()`; trailing whitespace is fine, any other
/// trailing content is an error.
pub fn decode_documents<T: Document>(bytes: &[u8]) -> Result<T, serde_json::Error> {
    let mut merged = T::default();
    for part in serde_json::Deserializer::from_slice(bytes).into_iter::<T>() {
        merged.merge(part?);
    }
    Ok(merged)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Green,
    Orange,
    Red,
    Gray,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Application {
    pub id: u64,
    pub name: String,
    #[serde(default, deserialize_with = "null_default")]
    pub health_status: HealthStatus,
    #[serde(default, deserialize_with = "numeric_map")]
    pub application_summary: BTreeMap<String, f64>,
    #[serde(default, deserialize_with = "numeric_map")]
    pub end_user_summary: BTreeMap<String, f64>,
}

impl Application {
    /// One sample per summary field, tagged with the summary it came from.
    pub fn summary_samples(&self) -> impl Iterator<Item = Sample> + '_ {
        let app = self
            .application_summary
            .iter()
            .map(|(name, value)| (APPLICATION_SUMMARY, name, *value));
        let usr = self
            .end_user_summary
            .iter()
            .map(|(name, value)| (END_USER_SUMMARY, name, *value));

        app.chain(usr).map(|(category, name, value)| Sample {
            app: self.name.clone(),
            name: name.clone(),
            value,
            category: category.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApplicationList {
    #[serde(default, deserialize_with = "null_default")]
    pub applications: Vec<Application>,
}

impl Document for ApplicationList {
    fn merge(&mut self, other: Self) {
        self.applications.extend(other.applications);
    }
}

impl ApplicationList {
    pub fn summary_samples(&self) -> impl Iterator<Item = Sample> + '_ {
        self.applications.iter().flat_map(|app| app.summary_samples())
    }
}

/// A metric an application reports, and the value fields it carries.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricName {
    pub name: String,
    #[serde(default, deserialize_with = "null_default")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricNameCatalog {
    #[serde(default, deserialize_with = "null_default")]
    pub metrics: Vec<MetricName>,
}

impl Document for MetricNameCatalog {
    fn merge(&mut self, other: Self) {
        self.metrics.extend(other.metrics);
    }
}

impl MetricNameCatalog {
    pub fn names(&self) -> Vec<String> {
        self.metrics.iter().map(|m| m.name.clone()).collect()
    }
}

/// A timeslice value: the API mixes numbers with strings and nulls.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Other(serde_json::Value),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            FieldValue::Other(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Timeslice {
    #[serde(default, deserialize_with = "null_default")]
    pub values: BTreeMap<String, FieldValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricSeries {
    pub name: String,
    #[serde(default, deserialize_with = "null_default")]
    pub timeslices: Vec<Timeslice>,
}

impl MetricSeries {
    /// Numeric fields of the first timeslice. Queries are summarized, so any
    /// further timeslices are ignored.
    pub fn samples<'a>(&'a self, app: &'a str) -> impl Iterator<Item = Sample> + 'a {
        self.timeslices
            .first()
            .into_iter()
            .flat_map(|slice| slice.values.iter())
            .filter_map(move |(field, value)| {
                value.as_f64().map(|value| Sample {
                    app: app.to_string(),
                    name: field.clone(),
                    value,
                    category: self.name.clone(),
                })
            })
    }
}

/// Metric data for one application, possibly merged from several chunks.
#[derive(Debug, Clone, Default)]
pub struct MetricDataSet {
    pub metrics: Vec<MetricSeries>,
}

// The wire format wraps the series in a `metric_data` object.
impl<'de> Deserialize<'de> for MetricDataSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(default, deserialize_with = "null_default")]
            metric_data: Body,
        }

        #[derive(Default, Deserialize)]
        struct Body {
            #[serde(default, deserialize_with = "null_default")]
            metrics: Vec<MetricSeries>,
        }

        let envelope = Envelope::deserialize(deserializer)?;
        Ok(Self {
            metrics: envelope.metric_data.metrics,
        })
    }
}

impl Document for MetricDataSet {
    fn merge(&mut self, other: Self) {
        self.metrics.extend(other.metrics);
    }
}

impl MetricDataSet {
    pub fn samples<'a>(&'a self, app: &'a str) -> impl Iterator<Item = Sample> + 'a {
        self.metrics.iter().flat_map(move |series| series.samples(app))
    }
}

/// An explicit `null` decodes like a missing field.
fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn numeric_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, FieldValue>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| v.as_f64().map(|v| (k, v)))
        .collect())
}
