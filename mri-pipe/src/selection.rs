//! Selection filter
//!
//! Narrows a [`ScanCatalog`] by condition, subject, measurement and scan
//! type. Filtering only ever removes records; an empty result is a valid
//! selection and only becomes an error when a path resolution needs it.

use crate::catalog::{ScanCatalog, ScanRecord};
use serde::Serialize;
use std::collections::BTreeSet;

/// Include/exclude criteria
///
/// An empty include list means "no restriction" for that dimension. An
/// exclude list always wins over the include list of the same dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelectionCriteria {
    pub conditions: Vec<String>,
    pub subjects: Vec<String>,
    pub exclude_subjects: Vec<String>,
    pub measurements: Vec<String>,
    pub exclude_measurements: Vec<String>,
    pub scan_types: Vec<String>,
}

fn owned<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    values.into_iter().map(Into::into).collect()
}

impl SelectionCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conditions<I: IntoIterator<Item = S>, S: Into<String>>(mut self, values: I) -> Self {
        self.conditions = owned(values);
        self
    }

    pub fn subjects<I: IntoIterator<Item = S>, S: Into<String>>(mut self, values: I) -> Self {
        self.subjects = owned(values);
        self
    }

    pub fn exclude_subjects<I: IntoIterator<Item = S>, S: Into<String>>(mut self, values: I) -> Self {
        self.exclude_subjects = owned(values);
        self
    }

    pub fn measurements<I: IntoIterator<Item = S>, S: Into<String>>(mut self, values: I) -> Self {
        self.measurements = owned(values);
        self
    }

    pub fn exclude_measurements<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        values: I,
    ) -> Self {
        self.exclude_measurements = owned(values);
        self
    }

    pub fn scan_types<I: IntoIterator<Item = S>, S: Into<String>>(mut self, values: I) -> Self {
        self.scan_types = owned(values);
        self
    }

    /// True if the record passes every dimension
    pub fn accepts(&self, record: &ScanRecord) -> bool {
        passes(&self.conditions, &[], &record.condition)
            && passes(&self.subjects, &self.exclude_subjects, &record.subject)
            && passes(
                &self.measurements,
                &self.exclude_measurements,
                &record.measurement,
            )
            && passes(&self.scan_types, &[], &record.scan_type)
    }
}

fn passes(include: &[String], exclude: &[String], value: &str) -> bool {
    if exclude.iter().any(|e| e == value) {
        return false;
    }
    include.is_empty() || include.iter().any(|i| i == value)
}

/// Filtered view of a catalog, in catalog order
#[derive(Debug, Clone, Default, Serialize)]
pub struct Selection {
    records: Vec<ScanRecord>,
}

impl Selection {
    pub fn records(&self) -> &[ScanRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Distinct conditions, sorted
    pub fn conditions(&self) -> Vec<String> {
        distinct(self.records.iter().map(|r| r.condition.as_str()))
    }

    /// Distinct subjects, sorted
    pub fn subjects(&self) -> Vec<String> {
        distinct(self.records.iter().map(|r| r.subject.as_str()))
    }

    /// Records matching one (condition, subject, scan type) tuple, in catalog order
    pub fn matching(&self, condition: &str, subject: &str, scan_type: &str) -> Vec<&ScanRecord> {
        self.records
            .iter()
            .filter(|r| r.condition == condition && r.subject == subject && r.scan_type == scan_type)
            .collect()
    }
}

fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    values
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Apply criteria to a catalog
pub fn select(catalog: &ScanCatalog, criteria: &SelectionCriteria) -> Selection {
    let records: Vec<ScanRecord> = catalog
        .records()
        .iter()
        .filter(|r| criteria.accepts(r))
        .cloned()
        .collect();

    tracing::debug!(
        catalog = catalog.len(),
        selected = records.len(),
        "Selection applied"
    );

    Selection { records }
}

/// Condition and subject axes that a workflow iterates over
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IterationAxes {
    pub conditions: Vec<String>,
    pub subjects: Vec<String>,
}

/// Resolve the iteration axes
///
/// An empty `conditions`/`subjects` criterion defaults to every value
/// observed in the selection. Explicit subjects keep their order with
/// excluded subjects removed.
pub fn resolve_defaults(selection: &Selection, criteria: &SelectionCriteria) -> IterationAxes {
    let conditions = if criteria.conditions.is_empty() {
        selection.conditions()
    } else {
        dedup_in_order(&criteria.conditions, &[])
    };

    let subjects = if criteria.subjects.is_empty() {
        selection.subjects()
    } else {
        dedup_in_order(&criteria.subjects, &criteria.exclude_subjects)
    };

    IterationAxes {
        conditions,
        subjects,
    }
}

fn dedup_in_order(values: &[String], exclude: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    values
        .iter()
        .filter(|v| !exclude.contains(v) && seen.insert(v.as_str()))
        .cloned()
        .collect()
}
