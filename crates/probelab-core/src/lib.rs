//! Laboratory sample records: the [`Sample`] entity with its measurement
//! validation and outcome derivation rules, and the [`SampleStore`]
//! contract with the in-memory variant.

use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SampleError {
    #[error("invalid measurement: {0}")]
    InvalidMeasurement(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("duplicate sample id {0}")]
    DuplicateId(SampleId),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Positive,
    Negative,
    Indeterminate,
}

impl Outcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Indeterminate => "indeterminate",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "positive" => Some(Self::Positive),
            "negative" => Some(Self::Negative),
            "indeterminate" => Some(Self::Indeterminate),
            _ => None,
        }
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SampleId(pub u64);

impl Display for SampleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The four configured measurement bounds.
///
/// A measurement is valid inside `[lower_bound, upper_bound]`; the closed
/// sub-range `[indeterminate_lower, indeterminate_upper]` classifies as
/// indeterminate, values above it as positive, values below as negative.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct MeasurementRuleset {
    pub lower_bound: i64,
    pub upper_bound: i64,
    pub indeterminate_lower: i64,
    pub indeterminate_upper: i64,
}

impl MeasurementRuleset {
    #[must_use]
    pub fn standard() -> Self {
        Self {
            lower_bound: 0,
            upper_bound: 1000,
            indeterminate_lower: 120,
            indeterminate_upper: 180,
        }
    }

    /// Validates the bound ordering invariant.
    ///
    /// # Errors
    /// Returns [`SampleError::Configuration`] unless
    /// `lower_bound <= indeterminate_lower <= indeterminate_upper <= upper_bound`.
    pub fn validate(&self) -> Result<(), SampleError> {
        if self.lower_bound > self.indeterminate_lower {
            return Err(SampleError::Configuration(
                "lower_bound MUST NOT exceed indeterminate_lower".to_string(),
            ));
        }

        if self.indeterminate_lower > self.indeterminate_upper {
            return Err(SampleError::Configuration(
                "indeterminate_lower MUST NOT exceed indeterminate_upper".to_string(),
            ));
        }

        if self.indeterminate_upper > self.upper_bound {
            return Err(SampleError::Configuration(
                "indeterminate_upper MUST NOT exceed upper_bound".to_string(),
            ));
        }

        Ok(())
    }

    /// Checks that a measurement lies inside the absolute valid range.
    ///
    /// # Errors
    /// Returns [`SampleError::InvalidMeasurement`] for out-of-range values.
    pub fn check(&self, measurement: i64) -> Result<(), SampleError> {
        if measurement < self.lower_bound || measurement > self.upper_bound {
            return Err(SampleError::InvalidMeasurement(format!(
                "value {measurement} outside [{}, {}]",
                self.lower_bound, self.upper_bound
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn classify(&self, measurement: i64) -> Outcome {
        if measurement > self.indeterminate_upper {
            Outcome::Positive
        } else if measurement >= self.indeterminate_lower {
            Outcome::Indeterminate
        } else {
            Outcome::Negative
        }
    }
}

/// Hands out sample ids, starting at 1 and never reusing a value.
///
/// Replaces the original design's hidden process-global counter so tests
/// can seed it deterministically and stores own their id lineage.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SampleIdAllocator {
    next: u64,
}

impl SampleIdAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self { next: 1 }
    }

    #[must_use]
    pub fn seeded(next: u64) -> Self {
        Self { next: next.max(1) }
    }

    pub fn allocate(&mut self) -> SampleId {
        let id = SampleId(self.next);
        self.next = self.next.saturating_add(1);
        id
    }

    /// Advances the allocator past an externally supplied id, so future
    /// allocations never collide with it.
    pub fn observe(&mut self, id: SampleId) {
        self.next = self.next.max(id.0.saturating_add(1));
    }
}

impl Default for SampleIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// A single measured-or-pending laboratory record.
///
/// The outcome is never set independently of the measurement: every
/// mutation recomputes it through [`MeasurementRuleset::classify`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    id: SampleId,
    taken_at: OffsetDateTime,
    measurement: Option<i64>,
    outcome: Option<Outcome>,
}

impl Sample {
    /// An open sample, pending measurement.
    pub fn new(ids: &mut SampleIdAllocator, taken_at: OffsetDateTime) -> Self {
        Self {
            id: ids.allocate(),
            taken_at,
            measurement: None,
            outcome: None,
        }
    }

    /// A fully formed sample with a validated measurement and derived outcome.
    ///
    /// Validation happens before an id is allocated, so a rejected
    /// construction does not consume one.
    ///
    /// # Errors
    /// Returns [`SampleError::InvalidMeasurement`] when the measurement lies
    /// outside the ruleset's absolute range.
    pub fn measured(
        ids: &mut SampleIdAllocator,
        taken_at: OffsetDateTime,
        measurement: i64,
        ruleset: &MeasurementRuleset,
    ) -> Result<Self, SampleError> {
        ruleset.check(measurement)?;

        Ok(Self {
            id: ids.allocate(),
            taken_at,
            measurement: Some(measurement),
            outcome: Some(ruleset.classify(measurement)),
        })
    }

    /// Trusted-load constructor for the persistence collaborator.
    ///
    /// Sets fields directly; the measurement/outcome pairing is the
    /// caller's responsibility. The loading store MUST advance its
    /// allocator past every rehydrated id (see [`SampleIdAllocator::observe`]).
    #[must_use]
    pub fn rehydrated(
        id: SampleId,
        taken_at: OffsetDateTime,
        measurement: Option<i64>,
        outcome: Option<Outcome>,
    ) -> Self {
        Self {
            id,
            taken_at,
            measurement,
            outcome,
        }
    }

    /// Records a measurement, recomputing the outcome.
    ///
    /// # Errors
    /// Returns [`SampleError::InvalidMeasurement`] for out-of-range values;
    /// the sample is unchanged in that case.
    pub fn set_measurement(
        &mut self,
        value: i64,
        ruleset: &MeasurementRuleset,
    ) -> Result<(), SampleError> {
        ruleset.check(value)?;
        self.measurement = Some(value);
        self.outcome = Some(ruleset.classify(value));
        Ok(())
    }

    #[must_use]
    pub fn id(&self) -> SampleId {
        self.id
    }

    #[must_use]
    pub fn taken_at(&self) -> OffsetDateTime {
        self.taken_at
    }

    #[must_use]
    pub fn measurement(&self) -> Option<i64> {
        self.measurement
    }

    #[must_use]
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }
}

// Identity semantics: two samples are the same record iff their ids match.
impl PartialEq for Sample {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Sample {}

impl Hash for Sample {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Display for Sample {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let measurement = self
            .measurement
            .map_or_else(|| "none".to_string(), compact_measurement);
        let outcome = self.outcome.map_or("none", Outcome::as_str);

        write!(
            f,
            "[id={:>3},  taken_at={:>17},  measurement={:>5},  outcome={:>9}]",
            self.id.0,
            format_minutes(self.taken_at),
            measurement,
            outcome
        )
    }
}

fn format_minutes(value: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}",
        value.year(),
        u8::from(value.month()),
        value.day(),
        value.hour(),
        value.minute()
    )
}

fn compact_measurement(value: i64) -> String {
    fn scaled(value: i64, divisor: f64, suffix: char) -> String {
        #[allow(clippy::cast_precision_loss)]
        let mut rendered = format!("{:.1}", value as f64 / divisor);
        if let Some(trimmed) = rendered.strip_suffix(".0") {
            rendered = trimmed.to_string();
        }
        rendered.push(suffix);
        rendered
    }

    if value.unsigned_abs() >= 1_000_000 {
        scaled(value, 1_000_000.0, 'M')
    } else if value.unsigned_abs() >= 1_000 {
        scaled(value, 1_000.0, 'K')
    } else {
        value.to_string()
    }
}

/// The capability set every store variant satisfies identically.
///
/// Absence is signaled through `false` / `None` / empty results, never an
/// error; errors are reserved for rejected input, configuration problems,
/// and backend failures.
pub trait SampleStore {
    /// Inserts a pre-built sample.
    ///
    /// # Errors
    /// Returns [`SampleError::DuplicateId`] on an id collision.
    fn add(&mut self, sample: Sample) -> Result<(), SampleError>;

    /// Creates and inserts an open sample, returning its id.
    ///
    /// # Errors
    /// Backend failures only.
    fn add_pending(&mut self, taken_at: OffsetDateTime) -> Result<SampleId, SampleError>;

    /// Creates and inserts a measured sample, returning its id.
    ///
    /// # Errors
    /// Propagates [`SampleError::InvalidMeasurement`] from construction
    /// unchanged.
    fn add_measured(
        &mut self,
        taken_at: OffsetDateTime,
        measurement: i64,
    ) -> Result<SampleId, SampleError>;

    /// Records a measurement on an existing open sample.
    ///
    /// Returns `false` without mutating anything when the id is unknown or
    /// the sample already carries a measurement.
    ///
    /// # Errors
    /// Returns [`SampleError::InvalidMeasurement`] for out-of-range values;
    /// the stored sample is unchanged in that case.
    fn add_measurement(&mut self, id: SampleId, measurement: i64) -> Result<bool, SampleError>;

    /// Removes a sample; `true` iff it existed. Idempotent.
    ///
    /// # Errors
    /// Backend failures only.
    fn remove(&mut self, id: SampleId) -> Result<bool, SampleError>;

    /// Point lookup by id.
    ///
    /// # Errors
    /// Backend failures only.
    fn get(&self, id: SampleId) -> Result<Option<Sample>, SampleError>;

    /// Every sample in storage order.
    ///
    /// # Errors
    /// Backend failures only.
    fn list_all(&self) -> Result<Vec<Sample>, SampleError>;

    /// Samples whose outcome equals the given value, relative storage order
    /// preserved. Samples without an outcome never match.
    ///
    /// # Errors
    /// Backend failures only.
    fn filter_by_outcome(&self, outcome: Outcome) -> Result<Vec<Sample>, SampleError>;

    /// Read-only projection sorted by `taken_at`; equal timestamps keep
    /// their storage order in both directions.
    ///
    /// # Errors
    /// Backend failures only.
    fn sort_by_time(&self, oldest_first: bool) -> Result<Vec<Sample>, SampleError>;
}

/// In-memory store variant: insertion-ordered, linear scans.
#[derive(Debug, Clone)]
pub struct MemorySampleStore {
    samples: Vec<Sample>,
    ids: SampleIdAllocator,
    ruleset: MeasurementRuleset,
}

impl MemorySampleStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
            ids: SampleIdAllocator::new(),
            ruleset: MeasurementRuleset::standard(),
        }
    }

    /// # Errors
    /// Returns [`SampleError::Configuration`] for a misordered ruleset.
    pub fn with_ruleset(ruleset: MeasurementRuleset) -> Result<Self, SampleError> {
        ruleset.validate()?;
        Ok(Self {
            samples: Vec::new(),
            ids: SampleIdAllocator::new(),
            ruleset,
        })
    }

    #[must_use]
    pub fn ruleset(&self) -> &MeasurementRuleset {
        &self.ruleset
    }
}

impl Default for MemorySampleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleStore for MemorySampleStore {
    fn add(&mut self, sample: Sample) -> Result<(), SampleError> {
        if self.samples.iter().any(|held| held.id() == sample.id()) {
            return Err(SampleError::DuplicateId(sample.id()));
        }

        self.ids.observe(sample.id());
        self.samples.push(sample);
        Ok(())
    }

    fn add_pending(&mut self, taken_at: OffsetDateTime) -> Result<SampleId, SampleError> {
        let sample = Sample::new(&mut self.ids, taken_at);
        let id = sample.id();
        self.add(sample)?;
        Ok(id)
    }

    fn add_measured(
        &mut self,
        taken_at: OffsetDateTime,
        measurement: i64,
    ) -> Result<SampleId, SampleError> {
        let sample = Sample::measured(&mut self.ids, taken_at, measurement, &self.ruleset)?;
        let id = sample.id();
        self.add(sample)?;
        Ok(id)
    }

    fn add_measurement(&mut self, id: SampleId, measurement: i64) -> Result<bool, SampleError> {
        let ruleset = self.ruleset;
        let Some(sample) = self.samples.iter_mut().find(|held| held.id() == id) else {
            return Ok(false);
        };

        if sample.measurement().is_some() {
            return Ok(false);
        }

        sample.set_measurement(measurement, &ruleset)?;
        Ok(true)
    }

    fn remove(&mut self, id: SampleId) -> Result<bool, SampleError> {
        let Some(position) = self.samples.iter().position(|held| held.id() == id) else {
            return Ok(false);
        };

        let _ = self.samples.remove(position);
        Ok(true)
    }

    fn get(&self, id: SampleId) -> Result<Option<Sample>, SampleError> {
        Ok(self
            .samples
            .iter()
            .find(|held| held.id() == id)
            .cloned())
    }

    fn list_all(&self) -> Result<Vec<Sample>, SampleError> {
        Ok(self.samples.clone())
    }

    fn filter_by_outcome(&self, outcome: Outcome) -> Result<Vec<Sample>, SampleError> {
        Ok(self
            .samples
            .iter()
            .filter(|held| held.outcome() == Some(outcome))
            .cloned()
            .collect())
    }

    fn sort_by_time(&self, oldest_first: bool) -> Result<Vec<Sample>, SampleError> {
        let mut sorted = self.samples.clone();
        if oldest_first {
            sorted.sort_by(|lhs, rhs| lhs.taken_at().cmp(&rhs.taken_at()));
        } else {
            sorted.sort_by(|lhs, rhs| rhs.taken_at().cmp(&lhs.taken_at()));
        }
        Ok(sorted)
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`SampleError::InvalidTimestamp`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, SampleError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| SampleError::InvalidTimestamp(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(SampleError::InvalidTimestamp(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`SampleError::InvalidTimestamp`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, SampleError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            SampleError::InvalidTimestamp(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
