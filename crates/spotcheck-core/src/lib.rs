//! Core reconciliation model: reference types, reports, observations, mismatches and dumps.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "spotcheck-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized {kind} `{input}`")]
pub struct ParseIdError {
    pub kind: &'static str,
    pub input: String,
}

impl ParseIdError {
    pub fn new(kind: &'static str, input: impl Into<String>) -> Self {
        Self {
            kind,
            input: input.into(),
        }
    }
}

/// Identifier of a reconciled record. Serializes as a string so it can key JSON maps.
pub trait ContentKey:
    Clone
    + Ord
    + Hash
    + fmt::Debug
    + fmt::Display
    + FromStr<Err = ParseIdError>
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> ContentKey for T where
    T: Clone
        + Ord
        + Hash
        + fmt::Debug
        + fmt::Display
        + FromStr<Err = ParseIdError>
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Anything that can report the content id it describes (local entities and reference records).
pub trait Keyed<K> {
    fn content_id(&self) -> K;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSource {
    Nysenate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ContentType {
    Bill,
    Calendar,
}

/// One reconciliation stream: an external feed paired with a local domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferenceType {
    SenateSiteBills,
    SenateSiteCalendars,
}

impl ReferenceType {
    pub const ALL: [ReferenceType; 2] = [Self::SenateSiteBills, Self::SenateSiteCalendars];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SenateSiteBills => "SENATE_SITE_BILLS",
            Self::SenateSiteCalendars => "SENATE_SITE_CALENDARS",
        }
    }

    pub fn data_source(&self) -> DataSource {
        match self {
            Self::SenateSiteBills | Self::SenateSiteCalendars => DataSource::Nysenate,
        }
    }

    pub fn content_type(&self) -> ContentType {
        match self {
            Self::SenateSiteBills => ContentType::Bill,
            Self::SenateSiteCalendars => ContentType::Calendar,
        }
    }
}

impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReferenceType {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| ParseIdError::new("reference type", s))
    }
}

/// Identity of a stored report. Unique per `(reference_type, reference_time)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReportId {
    pub reference_type: ReferenceType,
    /// Covered-end timestamp of the dump the report was built from.
    pub reference_time: DateTime<Utc>,
    pub generated_time: DateTime<Utc>,
}

impl ReportId {
    pub fn new(
        reference_type: ReferenceType,
        reference_time: DateTime<Utc>,
        generated_time: DateTime<Utc>,
    ) -> Self {
        Self {
            reference_type,
            reference_time,
            generated_time,
        }
    }

    pub fn key(&self) -> (ReferenceType, DateTime<Utc>) {
        (self.reference_type, self.reference_time)
    }

    pub fn same_report(&self, other: &ReportId) -> bool {
        self.key() == other.key()
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.reference_type, self.reference_time.to_rfc3339())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MismatchType {
    ReferenceDataMissing,
    ObserveDataMissing,
    ActiveAmendmentMismatch,
    TitleMismatch,
    SummaryMismatch,
    SponsorMismatch,
    SponsorPresenceMismatch,
    CosponsorMismatch,
    StatusMismatch,
    StatusPresenceMismatch,
    LawSectionMismatch,
    LawSectionPresenceMismatch,
    ActionMismatch,
    CalendarDateMismatch,
    ReleaseTimeMismatch,
    ReleaseTimePresenceMismatch,
    CalendarEntryMismatch,
}

impl MismatchType {
    pub const ALL: [MismatchType; 17] = [
        Self::ReferenceDataMissing,
        Self::ObserveDataMissing,
        Self::ActiveAmendmentMismatch,
        Self::TitleMismatch,
        Self::SummaryMismatch,
        Self::SponsorMismatch,
        Self::SponsorPresenceMismatch,
        Self::CosponsorMismatch,
        Self::StatusMismatch,
        Self::StatusPresenceMismatch,
        Self::LawSectionMismatch,
        Self::LawSectionPresenceMismatch,
        Self::ActionMismatch,
        Self::CalendarDateMismatch,
        Self::ReleaseTimeMismatch,
        Self::ReleaseTimePresenceMismatch,
        Self::CalendarEntryMismatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReferenceDataMissing => "REFERENCE_DATA_MISSING",
            Self::ObserveDataMissing => "OBSERVE_DATA_MISSING",
            Self::ActiveAmendmentMismatch => "ACTIVE_AMENDMENT_MISMATCH",
            Self::TitleMismatch => "TITLE_MISMATCH",
            Self::SummaryMismatch => "SUMMARY_MISMATCH",
            Self::SponsorMismatch => "SPONSOR_MISMATCH",
            Self::SponsorPresenceMismatch => "SPONSOR_PRESENCE_MISMATCH",
            Self::CosponsorMismatch => "COSPONSOR_MISMATCH",
            Self::StatusMismatch => "STATUS_MISMATCH",
            Self::StatusPresenceMismatch => "STATUS_PRESENCE_MISMATCH",
            Self::LawSectionMismatch => "LAW_SECTION_MISMATCH",
            Self::LawSectionPresenceMismatch => "LAW_SECTION_PRESENCE_MISMATCH",
            Self::ActionMismatch => "ACTION_MISMATCH",
            Self::CalendarDateMismatch => "CALENDAR_DATE_MISMATCH",
            Self::ReleaseTimeMismatch => "RELEASE_TIME_MISMATCH",
            Self::ReleaseTimePresenceMismatch => "RELEASE_TIME_PRESENCE_MISMATCH",
            Self::CalendarEntryMismatch => "CALENDAR_ENTRY_MISMATCH",
        }
    }

    /// Whether the member flags a value present on only one side.
    pub fn is_presence(&self) -> bool {
        matches!(
            self,
            Self::ReferenceDataMissing
                | Self::ObserveDataMissing
                | Self::SponsorPresenceMismatch
                | Self::StatusPresenceMismatch
                | Self::LawSectionPresenceMismatch
                | Self::ReleaseTimePresenceMismatch
        )
    }
}

impl fmt::Display for MismatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MismatchType {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| ParseIdError::new("mismatch type", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MismatchStatus {
    New,
    Existing,
    Resolved,
    Ignored,
}

impl MismatchStatus {
    pub fn is_open(&self, include_ignored: bool) -> bool {
        match self {
            Self::New | Self::Existing => true,
            Self::Ignored => include_ignored,
            Self::Resolved => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub mismatch_type: MismatchType,
    pub reference_data: String,
    pub observed_data: String,
    pub status: MismatchStatus,
    /// Reference time of the report that first carried this mismatch. Stamped at assembly.
    pub first_seen: Option<DateTime<Utc>>,
}

impl Mismatch {
    pub fn new(
        mismatch_type: MismatchType,
        reference_data: impl Into<String>,
        observed_data: impl Into<String>,
    ) -> Self {
        Self {
            mismatch_type,
            reference_data: reference_data.into(),
            observed_data: observed_data.into(),
            status: MismatchStatus::New,
            first_seen: None,
        }
    }

    /// Whole-record presence mismatch with no attribute values to display.
    pub fn missing(mismatch_type: MismatchType) -> Self {
        Self::new(mismatch_type, "", "")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = "K: ContentKey"))]
pub struct Observation<K: ContentKey> {
    pub content_id: K,
    pub mismatches: Vec<Mismatch>,
}

impl<K: ContentKey> Observation<K> {
    pub fn new(content_id: K) -> Self {
        Self {
            content_id,
            mismatches: Vec::new(),
        }
    }

    pub fn with_mismatch(content_id: K, mismatch: Mismatch) -> Self {
        let mut obs = Self::new(content_id);
        obs.add_mismatch(mismatch);
        obs
    }

    /// Adds the mismatch unless one of the same type is already recorded.
    pub fn add_mismatch(&mut self, mismatch: Mismatch) -> bool {
        if self.mismatch(mismatch.mismatch_type).is_some() {
            return false;
        }
        self.mismatches.push(mismatch);
        true
    }

    pub fn mismatch(&self, mismatch_type: MismatchType) -> Option<&Mismatch> {
        self.mismatches
            .iter()
            .find(|m| m.mismatch_type == mismatch_type)
    }

    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }

    pub fn open_mismatch_count(&self, include_ignored: bool) -> usize {
        self.mismatches
            .iter()
            .filter(|m| m.status.is_open(include_ignored))
            .count()
    }
}

/// Result of one reconciliation run. Immutable once assembled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = "K: ContentKey"))]
pub struct Report<K: ContentKey> {
    pub report_id: ReportId,
    pub observations: BTreeMap<K, Observation<K>>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl<K: ContentKey> Report<K> {
    pub fn reference_type(&self) -> ReferenceType {
        self.report_id.reference_type
    }

    pub fn observation(&self, content_id: &K) -> Option<&Observation<K>> {
        self.observations.get(content_id)
    }

    pub fn open_mismatch_count(&self, include_ignored: bool) -> usize {
        self.observations
            .values()
            .map(|obs| obs.open_mismatch_count(include_ignored))
            .sum()
    }

    pub fn status_count(&self, status: MismatchStatus) -> usize {
        self.mismatches().filter(|(_, m)| m.status == status).count()
    }

    pub fn mismatches(&self) -> impl Iterator<Item = (&K, &Mismatch)> {
        self.observations
            .iter()
            .flat_map(|(id, obs)| obs.mismatches.iter().map(move |m| (id, m)))
    }

    pub fn summary(&self) -> ReportSummary {
        ReportSummary {
            report_id: self.report_id.clone(),
            observations: self.observations.len(),
            open_mismatches: self.open_mismatch_count(false),
            ignored: self.status_count(MismatchStatus::Ignored),
            resolved: self.status_count(MismatchStatus::Resolved),
            notes: self.notes.clone(),
        }
    }
}

/// Accumulator threaded through assembly stages; produces the immutable [`Report`].
#[derive(Debug)]
pub struct ReportBuilder<K: ContentKey> {
    report_id: ReportId,
    observations: BTreeMap<K, Observation<K>>,
    notes: Vec<String>,
}

impl<K: ContentKey> ReportBuilder<K> {
    pub fn new(report_id: ReportId) -> Self {
        Self {
            report_id,
            observations: BTreeMap::new(),
            notes: Vec::new(),
        }
    }

    pub fn report_id(&self) -> &ReportId {
        &self.report_id
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// Merges into any existing observation for the same id, keeping one mismatch per type.
    pub fn add_observation(&mut self, observation: Observation<K>) {
        match self.observations.get_mut(&observation.content_id) {
            Some(existing) => {
                for mismatch in observation.mismatches {
                    existing.add_mismatch(mismatch);
                }
            }
            None => {
                self.observations
                    .insert(observation.content_id.clone(), observation);
            }
        }
    }

    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }

    pub fn mismatch_count(&self) -> usize {
        self.observations.values().map(|o| o.mismatches.len()).sum()
    }

    pub fn finish(self) -> Report<K> {
        let reference_time = self.report_id.reference_time;
        let mut observations = self.observations;
        for obs in observations.values_mut() {
            for mismatch in &mut obs.mismatches {
                mismatch.first_seen.get_or_insert(reference_time);
            }
        }
        Report {
            report_id: self.report_id,
            observations,
            notes: self.notes,
        }
    }
}

/// Coverage of a dump. Update tokens count as covered when `from < at <= to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageInterval {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl CoverageInterval {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    pub fn contains_update(&self, at: DateTime<Utc>) -> bool {
        at > self.from && at <= self.to
    }
}

/// An external snapshot awaiting reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dump {
    pub id: String,
    pub reference_type: ReferenceType,
    pub coverage: CoverageInterval,
    pub complete: bool,
    /// Provider-specific locator of the raw payload.
    pub payload: String,
    pub processed: bool,
}

impl Dump {
    pub fn default_id(reference_type: ReferenceType, coverage: &CoverageInterval) -> String {
        format!(
            "{}-{}-{}",
            reference_type,
            coverage.from.format("%Y%m%dT%H%M%S"),
            coverage.to.format("%Y%m%dT%H%M%S")
        )
    }
}

/// Timestamp on an update token that candidate selection keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateKind {
    #[default]
    ProcessedDate,
    PublishedDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = "K: ContentKey"))]
pub struct UpdateToken<K: ContentKey> {
    pub content_id: K,
    pub processed_at: DateTime<Utc>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

impl<K: ContentKey> UpdateToken<K> {
    pub fn new(content_id: K, processed_at: DateTime<Utc>) -> Self {
        Self {
            content_id,
            processed_at,
            published_at: None,
        }
    }

    pub fn with_published_at(mut self, published_at: DateTime<Utc>) -> Self {
        self.published_at = Some(published_at);
        self
    }

    pub fn timestamp(&self, kind: UpdateKind) -> Option<DateTime<Utc>> {
        match kind {
            UpdateKind::ProcessedDate => Some(self.processed_at),
            UpdateKind::PublishedDate => self.published_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortOrder {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            _ => Err(ParseIdError::new("sort order", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub report_id: ReportId,
    pub observations: usize,
    pub open_mismatches: usize,
    pub ignored: usize,
    pub resolved: usize,
    pub notes: Vec<String>,
}

/// Display form of a report with string content ids, independent of the stream's key type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportView {
    pub report_id: ReportId,
    pub data_source: DataSource,
    pub content_type: ContentType,
    pub summary: ReportSummary,
    pub observations: Vec<ObservationView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationView {
    pub content_id: String,
    pub mismatches: Vec<Mismatch>,
}

impl<K: ContentKey> From<&Report<K>> for ReportView {
    fn from(report: &Report<K>) -> Self {
        let reference_type = report.reference_type();
        Self {
            report_id: report.report_id.clone(),
            data_source: reference_type.data_source(),
            content_type: reference_type.content_type(),
            summary: report.summary(),
            observations: report
                .observations
                .values()
                .map(|obs| ObservationView {
                    content_id: obs.content_id.to_string(),
                    mismatches: obs.mismatches.clone(),
                })
                .collect(),
        }
    }
}
