//! Snapshot parsers and attribute checkers for the senate site bill and calendar feeds.

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use spotcheck_core::{Dump, Keyed, Mismatch, MismatchType, ParseIdError, ReferenceType};
use thiserror::Error;

pub const CRATE_NAME: &str = "spotcheck-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("malformed {format} payload in dump {dump_id}: {reason}")]
    MalformedPayload {
        format: &'static str,
        dump_id: String,
        reason: String,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Decodes a dump payload into reference records.
pub trait SnapshotParser<R>: Send + Sync {
    fn format(&self) -> &'static str;

    fn parse(&self, dump: &Dump, payload: &[u8]) -> Result<Vec<R>, AdapterError>;
}

/// Compares a local entity with its reference counterpart.
pub trait Checker<E, R>: Send + Sync {
    /// Taxonomy members this checker can emit, in rule order.
    fn rules(&self) -> &'static [MismatchType];

    fn check(&self, local: &E, reference: &R) -> Vec<Mismatch>;
}

#[derive(Debug, Deserialize)]
struct SenateSitePayload<R> {
    items: Vec<R>,
}

/// Parser for the senate site JSON export: `{"items": [...]}`.
#[derive(Debug)]
pub struct SenateSiteJsonParser<R> {
    _record: PhantomData<fn() -> R>,
}

impl<R> SenateSiteJsonParser<R> {
    pub const FORMAT: &'static str = "senate-site-json";

    pub fn new() -> Self {
        Self {
            _record: PhantomData,
        }
    }
}

impl<R> Default for SenateSiteJsonParser<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: DeserializeOwned> SnapshotParser<R> for SenateSiteJsonParser<R> {
    fn format(&self) -> &'static str {
        Self::FORMAT
    }

    fn parse(&self, dump: &Dump, payload: &[u8]) -> Result<Vec<R>, AdapterError> {
        let decoded: SenateSitePayload<R> =
            serde_json::from_slice(payload).map_err(|err| AdapterError::MalformedPayload {
                format: Self::FORMAT,
                dump_id: dump.id.clone(),
                reason: err.to_string(),
            })?;
        Ok(decoded.items)
    }
}

/// Static description of the parser and checker wired for a reference type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterInfo {
    pub reference_type: ReferenceType,
    pub parser_format: &'static str,
    pub rules: &'static [MismatchType],
}

pub fn adapter_info(reference_type: ReferenceType) -> AdapterInfo {
    match reference_type {
        ReferenceType::SenateSiteBills => AdapterInfo {
            reference_type,
            parser_format: SenateSiteJsonParser::<SenateSiteBill>::FORMAT,
            rules: BillChecker.rules(),
        },
        ReferenceType::SenateSiteCalendars => AdapterInfo {
            reference_type,
            parser_format: SenateSiteJsonParser::<SenateSiteCalendar>::FORMAT,
            rules: CalendarChecker.rules(),
        },
    }
}

pub fn normalize_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn check_value(out: &mut Vec<Mismatch>, mismatch_type: MismatchType, reference: &str, observed: &str) {
    if reference.trim() != observed.trim() {
        out.push(Mismatch::new(mismatch_type, reference, observed));
    }
}

fn check_text(out: &mut Vec<Mismatch>, mismatch_type: MismatchType, reference: &str, observed: &str) {
    if normalize_whitespace(reference) != normalize_whitespace(observed) {
        out.push(Mismatch::new(mismatch_type, reference, observed));
    }
}

/// One side absent is a presence mismatch; both present but unequal is a value mismatch.
fn check_optional(
    out: &mut Vec<Mismatch>,
    presence_type: MismatchType,
    value_type: MismatchType,
    reference: Option<&str>,
    observed: Option<&str>,
) {
    match (non_blank(reference), non_blank(observed)) {
        (Some(r), Some(o)) => check_text(out, value_type, r, o),
        (Some(r), None) => out.push(Mismatch::new(presence_type, r, "")),
        (None, Some(o)) => out.push(Mismatch::new(presence_type, "", o)),
        (None, None) => {}
    }
}

fn check_list(out: &mut Vec<Mismatch>, mismatch_type: MismatchType, reference: &[String], observed: &[String]) {
    let reference = reference.join("\n");
    let observed = observed.join("\n");
    if reference != observed {
        out.push(Mismatch::new(mismatch_type, reference, observed));
    }
}

/// Base print number plus session year, rendered `S1234-2023`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BillId {
    pub session: i32,
    pub print_no: String,
}

impl BillId {
    pub fn new(print_no: &str, session: i32) -> Self {
        Self {
            session,
            print_no: print_no.trim().to_ascii_uppercase(),
        }
    }
}

impl fmt::Display for BillId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.print_no, self.session)
    }
}

impl FromStr for BillId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (print_no, session) = s
            .trim()
            .rsplit_once('-')
            .ok_or_else(|| ParseIdError::new("bill id", s))?;
        let session = session
            .parse::<i32>()
            .map_err(|_| ParseIdError::new("bill id", s))?;
        let valid_print_no = print_no
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
            && print_no.chars().skip(1).all(|c| c.is_ascii_alphanumeric());
        if !valid_print_no {
            return Err(ParseIdError::new("bill id", s));
        }
        Ok(Self::new(print_no, session))
    }
}

impl TryFrom<String> for BillId {
    type Error = ParseIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BillId> for String {
    fn from(value: BillId) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillAction {
    pub date: NaiveDate,
    pub text: String,
}

impl BillAction {
    fn render(&self) -> String {
        format!("{} {}", self.date, normalize_whitespace(&self.text))
    }
}

/// Local canonical bill record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bill {
    pub bill_id: BillId,
    #[serde(default)]
    pub active_version: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub sponsor: Option<String>,
    #[serde(default)]
    pub cosponsors: Vec<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub law_section: Option<String>,
    #[serde(default)]
    pub actions: Vec<BillAction>,
}

impl Keyed<BillId> for Bill {
    fn content_id(&self) -> BillId {
        self.bill_id.clone()
    }
}

/// Bill record as published in the senate site export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenateSiteBill {
    pub base_print_no: String,
    pub session_year: i32,
    #[serde(default)]
    pub active_version: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub sponsor: Option<String>,
    #[serde(default)]
    pub co_sponsors: Vec<String>,
    #[serde(default)]
    pub last_status: Option<String>,
    #[serde(default)]
    pub law_section: Option<String>,
    #[serde(default)]
    pub actions: Vec<BillAction>,
}

impl Keyed<BillId> for SenateSiteBill {
    fn content_id(&self) -> BillId {
        BillId::new(&self.base_print_no, self.session_year)
    }
}

pub struct BillChecker;

const BILL_RULES: &[MismatchType] = &[
    MismatchType::ActiveAmendmentMismatch,
    MismatchType::TitleMismatch,
    MismatchType::SummaryMismatch,
    MismatchType::SponsorPresenceMismatch,
    MismatchType::SponsorMismatch,
    MismatchType::CosponsorMismatch,
    MismatchType::StatusPresenceMismatch,
    MismatchType::StatusMismatch,
    MismatchType::LawSectionPresenceMismatch,
    MismatchType::LawSectionMismatch,
    MismatchType::ActionMismatch,
];

impl Checker<Bill, SenateSiteBill> for BillChecker {
    fn rules(&self) -> &'static [MismatchType] {
        BILL_RULES
    }

    fn check(&self, local: &Bill, reference: &SenateSiteBill) -> Vec<Mismatch> {
        let mut out = Vec::new();
        check_value(
            &mut out,
            MismatchType::ActiveAmendmentMismatch,
            &reference.active_version.to_ascii_uppercase(),
            &local.active_version.to_ascii_uppercase(),
        );
        check_text(&mut out, MismatchType::TitleMismatch, &reference.title, &local.title);
        check_text(&mut out, MismatchType::SummaryMismatch, &reference.summary, &local.summary);
        check_optional(
            &mut out,
            MismatchType::SponsorPresenceMismatch,
            MismatchType::SponsorMismatch,
            reference.sponsor.as_deref(),
            local.sponsor.as_deref(),
        );
        check_list(
            &mut out,
            MismatchType::CosponsorMismatch,
            &reference.co_sponsors,
            &local.cosponsors,
        );
        check_optional(
            &mut out,
            MismatchType::StatusPresenceMismatch,
            MismatchType::StatusMismatch,
            reference.last_status.as_deref(),
            local.status.as_deref(),
        );
        check_optional(
            &mut out,
            MismatchType::LawSectionPresenceMismatch,
            MismatchType::LawSectionMismatch,
            reference.law_section.as_deref(),
            local.law_section.as_deref(),
        );
        check_list(
            &mut out,
            MismatchType::ActionMismatch,
            &reference.actions.iter().map(BillAction::render).collect::<Vec<_>>(),
            &local.actions.iter().map(BillAction::render).collect::<Vec<_>>(),
        );
        out
    }
}

/// Calendar year plus calendar number, rendered `2024-12`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CalendarId {
    pub year: i32,
    pub number: u32,
}

impl fmt::Display for CalendarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.year, self.number)
    }
}

impl FromStr for CalendarId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, number) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| ParseIdError::new("calendar id", s))?;
        Ok(Self {
            year: year.parse().map_err(|_| ParseIdError::new("calendar id", s))?,
            number: number.parse().map_err(|_| ParseIdError::new("calendar id", s))?,
        })
    }
}

impl TryFrom<String> for CalendarId {
    type Error = ParseIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CalendarId> for String {
    fn from(value: CalendarId) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEntry {
    pub cal_no: u32,
    pub bill_id: BillId,
}

/// Local canonical floor calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calendar {
    pub calendar_id: CalendarId,
    pub cal_date: NaiveDate,
    #[serde(default)]
    pub release_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: Vec<CalendarEntry>,
}

impl Keyed<CalendarId> for Calendar {
    fn content_id(&self) -> CalendarId {
        self.calendar_id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenateSiteCalendarEntry {
    pub bill_cal_no: u32,
    pub print_no: String,
    pub session_year: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenateSiteCalendar {
    pub year: i32,
    pub calendar_number: u32,
    pub cal_date: NaiveDate,
    #[serde(default)]
    pub release_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: Vec<SenateSiteCalendarEntry>,
}

impl Keyed<CalendarId> for SenateSiteCalendar {
    fn content_id(&self) -> CalendarId {
        CalendarId {
            year: self.year,
            number: self.calendar_number,
        }
    }
}

pub struct CalendarChecker;

const CALENDAR_RULES: &[MismatchType] = &[
    MismatchType::CalendarDateMismatch,
    MismatchType::ReleaseTimePresenceMismatch,
    MismatchType::ReleaseTimeMismatch,
    MismatchType::CalendarEntryMismatch,
];

impl Checker<Calendar, SenateSiteCalendar> for CalendarChecker {
    fn rules(&self) -> &'static [MismatchType] {
        CALENDAR_RULES
    }

    fn check(&self, local: &Calendar, reference: &SenateSiteCalendar) -> Vec<Mismatch> {
        let mut out = Vec::new();
        check_value(
            &mut out,
            MismatchType::CalendarDateMismatch,
            &reference.cal_date.to_string(),
            &local.cal_date.to_string(),
        );
        let reference_release = reference.release_date_time.map(|t| t.to_rfc3339());
        let local_release = local.release_time.map(|t| t.to_rfc3339());
        check_optional(
            &mut out,
            MismatchType::ReleaseTimePresenceMismatch,
            MismatchType::ReleaseTimeMismatch,
            reference_release.as_deref(),
            local_release.as_deref(),
        );
        check_list(
            &mut out,
            MismatchType::CalendarEntryMismatch,
            &reference
                .entries
                .iter()
                .map(|e| format!("{} {}", e.bill_cal_no, BillId::new(&e.print_no, e.session_year)))
                .collect::<Vec<_>>(),
            &local
                .entries
                .iter()
                .map(|e| format!("{} {}", e.cal_no, e.bill_id))
                .collect::<Vec<_>>(),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use spotcheck_core::CoverageInterval;
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::{Path, PathBuf};

    #[derive(Debug, Deserialize)]
    struct LocalFixture<E> {
        entities: Vec<E>,
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture_path(stream: &str, file: &str) -> PathBuf {
        workspace_root()
            .join("fixtures")
            .join(stream)
            .join("sample")
            .join(file)
    }

    fn sample_dump(reference_type: ReferenceType) -> Dump {
        let coverage = CoverageInterval::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).single().unwrap(),
        );
        Dump {
            id: Dump::default_id(reference_type, &coverage),
            reference_type,
            coverage,
            complete: true,
            payload: "payload.json".into(),
            processed: false,
        }
    }

    fn read_snapshot(stream: &str) -> BTreeMap<String, Vec<MismatchType>> {
        let text = fs::read_to_string(fixture_path(stream, "snapshot.json")).expect("read snapshot");
        serde_json::from_str(&text).expect("parse snapshot")
    }

    fn golden<K, E, R>(
        stream: &str,
        reference_type: ReferenceType,
        checker: &dyn Checker<E, R>,
    ) -> BTreeMap<String, Vec<MismatchType>>
    where
        K: Ord + fmt::Display,
        E: Keyed<K> + DeserializeOwned,
        R: Keyed<K> + DeserializeOwned,
    {
        let payload = fs::read(fixture_path(stream, "payload.json")).expect("read payload");
        let records = SenateSiteJsonParser::<R>::new()
            .parse(&sample_dump(reference_type), &payload)
            .expect("parse payload");
        let local: LocalFixture<E> =
            serde_json::from_str(&fs::read_to_string(fixture_path(stream, "local.json")).unwrap())
                .expect("parse local fixture");
        let local = local
            .entities
            .into_iter()
            .map(|e| (e.content_id(), e))
            .collect::<BTreeMap<_, _>>();

        records
            .iter()
            .filter_map(|r| {
                let entity = local.get(&r.content_id())?;
                let types = checker
                    .check(entity, r)
                    .into_iter()
                    .map(|m| m.mismatch_type)
                    .collect::<Vec<_>>();
                Some((r.content_id().to_string(), types))
            })
            .collect()
    }

    fn sample_bill() -> Bill {
        Bill {
            bill_id: "S1-2023".parse().unwrap(),
            active_version: "A".into(),
            title: "An act to amend the tax law".into(),
            summary: "Summary".into(),
            sponsor: Some("KRUEGER".into()),
            cosponsors: vec!["LIU".into()],
            status: Some("IN_SENATE_COMM".into()),
            law_section: Some("Tax Law".into()),
            actions: vec![BillAction {
                date: NaiveDate::from_ymd_opt(2023, 1, 4).unwrap(),
                text: "REFERRED TO FINANCE".into(),
            }],
        }
    }

    fn matching_reference(bill: &Bill) -> SenateSiteBill {
        SenateSiteBill {
            base_print_no: bill.bill_id.print_no.clone(),
            session_year: bill.bill_id.session,
            active_version: bill.active_version.clone(),
            title: bill.title.clone(),
            summary: bill.summary.clone(),
            sponsor: bill.sponsor.clone(),
            co_sponsors: bill.cosponsors.clone(),
            last_status: bill.status.clone(),
            law_section: bill.law_section.clone(),
            actions: bill.actions.clone(),
        }
    }

    #[test]
    fn golden_snapshot_senate_site_bills() {
        let actual = golden::<BillId, Bill, SenateSiteBill>(
            "senate-site-bills",
            ReferenceType::SenateSiteBills,
            &BillChecker,
        );
        assert_eq!(actual, read_snapshot("senate-site-bills"));
    }

    #[test]
    fn golden_snapshot_senate_site_calendars() {
        let actual = golden::<CalendarId, Calendar, SenateSiteCalendar>(
            "senate-site-calendars",
            ReferenceType::SenateSiteCalendars,
            &CalendarChecker,
        );
        assert_eq!(actual, read_snapshot("senate-site-calendars"));
    }

    #[test]
    fn identical_bills_produce_no_mismatches() {
        let bill = sample_bill();
        assert!(BillChecker.check(&bill, &matching_reference(&bill)).is_empty());
    }

    #[test]
    fn presence_and_inequality_are_distinct_types() {
        let bill = sample_bill();
        let mut reference = matching_reference(&bill);
        reference.sponsor = None;
        reference.last_status = Some("PASSED_SENATE".into());
        reference.law_section = Some("   ".into());

        let mismatches = BillChecker.check(&bill, &reference);
        let types = mismatches.iter().map(|m| m.mismatch_type).collect::<Vec<_>>();
        assert_eq!(
            types,
            vec![
                MismatchType::SponsorPresenceMismatch,
                MismatchType::StatusMismatch,
                MismatchType::LawSectionPresenceMismatch,
            ]
        );
        assert_eq!(mismatches[0].reference_data, "");
        assert_eq!(mismatches[0].observed_data, "KRUEGER");
        assert_eq!(mismatches[1].reference_data, "PASSED_SENATE");
    }

    #[test]
    fn free_text_ignores_whitespace_but_lists_keep_order() {
        let bill = sample_bill();
        let mut reference = matching_reference(&bill);
        reference.title = "An act  to amend\nthe tax law ".into();
        reference.co_sponsors = vec!["LIU".into(), "MAYER".into()];

        let mismatches = BillChecker.check(&bill, &reference);
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].mismatch_type, MismatchType::CosponsorMismatch);
        assert_eq!(mismatches[0].reference_data, "LIU\nMAYER");
        assert_eq!(mismatches[0].observed_data, "LIU");
    }

    #[test]
    fn calendar_release_time_presence_vs_value() {
        let local = Calendar {
            calendar_id: "2024-4".parse().unwrap(),
            cal_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            release_time: Some(Utc.with_ymd_and_hms(2024, 1, 10, 9, 0, 0).single().unwrap()),
            entries: Vec::new(),
        };
        let mut reference = SenateSiteCalendar {
            year: 2024,
            calendar_number: 4,
            cal_date: local.cal_date,
            release_date_time: Some(Utc.with_ymd_and_hms(2024, 1, 10, 9, 30, 0).single().unwrap()),
            entries: Vec::new(),
        };
        let types = |r: &SenateSiteCalendar| {
            CalendarChecker
                .check(&local, r)
                .into_iter()
                .map(|m| m.mismatch_type)
                .collect::<Vec<_>>()
        };
        assert_eq!(types(&reference), vec![MismatchType::ReleaseTimeMismatch]);
        reference.release_date_time = None;
        assert_eq!(types(&reference), vec![MismatchType::ReleaseTimePresenceMismatch]);
        reference.release_date_time = local.release_time;
        assert!(types(&reference).is_empty());
    }

    #[test]
    fn content_ids_parse_and_render() {
        let bill: BillId = "s1234-2023".parse().unwrap();
        assert_eq!(bill.to_string(), "S1234-2023");
        assert!("1234-2023".parse::<BillId>().is_err());
        assert!("S1234".parse::<BillId>().is_err());
        let calendar: CalendarId = "2024-12".parse().unwrap();
        assert_eq!(calendar, CalendarId { year: 2024, number: 12 });
        assert!("2024".parse::<CalendarId>().is_err());
    }

    #[test]
    fn malformed_payload_names_the_dump() {
        let dump = sample_dump(ReferenceType::SenateSiteBills);
        let err = SenateSiteJsonParser::<SenateSiteBill>::new()
            .parse(&dump, b"{\"items\": [{\"title\": 5}]}")
            .unwrap_err();
        match err {
            AdapterError::MalformedPayload { dump_id, format, .. } => {
                assert_eq!(dump_id, dump.id);
                assert_eq!(format, "senate-site-json");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn adapter_table_covers_every_reference_type() {
        for reference_type in ReferenceType::ALL {
            let info = adapter_info(reference_type);
            assert_eq!(info.reference_type, reference_type);
            assert!(!info.rules.is_empty());
        }
        assert_eq!(
            adapter_info(ReferenceType::SenateSiteCalendars).rules[0],
            MismatchType::CalendarDateMismatch
        );
    }
}
