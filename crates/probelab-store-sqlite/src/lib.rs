#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use probelab_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, MeasurementRuleset, Outcome, Sample, SampleError,
    SampleId, SampleIdAllocator, SampleStore,
};
use rusqlite::{params, Connection, OptionalExtension};

const SAMPLE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_SAMPLES_V1: &str = r"
CREATE TABLE IF NOT EXISTS samples (
  sample_id INTEGER PRIMARY KEY,
  taken_at TEXT NOT NULL,
  measurement INTEGER,
  outcome TEXT CHECK (outcome IN ('positive', 'negative', 'indeterminate') OR outcome IS NULL),
  CHECK ((measurement IS NULL) = (outcome IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_samples_outcome ON samples(outcome);
CREATE INDEX IF NOT EXISTS idx_samples_taken_at ON samples(taken_at);
";

/// SQLite-backed store variant.
///
/// Satisfies the same [`SampleStore`] contract as the in-memory variant;
/// rows are rehydrated through the trusted-load constructor and the id
/// allocator is advanced past every stored id during [`Self::migrate`].
pub struct SqliteSampleStore {
    conn: Connection,
    ids: SampleIdAllocator,
    ruleset: MeasurementRuleset,
}

impl SqliteSampleStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_ruleset(path, MeasurementRuleset::standard())
    }

    pub fn open_with_ruleset(path: &Path, ruleset: MeasurementRuleset) -> Result<Self> {
        ruleset
            .validate()
            .map_err(|err| anyhow!("invalid measurement ruleset: {err}"))?;

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            ids: SampleIdAllocator::new(),
            ruleset,
        })
    }

    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_SAMPLES_V1)
            .context("failed to apply samples schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SAMPLE_MIGRATION_VERSION, now],
            )
            .context("failed to register samples schema migration")?;

        self.sync_allocator()
    }

    #[must_use]
    pub fn ruleset(&self) -> &MeasurementRuleset {
        &self.ruleset
    }

    // Rehydration counter advance: future allocations must never collide
    // with ids already persisted.
    fn sync_allocator(&mut self) -> Result<()> {
        let highest = self
            .conn
            .query_row("SELECT MAX(sample_id) FROM samples", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .context("failed to query highest stored sample_id")?;

        if let Some(raw) = highest {
            let id =
                u64::try_from(raw).with_context(|| format!("invalid stored sample_id: {raw}"))?;
            self.ids.observe(SampleId(id));
        }

        Ok(())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl SampleStore for SqliteSampleStore {
    fn add(&mut self, sample: Sample) -> Result<(), SampleError> {
        let id = sample.id();
        let row_id = sample_row_id(id)?;
        let taken_at = format_rfc3339(sample.taken_at())?;

        self.conn
            .execute(
                "INSERT INTO samples(sample_id, taken_at, measurement, outcome)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    row_id,
                    taken_at,
                    sample.measurement(),
                    sample.outcome().map(Outcome::as_str),
                ],
            )
            .map_err(|err| translate_insert_error(id, err))?;

        self.ids.observe(id);
        Ok(())
    }

    fn add_pending(&mut self, taken_at: time::OffsetDateTime) -> Result<SampleId, SampleError> {
        let sample = Sample::new(&mut self.ids, taken_at);
        let id = sample.id();
        self.add(sample)?;
        Ok(id)
    }

    fn add_measured(
        &mut self,
        taken_at: time::OffsetDateTime,
        measurement: i64,
    ) -> Result<SampleId, SampleError> {
        let sample = Sample::measured(&mut self.ids, taken_at, measurement, &self.ruleset)?;
        let id = sample.id();
        self.add(sample)?;
        Ok(id)
    }

    fn add_measurement(&mut self, id: SampleId, measurement: i64) -> Result<bool, SampleError> {
        let Some(sample) = self.get(id)? else {
            return Ok(false);
        };

        if sample.measurement().is_some() {
            return Ok(false);
        }

        self.ruleset.check(measurement)?;
        let outcome = self.ruleset.classify(measurement);

        let affected = self
            .conn
            .execute(
                "UPDATE samples SET measurement = ?1, outcome = ?2 WHERE sample_id = ?3",
                params![measurement, outcome.as_str(), sample_row_id(id)?],
            )
            .map_err(storage_error)?;

        Ok(affected > 0)
    }

    fn remove(&mut self, id: SampleId) -> Result<bool, SampleError> {
        let Ok(row_id) = i64::try_from(id.0) else {
            return Ok(false);
        };

        let affected = self
            .conn
            .execute("DELETE FROM samples WHERE sample_id = ?1", params![row_id])
            .map_err(storage_error)?;

        Ok(affected > 0)
    }

    fn get(&self, id: SampleId) -> Result<Option<Sample>, SampleError> {
        let Ok(row_id) = i64::try_from(id.0) else {
            return Ok(None);
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT sample_id, taken_at, measurement, outcome
                 FROM samples
                 WHERE sample_id = ?1",
            )
            .map_err(storage_error)?;

        stmt.query_row(params![row_id], parse_sample_row)
            .optional()
            .map_err(storage_error)
    }

    fn list_all(&self) -> Result<Vec<Sample>, SampleError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT sample_id, taken_at, measurement, outcome
                 FROM samples
                 ORDER BY sample_id ASC",
            )
            .map_err(storage_error)?;

        let rows = stmt
            .query_map([], parse_sample_row)
            .map_err(storage_error)?;
        collect_rows(rows)
    }

    fn filter_by_outcome(&self, outcome: Outcome) -> Result<Vec<Sample>, SampleError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT sample_id, taken_at, measurement, outcome
                 FROM samples
                 WHERE outcome = ?1
                 ORDER BY sample_id ASC",
            )
            .map_err(storage_error)?;

        let rows = stmt
            .query_map(params![outcome.as_str()], parse_sample_row)
            .map_err(storage_error)?;
        collect_rows(rows)
    }

    fn sort_by_time(&self, oldest_first: bool) -> Result<Vec<Sample>, SampleError> {
        // RFC3339 text stops ordering correctly once sub-second digits
        // appear, so rows are loaded in storage order and sorted here,
        // which also gives the same tie behavior as the in-memory variant.
        let mut sorted = self.list_all()?;
        if oldest_first {
            sorted.sort_by(|lhs, rhs| lhs.taken_at().cmp(&rhs.taken_at()));
        } else {
            sorted.sort_by(|lhs, rhs| rhs.taken_at().cmp(&lhs.taken_at()));
        }
        Ok(sorted)
    }
}

fn parse_sample_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sample> {
    let id_raw: i64 = row.get(0)?;
    let taken_at_raw: String = row.get(1)?;
    let measurement: Option<i64> = row.get(2)?;
    let outcome_raw: Option<String> = row.get(3)?;

    let id = u64::try_from(id_raw).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid sample_id value: {id_raw}"),
            )),
        )
    })?;

    let taken_at = parse_rfc3339_utc(&taken_at_raw).map_err(to_sql_error)?;

    let outcome = outcome_raw
        .as_deref()
        .map(|raw| {
            Outcome::parse(raw).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    Box::new(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("invalid outcome: {raw}"),
                    )),
                )
            })
        })
        .transpose()?;

    Ok(Sample::rehydrated(
        SampleId(id),
        taken_at,
        measurement,
        outcome,
    ))
}

fn sample_row_id(id: SampleId) -> Result<i64, SampleError> {
    i64::try_from(id.0)
        .map_err(|_| SampleError::Storage(format!("sample id {id} exceeds sqlite integer range")))
}

fn translate_insert_error(id: SampleId, err: rusqlite::Error) -> SampleError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY {
            return SampleError::DuplicateId(id);
        }
    }

    storage_error(err)
}

fn storage_error(err: rusqlite::Error) -> SampleError {
    SampleError::Storage(err.to_string())
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: SampleError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>, SampleError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.map_err(storage_error)?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use time::{Duration, OffsetDateTime};

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn utc(raw: &str) -> OffsetDateTime {
        must(parse_rfc3339_utc(raw))
    }

    fn base_time() -> OffsetDateTime {
        utc("2001-01-01T00:00:00Z")
    }

    fn sqlite_store() -> SqliteSampleStore {
        let mut store = must(SqliteSampleStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn temp_db_path(label: &str) -> PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "probelab-{label}-{}-{unique}.sqlite3",
            std::process::id()
        ))
    }

    /// Runs a behavioral test against both store variants; the contract is
    /// identical from the caller's perspective.
    fn with_each_store(test: impl Fn(&mut dyn SampleStore)) {
        let mut memory = probelab_core::MemorySampleStore::new();
        test(&mut memory);

        let mut sqlite = sqlite_store();
        test(&mut sqlite);
    }

    // Mirrors the original working set: negative at t+1d, indeterminate at
    // t, positive at t+2d, and an open sample at t+7d.
    fn seed_working_set(store: &mut dyn SampleStore) -> [SampleId; 4] {
        let negative = must(store.add_measured(base_time() + Duration::days(1), 50));
        let indeterminate = must(store.add_measured(base_time(), 150));
        let positive = must(store.add_measured(base_time() + Duration::days(2), 900));
        let open = must(store.add_pending(base_time() + Duration::days(7)));
        [negative, indeterminate, positive, open]
    }

    #[test]
    fn list_all_reports_the_full_working_set() {
        with_each_store(|store| {
            let ids = seed_working_set(store);

            let all = must(store.list_all());
            assert_eq!(all.len(), 4);
            for id in ids {
                assert!(all.iter().any(|sample| sample.id() == id));
            }
        });
    }

    #[test]
    fn queries_on_empty_store_return_empty() {
        with_each_store(|store| {
            assert!(must(store.list_all()).is_empty());
            assert!(must(store.filter_by_outcome(Outcome::Positive)).is_empty());
            assert!(must(store.sort_by_time(true)).is_empty());
            assert_eq!(must(store.get(SampleId(1))), None);
        });
    }

    #[test]
    fn sort_by_time_orders_oldest_or_newest_first() {
        with_each_store(|store| {
            let [negative, indeterminate, positive, open] = seed_working_set(store);

            let oldest_first = must(store.sort_by_time(true));
            let ids: Vec<SampleId> = oldest_first.iter().map(Sample::id).collect();
            assert_eq!(ids, vec![indeterminate, negative, positive, open]);

            let newest_first = must(store.sort_by_time(false));
            let ids: Vec<SampleId> = newest_first.iter().map(Sample::id).collect();
            assert_eq!(ids, vec![open, positive, negative, indeterminate]);
        });
    }

    #[test]
    fn sort_by_time_is_a_projection_not_a_mutation() {
        with_each_store(|store| {
            let before: Vec<SampleId> = {
                seed_working_set(store);
                must(store.list_all()).iter().map(Sample::id).collect()
            };

            let _ = must(store.sort_by_time(false));

            let after: Vec<SampleId> = must(store.list_all()).iter().map(Sample::id).collect();
            assert_eq!(before, after);
        });
    }

    #[test]
    fn equal_timestamps_keep_storage_order_in_both_directions() {
        with_each_store(|store| {
            let first = must(store.add_measured(base_time(), 50));
            let second = must(store.add_measured(base_time(), 900));
            let third = must(store.add_pending(base_time()));

            let expected = vec![first, second, third];

            let ascending: Vec<SampleId> =
                must(store.sort_by_time(true)).iter().map(Sample::id).collect();
            assert_eq!(ascending, expected);

            let descending: Vec<SampleId> =
                must(store.sort_by_time(false)).iter().map(Sample::id).collect();
            assert_eq!(descending, expected);
        });
    }

    #[test]
    fn filter_by_outcome_returns_the_exact_subset_in_storage_order() {
        with_each_store(|store| {
            let [negative, indeterminate, positive, _open] = seed_working_set(store);

            let negatives = must(store.filter_by_outcome(Outcome::Negative));
            assert_eq!(negatives.len(), 1);
            assert_eq!(negatives[0].id(), negative);

            let indeterminates = must(store.filter_by_outcome(Outcome::Indeterminate));
            assert_eq!(indeterminates.len(), 1);
            assert_eq!(indeterminates[0].id(), indeterminate);

            let positives = must(store.filter_by_outcome(Outcome::Positive));
            assert_eq!(positives.len(), 1);
            assert_eq!(positives[0].id(), positive);

            // The filtered view is exactly the matching subsequence of the
            // full listing.
            let all = must(store.list_all());
            let expected: Vec<SampleId> = all
                .iter()
                .filter(|sample| sample.outcome() == Some(Outcome::Negative))
                .map(Sample::id)
                .collect();
            let actual: Vec<SampleId> = negatives.iter().map(Sample::id).collect();
            assert_eq!(actual, expected);
        });
    }

    #[test]
    fn remove_is_idempotent() {
        with_each_store(|store| {
            let [negative, ..] = seed_working_set(store);

            assert!(must(store.remove(negative)));
            assert!(!must(store.remove(negative)));
            assert_eq!(must(store.list_all()).len(), 3);
            assert_eq!(must(store.get(negative)), None);
        });
    }

    #[test]
    fn removing_an_unknown_id_leaves_the_store_unchanged() {
        with_each_store(|store| {
            let _ = must(store.add_pending(base_time()));
            let _ = must(store.add_pending(base_time()));
            let _ = must(store.add_pending(base_time()));

            assert!(!must(store.remove(SampleId(99))));
            assert_eq!(must(store.list_all()).len(), 3);
        });
    }

    #[test]
    fn add_measurement_fills_only_open_samples() {
        with_each_store(|store| {
            let [negative, _, _, open] = seed_working_set(store);

            assert!(must(store.add_measurement(open, 150)));
            let filled = must_some(must(store.get(open)));
            assert_eq!(filled.measurement(), Some(150));
            assert_eq!(filled.outcome(), Some(Outcome::Indeterminate));

            // Unknown id: nothing happens, nothing is created.
            assert!(!must(store.add_measurement(SampleId(99), 100)));
            assert_eq!(must(store.list_all()).len(), 4);

            // Already measured: untouched.
            assert!(!must(store.add_measurement(negative, 150)));
            let untouched = must_some(must(store.get(negative)));
            assert_eq!(untouched.measurement(), Some(50));
            assert_eq!(untouched.outcome(), Some(Outcome::Negative));
        });
    }

    #[test]
    fn out_of_range_measurements_are_rejected_without_mutation() {
        with_each_store(|store| {
            let open = must(store.add_pending(base_time()));

            let result = store.add_measurement(open, 1001);
            assert!(matches!(result, Err(SampleError::InvalidMeasurement(_))));
            let untouched = must_some(must(store.get(open)));
            assert_eq!(untouched.measurement(), None);
            assert_eq!(untouched.outcome(), None);

            let result = store.add_measured(base_time(), -1);
            assert!(matches!(result, Err(SampleError::InvalidMeasurement(_))));
            assert_eq!(must(store.list_all()).len(), 1);
        });
    }

    #[test]
    fn first_sample_in_the_indeterminate_band_is_classified_as_such() {
        with_each_store(|store| {
            let id = must(store.add_measured(base_time(), 150));

            let all = must(store.list_all());
            assert_eq!(all.len(), 1);
            assert_eq!(all[0].id(), id);
            assert_eq!(all[0].outcome(), Some(Outcome::Indeterminate));
        });
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        with_each_store(|store| {
            let mut ids = SampleIdAllocator::new();
            let original = Sample::new(&mut ids, base_time());
            let id = original.id();
            let duplicate = Sample::rehydrated(id, base_time() + Duration::days(1), None, None);

            must(store.add(original));
            let result = store.add(duplicate);
            assert!(matches!(result, Err(SampleError::DuplicateId(held)) if held == id));
            assert_eq!(must(store.list_all()).len(), 1);
        });
    }

    #[test]
    fn adding_a_prebuilt_sample_advances_the_store_allocator() {
        with_each_store(|store| {
            let sample = Sample::rehydrated(SampleId(40), base_time(), None, None);
            must(store.add(sample));

            let next = must(store.add_pending(base_time()));
            assert_eq!(next, SampleId(41));
        });
    }

    #[test]
    fn reopening_a_file_store_rehydrates_samples_and_advances_ids() {
        let path = temp_db_path("reopen");

        {
            let mut store = must(SqliteSampleStore::open(&path));
            must(store.migrate());
            let measured = must(store.add_measured(base_time(), 150));
            let open = must(store.add_pending(base_time() + Duration::days(7)));
            assert_eq!(measured, SampleId(1));
            assert_eq!(open, SampleId(2));
        }

        {
            let mut store = must(SqliteSampleStore::open(&path));
            must(store.migrate());

            let all = must(store.list_all());
            assert_eq!(all.len(), 2);
            assert_eq!(all[0].taken_at(), base_time());
            assert_eq!(all[0].measurement(), Some(150));
            assert_eq!(all[0].outcome(), Some(Outcome::Indeterminate));
            assert_eq!(all[1].taken_at(), base_time() + Duration::days(7));
            assert_eq!(all[1].measurement(), None);
            assert_eq!(all[1].outcome(), None);

            let next = must(store.add_pending(base_time()));
            assert_eq!(next, SampleId(3));
        }

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn migrate_is_idempotent() {
        let mut store = must(SqliteSampleStore::open(Path::new(":memory:")));
        must(store.migrate());
        let _ = must(store.add_measured(base_time(), 150));

        must(store.migrate());
        assert_eq!(must(store.list_all()).len(), 1);
    }

    #[test]
    fn schema_enforces_the_measurement_outcome_pairing() {
        let store = sqlite_store();

        let missing_outcome = store.connection().execute(
            "INSERT INTO samples(sample_id, taken_at, measurement, outcome)
             VALUES (1, '2001-01-01T00:00:00Z', 150, NULL)",
            [],
        );
        assert!(missing_outcome.is_err());

        let orphan_outcome = store.connection().execute(
            "INSERT INTO samples(sample_id, taken_at, measurement, outcome)
             VALUES (2, '2001-01-01T00:00:00Z', NULL, 'positive')",
            [],
        );
        assert!(orphan_outcome.is_err());
    }

    #[test]
    fn open_rejects_a_misordered_ruleset() {
        let mut ruleset = MeasurementRuleset::standard();
        ruleset.indeterminate_upper = 5000;

        let result = SqliteSampleStore::open_with_ruleset(Path::new(":memory:"), ruleset);
        assert!(result.is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_in_range_measurements_round_trip(measurements in prop::collection::vec(0i64..=1000, 1..20)) {
            let ruleset = MeasurementRuleset::standard();
            let mut store = sqlite_store();

            for &measurement in &measurements {
                let id = must(store.add_measured(base_time(), measurement));
                let held = must_some(must(store.get(id)));
                prop_assert_eq!(held.measurement(), Some(measurement));
                prop_assert_eq!(held.outcome(), Some(ruleset.classify(measurement)));
            }

            prop_assert_eq!(must(store.list_all()).len(), measurements.len());
        }

        #[test]
        fn prop_out_of_range_measurements_are_rejected(
            measurement in prop_oneof![-10_000i64..0, 1001i64..10_000]
        ) {
            let mut store = sqlite_store();
            let open = must(store.add_pending(base_time()));

            let constructed = store.add_measured(base_time(), measurement);
            prop_assert!(matches!(constructed, Err(SampleError::InvalidMeasurement(_))));

            let recorded = store.add_measurement(open, measurement);
            prop_assert!(matches!(recorded, Err(SampleError::InvalidMeasurement(_))));

            let all = must(store.list_all());
            prop_assert_eq!(all.len(), 1);
            prop_assert_eq!(all[0].measurement(), None);
        }
    }
}
