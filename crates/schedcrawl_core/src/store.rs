use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::types::Type;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, Transaction, params};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{IngestError, Result};
use crate::model::{Group, Institute, LessonSlot, LessonType, StudyForm, WeekParity};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS institutes (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    study_form INTEGER NOT NULL,
    updated_at_unix INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS study_groups (
    id TEXT PRIMARY KEY,
    institute_id TEXT NOT NULL,
    name TEXT NOT NULL,
    course_year INTEGER,
    study_form INTEGER NOT NULL,
    updated_at_unix INTEGER NOT NULL,
    FOREIGN KEY (institute_id) REFERENCES institutes(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_study_groups_institute ON study_groups(institute_id, study_form);

CREATE TABLE IF NOT EXISTS lesson_slots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id TEXT NOT NULL,
    week_offset INTEGER NOT NULL,
    weekday INTEGER NOT NULL,
    time_slot INTEGER NOT NULL,
    subject TEXT NOT NULL,
    teacher TEXT,
    room TEXT,
    lesson_type TEXT NOT NULL,
    parity TEXT NOT NULL CHECK (parity IN ('all', 'odd', 'even')),
    starts_at TEXT,
    ends_at TEXT,
    content_hash TEXT NOT NULL,
    updated_at_unix INTEGER NOT NULL,
    UNIQUE (group_id, week_offset, weekday, time_slot),
    FOREIGN KEY (group_id) REFERENCES study_groups(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_lesson_slots_group_week ON lesson_slots(group_id, week_offset);
"#;

const LESSON_COLUMNS: &str = "group_id, week_offset, weekday, time_slot, subject, teacher, room, \
     lesson_type, parity, starts_at, ends_at";

const GROUP_COLUMNS: &str = "id, institute_id, name, course_year, study_form";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl UpsertCounts {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaceCounts {
    pub removed: usize,
    pub inserted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub institutes: usize,
    pub groups: usize,
    pub lessons: usize,
    pub lessons_by_week: BTreeMap<u8, usize>,
}

/// SQLite-backed schedule store. Every write method is its own transaction.
pub struct Store {
    connection: Connection,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let connection = Connection::open(db_path)?;
        connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Self::from_connection(connection)
    }

    /// Open an existing database for queries. Never creates the file or touches
    /// the schema, and every write through the handle fails.
    pub fn open_read_only(db_path: &Path) -> Result<Self> {
        if !db_path.is_file() {
            return Err(IngestError::config(format!(
                "database {} does not exist; run `schedcrawl crawl` first",
                db_path.display()
            )));
        }
        let connection = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        Ok(Self { connection })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(connection: Connection) -> Result<Self> {
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { connection };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Safe to run against an existing database.
    pub fn initialize_schema(&self) -> Result<()> {
        self.connection.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    pub fn upsert_institute(&mut self, institute: &Institute) -> Result<String> {
        let transaction = self.connection.transaction()?;
        transaction.execute(
            "INSERT INTO institutes (id, name, study_form, updated_at_unix)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                study_form = excluded.study_form,
                updated_at_unix = excluded.updated_at_unix",
            params![
                institute.id,
                institute.name,
                institute.study_form.code(),
                unix_timestamp()
            ],
        )?;
        transaction.commit()?;
        Ok(institute.id.clone())
    }

    pub fn upsert_group(&mut self, group: &Group) -> Result<String> {
        let transaction = self.connection.transaction()?;
        if !row_exists(&transaction, "institutes", &group.institute_id)? {
            return Err(IngestError::integrity(format!(
                "group {} references missing institute {}",
                group.id, group.institute_id
            )));
        }
        transaction.execute(
            "INSERT INTO study_groups (id, institute_id, name, course_year, study_form, updated_at_unix)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                institute_id = excluded.institute_id,
                name = excluded.name,
                course_year = excluded.course_year,
                study_form = excluded.study_form,
                updated_at_unix = excluded.updated_at_unix",
            params![
                group.id,
                group.institute_id,
                group.name,
                group.course_year,
                group.study_form.code(),
                unix_timestamp()
            ],
        )?;
        transaction.commit()?;
        Ok(group.id.clone())
    }

    /// Additive upsert keyed by (group, week, weekday, slot). Rows not in
    /// `lessons` are left alone. Fails without writing if any group is missing.
    pub fn upsert_lessons(&mut self, lessons: &[LessonSlot]) -> Result<UpsertCounts> {
        let transaction = self.connection.transaction()?;
        ensure_groups_exist(&transaction, lessons)?;
        let mut counts = UpsertCounts::default();
        for lesson in lessons {
            let hash = lesson_hash(lesson);
            let existing: Option<String> = transaction
                .query_row(
                    "SELECT content_hash FROM lesson_slots
                     WHERE group_id = ?1 AND week_offset = ?2 AND weekday = ?3 AND time_slot = ?4",
                    params![
                        lesson.group_id,
                        lesson.week_offset,
                        lesson.weekday,
                        lesson.time_slot
                    ],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                Some(current) if current == hash => counts.unchanged += 1,
                Some(_) => {
                    write_lesson(&transaction, lesson, &hash)?;
                    counts.updated += 1;
                }
                None => {
                    write_lesson(&transaction, lesson, &hash)?;
                    counts.inserted += 1;
                }
            }
        }
        transaction.commit()?;
        Ok(counts)
    }

    /// Scoped reconciliation: the stored slots for (group, week) become exactly `lessons`.
    pub fn replace_lessons(
        &mut self,
        group_id: &str,
        week_offset: u8,
        lessons: &[LessonSlot],
    ) -> Result<ReplaceCounts> {
        if let Some(stray) = lessons
            .iter()
            .find(|lesson| lesson.group_id != group_id || lesson.week_offset != week_offset)
        {
            return Err(IngestError::validation(format!(
                "lesson for group {} week {} does not belong to replace scope {group_id}/{week_offset}",
                stray.group_id, stray.week_offset
            )));
        }
        let transaction = self.connection.transaction()?;
        if !row_exists(&transaction, "study_groups", group_id)? {
            return Err(IngestError::integrity(format!(
                "lessons reference missing group {group_id}"
            )));
        }
        let removed = transaction.execute(
            "DELETE FROM lesson_slots WHERE group_id = ?1 AND week_offset = ?2",
            params![group_id, week_offset],
        )?;
        for lesson in lessons {
            write_lesson(&transaction, lesson, &lesson_hash(lesson))?;
        }
        transaction.commit()?;
        Ok(ReplaceCounts {
            removed,
            inserted: lessons.len(),
        })
    }

    /// Remove groups of (institute, form) that are not in `keep`, with their lessons.
    pub fn prune_groups(
        &mut self,
        institute_id: &str,
        form: StudyForm,
        keep: &[String],
    ) -> Result<usize> {
        let keep = keep.iter().map(String::as_str).collect::<BTreeSet<_>>();
        let transaction = self.connection.transaction()?;
        let stale = {
            let mut statement = transaction.prepare(
                "SELECT id FROM study_groups WHERE institute_id = ?1 AND study_form = ?2",
            )?;
            let ids = statement
                .query_map(params![institute_id, form.code()], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids.into_iter()
                .filter(|id| !keep.contains(id.as_str()))
                .collect::<Vec<_>>()
        };
        for id in &stale {
            transaction.execute("DELETE FROM study_groups WHERE id = ?1", [id])?;
        }
        transaction.commit()?;
        Ok(stale.len())
    }

    /// Case-insensitive (Unicode) substring match on group names, ignoring spaces.
    pub fn find_groups_by_name(&self, pattern: &str) -> Result<Vec<Group>> {
        let needle = search_key(pattern);
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let mut groups = self.query_groups(
            &format!("SELECT {GROUP_COLUMNS} FROM study_groups"),
            params![],
        )?;
        groups.retain(|group| search_key(&group.name).contains(&needle));
        groups.sort_by(|left, right| {
            left.name
                .to_lowercase()
                .cmp(&right.name.to_lowercase())
                .then(left.id.cmp(&right.id))
        });
        Ok(groups)
    }

    /// Slots of one group for one week, ordered by (weekday, time_slot).
    pub fn get_week_schedule(&self, group_id: &str, week_offset: u8) -> Result<Vec<LessonSlot>> {
        let mut statement = self.connection.prepare(&format!(
            "SELECT {LESSON_COLUMNS} FROM lesson_slots
             WHERE group_id = ?1 AND week_offset = ?2
             ORDER BY weekday, time_slot"
        ))?;
        let rows = statement
            .query_map(params![group_id, week_offset], lesson_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_group(&self, group_id: &str) -> Result<Option<Group>> {
        let mut groups = self.query_groups(
            &format!("SELECT {GROUP_COLUMNS} FROM study_groups WHERE id = ?1"),
            params![group_id],
        )?;
        Ok(groups.pop())
    }

    pub fn get_institute(&self, institute_id: &str) -> Result<Option<Institute>> {
        let institute = self
            .connection
            .query_row(
                "SELECT id, name, study_form FROM institutes WHERE id = ?1",
                [institute_id],
                institute_from_row,
            )
            .optional()?;
        Ok(institute)
    }

    pub fn list_institutes(&self) -> Result<Vec<Institute>> {
        let mut statement = self
            .connection
            .prepare("SELECT id, name, study_form FROM institutes ORDER BY name COLLATE NOCASE, id")?;
        let rows = statement
            .query_map([], institute_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_groups_for_institute(
        &self,
        institute_id: &str,
        course_year: Option<u8>,
    ) -> Result<Vec<Group>> {
        let mut groups = self.query_groups(
            &format!(
                "SELECT {GROUP_COLUMNS} FROM study_groups
                 WHERE institute_id = ?1 AND (?2 IS NULL OR course_year = ?2)"
            ),
            params![institute_id, course_year],
        )?;
        groups.sort_by(|left, right| left.name.to_lowercase().cmp(&right.name.to_lowercase()));
        Ok(groups)
    }

    pub fn course_years_for_institute(&self, institute_id: &str) -> Result<Vec<u8>> {
        let mut statement = self.connection.prepare(
            "SELECT DISTINCT course_year FROM study_groups
             WHERE institute_id = ?1 AND course_year IS NOT NULL
             ORDER BY course_year",
        )?;
        let rows = statement
            .query_map([institute_id], |row| row.get::<_, u8>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let mut statement = self.connection.prepare(
            "SELECT week_offset, COUNT(*) FROM lesson_slots GROUP BY week_offset ORDER BY week_offset",
        )?;
        let lessons_by_week = statement
            .query_map([], |row| Ok((row.get::<_, u8>(0)?, row.get::<_, usize>(1)?)))?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
        Ok(StoreStats {
            institutes: self.count("institutes")?,
            groups: self.count("study_groups")?,
            lessons: lessons_by_week.values().sum(),
            lessons_by_week,
        })
    }

    fn count(&self, table: &str) -> Result<usize> {
        let count = self
            .connection
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get::<_, usize>(0)
            })?;
        Ok(count)
    }

    fn query_groups(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Group>> {
        let mut statement = self.connection.prepare(sql)?;
        let rows = statement
            .query_map(params, group_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn ensure_groups_exist(transaction: &Transaction<'_>, lessons: &[LessonSlot]) -> Result<()> {
    let group_ids = lessons
        .iter()
        .map(|lesson| lesson.group_id.as_str())
        .collect::<BTreeSet<_>>();
    for group_id in group_ids {
        if !row_exists(transaction, "study_groups", group_id)? {
            return Err(IngestError::integrity(format!(
                "lessons reference missing group {group_id}"
            )));
        }
    }
    Ok(())
}

fn row_exists(connection: &Connection, table: &str, id: &str) -> Result<bool> {
    let exists: i64 = connection.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?1)"),
        [id],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn write_lesson(connection: &Connection, lesson: &LessonSlot, hash: &str) -> Result<()> {
    connection.execute(
        "INSERT INTO lesson_slots (
            group_id, week_offset, weekday, time_slot, subject, teacher, room,
            lesson_type, parity, starts_at, ends_at, content_hash, updated_at_unix
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ON CONFLICT(group_id, week_offset, weekday, time_slot) DO UPDATE SET
            subject = excluded.subject,
            teacher = excluded.teacher,
            room = excluded.room,
            lesson_type = excluded.lesson_type,
            parity = excluded.parity,
            starts_at = excluded.starts_at,
            ends_at = excluded.ends_at,
            content_hash = excluded.content_hash,
            updated_at_unix = excluded.updated_at_unix",
        params![
            lesson.group_id,
            lesson.week_offset,
            lesson.weekday,
            lesson.time_slot,
            lesson.subject,
            lesson.teacher,
            lesson.room,
            lesson.lesson_type.as_str(),
            lesson.parity.as_str(),
            lesson.starts_at,
            lesson.ends_at,
            hash,
            unix_timestamp()
        ],
    )?;
    Ok(())
}

fn institute_from_row(row: &Row<'_>) -> rusqlite::Result<Institute> {
    Ok(Institute {
        id: row.get(0)?,
        name: row.get(1)?,
        study_form: form_from_sql(2, row.get(2)?)?,
    })
}

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        institute_id: row.get(1)?,
        name: row.get(2)?,
        course_year: row.get(3)?,
        study_form: form_from_sql(4, row.get(4)?)?,
    })
}

fn lesson_from_row(row: &Row<'_>) -> rusqlite::Result<LessonSlot> {
    Ok(LessonSlot {
        group_id: row.get(0)?,
        week_offset: row.get(1)?,
        weekday: row.get(2)?,
        time_slot: row.get(3)?,
        subject: row.get(4)?,
        teacher: row.get(5)?,
        room: row.get(6)?,
        lesson_type: LessonType::from_db(&row.get::<_, String>(7)?),
        parity: WeekParity::from_db(&row.get::<_, String>(8)?),
        starts_at: row.get(9)?,
        ends_at: row.get(10)?,
    })
}

fn form_from_sql(index: usize, code: i64) -> rusqlite::Result<StudyForm> {
    StudyForm::from_code(code).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(index, Type::Integer, error.to_string().into())
    })
}

/// Short digest of the mutable lesson fields.
fn lesson_hash(lesson: &LessonSlot) -> String {
    let fields = [
        lesson.subject.as_str(),
        lesson.teacher.as_deref().unwrap_or(""),
        lesson.room.as_deref().unwrap_or(""),
        lesson.lesson_type.as_str(),
        lesson.parity.as_str(),
        lesson.starts_at.as_deref().unwrap_or(""),
        lesson.ends_at.as_deref().unwrap_or(""),
    ];
    let digest = Sha256::digest(fields.join("\u{1f}").as_bytes());
    let mut output = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn search_key(value: &str) -> String {
    value
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
