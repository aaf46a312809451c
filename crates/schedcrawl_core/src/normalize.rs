//! Raw payload records → validated entities. Pure, no I/O.

use std::collections::BTreeMap;

use crate::error::{IngestError, Result};
use crate::model::{
    Group, Institute, LessonKey, LessonSlot, LessonType, MAX_WEEK_OFFSET, StudyForm, WeekParity,
    pair_times, slot_for_start_time,
};
use crate::remote::{RawGroup, RawInstitute, RawLesson};

const WEEKDAY_NAMES: [(&str, u8); 14] = [
    ("понедельник", 1),
    ("вторник", 2),
    ("среда", 3),
    ("четверг", 4),
    ("пятница", 5),
    ("суббота", 6),
    ("воскресенье", 7),
    ("monday", 1),
    ("tuesday", 2),
    ("wednesday", 3),
    ("thursday", 4),
    ("friday", 5),
    ("saturday", 6),
    ("sunday", 7),
];

/// Lessons kept for one (group, week) plus the records that were rejected.
#[derive(Debug, Default)]
pub struct LessonBatch {
    pub slots: Vec<LessonSlot>,
    pub rejected: Vec<IngestError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellParts {
    pub kind: Option<String>,
    pub room: Option<String>,
    pub teacher: Option<String>,
    pub subject: Option<String>,
}

pub fn normalize_institute(raw: &RawInstitute, form: StudyForm) -> Result<Institute> {
    let id = clean(raw.id.as_deref())
        .ok_or_else(|| IngestError::validation("institute record has no id"))?;
    let name = clean(raw.name.as_deref())
        .ok_or_else(|| IngestError::validation(format!("institute {id} has no name")))?;
    Ok(Institute {
        id,
        name,
        study_form: form,
    })
}

pub fn normalize_group(raw: &RawGroup, institute_id: &str, form: StudyForm) -> Result<Group> {
    let id = clean(raw.id.as_deref()).ok_or_else(|| {
        IngestError::validation(format!("group record in institute {institute_id} has no id"))
    })?;
    let name = clean(raw.name.as_deref())
        .ok_or_else(|| IngestError::validation(format!("group {id} has no name")))?;
    Ok(Group {
        id,
        institute_id: institute_id.to_string(),
        name,
        course_year: raw.course.as_deref().and_then(course_year),
        study_form: form,
    })
}

pub fn normalize_lesson(raw: &RawLesson, group_id: &str, week_offset: u8) -> Result<LessonSlot> {
    if week_offset > MAX_WEEK_OFFSET {
        return Err(IngestError::validation(format!(
            "week offset {week_offset} is out of range 0..={MAX_WEEK_OFFSET}"
        )));
    }

    let cell = raw
        .cell
        .as_deref()
        .map(parse_cell)
        .unwrap_or_default();

    let weekday_label = clean(raw.weekday.as_deref()).ok_or_else(|| {
        IngestError::validation(format!("lesson for group {group_id} has no weekday"))
    })?;
    let weekday = parse_weekday(&weekday_label).ok_or_else(|| {
        IngestError::validation(format!(
            "lesson for group {group_id} has unknown weekday {weekday_label:?}"
        ))
    })?;

    let time_slot = match (raw.pair, raw.start.as_deref()) {
        (Some(pair), _) => pair,
        (None, Some(start)) => slot_for_start_time(start).ok_or_else(|| {
            IngestError::validation(format!(
                "lesson for group {group_id} starts at {start:?}, which is not a known pair time"
            ))
        })?,
        (None, None) => {
            return Err(IngestError::validation(format!(
                "lesson for group {group_id} on day {weekday} has no pair number or start time"
            )));
        }
    };
    let Some((default_start, default_end)) = pair_times(time_slot) else {
        return Err(IngestError::validation(format!(
            "lesson for group {group_id} has pair number {time_slot} outside 1..=7"
        )));
    };

    let subject = clean(raw.subject.as_deref())
        .or(cell.subject)
        .ok_or_else(|| {
            IngestError::validation(format!(
                "lesson for group {group_id} at day {weekday} pair {time_slot} has no subject"
            ))
        })?;
    let kind = clean(raw.kind.as_deref()).or(cell.kind);

    Ok(LessonSlot {
        group_id: group_id.to_string(),
        week_offset,
        weekday,
        time_slot,
        subject,
        teacher: clean(raw.teacher.as_deref()).or(cell.teacher),
        room: clean(raw.room.as_deref()).or(cell.room),
        lesson_type: kind.as_deref().map(parse_lesson_type).unwrap_or(LessonType::Other),
        parity: raw
            .parity
            .as_deref()
            .map(parse_parity)
            .unwrap_or(WeekParity::All),
        starts_at: clean(raw.start.as_deref()).or_else(|| Some(default_start.to_string())),
        ends_at: clean(raw.end.as_deref()).or_else(|| Some(default_end.to_string())),
    })
}

/// Normalize a lesson listing for one (group, week): drops lessons of the other
/// parity and collapses duplicate natural keys, the last record winning.
///
/// The every-week listing (offset 0) stores one row per (weekday, slot), so odd
/// and even cells meeting there either fold into one all-week lesson when they
/// agree, or are reported as a validation error when they differ.
pub fn normalize_lessons(raws: &[RawLesson], group_id: &str, week_offset: u8) -> LessonBatch {
    let mut by_key: BTreeMap<LessonKey, LessonSlot> = BTreeMap::new();
    let mut rejected = Vec::new();
    for raw in raws {
        let mut slot = match normalize_lesson(raw, group_id, week_offset) {
            Ok(slot) if slot.parity.applies_to(week_offset) => slot,
            Ok(_) => continue,
            Err(error) => {
                rejected.push(error);
                continue;
            }
        };
        if let Some(previous) = by_key.get(&slot.natural_key())
            && previous.parity != slot.parity
        {
            if same_lesson(previous, &slot) {
                slot.parity = WeekParity::All;
            } else {
                rejected.push(IngestError::validation(format!(
                    "group {group_id}: {} and {} lessons share weekday {} pair {} in the \
                     every-week listing; crawl weeks 1 and 2 for this group",
                    previous.parity.as_str(),
                    slot.parity.as_str(),
                    slot.weekday,
                    slot.time_slot
                )));
            }
        }
        by_key.insert(slot.natural_key(), slot);
    }
    LessonBatch {
        slots: by_key.into_values().collect(),
        rejected,
    }
}

fn same_lesson(left: &LessonSlot, right: &LessonSlot) -> bool {
    left.subject == right.subject
        && left.teacher == right.teacher
        && left.room == right.room
        && left.lesson_type == right.lesson_type
}

/// Split `"лк, 529а-3, Филатов Д.О., Общая психология"` into its parts.
pub fn parse_cell(text: &str) -> CellParts {
    let parts = text
        .split(',')
        .map(collapse_whitespace)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>();
    let mut used = vec![false; parts.len()];
    let mut cell = CellParts::default();

    if let Some(first) = parts.first()
        && first.chars().count() <= 3
    {
        cell.kind = Some(first.clone());
        used[0] = true;
    }
    if let Some(index) = (0..parts.len()).find(|&index| !used[index] && looks_like_room(&parts[index]))
    {
        cell.room = Some(parts[index].clone());
        used[index] = true;
    }
    if let Some(index) =
        (0..parts.len()).find(|&index| !used[index] && looks_like_teacher(&parts[index]))
    {
        cell.teacher = Some(parts[index].clone());
        used[index] = true;
    }

    let rest = parts
        .iter()
        .zip(&used)
        .filter(|(_, used)| !**used)
        .map(|(part, _)| part.as_str())
        .collect::<Vec<_>>();
    if !rest.is_empty() {
        cell.subject = Some(rest.join(", "));
    }
    cell
}

pub fn parse_weekday(label: &str) -> Option<u8> {
    let label = label.trim().to_lowercase();
    if let Ok(number) = label.parse::<u8>() {
        return (1..=7).contains(&number).then_some(number);
    }
    WEEKDAY_NAMES
        .iter()
        .find(|(name, _)| *name == label)
        .map(|(_, day)| *day)
}

pub fn parse_lesson_type(kind: &str) -> LessonType {
    let kind = kind.trim().trim_end_matches('.').to_lowercase();
    if kind.starts_with("лк") || kind.starts_with("лек") || kind.starts_with("lec") {
        LessonType::Lecture
    } else if kind.starts_with("пр") || kind.starts_with("сем") || kind.starts_with("prac") {
        LessonType::Practice
    } else if kind.starts_with("лб") || kind.starts_with("лаб") || kind.starts_with("lab") {
        LessonType::Lab
    } else {
        LessonType::Other
    }
}

pub fn parse_parity(value: &str) -> WeekParity {
    let value = value.trim().to_lowercase();
    if value == "1" || value.contains("числ") || value.contains("odd") {
        WeekParity::Odd
    } else if value == "2" || value.contains("знам") || value.contains("even") {
        WeekParity::Even
    } else {
        WeekParity::All
    }
}

/// "2 курс" → 2.
pub fn course_year(label: &str) -> Option<u8> {
    let digits = label
        .chars()
        .skip_while(|ch| !ch.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect::<String>();
    digits.parse::<u8>().ok().filter(|year| *year > 0)
}

pub fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clean(value: Option<&str>) -> Option<String> {
    value.map(collapse_whitespace).filter(|value| !value.is_empty())
}

fn looks_like_room(part: &str) -> bool {
    part.chars().any(|ch| ch.is_ascii_digit()) || part.contains('-')
}

fn looks_like_teacher(part: &str) -> bool {
    part.contains('.') && part.contains(' ')
}
