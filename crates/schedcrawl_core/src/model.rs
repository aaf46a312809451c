use serde::Serialize;

use crate::error::{IngestError, Result};

/// Pair number → (start, end) as published by the university.
pub const PAIR_TIMES: [(u8, &str, &str); 7] = [
    (1, "08:30", "10:00"),
    (2, "10:20", "11:50"),
    (3, "12:10", "13:40"),
    (4, "14:00", "15:30"),
    (5, "15:50", "17:20"),
    (6, "17:40", "19:10"),
    (7, "19:30", "21:00"),
];

pub const MAX_WEEK_OFFSET: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyForm {
    FullTime,
    PartTime,
    Evening,
}

impl StudyForm {
    pub const ALL: [StudyForm; 3] = [Self::FullTime, Self::PartTime, Self::Evening];

    pub fn code(self) -> u8 {
        match self {
            Self::FullTime => 0,
            Self::PartTime => 1,
            Self::Evening => 2,
        }
    }

    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(Self::FullTime),
            1 => Ok(Self::PartTime),
            2 => Ok(Self::Evening),
            other => Err(IngestError::config(format!(
                "unknown study form {other} (expected 0 full-time, 1 part-time, 2 evening)"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FullTime => "full-time",
            Self::PartTime => "part-time",
            Self::Evening => "evening",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonType {
    Lecture,
    Practice,
    Lab,
    Other,
}

impl LessonType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lecture => "lecture",
            Self::Practice => "practice",
            Self::Lab => "lab",
            Self::Other => "other",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "lecture" => Self::Lecture,
            "practice" => Self::Practice,
            "lab" => Self::Lab,
            _ => Self::Other,
        }
    }
}

/// Which alternating week a lesson runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WeekParity {
    All,
    Odd,
    Even,
}

impl WeekParity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Odd => "odd",
            Self::Even => "even",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value {
            "odd" => Self::Odd,
            "even" => Self::Even,
            _ => Self::All,
        }
    }

    /// Whether a lesson with this parity belongs to the given week offset.
    pub fn applies_to(self, week_offset: u8) -> bool {
        match (self, week_offset) {
            (_, 0) | (Self::All, _) => true,
            (Self::Odd, 1) | (Self::Even, 2) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Institute {
    pub id: String,
    pub name: String,
    /// Form the institute was most recently listed under. One row serves every form.
    pub study_form: StudyForm,
}

impl Institute {
    pub fn natural_key(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub id: String,
    pub institute_id: String,
    pub name: String,
    pub course_year: Option<u8>,
    pub study_form: StudyForm,
}

impl Group {
    pub fn natural_key(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LessonKey {
    pub group_id: String,
    pub week_offset: u8,
    pub weekday: u8,
    pub time_slot: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LessonSlot {
    pub group_id: String,
    pub week_offset: u8,
    pub weekday: u8,
    pub time_slot: u8,
    pub subject: String,
    pub teacher: Option<String>,
    pub room: Option<String>,
    pub lesson_type: LessonType,
    pub parity: WeekParity,
    pub starts_at: Option<String>,
    pub ends_at: Option<String>,
}

impl LessonSlot {
    pub fn natural_key(&self) -> LessonKey {
        LessonKey {
            group_id: self.group_id.clone(),
            week_offset: self.week_offset,
            weekday: self.weekday,
            time_slot: self.time_slot,
        }
    }
}

pub fn pair_times(time_slot: u8) -> Option<(&'static str, &'static str)> {
    PAIR_TIMES
        .iter()
        .find(|(slot, _, _)| *slot == time_slot)
        .map(|(_, start, end)| (*start, *end))
}

pub fn slot_for_start_time(start: &str) -> Option<u8> {
    let start = start.trim();
    let padded = if start.len() == 4 {
        format!("0{start}")
    } else {
        start.to_string()
    };
    PAIR_TIMES
        .iter()
        .find(|(_, begin, _)| padded.starts_with(begin))
        .map(|(slot, _, _)| *slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn study_form_codes_round_trip_and_reject_unknown() {
        for form in StudyForm::ALL {
            assert_eq!(StudyForm::from_code(i64::from(form.code())).expect("form"), form);
        }
        let error = StudyForm::from_code(7).expect_err("must fail");
        assert_eq!(error.kind(), "config");
    }

    #[test]
    fn parity_filters_week_offsets() {
        assert!(WeekParity::Odd.applies_to(1));
        assert!(!WeekParity::Odd.applies_to(2));
        assert!(WeekParity::Even.applies_to(0));
        assert!(WeekParity::All.applies_to(2));
    }

    #[test]
    fn start_time_maps_to_pair_number() {
        assert_eq!(slot_for_start_time("08:30"), Some(1));
        assert_eq!(slot_for_start_time("8:30"), Some(1));
        assert_eq!(slot_for_start_time("14:00:00"), Some(4));
        assert_eq!(slot_for_start_time("09:00"), None);
        assert_eq!(pair_times(7), Some(("19:30", "21:00")));
    }
}
