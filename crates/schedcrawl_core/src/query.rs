//! Read-only lookups over the store. Never reaches the network.

use std::collections::BTreeMap;

use chrono::{Local, NaiveDate};

use crate::error::Result;
use crate::model::{Group, LessonSlot};
use crate::store::Store;

pub const DEFAULT_SEMESTER_START: (i32, u32, u32) = (2025, 9, 1);
pub const DEFAULT_PARITY_BLOCK_WEEKS: u32 = 7;

/// Maps calendar dates to the alternating week offset (1 odd, 2 even).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcademicCalendar {
    pub semester_start: NaiveDate,
    /// How many consecutive weeks share one parity.
    pub parity_block_weeks: u32,
}

impl Default for AcademicCalendar {
    fn default() -> Self {
        let (year, month, day) = DEFAULT_SEMESTER_START;
        Self {
            semester_start: NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default(),
            parity_block_weeks: DEFAULT_PARITY_BLOCK_WEEKS,
        }
    }
}

impl AcademicCalendar {
    /// 1-based week number since the semester start; dates before it count as week 1.
    pub fn week_number(&self, date: NaiveDate) -> u32 {
        let days = (date - self.semester_start).num_days();
        if days < 0 {
            return 1;
        }
        u32::try_from(days / 7).unwrap_or(u32::MAX).saturating_add(1)
    }

    pub fn week_offset(&self, date: NaiveDate) -> u8 {
        let block = (self.week_number(date) - 1) / self.parity_block_weeks.max(1);
        if block % 2 == 0 { 1 } else { 2 }
    }
}

pub struct QueryFacade<'a> {
    store: &'a Store,
    calendar: AcademicCalendar,
}

impl<'a> QueryFacade<'a> {
    pub fn new(store: &'a Store, calendar: AcademicCalendar) -> Self {
        Self { store, calendar }
    }

    pub fn calendar(&self) -> &AcademicCalendar {
        &self.calendar
    }

    pub fn search_groups(&self, text: &str) -> Result<Vec<Group>> {
        self.store.find_groups_by_name(text)
    }

    pub fn current_week_schedule(&self, group_id: &str) -> Result<Vec<LessonSlot>> {
        self.week_schedule_on(group_id, Local::now().date_naive())
    }

    /// Lessons of the week containing `date`, including every-week slots.
    /// A parity-specific slot wins over an every-week slot at the same time.
    pub fn week_schedule_on(&self, group_id: &str, date: NaiveDate) -> Result<Vec<LessonSlot>> {
        let offset = self.calendar.week_offset(date);
        let mut merged = BTreeMap::new();
        for slot in self.store.get_week_schedule(group_id, 0)? {
            if slot.parity.applies_to(offset) {
                merged.insert((slot.weekday, slot.time_slot), slot);
            }
        }
        for slot in self.store.get_week_schedule(group_id, offset)? {
            merged.insert((slot.weekday, slot.time_slot), slot);
        }
        Ok(merged.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Institute, LessonType, StudyForm, WeekParity};

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
    }

    fn slot(week: u8, weekday: u8, time_slot: u8, subject: &str, parity: WeekParity) -> LessonSlot {
        LessonSlot {
            group_id: "g1".to_string(),
            week_offset: week,
            weekday,
            time_slot,
            subject: subject.to_string(),
            teacher: None,
            room: None,
            lesson_type: LessonType::Practice,
            parity,
            starts_at: None,
            ends_at: None,
        }
    }

    fn store_with_group() -> Store {
        let mut store = Store::open_in_memory().expect("store");
        store
            .upsert_institute(&Institute {
                id: "i1".to_string(),
                name: "ИМиТ".to_string(),
                study_form: StudyForm::FullTime,
            })
            .expect("institute");
        store
            .upsert_group(&Group {
                id: "g1".to_string(),
                institute_id: "i1".to_string(),
                name: "ПМИ-121".to_string(),
                course_year: Some(1),
                study_form: StudyForm::FullTime,
            })
            .expect("group");
        store
    }

    #[test]
    fn calendar_alternates_in_blocks() {
        let calendar = AcademicCalendar {
            semester_start: date(2025, 9, 1),
            parity_block_weeks: 1,
        };
        assert_eq!(calendar.week_number(date(2025, 9, 1)), 1);
        assert_eq!(calendar.week_offset(date(2025, 9, 7)), 1);
        assert_eq!(calendar.week_offset(date(2025, 9, 8)), 2);
        assert_eq!(calendar.week_offset(date(2025, 9, 15)), 1);
        assert_eq!(calendar.week_offset(date(2025, 8, 1)), 1);

        let default = AcademicCalendar::default();
        assert_eq!(default.week_offset(date(2025, 10, 19)), 1);
        assert_eq!(default.week_offset(date(2025, 10, 20)), 2);
    }

    #[test]
    fn week_schedule_merges_every_week_slots() {
        let mut store = store_with_group();
        store
            .upsert_lessons(&[
                slot(0, 1, 1, "Every week", WeekParity::All),
                slot(0, 1, 2, "Shadowed", WeekParity::All),
                slot(0, 2, 1, "Even only", WeekParity::Even),
                slot(1, 1, 2, "Odd pair", WeekParity::Odd),
                slot(2, 3, 3, "Even week", WeekParity::All),
            ])
            .expect("lessons");
        let facade = QueryFacade::new(
            &store,
            AcademicCalendar {
                semester_start: date(2025, 9, 1),
                parity_block_weeks: 1,
            },
        );

        let odd = facade
            .week_schedule_on("g1", date(2025, 9, 3))
            .expect("odd week")
            .into_iter()
            .map(|slot| slot.subject)
            .collect::<Vec<_>>();
        assert_eq!(odd, vec!["Every week", "Odd pair"]);

        let even = facade
            .week_schedule_on("g1", date(2025, 9, 10))
            .expect("even week")
            .into_iter()
            .map(|slot| slot.subject)
            .collect::<Vec<_>>();
        assert_eq!(even, vec!["Every week", "Shadowed", "Even only", "Even week"]);
    }

    #[test]
    fn unknown_group_gives_empty_results() {
        let store = Store::open_in_memory().expect("store");
        let facade = QueryFacade::new(&store, AcademicCalendar::default());
        assert!(facade.current_week_schedule("missing").expect("week").is_empty());
        assert!(facade.search_groups("пми").expect("search").is_empty());
    }

    #[test]
    fn search_goes_through_store_matching() {
        let store = store_with_group();
        let facade = QueryFacade::new(&store, AcademicCalendar::default());
        let hits = facade.search_groups("пм и-1").expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "g1");
    }
}
