use std::thread::sleep;
use std::time::{Duration, Instant};

use log::debug;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, ORIGIN, REFERER, USER_AGENT};
use serde_json::{Map, Value, json};

use crate::config::AppConfig;
use crate::error::{IngestError, Result};
use crate::model::StudyForm;

pub const INSTITUTES_ENDPOINT: &str = "/api/catalogs/GetInstitutes";
pub const GROUPS_ENDPOINT: &str = "/api/student/GetStudGroups";
pub const SCHEDULE_ENDPOINT: &str = "/api/student/GetGroupSchedule";

const SCHEDULE_WEEK_DAYS: &str = "1,2,3,4,5,6";
const FRONTEND_ORIGIN: &str = "https://student.vlsu.ru";

const DAY_KEYS: &[&str] = &["Day", "DayOfWeek", "WeekDay"];
const WEEK_KEYS: &[&str] = &["WeekType", "Week", "WeekMode", "TypeWeek"];
const START_KEYS: &[&str] = &["Start", "TimeStart", "Begin", "From", "StartTime"];
const END_KEYS: &[&str] = &["End", "TimeEnd", "Finish", "To", "EndTime"];
const PAIR_KEYS: &[&str] = &["Pair", "PairNumber", "Number", "Para"];
const SUBJECT_KEYS: &[&str] = &["Title", "Discipline", "Subject", "Name", "Lesson"];
const TEACHER_KEYS: &[&str] = &["Teacher", "Lecturer", "Professor", "Prepod", "TeacherName"];
const ROOM_KEYS: &[&str] = &["Room", "Audience", "Auditory", "Classroom", "Cabinet", "Aud"];
const KIND_KEYS: &[&str] = &["Kind", "Type", "LessonType", "Format"];
const CONTAINER_KEYS: &[&str] = &["Days", "DayItems", "Schedule", "Lessons", "Pairs", "Items"];

/// Institute listing item before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawInstitute {
    pub id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawGroup {
    pub id: Option<String>,
    pub name: Option<String>,
    pub course: Option<String>,
}

/// One lesson as found in a schedule payload. Either the structured fields
/// are filled, or `cell` carries the packed "kind, room, teacher, subject" text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawLesson {
    pub weekday: Option<String>,
    pub pair: Option<u8>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub subject: Option<String>,
    pub teacher: Option<String>,
    pub room: Option<String>,
    pub kind: Option<String>,
    pub parity: Option<String>,
    pub cell: Option<String>,
}

pub trait ScheduleApi {
    fn list_forms(&mut self) -> Result<Vec<StudyForm>>;
    fn list_institutes(&mut self, form: StudyForm) -> Result<Vec<RawInstitute>>;
    fn list_groups(&mut self, institute_id: &str, form: StudyForm) -> Result<Vec<RawGroup>>;
    fn list_lessons(&mut self, group_id: &str, week_offset: u8) -> Result<Vec<RawLesson>>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub pause: Duration,
    pub max_attempts: u32,
}

impl ApiClientConfig {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            base_url: config.api_url(),
            user_agent: config.user_agent(),
            timeout: Duration::from_millis(config.timeout_ms()),
            pause: Duration::from_millis(config.pause_ms()),
            max_attempts: config.max_attempts().max(1),
        }
    }
}

/// Minimum spacing between consecutive requests of one client instance.
#[derive(Debug, Clone)]
pub struct Pacer {
    pause: Duration,
    last_request_at: Option<Instant>,
}

impl Pacer {
    pub fn new(pause: Duration) -> Self {
        Self {
            pause,
            last_request_at: None,
        }
    }

    pub fn pause(&self) -> Duration {
        self.pause
    }

    /// Sleep until `pause` has elapsed since the previous call, then stamp now.
    pub fn wait(&mut self) {
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < self.pause {
                sleep(self.pause - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
    }
}

pub struct VlsuClient {
    client: Client,
    config: ApiClientConfig,
    pacer: Pacer,
    request_count: usize,
}

impl VlsuClient {
    pub fn new(config: ApiClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/plain, */*"),
        );
        headers.insert(ORIGIN, HeaderValue::from_static(FRONTEND_ORIGIN));
        headers.insert(REFERER, HeaderValue::from_static("https://student.vlsu.ru/"));
        let user_agent = HeaderValue::from_str(&config.user_agent).map_err(|error| {
            IngestError::config(format!("invalid user agent {:?}: {error}", config.user_agent))
        })?;
        headers.insert(USER_AGENT, user_agent);

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|error| {
                IngestError::config(format!("failed to build schedule API HTTP client: {error}"))
            })?;

        Ok(Self {
            client,
            pacer: Pacer::new(config.pause),
            config,
            request_count: 0,
        })
    }

    fn request_text(&mut self, endpoint: &str, body: Option<&Value>) -> Result<String> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint);
        let client = &self.client;
        send_with_retry(
            &mut self.pacer,
            self.config.max_attempts,
            endpoint,
            &mut self.request_count,
            || send_once(client, &url, endpoint, body),
        )
    }
}

/// Run `send` until it succeeds, fails with a non-retriable error, or
/// `max_attempts` calls have been made. Every call is paced and counted, and
/// attempt `n` is followed by a `pause × n` backoff.
fn send_with_retry<F>(
    pacer: &mut Pacer,
    max_attempts: u32,
    endpoint: &str,
    request_count: &mut usize,
    mut send: F,
) -> Result<String>
where
    F: FnMut() -> Result<String>,
{
    let mut attempt: u32 = 1;
    loop {
        pacer.wait();
        *request_count += 1;
        match send() {
            Ok(text) => return Ok(text),
            Err(error) if error.is_retriable() && attempt < max_attempts => {
                debug!("retrying {endpoint} after attempt {attempt}/{max_attempts}: {error}");
                sleep(pacer.pause() * attempt);
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

fn send_once(client: &Client, url: &str, endpoint: &str, body: Option<&Value>) -> Result<String> {
    let request = match body {
        Some(body) => client.post(url).json(body),
        None => client.get(url),
    };
    let response = request
        .send()
        .map_err(|error| transport_error(endpoint, &error))?;
    let status = response.status();
    if !status.is_success() {
        return Err(IngestError::remote(
            Some(status.as_u16()),
            endpoint,
            is_retriable_status(status),
            format!("HTTP {status}"),
        ));
    }
    let text = response
        .text()
        .map_err(|error| transport_error(endpoint, &error))?;
    debug!(
        "{} {endpoint} body={} status={status} bytes={}",
        if body.is_some() { "POST" } else { "GET" },
        body.map(Value::to_string).unwrap_or_default(),
        text.len()
    );
    Ok(text)
}

impl ScheduleApi for VlsuClient {
    fn list_forms(&mut self) -> Result<Vec<StudyForm>> {
        Ok(StudyForm::ALL.to_vec())
    }

    fn list_institutes(&mut self, form: StudyForm) -> Result<Vec<RawInstitute>> {
        debug!("listing institutes for form {}", form.as_str());
        let text = self.request_text(INSTITUTES_ENDPOINT, None)?;
        parse_institutes(INSTITUTES_ENDPOINT, &text)
    }

    fn list_groups(&mut self, institute_id: &str, form: StudyForm) -> Result<Vec<RawGroup>> {
        let body = json!({ "Institut": institute_id, "WFormed": form.code() });
        let text = self.request_text(GROUPS_ENDPOINT, Some(&body))?;
        parse_groups(GROUPS_ENDPOINT, &text)
    }

    fn list_lessons(&mut self, group_id: &str, week_offset: u8) -> Result<Vec<RawLesson>> {
        let body = json!({
            "Nrec": group_id,
            "WeekType": week_offset,
            "WeekDays": SCHEDULE_WEEK_DAYS,
        });
        let text = self.request_text(SCHEDULE_ENDPOINT, Some(&body))?;
        parse_lessons(SCHEDULE_ENDPOINT, &text)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

pub fn parse_institutes(endpoint: &str, body: &str) -> Result<Vec<RawInstitute>> {
    let items = parse_object_list(endpoint, body)?;
    Ok(items
        .iter()
        .map(|item| RawInstitute {
            id: pick_text(item, &["Value", "Id", "ID"]),
            name: pick_text(item, &["Text", "Name"]),
        })
        .collect())
}

pub fn parse_groups(endpoint: &str, body: &str) -> Result<Vec<RawGroup>> {
    let items = parse_object_list(endpoint, body)?;
    Ok(items
        .iter()
        .map(|item| RawGroup {
            id: pick_text(item, &["Nrec", "Value", "Id", "ID"]),
            name: pick_text(item, &["Name", "Text"]),
            course: pick_text(item, &["Course", "Kurs", "CourseNumber"]),
        })
        .collect())
}

/// Accepts the day-array layout (`n1..n7` / `z1..z7` cells per weekday) and
/// nested or flat lesson objects.
pub fn parse_lessons(endpoint: &str, body: &str) -> Result<Vec<RawLesson>> {
    let payload = decode_json(endpoint, body)?;
    let mut lessons = Vec::new();
    match &payload {
        Value::Array(items) if items.iter().any(is_day_cell_object) => {
            for item in items {
                let Value::Object(day) = item else {
                    return Err(IngestError::parse(endpoint, &item.to_string()));
                };
                collect_day_cells(day, &mut lessons);
            }
        }
        Value::Array(_) | Value::Object(_) => {
            walk_lessons(endpoint, &payload, None, None, &mut lessons)?;
        }
        Value::Null => {}
        other => return Err(IngestError::parse(endpoint, &other.to_string())),
    }
    Ok(lessons)
}

fn decode_json(endpoint: &str, body: &str) -> Result<Value> {
    serde_json::from_str(body).map_err(|_| IngestError::parse(endpoint, body))
}

fn parse_object_list(endpoint: &str, body: &str) -> Result<Vec<Map<String, Value>>> {
    let Value::Array(items) = decode_json(endpoint, body)? else {
        return Err(IngestError::parse(endpoint, body));
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map),
            other => Err(IngestError::parse(endpoint, &other.to_string())),
        })
        .collect()
}

fn is_day_cell_object(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| map.contains_key("n1") || map.contains_key("z1"))
}

fn collect_day_cells(day: &Map<String, Value>, out: &mut Vec<RawLesson>) {
    if day.get("type").and_then(Value::as_str) != Some("Lessons") {
        return;
    }
    let weekday = pick_text(day, &["name"]);
    for pair in 1..=7u8 {
        for (prefix, parity) in [("n", "odd"), ("z", "even")] {
            let key = format!("{prefix}{pair}");
            let Some(cell) = pick_text(day, &[key.as_str()]) else {
                continue;
            };
            out.push(RawLesson {
                weekday: weekday.clone(),
                pair: Some(pair),
                parity: Some(parity.to_string()),
                cell: Some(cell),
                ..RawLesson::default()
            });
        }
    }
}

fn walk_lessons(
    endpoint: &str,
    node: &Value,
    day: Option<&str>,
    week: Option<&str>,
    out: &mut Vec<RawLesson>,
) -> Result<()> {
    match node {
        Value::Array(items) => {
            for item in items {
                walk_lessons(endpoint, item, day, week, out)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            let own_day = pick_text(map, DAY_KEYS);
            let own_week = pick_text(map, WEEK_KEYS);
            let day = own_day.as_deref().or(day);
            let week = own_week.as_deref().or(week);

            let containers = CONTAINER_KEYS
                .iter()
                .filter_map(|key| map.get(*key))
                .filter(|value| value.is_array() || value.is_object())
                .collect::<Vec<_>>();
            if !is_container_name(map) && (has_any(map, SUBJECT_KEYS) || has_any(map, START_KEYS))
            {
                out.push(lesson_from_object(map, day, week));
            }
            for container in containers {
                walk_lessons(endpoint, container, day, week, out)?;
            }
            for (key, parity) in [
                ("All", "all"),
                ("Numerator", "odd"),
                ("Odd", "odd"),
                ("Denominator", "even"),
                ("Even", "even"),
            ] {
                if let Some(child) = map.get(key) {
                    walk_lessons(endpoint, child, day, Some(parity), out)?;
                }
            }
            Ok(())
        }
        Value::Null => Ok(()),
        other => Err(IngestError::parse(endpoint, &other.to_string())),
    }
}

fn lesson_from_object(map: &Map<String, Value>, day: Option<&str>, week: Option<&str>) -> RawLesson {
    RawLesson {
        weekday: day.map(ToString::to_string),
        pair: pick_text(map, PAIR_KEYS).and_then(|value| value.parse::<u8>().ok()),
        start: pick_text(map, START_KEYS),
        end: pick_text(map, END_KEYS),
        subject: pick_text(map, SUBJECT_KEYS),
        teacher: pick_text(map, TEACHER_KEYS),
        room: pick_text(map, ROOM_KEYS),
        kind: pick_text(map, KIND_KEYS),
        parity: week.map(ToString::to_string),
        cell: None,
    }
}

// A day wrapper such as {"Name": "Monday", "Lessons": [...]} is not a lesson itself.
fn is_container_name(map: &Map<String, Value>) -> bool {
    !has_any(map, START_KEYS)
        && !has_any(map, TEACHER_KEYS)
        && !has_any(map, ROOM_KEYS)
        && CONTAINER_KEYS.iter().any(|key| map.contains_key(*key))
}

fn has_any(map: &Map<String, Value>, keys: &[&str]) -> bool {
    pick_text(map, keys).is_some()
}

/// First non-empty value among `keys`, rendered as text.
fn pick_text(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::String(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    })
}

fn transport_error(endpoint: &str, error: &reqwest::Error) -> IngestError {
    let status = error.status();
    let retriable = transport_retriable(status, error.is_timeout(), error.is_connect());
    IngestError::remote(
        status.map(|code| code.as_u16()),
        endpoint,
        retriable,
        error.to_string(),
    )
}

pub fn is_retriable_status(status: StatusCode) -> bool {
    status.is_server_error()
}

/// Builder and redirect failures fail the same way on every attempt.
fn transport_retriable(status: Option<StatusCode>, timeout: bool, connect: bool) -> bool {
    status.is_some_and(is_retriable_status) || timeout || connect
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use reqwest::StatusCode;

    use super::{
        GROUPS_ENDPOINT, INSTITUTES_ENDPOINT, Pacer, RawGroup, RawInstitute, SCHEDULE_ENDPOINT,
        is_retriable_status, parse_groups, parse_institutes, parse_lessons, send_with_retry,
        transport_retriable,
    };
    use crate::error::IngestError;

    fn status_error(status: u16) -> IngestError {
        let code = StatusCode::from_u16(status).expect("status");
        IngestError::remote(Some(status), GROUPS_ENDPOINT, is_retriable_status(code), "HTTP")
    }

    #[test]
    fn pacer_spaces_sequential_calls() {
        let pause = Duration::from_millis(30);
        let mut pacer = Pacer::new(pause);
        let calls = 5u32;
        let started = Instant::now();
        for _ in 0..calls {
            pacer.wait();
        }
        assert!(started.elapsed() >= pause * (calls - 1));
    }

    #[test]
    fn server_errors_are_retried_until_attempts_run_out() {
        let mut pacer = Pacer::new(Duration::from_millis(1));
        let mut requests = 0usize;
        let mut calls = 0u32;
        let error = send_with_retry(&mut pacer, 3, GROUPS_ENDPOINT, &mut requests, || {
            calls += 1;
            Err(status_error(503))
        })
        .expect_err("exhausted");

        assert_eq!(calls, 3);
        assert_eq!(requests, 3);
        assert!(error.is_retriable());
        assert_eq!(error.kind(), "remote");
    }

    #[test]
    fn client_errors_fail_on_the_first_attempt() {
        let mut pacer = Pacer::new(Duration::from_millis(1));
        let mut requests = 0usize;
        let mut calls = 0u32;
        let error = send_with_retry(&mut pacer, 3, GROUPS_ENDPOINT, &mut requests, || {
            calls += 1;
            Err(status_error(404))
        })
        .expect_err("not found");

        assert_eq!(calls, 1);
        assert_eq!(requests, 1);
        assert!(!error.is_retriable());
    }

    #[test]
    fn retry_returns_the_first_successful_body() {
        let mut pacer = Pacer::new(Duration::from_millis(1));
        let mut requests = 0usize;
        let mut calls = 0u32;
        let body = send_with_retry(&mut pacer, 3, GROUPS_ENDPOINT, &mut requests, || {
            calls += 1;
            if calls == 1 {
                Err(status_error(503))
            } else {
                Ok("[]".to_string())
            }
        })
        .expect("second attempt");

        assert_eq!(body, "[]");
        assert_eq!(calls, 2);
        assert_eq!(requests, 2);
    }

    #[test]
    fn only_timeouts_connects_and_server_statuses_are_transient() {
        assert!(transport_retriable(Some(StatusCode::BAD_GATEWAY), false, false));
        assert!(transport_retriable(None, true, false));
        assert!(transport_retriable(None, false, true));
        assert!(!transport_retriable(None, false, false));
        assert!(!transport_retriable(Some(StatusCode::NOT_FOUND), false, false));
    }

    #[test]
    fn independent_pacers_do_not_share_state() {
        let mut first = Pacer::new(Duration::from_millis(200));
        let mut second = Pacer::new(Duration::from_millis(200));
        first.wait();
        let started = Instant::now();
        second.wait();
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[test]
    fn server_errors_are_retriable_client_errors_are_not() {
        assert!(is_retriable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retriable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retriable_status(StatusCode::NOT_FOUND));
        assert!(!is_retriable_status(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn institutes_parse_value_and_text() {
        let body = r#"[{"Value":"a1","Text":"Институт информационных технологий"},{"Value":"b2"}]"#;
        let parsed = parse_institutes(INSTITUTES_ENDPOINT, body).expect("parse");
        assert_eq!(
            parsed,
            vec![
                RawInstitute {
                    id: Some("a1".to_string()),
                    name: Some("Институт информационных технологий".to_string()),
                },
                RawInstitute {
                    id: Some("b2".to_string()),
                    name: None,
                },
            ]
        );
    }

    #[test]
    fn groups_accept_id_aliases_and_numeric_course() {
        let body = r#"[{"Nrec":"g1","Name":"АВТ-121","Course":"1 курс"},{"Id":42,"Text":"ПМИ-221","Kurs":2}]"#;
        let parsed = parse_groups(GROUPS_ENDPOINT, body).expect("parse");
        assert_eq!(
            parsed[1],
            RawGroup {
                id: Some("42".to_string()),
                name: Some("ПМИ-221".to_string()),
                course: Some("2".to_string()),
            }
        );
        assert_eq!(parsed[0].course.as_deref(), Some("1 курс"));
    }

    #[test]
    fn non_list_payload_is_a_parse_error() {
        let error = parse_groups(GROUPS_ENDPOINT, r#"{"error":"boom"}"#).expect_err("must fail");
        assert_eq!(error.kind(), "parse");
        let error = parse_institutes(INSTITUTES_ENDPOINT, "<html>").expect_err("must fail");
        assert_eq!(error.kind(), "parse");
    }

    #[test]
    fn day_array_payload_yields_cells_with_parity() {
        let body = r#"[
            {"type":"Header","name":"ignored"},
            {"type":"Lessons","name":"Понедельник","n1":"лк, 529а-3, Филатов Д.О., Общая психология","z1":"","z2":"пр, Физическая культура и спорт, поток"}
        ]"#;
        let parsed = parse_lessons(SCHEDULE_ENDPOINT, body).expect("parse");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].weekday.as_deref(), Some("Понедельник"));
        assert_eq!(parsed[0].pair, Some(1));
        assert_eq!(parsed[0].parity.as_deref(), Some("odd"));
        assert_eq!(parsed[1].pair, Some(2));
        assert_eq!(parsed[1].parity.as_deref(), Some("even"));
    }

    #[test]
    fn nested_lesson_objects_inherit_day_context() {
        let body = r#"{"Days":[
            {"Day":2,"Lessons":[
                {"Start":"10:20","Discipline":"Базы данных","Teacher":"Иванов И.И.","Room":"301-2","Kind":"лб"}
            ]}
        ]}"#;
        let parsed = parse_lessons(SCHEDULE_ENDPOINT, body).expect("parse");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].weekday.as_deref(), Some("2"));
        assert_eq!(parsed[0].subject.as_deref(), Some("Базы данных"));
        assert_eq!(parsed[0].start.as_deref(), Some("10:20"));
        assert_eq!(parsed[0].kind.as_deref(), Some("лб"));
    }

    #[test]
    fn scalar_schedule_payload_is_rejected() {
        let error = parse_lessons(SCHEDULE_ENDPOINT, "\"oops\"").expect_err("must fail");
        assert_eq!(error.kind(), "parse");
    }
}
