use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::{Args, CommandFactory, Parser, Subcommand};
use log::info;
use schedcrawl_core::config::{AppConfig, load_config};
use schedcrawl_core::crawl::{
    CancelToken, CrawlReport, CrawlScope, CrawlState, forms_from_codes, run_crawl,
};
use schedcrawl_core::model::LessonSlot;
use schedcrawl_core::query::QueryFacade;
use schedcrawl_core::remote::{ApiClientConfig, VlsuClient};
use schedcrawl_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, inspect_runtime, normalize_for_display,
    resolve_config_path, resolve_paths,
};
use schedcrawl_core::store::Store;

#[derive(Debug, Parser)]
#[command(
    name = "schedcrawl",
    version,
    about = "Crawl the university schedule API into a local SQLite store and query it offline"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "SQLite database path")]
    db: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH", help = "Path to schedcrawl.toml")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(long, global = true, help = "Log every request and state transition")]
    debug: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    db: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            db: cli.db.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Walk forms, institutes, groups and lessons into the store")]
    Crawl(CrawlArgs),
    #[command(about = "Find groups by (part of) their name")]
    Search(SearchArgs),
    #[command(about = "Show a group's schedule for the current or given week")]
    Week(WeekArgs),
    #[command(about = "List stored institutes")]
    Institutes,
    #[command(about = "List stored groups of an institute")]
    Groups(GroupsArgs),
    #[command(about = "Show row counts of the store")]
    Stats,
}

#[derive(Debug, Args)]
struct CrawlArgs {
    #[arg(long, num_args = 1.., value_name = "CODE", help = "Study forms: 0 full-time, 1 part-time, 2 evening")]
    forms: Option<Vec<i64>>,
    #[arg(long, value_name = "SECONDS", help = "Pause between requests")]
    pause: Option<f64>,
    #[arg(long, value_name = "ID_OR_NAME", help = "Only crawl matching institutes")]
    only_institute: Option<String>,
    #[arg(long, num_args = 1.., value_name = "OFFSET", help = "Week offsets: 0 every week, 1 odd, 2 even")]
    weeks: Option<Vec<u8>>,
    #[arg(long, help = "Replace stored weeks and prune groups that are no longer listed")]
    reconcile: bool,
}

#[derive(Debug, Args)]
struct SearchArgs {
    query: String,
}

#[derive(Debug, Args)]
struct WeekArgs {
    group_id: String,
    #[arg(long, value_name = "YYYY-MM-DD", help = "Any date inside the wanted week")]
    date: Option<String>,
}

#[derive(Debug, Args)]
struct GroupsArgs {
    institute_id: String,
    #[arg(long, value_name = "N", help = "Only groups of this course year")]
    course: Option<u8>,
}

struct Runtime {
    paths: ResolvedPaths,
    config: AppConfig,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.debug);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Crawl(args)) => run_crawl_command(&runtime, args),
        Some(Commands::Search(SearchArgs { query })) => run_search(&runtime, &query),
        Some(Commands::Week(args)) => run_week(&runtime, args),
        Some(Commands::Institutes) => run_institutes(&runtime),
        Some(Commands::Groups(args)) => run_groups(&runtime, args),
        Some(Commands::Stats) => run_stats(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn run_crawl_command(runtime: &RuntimeOptions, args: CrawlArgs) -> Result<ExitCode> {
    let Runtime { paths, config } = load_runtime(runtime)?;

    let forms = forms_from_codes(&args.forms.unwrap_or_else(|| config.form_codes()))?;
    let scope = CrawlScope {
        forms,
        institute_filter: args.only_institute,
        week_offsets: args.weeks.unwrap_or_else(|| config.week_offsets()),
        reconcile: args.reconcile,
    }
    .validated()?;

    let mut client_config = ApiClientConfig::from_config(&config);
    if let Some(seconds) = args.pause {
        client_config.pause = parse_pause(seconds)?;
    }
    let pause = client_config.pause;
    let mut client = VlsuClient::new(client_config)?;
    let mut store = open_store(&paths)?;

    info!(
        "crawling {} form(s), weeks {:?} into {}",
        scope.forms.len(),
        scope.week_offsets,
        normalize_for_display(&paths.db_path)
    );
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\n[crawl] interrupt received, stopping after the current institute");
        handler_token.cancel();
    })
    .context("failed to install Ctrl-C handler")?;
    let report = run_crawl(&mut client, &mut store, &scope, &cancel)?;

    println!("crawl");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!(
        "forms_selected: {}",
        scope
            .forms
            .iter()
            .map(|form| form.as_str())
            .collect::<Vec<_>>()
            .join(",")
    );
    println!(
        "weeks: {}",
        scope
            .week_offsets
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(",")
    );
    println!("reconcile: {}", format_flag(scope.reconcile));
    println!("pause_ms: {}", pause.as_millis());
    print_crawl_report(&report);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(ExitCode::from(crawl_exit_code(&report)))
}

fn print_crawl_report(report: &CrawlReport) {
    println!("final_state: {}", report.final_state);
    println!("cancelled: {}", format_flag(report.cancelled));
    println!("forms: {}", report.forms);
    println!("institutes: {}", report.institutes);
    println!("groups: {}", report.groups);
    println!("lessons: {}", report.lessons);
    println!("lessons_inserted: {}", report.lessons_inserted);
    println!("lessons_updated: {}", report.lessons_updated);
    println!("lessons_unchanged: {}", report.lessons_unchanged);
    println!("lessons_removed: {}", report.lessons_removed);
    println!("groups_pruned: {}", report.groups_pruned);
    println!("requests: {}", report.request_count);
    println!("failures: {}", report.failures.len());
    println!("failed_institutes: {}", report.failed_institutes().len());
    if let Some(reason) = &report.abort_reason {
        println!("abort_reason: {reason}");
    }
    if !report.failures.is_empty() {
        println!("failure_details:");
        for failure in &report.failures {
            println!(
                "  - [{}] {} institute={} ({}) group={}: {}",
                failure.kind,
                failure.form.as_str(),
                failure.institute_id.as_deref().unwrap_or("?"),
                failure.institute_name.as_deref().unwrap_or("?"),
                failure.group_id.as_deref().unwrap_or("-"),
                failure.message
            );
        }
    }
}

fn parse_pause(seconds: f64) -> Result<Duration> {
    if seconds < 0.0 {
        bail!("--pause must be a non-negative number of seconds, got {seconds}");
    }
    Duration::try_from_secs_f64(seconds)
        .with_context(|| format!("--pause {seconds} is not a usable number of seconds"))
}

fn crawl_exit_code(report: &CrawlReport) -> u8 {
    if report.final_state == CrawlState::AbortedWithErrors {
        2
    } else if report.success() {
        0
    } else {
        1
    }
}

fn run_search(runtime: &RuntimeOptions, query: &str) -> Result<ExitCode> {
    let Runtime { paths, config } = load_runtime(runtime)?;
    let store = open_store_read_only(&paths)?;
    let facade = QueryFacade::new(&store, config.calendar()?);
    let groups = facade.search_groups(query)?;

    println!("search");
    println!("query: {query}");
    println!("matches: {}", groups.len());
    for group in &groups {
        println!(
            "  - {} id={} institute={} course={} form={}",
            group.name,
            group.id,
            group.institute_id,
            group
                .course_year
                .map(|year| year.to_string())
                .unwrap_or_else(|| "n/a".to_string()),
            group.study_form.as_str()
        );
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(ExitCode::SUCCESS)
}

fn run_week(runtime: &RuntimeOptions, args: WeekArgs) -> Result<ExitCode> {
    let Runtime { paths, config } = load_runtime(runtime)?;
    let store = open_store_read_only(&paths)?;
    let facade = QueryFacade::new(&store, config.calendar()?);

    let (date_label, slots, offset) = match args.date.as_deref() {
        Some(raw) => {
            let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .with_context(|| format!("invalid --date {raw:?}, expected YYYY-MM-DD"))?;
            let slots = facade.week_schedule_on(&args.group_id, date)?;
            (raw.trim().to_string(), slots, facade.calendar().week_offset(date))
        }
        None => {
            let today = chrono::Local::now().date_naive();
            let slots = facade.current_week_schedule(&args.group_id)?;
            (today.to_string(), slots, facade.calendar().week_offset(today))
        }
    };

    println!("week");
    println!("group_id: {}", args.group_id);
    if let Some(group) = store.get_group(&args.group_id)? {
        println!("group_name: {}", group.name);
    }
    println!("date: {date_label}");
    println!("week_offset: {offset}");
    println!("lessons: {}", slots.len());
    for slot in &slots {
        print_slot(slot);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_slot(slot: &LessonSlot) {
    println!(
        "  - day={} pair={} {}-{} [{}] {} | {} | {}",
        slot.weekday,
        slot.time_slot,
        slot.starts_at.as_deref().unwrap_or("?"),
        slot.ends_at.as_deref().unwrap_or("?"),
        slot.lesson_type.as_str(),
        slot.subject,
        slot.teacher.as_deref().unwrap_or("-"),
        slot.room.as_deref().unwrap_or("-")
    );
}

fn run_institutes(runtime: &RuntimeOptions) -> Result<ExitCode> {
    let Runtime { paths, .. } = load_runtime(runtime)?;
    let store = open_store_read_only(&paths)?;
    let institutes = store.list_institutes()?;

    println!("institutes");
    println!("count: {}", institutes.len());
    for institute in &institutes {
        println!(
            "  - {} id={} last_seen_form={}",
            institute.name,
            institute.id,
            institute.study_form.as_str()
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn run_groups(runtime: &RuntimeOptions, args: GroupsArgs) -> Result<ExitCode> {
    let Runtime { paths, .. } = load_runtime(runtime)?;
    let store = open_store_read_only(&paths)?;
    if store.get_institute(&args.institute_id)?.is_none() {
        bail!("institute {} is not in the store", args.institute_id);
    }
    let courses = store.course_years_for_institute(&args.institute_id)?;
    let groups = store.list_groups_for_institute(&args.institute_id, args.course)?;

    println!("groups");
    println!("institute_id: {}", args.institute_id);
    println!(
        "courses: {}",
        courses
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(",")
    );
    println!("count: {}", groups.len());
    for group in &groups {
        println!("  - {} id={}", group.name, group.id);
    }
    Ok(ExitCode::SUCCESS)
}

fn run_stats(runtime: &RuntimeOptions) -> Result<ExitCode> {
    let Runtime { paths, .. } = load_runtime(runtime)?;
    let status = inspect_runtime(&paths)?;
    let store = open_store_read_only(&paths)?;
    let stats = store.stats()?;

    println!("store stats");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("institutes: {}", stats.institutes);
    println!("groups: {}", stats.groups);
    println!("lessons: {}", stats.lessons);
    for (week, count) in &stats.lessons_by_week {
        println!("lessons.week_{week}: {count}");
    }
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(ExitCode::SUCCESS)
}

fn load_runtime(runtime: &RuntimeOptions) -> Result<Runtime> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        db: runtime.db.clone(),
        config: runtime.config.clone(),
    };
    let (config_path, _) = resolve_config_path(&context, &overrides);
    let config = load_config(&config_path)?;
    let paths = resolve_paths(&context, &overrides, &config);
    Ok(Runtime { paths, config })
}

fn open_store(paths: &ResolvedPaths) -> Result<Store> {
    Store::open(&paths.db_path)
        .with_context(|| format!("failed to open {}", normalize_for_display(&paths.db_path)))
}

fn open_store_read_only(paths: &ResolvedPaths) -> Result<Store> {
    Store::open_read_only(&paths.db_path)
        .with_context(|| format!("failed to open {}", normalize_for_display(&paths.db_path)))
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use schedcrawl_core::runtime::ValueSource;

    use super::*;

    #[test]
    fn pause_rejects_values_a_duration_cannot_hold() {
        assert!(parse_pause(1e300).is_err());
        assert!(parse_pause(-1.0).is_err());
        assert!(parse_pause(f64::NAN).is_err());
        assert!(parse_pause(f64::INFINITY).is_err());
        assert_eq!(parse_pause(0.5).expect("half second"), Duration::from_millis(500));
        assert_eq!(parse_pause(0.0).expect("zero"), Duration::ZERO);
    }

    #[test]
    fn exit_code_distinguishes_abort_cancel_and_success() {
        let done = CrawlReport {
            final_state: CrawlState::Done,
            ..CrawlReport::default()
        };
        assert_eq!(crawl_exit_code(&done), 0);

        let cancelled = CrawlReport {
            cancelled: true,
            ..done.clone()
        };
        assert_eq!(crawl_exit_code(&cancelled), 1);

        let aborted = CrawlReport {
            final_state: CrawlState::AbortedWithErrors,
            abort_reason: Some("listing study forms failed".to_string()),
            ..CrawlReport::default()
        };
        assert_eq!(crawl_exit_code(&aborted), 2);
    }

    #[test]
    fn interrupt_token_clone_cancels_the_crawl_token() {
        let cancel = CancelToken::new();
        let handler_token = cancel.clone();
        assert!(!cancel.is_cancelled());
        handler_token.cancel();
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn query_commands_do_not_create_a_missing_database() {
        let temp = tempfile::tempdir().expect("tempdir");
        let db_path = temp.path().join("state").join("schedule.db");
        let paths = ResolvedPaths {
            db_path: db_path.clone(),
            config_path: temp.path().join("schedcrawl.toml"),
            db_source: ValueSource::Flag,
            config_source: ValueSource::Default,
        };
        assert!(open_store_read_only(&paths).is_err());
        assert!(!db_path.exists());
    }
}
