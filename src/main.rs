use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod aggregate;
mod config;
mod context;
mod db;
mod error;
mod filter;
mod loader;
mod models;
mod navigation;
mod report;
mod store;

use crate::aggregate::{
    band_histogram, by_campus, by_class, by_course, by_grade, by_status, by_teacher,
};
use crate::config::{Config, SourceConfig};
use crate::context::{Role, RoleContext};
use crate::filter::{Filterable, QueryFilters};
use crate::loader::LatestRequest;
use crate::models::{AggregatedMetric, BandHistogram};
use crate::navigation::{
    Dimension, DrillDown, LESSON_DETAILS_ROUTE, STUDENT_PROGRESS_ROUTE, TEACHER_COMPLETION_ROUTE,
};
use crate::store::{LessonRow, RecordStore};

#[derive(Parser)]
#[command(name = "completion-insights")]
#[command(about = "Course completion analytics with drill-down filters", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load the generated demo dataset into Postgres
    Seed {
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Import teacher completion rows from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Write the generated demo dataset to disk
    Generate {
        #[arg(long)]
        out: PathBuf,
        #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
        format: OutputFormat,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Filter and aggregate one dashboard view
    Dashboard {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        view: ViewArgs,
        #[arg(long, value_enum, default_value_t = View::Teachers)]
        records: View,
        #[arg(long, value_enum, default_value_t = Metric::Rows)]
        metric: Metric,
        #[arg(long, value_enum, default_value_t = GroupBy::Grade)]
        group_by: GroupBy,
        /// Only the lessons of this teacher completion row
        #[arg(long)]
        parent: Option<i64>,
        /// Keep only the highest N groups
        #[arg(long)]
        top: Option<usize>,
        #[arg(long)]
        json: bool,
        /// Re-fetch from Postgres every N seconds and print each fresh result
        #[arg(long, value_name = "SECONDS", requires = "postgres")]
        watch: Option<u64>,
    },
    /// Generate a markdown report
    Report {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        view: ViewArgs,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Build a drill-down URL
    Link {
        #[arg(long)]
        route: String,
        /// key=value, repeatable
        #[arg(long = "param")]
        params: Vec<String>,
    },
}

#[derive(Args)]
#[command(group(
    ArgGroup::new("source")
        .args(["csv_dir", "json_file", "postgres"])
        .multiple(false)
))]
struct SourceArgs {
    #[arg(long)]
    csv_dir: Option<PathBuf>,
    #[arg(long = "json-file")]
    json_file: Option<PathBuf>,
    #[arg(long)]
    postgres: bool,
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args)]
struct ViewArgs {
    #[arg(long, default_value = "admin")]
    role: Role,
    /// Teacher bound to a teacher session
    #[arg(long)]
    teacher_name: Option<String>,
    /// Student bound to a student session
    #[arg(long)]
    student_id: Option<String>,
    /// Query string of the destination view, e.g. "grade=Grade%205&filter=behind"
    #[arg(long, default_value = "")]
    query: String,
    #[arg(long, default_value = "")]
    search: String,
}

impl ViewArgs {
    /// A teacher or student role without its binding sees nothing.
    fn context(&self) -> RoleContext {
        match (self.role, &self.teacher_name, &self.student_id) {
            (Role::Teacher, Some(name), _) => RoleContext::teacher(name.clone()),
            (Role::Student, _, Some(id)) => RoleContext::student(id.clone()),
            (Role::Principal, ..) => RoleContext::principal(),
            (Role::Admin, ..) => RoleContext::admin(),
            (role, ..) => RoleContext {
                role,
                teacher_name: None,
                student_id: None,
            },
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Csv,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum View {
    Teachers,
    Students,
    Lessons,
}

impl View {
    fn route(self) -> &'static str {
        match self {
            View::Teachers => TEACHER_COMPLETION_ROUTE,
            View::Students => STUDENT_PROGRESS_ROUTE,
            View::Lessons => LESSON_DETAILS_ROUTE,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Metric {
    Rows,
    Mean,
    Count,
    Histogram,
    Summary,
    StatusTotals,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum GroupBy {
    Grade,
    Teacher,
    Class,
    Campus,
    Course,
    Status,
}

impl GroupBy {
    fn key_fn<R: Filterable>(self) -> fn(&R) -> String {
        match self {
            GroupBy::Grade => by_grade::<R>,
            GroupBy::Teacher => by_teacher::<R>,
            GroupBy::Class => by_class::<R>,
            GroupBy::Campus => by_campus::<R>,
            GroupBy::Course => by_course::<R>,
            GroupBy::Status => by_status::<R>,
        }
    }

    fn dimension(self) -> Option<Dimension> {
        match self {
            GroupBy::Grade => Some(Dimension::Grade),
            GroupBy::Teacher => Some(Dimension::Teacher),
            GroupBy::Class => Some(Dimension::Class),
            GroupBy::Status => Some(Dimension::Status),
            GroupBy::Campus | GroupBy::Course => None,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("completion_insights=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::InitDb => {
            let pool = connect(&config).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed { seed } => {
            let pool = connect(&config).await?;
            let store = store::generate(seed.unwrap_or(config.seed))?;
            let inserted = db::seed(&pool, &store).await?;
            println!("Seed data inserted ({inserted} rows).");
        }
        Commands::Import { csv } => {
            let pool = connect(&config).await?;
            let imported = db::import_teacher_csv(&pool, &csv).await?;
            println!("Imported {imported} teacher completion rows from {}.", csv.display());
        }
        Commands::Generate { out, format, seed } => {
            let store = store::generate(seed.unwrap_or(config.seed))?;
            match format {
                OutputFormat::Csv => store::write_csv_dir(&store, &out)?,
                OutputFormat::Json => store::write_json(&store, &out)?,
            }
            println!("Dataset written to {}.", out.display());
        }
        Commands::Dashboard {
            source,
            view,
            records,
            metric,
            group_by,
            parent,
            top,
            json,
            watch,
        } => {
            let ctx = view.context();
            let filters = QueryFilters::from_query_string(&view.query);
            let options = DashboardOptions {
                view: records,
                metric,
                group_by,
                parent,
                top,
                json,
            };
            options.check()?;

            match watch {
                Some(seconds) => {
                    let pool = connect(&config).await?;
                    let every = Duration::from_secs(seconds.max(1));
                    watch_dashboard(pool, every, move |store| {
                        run_dashboard(store, &ctx, &filters, &view.search, &options)
                    })
                    .await;
                }
                None => {
                    let store = load_store(&config, &source).await?;
                    run_dashboard(&store, &ctx, &filters, &view.search, &options)?;
                }
            }
        }
        Commands::Report { source, view, out } => {
            let store = load_store(&config, &source).await?;
            let filters = QueryFilters::from_query_string(&view.query);
            let report =
                report::build_report(&store, &view.context(), &filters, &view.search, config.top_n);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Link { route, params } => {
            let mut pairs = Vec::with_capacity(params.len());
            for param in &params {
                let (key, value) = param
                    .split_once('=')
                    .with_context(|| format!("parameter {param:?} is not key=value"))?;
                pairs.push((key, value));
            }
            println!("{}", navigation::build_drill_down_url(&route, pairs));
        }
    }

    Ok(())
}

async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(config.database_url()?)
        .await
        .context("failed to connect to Postgres")
}

async fn load_store(config: &Config, args: &SourceArgs) -> anyhow::Result<RecordStore> {
    let source = if let Some(dir) = &args.csv_dir {
        SourceConfig::Csv { dir: dir.clone() }
    } else if let Some(path) = &args.json_file {
        SourceConfig::Json { path: path.clone() }
    } else if args.postgres {
        SourceConfig::Postgres
    } else if args.seed.is_some() {
        SourceConfig::Generated
    } else {
        config.source.clone()
    };

    match source {
        SourceConfig::Generated => store::generate(args.seed.unwrap_or(config.seed)),
        SourceConfig::Csv { dir } => store::load_csv_dir(&dir),
        SourceConfig::Json { path } => store::load_json(&path),
        SourceConfig::Postgres => {
            let pool = connect(config).await?;
            let store = db::fetch_store(&pool).await?;
            info!(teachers = store.teachers().len(), "loaded records from postgres");
            Ok(store)
        }
    }
}

/// Starts a fetch on every tick without waiting for the previous one. A
/// fetch that resolves after a newer one was started is dropped unrendered.
async fn watch_dashboard<F>(pool: PgPool, every: Duration, render: F)
where
    F: Fn(&RecordStore) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let latest = Arc::new(LatestRequest::new());
    let render = Arc::new(render);
    let mut ticker = tokio::time::interval(every);

    loop {
        ticker.tick().await;
        let latest = Arc::clone(&latest);
        let render = Arc::clone(&render);
        let pool = pool.clone();
        tokio::spawn(async move {
            match latest.run(db::fetch_store(&pool)).await {
                Some(Ok(store)) => {
                    if let Err(e) = render(&store) {
                        warn!(error = %e, "failed to render dashboard");
                    }
                }
                Some(Err(e)) => warn!(error = %e, "failed to fetch records"),
                None => debug!("skipped superseded dashboard refresh"),
            }
        });
    }
}

const NO_MATCHES: &str = "No records match these filters.";

struct DashboardOptions {
    view: View,
    metric: Metric,
    group_by: GroupBy,
    parent: Option<i64>,
    top: Option<usize>,
    json: bool,
}

impl DashboardOptions {
    fn check(&self) -> anyhow::Result<()> {
        if self.group_by == GroupBy::Status && self.view != View::Lessons {
            bail!("--group-by status only applies to lesson records");
        }
        if self.parent.is_some() && self.view != View::Lessons {
            bail!("--parent only applies to lesson records");
        }
        Ok(())
    }
}

fn run_dashboard(
    store: &RecordStore,
    ctx: &RoleContext,
    filters: &QueryFilters,
    search: &str,
    options: &DashboardOptions,
) -> anyhow::Result<()> {
    options.check()?;

    match options.view {
        View::Teachers => {
            let rows = filter::filter(store.teachers(), ctx, filters, search);
            match options.metric {
                Metric::Rows => print_rows(&rows, options.json, |r| {
                    format!(
                        "{:>4}  {:<16} {:<12} {:<16} {:>3}%{}",
                        r.id,
                        r.teacher_name,
                        r.class_label(),
                        r.course_name,
                        r.completion_percentage,
                        if r.behind_schedule_flag { "  behind" } else { "" }
                    )
                }),
                Metric::Summary => print_value(&aggregate::summarize_teachers(&rows), options.json),
                Metric::StatusTotals => {
                    print_value(&aggregate::lesson_status_totals(&rows), options.json)
                }
                _ => print_grouped(&rows, filters, options),
            }
        }
        View::Students => {
            let rows = filter::filter(store.students(), ctx, filters, search);
            match options.metric {
                Metric::Rows => print_rows(&rows, options.json, |r| {
                    format!(
                        "{:>4}  {:<9} {:<16} {:<12} {:<16} {:>3}%{}",
                        r.id,
                        r.student_id,
                        r.student_name,
                        r.class_label(),
                        r.course_name,
                        r.completion_percentage,
                        if r.at_risk_flag { "  at risk" } else { "" }
                    )
                }),
                Metric::Summary => print_value(&aggregate::summarize_students(&rows), options.json),
                Metric::StatusTotals => bail!("status totals are computed from teacher records"),
                _ => print_grouped(&rows, filters, options),
            }
        }
        View::Lessons => {
            let all: Vec<LessonRow<'_>> = match options.parent {
                Some(id) => {
                    let parent = store
                        .teacher(id)
                        .with_context(|| format!("no teacher completion row with id {id}"))?;
                    store
                        .lessons_for(id)
                        .into_iter()
                        .map(|lesson| LessonRow { lesson, parent })
                        .collect()
                }
                None => store.lesson_rows(),
            };
            let rows = filter::filter(&all, ctx, filters, search);
            match options.metric {
                Metric::Rows => {
                    let lessons: Vec<_> = rows.iter().map(|r| r.lesson).collect();
                    print_rows(&lessons, options.json, |l| {
                        format!(
                            "{:>5}  #{:<3} {:<28} {}  {}",
                            l.teacher_completion_id,
                            l.lesson_number,
                            l.lesson_title,
                            l.planned_date,
                            l.status
                        )
                    })
                }
                Metric::Summary | Metric::StatusTotals => {
                    bail!("summaries are computed from teacher or student records")
                }
                _ => print_grouped(&rows, filters, options),
            }
        }
    }
}

fn print_rows<T: Serialize>(
    rows: &[T],
    json: bool,
    line: impl Fn(&T) -> String,
) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(rows)?);
    } else if rows.is_empty() {
        println!("{NO_MATCHES}");
    } else {
        for row in rows {
            println!("{}", line(row));
        }
    }
    Ok(())
}

fn print_value<T: Serialize>(value: &T, json: bool) -> anyhow::Result<()> {
    let rendered = if json {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{rendered}");
    Ok(())
}

fn print_grouped<R: Filterable>(
    rows: &[R],
    filters: &QueryFilters,
    options: &DashboardOptions,
) -> anyhow::Result<()> {
    let key = options.group_by.key_fn::<R>();
    let json = options.json;

    if options.metric == Metric::Histogram {
        let histogram = band_histogram(rows, key);
        if json {
            return print_value(&histogram, json);
        }
        for line in histogram_lines(&histogram) {
            println!("{line}");
        }
        return Ok(());
    }

    let metrics: Vec<AggregatedMetric> = if options.metric == Metric::Mean {
        aggregate::aggregate(rows, key, aggregate::mean_completion)
    } else {
        aggregate::aggregate(rows, key, aggregate::count)
    };
    let metrics = match options.top {
        Some(n) => aggregate::top_n(metrics, n),
        None => metrics,
    };

    if json {
        return print_value(&metrics, json);
    }
    if metrics.is_empty() {
        println!("{NO_MATCHES}");
    }
    for metric in &metrics {
        let link = options
            .group_by
            .dimension()
            .map(|dimension| {
                DrillDown::carrying(options.view.route(), filters)
                    .with(dimension, &metric.group_key)
                    .url()
            })
            .unwrap_or_default();
        println!("{:<24} {:>6}  {}", metric.group_key, metric.value, link);
    }
    Ok(())
}

fn histogram_lines(histogram: &[BandHistogram]) -> Vec<String> {
    if histogram.is_empty() {
        return vec![NO_MATCHES.to_string()];
    }
    histogram
        .iter()
        .map(|row| {
            format!(
                "{:<20} {:>4} {:>4} {:>4} {:>4}",
                row.group_key, row.band0_25, row.band25_50, row.band50_75, row.band75_100
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::student;

    #[test]
    fn empty_histogram_prints_empty_state() {
        let students = vec![student(1, "STU-1", "Asha", 40)];
        let none = filter::filter(
            &students,
            &RoleContext::admin(),
            &QueryFilters::from_query_string("grade=Grade%209"),
            "",
        );
        let histogram = band_histogram(&none, by_grade);
        assert_eq!(histogram_lines(&histogram), vec![NO_MATCHES.to_string()]);

        let lines = histogram_lines(&band_histogram(&students, by_grade));
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("Grade 5"));
    }

    #[test]
    fn status_grouping_needs_lesson_view() {
        let options = DashboardOptions {
            view: View::Teachers,
            metric: Metric::Count,
            group_by: GroupBy::Status,
            parent: None,
            top: None,
            json: false,
        };
        assert!(options.check().is_err());
        let lessons = DashboardOptions {
            view: View::Lessons,
            ..options
        };
        assert!(lessons.check().is_ok());
    }

    #[test]
    fn watch_flag_requires_postgres_source() {
        let parsed = Cli::try_parse_from(["completion-insights", "dashboard", "--watch", "5"]);
        assert!(parsed.is_err());
        let parsed = Cli::try_parse_from([
            "completion-insights",
            "dashboard",
            "--postgres",
            "--watch",
            "5",
        ]);
        assert!(parsed.is_ok());
    }
}
