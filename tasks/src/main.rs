use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use tasks::{LineContext, QueryResult, Task, TaskSettings, tasks_in_document, toggle_document_line};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(
    name = "tasks",
    about = "Markdown checklist tasks: parse, toggle and query",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Settings file (TOML). Missing files fall back to defaults.
    #[arg(long, global = true, default_value = "tasks.toml")]
    config: PathBuf,
    /// Override the configured global filter.
    #[arg(long, global = true)]
    global_filter: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse markdown files and print the tasks they contain.
    Parse(ParseArgs),

    /// Toggle the checklist item on one line of a file.
    Toggle(ToggleArgs),

    /// Run a query over the tasks in markdown files.
    Query(QueryArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Markdown files or directories containing markdown files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of task lines.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ToggleArgs {
    /// Markdown file containing the line.
    file: PathBuf,
    /// Line number to toggle (1-based).
    #[arg(long)]
    line: usize,
    /// Completion date to record. Defaults to today.
    #[arg(long)]
    today: Option<NaiveDate>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct QueryArgs {
    /// Markdown files or directories to search.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Query text; one instruction per line.
    #[arg(long, conflicts_with = "query_file", required_unless_present = "query_file")]
    query: Option<String>,
    /// Read the query from a file.
    #[arg(long)]
    query_file: Option<PathBuf>,
    /// Date used for relative dates in the query. Defaults to today.
    #[arg(long)]
    today: Option<NaiveDate>,
    /// Emit JSON instead of grouped task lines.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = load_settings(&cli.config, cli.global_filter)?;
    match cli.command {
        Commands::Parse(args) => handle_parse(args, &settings),
        Commands::Toggle(args) => handle_toggle(args, &settings),
        Commands::Query(args) => handle_query(args, &settings),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_settings(path: &Path, global_filter: Option<String>) -> Result<TaskSettings> {
    let mut settings =
        TaskSettings::load(path).with_context(|| format!("loading settings {:?}", path))?;
    if let Some(filter) = global_filter {
        settings.global_filter = filter;
    }
    debug!(?settings, "resolved settings");
    Ok(settings)
}

fn handle_parse(args: ParseArgs, settings: &TaskSettings) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let tasks = collect_tasks(&inputs, settings)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
    } else {
        let mut current: Option<&str> = None;
        for task in &tasks {
            if current != Some(task.path.as_str()) {
                if current.is_some() {
                    println!();
                }
                println!("== {} ==", task.path);
                current = Some(task.path.as_str());
            }
            println!("{}", task.to_file_line_string());
        }
    }
    Ok(())
}

fn handle_toggle(args: ToggleArgs, settings: &TaskSettings) -> Result<()> {
    let ToggleArgs {
        file,
        line,
        today,
        in_place,
    } = args;
    if line == 0 {
        anyhow::bail!("line numbers start at 1");
    }
    let today = today.unwrap_or_else(|| Local::now().date_naive());
    let text = fs::read_to_string(&file).with_context(|| format!("reading {:?}", file))?;
    let context = LineContext::for_path(file.display().to_string());

    let Some(updated) = toggle_document_line(&text, line - 1, &context, settings, today) else {
        anyhow::bail!("line {line} of {:?} is not a checklist item", file);
    };

    if in_place {
        fs::write(&file, updated.as_bytes()).with_context(|| format!("writing {:?}", file))?;
        info!(?file, line, "toggled");
    } else {
        print!("{updated}");
        if !updated.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn handle_query(args: QueryArgs, settings: &TaskSettings) -> Result<()> {
    let QueryArgs {
        inputs,
        query,
        query_file,
        today,
        json,
    } = args;
    let text = match (query, query_file) {
        (Some(text), _) => text,
        (None, Some(path)) => {
            fs::read_to_string(&path).with_context(|| format!("reading query {:?}", path))?
        }
        (None, None) => anyhow::bail!("either --query or --query-file is required"),
    };
    let today = today.unwrap_or_else(|| Local::now().date_naive());
    let tasks = collect_tasks(&inputs, settings)?;
    let result = QueryResult::from_query_text(&text, &tasks, today);

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    if let Some(message) = result.search_error_message() {
        anyhow::bail!("query failed: {message}");
    }
    print!("{}", render_result(&result));
    Ok(())
}

fn render_result(result: &QueryResult) -> String {
    let mut out = String::new();
    for group in result.groups() {
        if !group.names.is_empty() {
            out.push_str(&format!("## {}\n", group.heading()));
        }
        for task in group.tasks() {
            out.push_str(&task.to_file_line_string());
            out.push('\n');
        }
    }
    out.push_str(&result.total_tasks_count_display_text());
    out.push('\n');
    out
}

fn collect_tasks(inputs: &[PathBuf], settings: &TaskSettings) -> Result<Vec<Task>> {
    let expanded = expand_inputs(inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no markdown files found in the provided inputs");
    }
    let mut tasks = Vec::new();
    for path in expanded {
        debug!(?path, "scanning");
        let text = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        tasks.extend(tasks_in_document(&path.display().to_string(), &text, settings));
    }
    Ok(tasks)
}

fn is_markdown(path: &Path) -> bool {
    path.extension().map(|ext| ext == "md").unwrap_or(false)
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!(dir = ?canonical, "scanning directory");
            let mut found = Vec::new();
            visit_dir(&canonical, &mut found, &mut HashSet::new())?;
            found.sort();
            for file in found {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !is_markdown(&canonical) {
                anyhow::bail!("{:?} is not a .md file", canonical);
            }
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && is_markdown(&canonical) {
        out.push(canonical);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasks::TaskGroups;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn expand_inputs_finds_markdown_recursively() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let nested = tmp.path().join("notes/daily");
        fs::create_dir_all(&nested).expect("mkdir");
        fs::write(tmp.path().join("notes/a.md"), "- [ ] a").expect("write a");
        fs::write(nested.join("b.md"), "- [ ] b").expect("write b");
        fs::write(nested.join("skip.txt"), "- [ ] no").expect("write txt");

        let found = expand_inputs(&[tmp.path().to_path_buf(), nested.join("b.md")])
            .expect("expand");
        let names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.md", "b.md"]);
    }

    #[test]
    fn expand_inputs_rejects_other_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("todo.txt");
        fs::write(&file, "").expect("write");
        assert!(expand_inputs(&[file]).is_err());
    }

    #[test]
    fn toggle_in_place_rewrites_the_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("plants.md");
        fs::write(&file, "# Plants\n- [ ] Water 🔁 every week 📅 2021-04-09\n").expect("write");

        handle_toggle(
            ToggleArgs {
                file: file.clone(),
                line: 2,
                today: Some(date(2021, 4, 12)),
                in_place: true,
            },
            &TaskSettings::default(),
        )
        .expect("toggle");

        assert_eq!(
            fs::read_to_string(&file).expect("read"),
            "# Plants\n- [x] Water 🔁 every week 📅 2021-04-09 ✅ 2021-04-12\n- [ ] Water 🔁 every week 📅 2021-04-16\n"
        );
    }

    #[test]
    fn toggle_rejects_plain_lines() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("plants.md");
        fs::write(&file, "# Plants\n").expect("write");
        let args = ToggleArgs {
            file,
            line: 1,
            today: None,
            in_place: true,
        };
        assert!(handle_toggle(args, &TaskSettings::default()).is_err());
    }

    #[test]
    fn settings_flag_overrides_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let config = tmp.path().join("tasks.toml");
        fs::write(&config, "global_filter = \"#task\"\n").expect("write");
        assert_eq!(load_settings(&config, None).expect("load").global_filter, "#task");
        assert_eq!(
            load_settings(&config, Some("#todo".into())).expect("load").global_filter,
            "#todo"
        );
    }

    #[test]
    fn render_result_prints_headings_and_count() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("list.md");
        fs::write(&file, "- [ ] one\n- [x] two\n- [ ] three\n").expect("write");
        let tasks = collect_tasks(&[file], &TaskSettings::default()).expect("collect");

        let result = QueryResult::from_query_text("group by status\nlimit 2", &tasks, date(2022, 1, 1));
        assert_eq!(
            render_result(&result),
            "## Todo\n- [ ] one\n## Done\n- [x] two\n2 of 3 tasks\n"
        );

        let empty = QueryResult::new(TaskGroups::new(), 0);
        assert_eq!(render_result(&empty), "0 tasks\n");
    }
}
