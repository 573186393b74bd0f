use std::io::{self, BufRead, IsTerminal, Write};
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use elec_devupdate::app::App;
use elec_devupdate::config::{ConfigLoader, Settings};
use elec_devupdate::domain::BuildLink;
use elec_devupdate::error::DevUpdateError;
use elec_devupdate::output::{JsonOutput, OutputMode, TextOutput};
use elec_devupdate::system::{OS_RELEASE_PATH, OsRelease};
use elec_devupdate::tui::TerminalProgress;

#[derive(Parser)]
#[command(name = "devupdate")]
#[command(about = "Find and stage LibreELEC/OpenELEC development builds and releases")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Override the detected arch, e.g. Generic.x86_64
    #[arg(long, global = true)]
    arch: Option<String>,

    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "List the build sources for this platform")]
    Sources,
    #[command(about = "List the builds a source offers, newest first")]
    List(ListArgs),
    #[command(about = "Download a build and stage it for installation")]
    Fetch(FetchArgs),
    #[command(about = "Check whether a newer build is available")]
    Check(SourceArgs),
    #[command(about = "Confirm the build staged by the last fetch is now installed")]
    Confirm,
    #[command(about = "Show the full release notes behind a build summary")]
    Notes { url: String },
}

#[derive(Args)]
struct SourceArgs {
    #[arg(long, short)]
    source: Option<String>,
}

#[derive(Args)]
struct ListArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Seconds to wait for build summaries
    #[arg(long, default_value_t = 5)]
    wait: u64,
}

#[derive(Args)]
struct FetchArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Position in the listing (0 is newest); prompts when omitted
    #[arg(long, short)]
    index: Option<usize>,

    #[arg(long)]
    no_verify: bool,

    /// Keep a copy of every downloaded build under DIR
    #[arg(long, value_name = "DIR")]
    archive: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<DevUpdateError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &DevUpdateError) -> u8 {
    match error {
        DevUpdateError::UnknownSource(_) | DevUpdateError::NoBuildsFound { .. } => 2,
        DevUpdateError::Connection { .. } | DevUpdateError::ListingUnavailable { .. } => 3,
        DevUpdateError::IntegrityMismatch { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let mut settings = ConfigLoader::resolve(cli.config.as_deref())?;
    if cli.arch.is_some() {
        settings.arch = cli.arch;
    }
    if let Commands::Fetch(args) = &cli.command {
        apply_fetch_overrides(&mut settings, args);
    }

    let os_release = match OsRelease::load(Path::new(OS_RELEASE_PATH)) {
        Ok(release) => release,
        Err(err) => {
            debug!(error = %err, "os-release unavailable");
            OsRelease::default()
        }
    };
    let app = App::from_settings(&settings, os_release)?;

    match cli.command {
        Commands::Sources => {
            let result = app.sources();
            match output_mode {
                OutputMode::Json => JsonOutput::print_sources(&result),
                OutputMode::Human => TextOutput::print_sources(&result),
            }
            .into_diagnostic()
        }
        Commands::List(args) => {
            let source = app.source_name(args.source.source.as_deref())?;
            let result = app.list(&source, Duration::from_secs(args.wait))?;
            if result.builds.is_empty() {
                return Err(no_builds(&app).into());
            }
            match output_mode {
                OutputMode::Json => JsonOutput::print_list(&result),
                OutputMode::Human => TextOutput::print_list(&result),
            }
            .into_diagnostic()
        }
        Commands::Fetch(args) => run_fetch(&app, args, output_mode),
        Commands::Check(args) => {
            let source = app.source_name(args.source.as_deref())?;
            let result = app.check(&source)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_check(&result),
                OutputMode::Human => TextOutput::print_check(&result),
            }
            .into_diagnostic()
        }
        Commands::Confirm => {
            let result = app.confirm()?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_confirm(&result),
                OutputMode::Human => TextOutput::print_confirm(&result),
            }
            .into_diagnostic()
        }
        Commands::Notes { url } => {
            println!("{}", app.details(&url)?);
            Ok(())
        }
    }
}

fn apply_fetch_overrides(settings: &mut Settings, args: &FetchArgs) {
    if args.no_verify {
        settings.verify_files = false;
    }
    if let Some(archive) = &args.archive {
        settings.archive_root = Some(archive.clone());
    }
}

fn run_fetch(app: &App, args: FetchArgs, output_mode: OutputMode) -> miette::Result<()> {
    let source = app.source_name(args.source.source.as_deref())?;
    let mut builds = app.builds(&source)?;
    if builds.is_empty() {
        return Err(no_builds(app).into());
    }

    let index = match args.index {
        Some(index) => index,
        None if io::stdin().is_terminal() && matches!(output_mode, OutputMode::Human) => {
            prompt_index(&builds)?
        }
        None => 0,
    };
    if index >= builds.len() {
        return Err(miette::Report::msg(format!(
            "index {index} out of range; {source} lists {} builds",
            builds.len()
        )));
    }
    let link = builds.swap_remove(index);

    let result = {
        let sink = TerminalProgress::new();
        app.fetch(&source, link, &sink)?
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print_fetch(&result),
        OutputMode::Human => TextOutput::print_fetch(&result),
    }
    .into_diagnostic()
}

fn prompt_index(builds: &[BuildLink]) -> miette::Result<usize> {
    let mut stdout = io::stdout().lock();
    for (index, link) in builds.iter().enumerate() {
        writeln!(stdout, "{index:>3}  {link}").into_diagnostic()?;
    }
    write!(stdout, "Build to fetch [0]: ").into_diagnostic()?;
    stdout.flush().into_diagnostic()?;
    drop(stdout);

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).into_diagnostic()?;
    let line = line.trim();
    if line.is_empty() {
        return Ok(0);
    }
    line.parse()
        .map_err(|_| miette::Report::msg(format!("not a build number: {line}")))
}

fn no_builds(app: &App) -> DevUpdateError {
    DevUpdateError::NoBuildsFound {
        platform: app.platform().to_string(),
    }
}
