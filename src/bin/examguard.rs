//! Examguard CLI - Command-line interface for the Examguard integrity engine
//!
//! Commands:
//! - replay: Run recorded input through a session and report the decisions
//! - validate: Validate examguard.input.v1 records
//! - config: Print the effective configuration
//! - doctor: Diagnose configuration and environment

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use examguard::schema::{InputRecord, RecordReader, SCHEMA_VERSION};
use examguard::session::SectionPlan;
use examguard::{replay_records, AssessmentPlan, EngineConfig, IntegrityError, ReplayReport};
use examguard::{ENGINE_VERSION, PRODUCER_NAME};

/// Examguard - Integrity engine for proctored assessment sessions
#[derive(Parser)]
#[command(name = "examguard")]
#[command(version = ENGINE_VERSION)]
#[command(about = "Replay and inspect proctored-session integrity decisions", long_about = None)]
struct Cli {
    /// Emit logs as JSON on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay recorded input through a session
    Replay {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output format
        #[arg(long, default_value = "json-pretty")]
        output_format: OutputFormat,

        /// Engine configuration (TOML); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Assessment identifier
        #[arg(long, default_value = "replay-assessment")]
        assessment_id: String,

        /// Session token
        #[arg(long, default_value = "replay-session")]
        session_token: String,

        /// Section as id:seconds; repeat for several sections
        #[arg(long = "section", default_value = "section-1:3600")]
        sections: Vec<String>,
    },

    /// Validate input records
    Validate {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file to load and validate
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Diagnose configuration and environment
    Doctor {
        /// Configuration file to check
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum InputFormat {
    /// Newline-delimited JSON (one record per line)
    Ndjson,
    /// JSON array of records
    Json,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Full report as compact JSON
    Json,
    /// Full report as pretty-printed JSON
    JsonPretty,
    /// One violation per line
    Ndjson,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string()));
            ExitCode::FAILURE
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run(cli: Cli) -> Result<(), ExamguardCliError> {
    match cli.command {
        Commands::Replay {
            input,
            output,
            input_format,
            output_format,
            config,
            assessment_id,
            session_token,
            sections,
        } => {
            let plan = AssessmentPlan {
                assessment_id,
                session_token,
                sections: parse_sections(&sections)?,
            };
            cmd_replay(&input, &output, input_format, output_format, config.as_deref(), plan)
        }

        Commands::Validate {
            input,
            input_format,
            json,
        } => cmd_validate(&input, input_format, json),

        Commands::Config { config } => cmd_config(config.as_deref()),

        Commands::Doctor { config, json } => cmd_doctor(config.as_deref(), json),
    }
}

fn cmd_replay(
    input: &Path,
    output: &Path,
    input_format: InputFormat,
    output_format: OutputFormat,
    config: Option<&Path>,
    plan: AssessmentPlan,
) -> Result<(), ExamguardCliError> {
    let config = load_config(config)?;
    let records = read_records(input, &input_format)?;
    if records.is_empty() {
        return Err(ExamguardCliError::NoRecords);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(replay_records(&records, plan, config))?;

    let rendered = format_report(&report, &output_format)?;
    if output.to_string_lossy() == "-" {
        let mut stdout = io::stdout().lock();
        stdout.write_all(rendered.as_bytes())?;
        stdout.flush()?;
    } else {
        fs::write(output, rendered)?;
    }
    Ok(())
}

fn cmd_validate(
    input: &Path,
    input_format: InputFormat,
    json: bool,
) -> Result<(), ExamguardCliError> {
    let records = read_records(input, &input_format)?;
    let results = RecordReader::validate_records(&records);

    let report = ValidationReport {
        total_records: records.len(),
        valid_records: records.len() - results.len(),
        invalid_records: results.len(),
        errors: results
            .iter()
            .map(|r| ValidationErrorDetail {
                index: r.index,
                record_id: r.record_id.clone(),
                error: r.result.as_ref().map(|e| e.to_string()).unwrap_or_default(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Total records:   {}", report.total_records);
        println!("Valid records:   {}", report.valid_records);
        println!("Invalid records: {}", report.invalid_records);

        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!(
                    "  - Record {} (index {}): {}",
                    err.record_id.as_deref().unwrap_or("unknown"),
                    err.index,
                    err.error
                );
            }
        }
    }

    if report.invalid_records > 0 {
        Err(ExamguardCliError::ValidationFailed(report.invalid_records))
    } else {
        Ok(())
    }
}

fn cmd_config(config: Option<&Path>) -> Result<(), ExamguardCliError> {
    let config = load_config(config)?;
    print!("{}", config.to_toml_string()?);
    Ok(())
}

fn cmd_doctor(config: Option<&Path>, json: bool) -> Result<(), ExamguardCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "engine_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Examguard version {}", ENGINE_VERSION),
    });

    checks.push(DoctorCheck {
        name: "schema_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Input schema: {}", SCHEMA_VERSION),
    });

    match config {
        Some(path) if !path.exists() => checks.push(DoctorCheck {
            name: "config".to_string(),
            status: CheckStatus::Warning,
            message: "Config file does not exist; defaults apply".to_string(),
        }),
        Some(path) => match EngineConfig::from_path(path) {
            Ok(config) => checks.push(DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Ok,
                message: format!(
                    "Config valid (tab switch limit {}, cool-down {} ms, vision {})",
                    config.policy.tab_switch_limit,
                    config.policy.cool_down_ms,
                    if config.vision.enabled { "on" } else { "off" }
                ),
            }),
            Err(e) => checks.push(DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Error,
                message: e.to_string(),
            }),
        },
        None => checks.push(DoctorCheck {
            name: "config".to_string(),
            status: CheckStatus::Ok,
            message: "No config file given; defaults apply".to_string(),
        }),
    }

    checks.push(stdin_check(stdin_is_terminal()));

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: ENGINE_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Examguard Doctor Report");
        println!("=======================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(ExamguardCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// Helper functions

fn load_config(path: Option<&Path>) -> Result<EngineConfig, ExamguardCliError> {
    let config = match path {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

/// `--input -` reads stdin; on a terminal that waits for typed records
fn stdin_check(is_terminal: bool) -> DoctorCheck {
    if is_terminal {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Warning,
            message: "stdin is a terminal; --input - will wait for typed records".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (replay input ready)".to_string(),
        }
    }
}

fn stdin_is_terminal() -> bool {
    atty::is(atty::Stream::Stdin)
}

fn read_records(input: &Path, format: &InputFormat) -> Result<Vec<InputRecord>, ExamguardCliError> {
    let input_data = if input.to_string_lossy() == "-" {
        if stdin_is_terminal() {
            tracing::warn!("Reading records from the terminal; end input with Ctrl-D");
        }
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        fs::read_to_string(input)?
    };

    let records = match format {
        InputFormat::Ndjson => RecordReader::parse_ndjson(&input_data)?,
        InputFormat::Json => RecordReader::parse_array(&input_data)?,
    };
    Ok(records)
}

fn parse_sections(values: &[String]) -> Result<Vec<SectionPlan>, ExamguardCliError> {
    values
        .iter()
        .map(|value| {
            let (id, seconds) = value
                .rsplit_once(':')
                .ok_or_else(|| ExamguardCliError::InvalidSection(value.clone()))?;
            let duration_seconds = seconds
                .parse::<u32>()
                .ok()
                .filter(|s| *s > 0)
                .ok_or_else(|| ExamguardCliError::InvalidSection(value.clone()))?;
            if id.is_empty() {
                return Err(ExamguardCliError::InvalidSection(value.clone()));
            }
            Ok(SectionPlan {
                section_id: id.to_string(),
                duration_seconds,
            })
        })
        .collect()
}

fn format_report(report: &ReplayReport, format: &OutputFormat) -> Result<String, ExamguardCliError> {
    match format {
        OutputFormat::Ndjson => {
            let mut lines: Vec<String> = Vec::new();
            for violation in &report.violations {
                lines.push(serde_json::to_string(violation)?);
            }
            Ok(lines.join("\n") + "\n")
        }
        OutputFormat::Json => Ok(serde_json::to_string(report)? + "\n"),
        OutputFormat::JsonPretty => Ok(serde_json::to_string_pretty(report)? + "\n"),
    }
}

// Error types

#[derive(Debug)]
enum ExamguardCliError {
    Io(io::Error),
    Engine(IntegrityError),
    Json(serde_json::Error),
    NoRecords,
    InvalidSection(String),
    ValidationFailed(usize),
    DoctorFailed,
}

impl From<io::Error> for ExamguardCliError {
    fn from(e: io::Error) -> Self {
        ExamguardCliError::Io(e)
    }
}

impl From<IntegrityError> for ExamguardCliError {
    fn from(e: IntegrityError) -> Self {
        ExamguardCliError::Engine(e)
    }
}

impl From<serde_json::Error> for ExamguardCliError {
    fn from(e: serde_json::Error) -> Self {
        ExamguardCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<ExamguardCliError> for CliError {
    fn from(e: ExamguardCliError) -> Self {
        match e {
            ExamguardCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            ExamguardCliError::Engine(e @ (IntegrityError::Config(_) | IntegrityError::Toml(_))) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'examguard config' to see the effective configuration".to_string()),
            },
            ExamguardCliError::Engine(e @ (IntegrityError::ParseError(_) | IntegrityError::JsonError(_))) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Ensure input matches examguard.input.v1 schema".to_string()),
            },
            ExamguardCliError::Engine(e) => CliError {
                code: "ENGINE_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check the command sequence in the input".to_string()),
            },
            ExamguardCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            ExamguardCliError::NoRecords => CliError {
                code: "NO_RECORDS".to_string(),
                message: "No records found in input".to_string(),
                hint: Some("Ensure input file is not empty".to_string()),
            },
            ExamguardCliError::InvalidSection(value) => CliError {
                code: "INVALID_SECTION".to_string(),
                message: format!("Invalid section '{}'", value),
                hint: Some("Use id:seconds with seconds > 0, e.g. --section part-a:1800".to_string()),
            },
            ExamguardCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} records failed validation", count),
                hint: Some("Fix validation errors and retry".to_string()),
            },
            ExamguardCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct ValidationReport {
    total_records: usize,
    valid_records: usize,
    invalid_records: usize,
    errors: Vec<ValidationErrorDetail>,
}

#[derive(serde::Serialize)]
struct ValidationErrorDetail {
    index: usize,
    record_id: Option<String>,
    error: String,
}

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_stdin_check_warns_on_terminal() {
        let check = stdin_check(true);
        assert_eq!(check.name, "stdin");
        assert!(matches!(check.status, CheckStatus::Warning));

        let check = stdin_check(false);
        assert!(matches!(check.status, CheckStatus::Ok));
    }
}
