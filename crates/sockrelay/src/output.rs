use std::io::IsTerminal;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use sockrelay::frame::{JobResult, Outcome};

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ResultOutput<'a> {
    source_path: &'a str,
    converted: &'a str,
    file_name: &'a str,
    outcome: &'static str,
    error: Option<&'a str>,
    timestamp: String,
}

impl<'a> ResultOutput<'a> {
    fn new(result: &'a JobResult) -> Self {
        Self {
            source_path: &result.packet.source_path,
            converted: &result.converted,
            file_name: result.converted_file_name(),
            outcome: outcome_name(result.outcome()),
            error: result.error_detail(),
            timestamp: now_unix_seconds(),
        }
    }
}

pub fn print_result(result: &JobResult, format: OutputFormat) {
    let out = ResultOutput::new(result);
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["OUTCOME", "SOURCE", "CONVERTED", "ERROR"])
                .add_row(vec![
                    out.outcome.to_string(),
                    out.source_path.to_string(),
                    out.converted.to_string(),
                    out.error.unwrap_or("-").to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => match out.error {
            Some(error) => println!(
                "{} {} -> {} ({error})",
                out.outcome, out.source_path, out.converted
            ),
            None => println!("{} {} -> {}", out.outcome, out.source_path, out.converted),
        },
        OutputFormat::Raw => println!("{}", out.file_name),
    }
}

#[derive(Serialize)]
struct ListeningOutput<'a> {
    event: &'static str,
    role: &'a str,
    addr: String,
}

/// Announce a bound listener on stdout so callers can discover the port.
pub fn print_listening(role: &str, addr: SocketAddr, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ListeningOutput {
                event: "listening",
                role,
                addr: addr.to_string(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => println!("{role} listening on {addr}"),
        OutputFormat::Raw => println!("{addr}"),
    }
}

fn outcome_name(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Success => "success",
        Outcome::Failure => "failure",
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
