use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use crate::cmd::DoctorArgs;
use crate::exit::{CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::OutputFormat;

/// Soft descriptor limit below which a consumer is likely to run out.
const LOW_FD_LIMIT: u64 = 4096;

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Warn,
    Info,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: &'static str,
    status: CheckStatus,
    detail: String,
}

impl CheckResult {
    fn new(name: &'static str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name,
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorOutput {
    checks: Vec<CheckResult>,
    overall: &'static str,
}

pub fn run(args: DoctorArgs, format: OutputFormat) -> CliResult<i32> {
    let checks = vec![
        multiplexer_check(),
        fd_limit_check(),
        transcoder_check(&args.ffmpeg),
        temp_dir_writable_check(),
        compiled_features_check(),
    ];

    let has_fail = checks.iter().any(|c| matches!(c.status, CheckStatus::Fail));
    let output = DoctorOutput {
        checks,
        overall: if has_fail { "fail" } else { "pass" },
    };

    print_doctor(&output, format);

    if has_fail {
        Ok(HEALTH_CHECK_FAILED)
    } else {
        Ok(SUCCESS)
    }
}

fn print_doctor(output: &DoctorOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => match serde_json::to_string(output) {
            Ok(json) => println!("{json}"),
            Err(_) => println!("{{\"overall\":\"{}\"}}", output.overall),
        },
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CHECK", "STATUS", "DETAIL"]);
            for check in &output.checks {
                table.add_row(vec![
                    check.name.to_string(),
                    status_text(check.status).to_string(),
                    check.detail.clone(),
                ]);
            }
            println!("{table}");
            println!("overall: {}", output.overall);
        }
        OutputFormat::Pretty => {
            for check in &output.checks {
                println!("{:<4} {:<18} {}", status_text(check.status), check.name, check.detail);
            }
            println!("overall: {}", output.overall);
        }
        OutputFormat::Raw => println!("{}", output.overall),
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
        CheckStatus::Warn => "WARN",
        CheckStatus::Info => "INFO",
    }
}

fn multiplexer_check() -> CheckResult {
    #[cfg(target_os = "linux")]
    {
        match sockrelay::mux::Multiplexer::new() {
            Ok(mux) => CheckResult::new(
                "multiplexer",
                CheckStatus::Pass,
                format!("epoll instance created (fd {})", mux.as_raw_fd()),
            ),
            Err(err) => CheckResult::new("multiplexer", CheckStatus::Fail, err.to_string()),
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        CheckResult::new(
            "multiplexer",
            CheckStatus::Fail,
            "epoll unavailable; the consumer runs on Linux only",
        )
    }
}

fn fd_limit_check() -> CheckResult {
    match sockrelay::transport::nofile_limit() {
        Ok((soft, hard)) if soft >= LOW_FD_LIMIT || hard >= LOW_FD_LIMIT => CheckResult::new(
            "fd_limit",
            CheckStatus::Pass,
            format!("soft {soft}, hard {hard} (soft is raised to hard at startup)"),
        ),
        Ok((soft, hard)) => CheckResult::new(
            "fd_limit",
            CheckStatus::Warn,
            format!("soft {soft}, hard {hard}; few concurrent connections possible"),
        ),
        Err(err) => CheckResult::new("fd_limit", CheckStatus::Fail, err.to_string()),
    }
}

fn transcoder_check(program: &Path) -> CheckResult {
    let probe = Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output();

    match probe {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let banner = stdout.lines().next().unwrap_or_default().trim().to_string();
            CheckResult::new("transcoder", CheckStatus::Pass, banner)
        }
        Ok(output) => CheckResult::new(
            "transcoder",
            CheckStatus::Warn,
            format!("{} -version exited with {}", program.display(), output.status),
        ),
        Err(err) => CheckResult::new(
            "transcoder",
            CheckStatus::Warn,
            format!("{} not runnable: {err}", program.display()),
        ),
    }
}

fn temp_dir_writable_check() -> CheckResult {
    let dir = PathBuf::from(format!(
        "{}/sockrelay-doctor-{}",
        std::env::temp_dir().display(),
        std::process::id()
    ));
    let probe = std::fs::create_dir_all(&dir).and_then(|()| std::fs::write(dir.join("probe"), b"ok"));
    let _ = std::fs::remove_dir_all(&dir);

    match probe {
        Ok(()) => CheckResult::new(
            "temp_dir_writable",
            CheckStatus::Pass,
            format!("{} writable", std::env::temp_dir().display()),
        ),
        Err(err) => CheckResult::new(
            "temp_dir_writable",
            CheckStatus::Fail,
            format!("{} not writable: {err}", std::env::temp_dir().display()),
        ),
    }
}

fn compiled_features_check() -> CheckResult {
    let mut features = Vec::new();
    if cfg!(feature = "http") {
        features.push("http");
    }
    if cfg!(feature = "cli") {
        features.push("cli");
    }
    CheckResult::new("compiled_features", CheckStatus::Info, features.join(", "))
}
