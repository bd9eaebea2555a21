//! `tonpixo check` - configuration and backend diagnostics.
//!
//! Each check reports pass/fail with a hint on failures.

use std::error::Error as _;
use std::path::Path;
use std::time::Duration;

use crate::config::Config;
use crate::session::{AmbientIdSource, FileAmbientSource};
use crate::settings::Settings;

enum CheckResult {
    Pass(String),
    Fail(String),
    Skip(String),
}

fn check(name: &str, result: CheckResult, passed: &mut u32, failed: &mut u32) {
    match result {
        CheckResult::Pass(detail) => {
            *passed += 1;
            println!("  [pass] {name}: {detail}");
        }
        CheckResult::Fail(detail) => {
            *failed += 1;
            println!("  [FAIL] {name}: {detail}");
        }
        CheckResult::Skip(reason) => {
            println!("  [skip] {name}: {reason}");
        }
    }
}

/// Run all checks and print results. Fails if any check failed.
pub async fn run_check_command(config_path: Option<&Path>, timeout: Duration) -> anyhow::Result<()> {
    println!("tonpixo check");
    println!("=============\n");

    let mut passed = 0u32;
    let mut failed = 0u32;

    check(
        "Config file",
        check_config_file(config_path),
        &mut passed,
        &mut failed,
    );

    let config = Config::from_env_with_toml(config_path);
    check(
        "Configuration",
        match &config {
            Ok(config) => CheckResult::Pass(format!(
                "backend {} as user '{}'",
                config.api.base_url, config.api.user_id
            )),
            Err(e) => CheckResult::Fail(e.to_string()),
        },
        &mut passed,
        &mut failed,
    );

    match &config {
        Ok(config) => {
            check(
                "Saved conversation",
                check_session_pointer(&config.identity.pointer_path),
                &mut passed,
                &mut failed,
            );
            check(
                "Backend reachability",
                check_backend(&config.api.base_url, timeout).await,
                &mut passed,
                &mut failed,
            );
        }
        Err(_) => {
            check(
                "Backend reachability",
                CheckResult::Skip("configuration is invalid".to_string()),
                &mut passed,
                &mut failed,
            );
        }
    }

    println!("\n{passed} passed, {failed} failed");
    if failed > 0 {
        anyhow::bail!("{failed} check(s) failed");
    }
    Ok(())
}

fn check_config_file(explicit: Option<&Path>) -> CheckResult {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(Settings::default_toml_path);
    match Settings::load_toml(&path) {
        Ok(Some(_)) => CheckResult::Pass(format!("loaded {}", path.display())),
        Ok(None) if explicit.is_some() => {
            CheckResult::Fail(format!("{} does not exist", path.display()))
        }
        Ok(None) => CheckResult::Skip(format!("no file at {}, using defaults", path.display())),
        Err(e) => CheckResult::Fail(e),
    }
}

fn check_session_pointer(path: &Path) -> CheckResult {
    match FileAmbientSource::new(path).read() {
        Some(id) => CheckResult::Pass(format!("will resume {id}")),
        None => CheckResult::Skip("a new conversation will be started".to_string()),
    }
}

async fn check_backend(base_url: &str, timeout: Duration) -> CheckResult {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => return CheckResult::Fail(format!("HTTP client init failed: {e}")),
    };
    // Any HTTP answer, even 404 for the unknown job, proves the API is up.
    let url = format!("{}/api/status/tonpixo-check", base_url.trim_end_matches('/'));
    match client.get(&url).send().await {
        Ok(response) if response.status().is_server_error() => {
            CheckResult::Fail(format!("{url} answered {}", response.status()))
        }
        Ok(response) => CheckResult::Pass(format!("{url} answered {}", response.status())),
        Err(e) => CheckResult::Fail(format!(
            "{} ({e}); is the backend running and TONPIXO_API_URL correct?",
            classify_transport_error(&e)
        )),
    }
}

fn classify_transport_error(error: &reqwest::Error) -> &'static str {
    if error.is_timeout() {
        return "timed out";
    }

    let mut source = error.source();
    while let Some(err) = source {
        if let Some(io_error) = err.downcast_ref::<std::io::Error>() {
            return match io_error.kind() {
                std::io::ErrorKind::NotFound => "DNS lookup failed",
                std::io::ErrorKind::ConnectionRefused => "connection refused",
                _ => "connection failed",
            };
        }
        source = err.source();
    }

    let lowered = error.to_string().to_ascii_lowercase();
    if lowered.contains("dns") || lowered.contains("lookup") || lowered.contains("no such host") {
        "DNS lookup failed"
    } else {
        "connection failed"
    }
}
