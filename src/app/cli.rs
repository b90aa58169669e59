use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Run,
    Once,
    Classify,
    Status,
    Purge,
    Scan,
    Stop,
    Help,
    Unknown,
}

pub fn parse_cli_verb(input: &str) -> CliVerb {
    match input {
        "run" => CliVerb::Run,
        "once" => CliVerb::Once,
        "classify" => CliVerb::Classify,
        "status" => CliVerb::Status,
        "purge" => CliVerb::Purge,
        "scan" => CliVerb::Scan,
        "stop" => CliVerb::Stop,
        "help" | "-h" | "--help" => CliVerb::Help,
        _ => CliVerb::Unknown,
    }
}

/// Arguments after global options were split off.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliInvocation {
    pub config: Option<PathBuf>,
    pub args: Vec<String>,
}

/// Pulls `--config <path>` / `--config=<path>` out of `args`, wherever it
/// appears.
pub fn split_global_options(args: Vec<String>) -> Result<CliInvocation, String> {
    let mut invocation = CliInvocation::default();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let value = iter
                .next()
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| "--config requires a path".to_string())?;
            invocation.config = Some(PathBuf::from(value));
        } else if let Some(value) = arg.strip_prefix("--config=") {
            if value.trim().is_empty() {
                return Err("--config requires a path".to_string());
            }
            invocation.config = Some(PathBuf::from(value));
        } else {
            invocation.args.push(arg);
        }
    }
    Ok(invocation)
}

pub fn cli_help_lines() -> Vec<String> {
    vec![
        "Usage: taskgate [--config <path>] <command>".to_string(),
        String::new(),
        "Commands:".to_string(),
        "  run                  Run the scheduler loop until stopped".to_string(),
        "  once                 Classify and execute eligible tasks, then exit".to_string(),
        "  classify <file>      Run the gate pipeline on one pending task".to_string(),
        "  status               Show task counts, SLA compliance and recent errors".to_string(),
        "  purge                Delete snapshots past the retention window".to_string(),
        "  scan                 Scan task folders for credential patterns".to_string(),
        "  stop                 Signal a running scheduler to stop".to_string(),
    ]
}

pub(crate) fn help_text() -> String {
    cli_help_lines().join("\n")
}
