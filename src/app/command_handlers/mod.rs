use crate::app::cli::{help_text, parse_cli_verb, split_global_options, CliVerb};

pub mod daemon;
pub mod maintenance;
pub mod tasks;

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    let invocation = split_global_options(args)?;
    let config = invocation.config.as_deref();
    let args = invocation.args;
    if args.is_empty() {
        return Ok(help_text());
    }

    match parse_cli_verb(args[0].as_str()) {
        CliVerb::Run => daemon::cmd_run(config),
        CliVerb::Once => daemon::cmd_once(config),
        CliVerb::Stop => daemon::cmd_stop(config),
        CliVerb::Classify => tasks::cmd_classify(config, &args[1..]),
        CliVerb::Status => tasks::cmd_status(config),
        CliVerb::Scan => tasks::cmd_scan(config),
        CliVerb::Purge => maintenance::cmd_purge(config),
        CliVerb::Help => Ok(help_text()),
        CliVerb::Unknown => Err(format!("unknown command `{}`", args[0])),
    }
}
