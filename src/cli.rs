use anyhow::Result;
use clap::{ArgAction, builder::PossibleValuesParser, value_parser};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::tunnel::TunnelMethod;

#[derive(Debug, Clone)]
pub struct AppArgs {
    pub config_file: String,
    pub config_test: bool,
    pub methods: Vec<TunnelMethod>,
    pub log_level: String,
}

fn command() -> clap::Command {
    clap::Command::new("sshtunnel-harness")
        .version(crate::VERSION)
        .about("Runs destination acceptance checks through an SSH tunnel")
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Config filename")
                .default_value("harness.yaml")
                .value_parser(value_parser!(String))
                .num_args(1),
        )
        .arg(
            clap::Arg::new("method")
                .short('m')
                .long("method")
                .help("Tunnel method to run; repeat to run several")
                .value_parser(PossibleValuesParser::new(["ssh-key", "password", "none"]))
                .action(ArgAction::Append),
        )
        .arg(
            clap::Arg::new("log-level")
                .short('l')
                .long("log")
                .help("Set log level")
                .value_parser(PossibleValuesParser::new([
                    "error", "warn", "info", "debug", "trace",
                ]))
                .num_args(1),
        )
        .arg(
            clap::Arg::new("config-check")
                .short('t')
                .long("test")
                .help("Load and check config file then exits")
                .action(ArgAction::SetTrue),
        )
}

fn args_from_matches(args: &clap::ArgMatches) -> Result<AppArgs> {
    let config_file = args
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("harness.yaml")
        .to_string();
    let config_test = args.get_flag("config-check");
    let methods = args
        .get_many::<String>("method")
        .into_iter()
        .flatten()
        .map(|m| m.parse::<TunnelMethod>())
        .collect::<Result<Vec<_>, _>>()?;
    let log_level = args
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info")
        .to_string();
    Ok(AppArgs {
        config_file,
        config_test,
        methods,
        log_level,
    })
}

pub fn parse_args() -> Result<AppArgs> {
    let args = args_from_matches(&command().get_matches())?;
    init_logging(&args.log_level)?;
    Ok(args)
}

/// Logs go to stderr; stdout carries the JSON report.
pub fn init_logging(log_level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(log_level.parse()?)
                .from_env()?,
        )
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> AppArgs {
        let matches = command().try_get_matches_from(argv).unwrap();
        args_from_matches(&matches).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["sshtunnel-harness"]);
        assert_eq!(args.config_file, "harness.yaml");
        assert!(!args.config_test);
        assert!(args.methods.is_empty());
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_methods_and_flags() {
        let args = parse(&[
            "sshtunnel-harness",
            "-c",
            "ci.yaml",
            "-m",
            "ssh-key",
            "--method",
            "none",
            "-t",
            "-l",
            "debug",
        ]);
        assert_eq!(args.config_file, "ci.yaml");
        assert!(args.config_test);
        assert_eq!(args.methods, vec![TunnelMethod::SshKeyAuth, TunnelMethod::NoTunnel]);
        assert_eq!(args.log_level, "debug");
    }

    #[test]
    fn test_rejects_unknown_method() {
        assert!(
            command()
                .try_get_matches_from(["sshtunnel-harness", "-m", "telnet"])
                .is_err()
        );
    }

    #[test]
    fn test_log_levels_parse_as_directives() {
        for level in ["error", "warn", "info", "debug", "trace"] {
            assert!(level.parse::<tracing_subscriber::filter::Directive>().is_ok());
        }
    }
}
