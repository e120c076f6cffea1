#![forbid(unsafe_code)]

//! Command-line argument parsing for the workbench.
//!
//! Parses args manually. Supports environment variable overrides via the
//! `MCS_WORKBENCH_*` prefix; flags win over the environment.

use std::env;
use std::process;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const HELP_TEXT: &str = "\
mcs-workbench: run observable-container scenarios end to end

USAGE:
    mcs-workbench [OPTIONS]

OPTIONS:
    --scenario=NAME      Run only NAME (default: every non-crashing scenario)
    --list               List scenarios and exit
    --repeat=N           Run the selection N times (default: 1)
    --log=FILTER         tracing filter directive (default: info)
    --trace-notify       Emit a trace event per listener visit
    --help, -h           Show this help message
    --version, -V        Show version

ENVIRONMENT VARIABLES:
    MCS_WORKBENCH_SCENARIO   Override --scenario
    MCS_WORKBENCH_REPEAT     Override --repeat
    MCS_WORKBENCH_LOG        Override --log
    MCS_AFFINITY             Container affinity mode: 'context' or 'thread'
    MCS_CALL_SITES           Record registration call sites (1/true)
    MCS_TRACE_NOTIFY         Same as --trace-notify (1/true)";

/// Parsed command-line options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opts {
    /// Scenario name, or `None` for the default selection.
    pub scenario: Option<String>,
    pub list: bool,
    pub repeat: u32,
    /// `tracing_subscriber::EnvFilter` directive.
    pub log: String,
    pub trace_notify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParseError {
    Help,
    Version,
    InvalidValue { flag: &'static str, value: String },
    UnknownArg(String),
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            scenario: None,
            list: false,
            repeat: 1,
            log: "info".into(),
            trace_notify: false,
        }
    }
}

impl Opts {
    pub fn parse() -> Self {
        match Self::parse_from_env_and_args(env::args().skip(1), |key| env::var(key).ok()) {
            Ok(opts) => opts,
            Err(ParseError::Help) => {
                println!("{HELP_TEXT}");
                process::exit(0);
            }
            Err(ParseError::Version) => {
                println!("mcs-workbench {VERSION}");
                process::exit(0);
            }
            Err(ParseError::InvalidValue { flag, value }) => {
                eprintln!("Invalid {flag} value: {value}");
                process::exit(1);
            }
            Err(ParseError::UnknownArg(arg)) => {
                eprintln!("Unknown argument: {arg}");
                eprintln!("Run with --help for usage information.");
                process::exit(1);
            }
        }
    }

    fn parse_from_env_and_args<I, S, F>(args: I, get_env: F) -> Result<Self, ParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&str) -> Option<String>,
    {
        let mut opts = Self::default();

        if let Some(val) = get_env("MCS_WORKBENCH_SCENARIO")
            && !val.trim().is_empty()
        {
            opts.scenario = Some(val.trim().to_string());
        }
        if let Some(val) = get_env("MCS_WORKBENCH_REPEAT")
            && let Ok(n) = val.trim().parse()
        {
            opts.repeat = n;
        }
        if let Some(val) = get_env("MCS_WORKBENCH_LOG")
            && !val.trim().is_empty()
        {
            opts.log = val;
        }

        for arg in args {
            let arg = arg.as_ref();
            match arg {
                "--help" | "-h" => return Err(ParseError::Help),
                "--version" | "-V" => return Err(ParseError::Version),
                "--list" => opts.list = true,
                "--trace-notify" => opts.trace_notify = true,
                other => {
                    if let Some(val) = other.strip_prefix("--scenario=") {
                        if val.is_empty() {
                            return Err(ParseError::InvalidValue {
                                flag: "--scenario",
                                value: val.to_string(),
                            });
                        }
                        opts.scenario = Some(val.to_string());
                    } else if let Some(val) = other.strip_prefix("--repeat=") {
                        opts.repeat = val.parse().map_err(|_| ParseError::InvalidValue {
                            flag: "--repeat",
                            value: val.to_string(),
                        })?;
                    } else if let Some(val) = other.strip_prefix("--log=") {
                        opts.log = val.to_string();
                    } else {
                        return Err(ParseError::UnknownArg(other.to_string()));
                    }
                }
            }
        }

        Ok(opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Opts, ParseError> {
        Opts::parse_from_env_and_args(args.iter(), |_| None)
    }

    fn parse_with_env(args: &[&str], env: &[(&str, &str)]) -> Result<Opts, ParseError> {
        let env: Vec<(String, String)> = env
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Opts::parse_from_env_and_args(args.iter(), move |key| {
            env.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
        })
    }

    #[test]
    fn defaults() {
        let opts = parse(&[]).unwrap();
        assert_eq!(opts, Opts::default());
        assert_eq!(opts.repeat, 1);
        assert_eq!(opts.log, "info");
    }

    #[test]
    fn flags() {
        let opts = parse(&["--scenario=staged-registry", "--repeat=3", "--trace-notify"]).unwrap();
        assert_eq!(opts.scenario.as_deref(), Some("staged-registry"));
        assert_eq!(opts.repeat, 3);
        assert!(opts.trace_notify);
    }

    #[test]
    fn help_and_version() {
        assert_eq!(parse(&["-h"]), Err(ParseError::Help));
        assert_eq!(parse(&["--version"]), Err(ParseError::Version));
    }

    #[test]
    fn invalid_repeat() {
        assert_eq!(
            parse(&["--repeat=many"]),
            Err(ParseError::InvalidValue {
                flag: "--repeat",
                value: "many".into()
            })
        );
    }

    #[test]
    fn unknown_arg() {
        assert_eq!(
            parse(&["--frobnicate"]),
            Err(ParseError::UnknownArg("--frobnicate".into()))
        );
    }

    #[test]
    fn env_overrides_and_flag_precedence() {
        let opts = parse_with_env(
            &["--repeat=2"],
            &[
                ("MCS_WORKBENCH_SCENARIO", "sequence-script"),
                ("MCS_WORKBENCH_REPEAT", "9"),
                ("MCS_WORKBENCH_LOG", "mcs_core=debug"),
            ],
        )
        .unwrap();
        assert_eq!(opts.scenario.as_deref(), Some("sequence-script"));
        assert_eq!(opts.repeat, 2);
        assert_eq!(opts.log, "mcs_core=debug");
    }

    #[test]
    fn bad_env_repeat_is_ignored() {
        let opts = parse_with_env(&[], &[("MCS_WORKBENCH_REPEAT", "lots")]).unwrap();
        assert_eq!(opts.repeat, 1);
    }
}
