use crate::CLAP_STYLING;
use clap::{Arg, arg, command};
use onionweave_core::config::{DEFAULT_CONFIG_PATH, POOLS};
use std::path::PathBuf;

fn config_arg() -> Arg {
    arg!(-c --"config" <PATH>)
        .required(false)
        .help(format!("Path to the configuration file [default: {}]", DEFAULT_CONFIG_PATH))
        .value_parser(clap::value_parser!(PathBuf))
}

pub(crate) fn command_argument_builder() -> clap::Command {
    clap::Command::new("onionweave")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("onionweave")
        .styles(CLAP_STYLING)
        .arg(arg!(-q --"quiet" "Suppress banner and non-essential output").required(false))
        .subcommand_required(false)
        .subcommand(
            command!("init")
                .about("Writes a default configuration and prepares the data directory")
                .arg(
                    arg!([PATH])
                        .required(false)
                        .help("Where to write the configuration file")
                        .default_value(DEFAULT_CONFIG_PATH),
                )
                .arg(
                    arg!(-f --"force")
                        .help("Overwrites an existing configuration without asking")
                        .required(false),
                ),
        )
        .subcommand(
            command!("run")
                .about(
                    "Reclaims abandoned messages, then launches and supervises every worker \
                pool until interrupted",
                )
                .arg(config_arg()),
        )
        .subcommand(
            command!("worker")
                .about("Runs a single worker of one pool")
                .hide(true)
                .arg(
                    arg!(-p --"pool" <NAME>)
                        .required(true)
                        .help("The pool this worker belongs to")
                        .value_parser(POOLS),
                )
                .arg(config_arg()),
        )
        .subcommand(
            command!("reclaim")
                .about("Returns claimed messages of dead workers to their inboxes")
                .arg(config_arg()),
        )
        .subcommand(
            command!("seed")
                .about("Queues URLs for fetching, ahead of anything already waiting")
                .arg(
                    arg!(-u --"url" <URL>)
                        .required(false)
                        .help("A single URL to seed")
                        .conflicts_with("hosts-file"),
                )
                .arg(
                    arg!(-H --"hosts-file" <PATH>)
                        .required(false)
                        .help("Path to a newline-delimited file of URLs to seed")
                        .value_parser(clap::value_parser!(PathBuf))
                        .conflicts_with("url"),
                )
                .arg(config_arg()),
        )
        .subcommand(
            command!("status")
                .about("Shows mailbox backlogs and crawl totals")
                .arg(config_arg()),
        )
        .subcommand(
            command!("graph")
                .about("Exports the domain link graph")
                .arg(
                    arg!(-f --"format" <FORMAT>)
                        .required(false)
                        .help("Graph format: csv, dot")
                        .value_parser(["csv", "dot"])
                        .default_value("csv"),
                )
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Save the graph to a file (default: print to screen)")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--"accessible-only")
                        .required(false)
                        .help("Only keep edges between domains that answered")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(config_arg()),
        )
        .subcommand(
            command!("metrics")
                .about("Reads the metric store")
                .subcommand_required(true)
                .subcommand(
                    command!("list")
                        .about("Lists every declared metric")
                        .arg(config_arg()),
                )
                .subcommand(
                    command!("query")
                        .about("Prints the data points of one metric")
                        .arg(
                            arg!(-i --"id" <METRIC_ID>)
                                .required(true)
                                .help("The metric id, as shown by `metrics list`")
                                .value_parser(clap::value_parser!(i64)),
                        )
                        .arg(
                            arg!(-m --"minutes" <MINUTES>)
                                .required(false)
                                .help("How far back to look")
                                .value_parser(clap::value_parser!(i64))
                                .default_value("60"),
                        )
                        .arg(config_arg()),
                ),
        )
}
