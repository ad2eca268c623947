// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::process;

use clap::{Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;
use pds_dirty::cli_print_error_chain;
use pds_dirty::config::{DemoConfig, DemoParams, RangeConfig, WriteConfig};
use pds_dirty::demo;
use thiserror::Error;
use vm_migration::MemoryRangeTable;

#[derive(Error, Debug)]
enum Error {
    #[error("Failed to parse parameters")]
    ParseConfig(#[source] pds_dirty::config::ConfigError),
    #[error("Dirty tracking failed")]
    Demo(#[source] demo::DemoError),
    #[error("Failed to serialize dirty ranges")]
    Serialize(#[source] serde_json::Error),
}

fn create_app() -> Command {
    Command::new("pds-dirty")
        .version(env!("BUILT_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Track the guest pages written by an emulated PDS VF.")
        .arg(
            Arg::new("range")
                .long("range")
                .help(RangeConfig::SYNTAX)
                .num_args(1)
                .action(ArgAction::Append)
                .required(true),
        )
        .arg(
            Arg::new("page-size")
                .long("page-size")
                .help("Dirty tracking granularity in bytes")
                .num_args(1),
        )
        .arg(
            Arg::new("write")
                .long("write")
                .help(WriteConfig::SYNTAX)
                .num_args(1)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("window")
                .long("window")
                .help("Bytes of guest memory covered by each sync (default: the whole region)")
                .num_args(1),
        )
        .arg(
            Arg::new("rounds")
                .long("rounds")
                .help("Number of sync rounds")
                .num_args(1),
        )
        .arg(
            Arg::new("max-segment")
                .long("max-segment")
                .help("Largest scatter list fragment accepted by the device")
                .num_args(1),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print the dirty ranges of each round as JSON")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .help("Set the level of verbosity")
                .action(ArgAction::Count),
        )
}

fn print_round(round: usize, table: &MemoryRangeTable, json: bool) -> Result<(), Error> {
    if json {
        println!(
            "{}",
            serde_json::to_string(table).map_err(Error::Serialize)?
        );
        return Ok(());
    }

    println!(
        "round {}: {} dirty ranges, {} bytes",
        round,
        table.regions().len(),
        table.total_length()
    );
    for range in table.regions() {
        println!("  0x{:x}-0x{:x}", range.gpa, range.gpa + range.length);
    }
    Ok(())
}

fn values<'a>(cmd_arguments: &'a ArgMatches, name: &str) -> Vec<&'a str> {
    cmd_arguments
        .get_many::<String>(name)
        .map(|v| v.map(|s| s.as_str()).collect())
        .unwrap_or_default()
}

fn value<'a>(cmd_arguments: &'a ArgMatches, name: &str) -> Option<&'a str> {
    cmd_arguments.get_one::<String>(name).map(|s| s.as_str())
}

fn start_demo(cmd_arguments: &ArgMatches) -> Result<(), Error> {
    let config = DemoConfig::parse(DemoParams {
        ranges: values(cmd_arguments, "range"),
        page_size: value(cmd_arguments, "page-size"),
        writes: values(cmd_arguments, "write"),
        window: value(cmd_arguments, "window"),
        rounds: value(cmd_arguments, "rounds"),
        max_segment: value(cmd_arguments, "max-segment"),
        json: cmd_arguments.get_flag("json"),
    })
    .map_err(Error::ParseConfig)?;

    let rounds = demo::run(&config).map_err(Error::Demo)?;
    for (round, table) in rounds.iter().enumerate() {
        print_round(round, table, config.json)?;
    }

    Ok(())
}

fn main() {
    let cmd_arguments = create_app().get_matches();

    let log_level = match cmd_arguments.get_count("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_default_env()
        .init();

    if let Err(top_error) = start_demo(&cmd_arguments) {
        cli_print_error_chain(&top_error, "pds-dirty");
        process::exit(1);
    }
}
