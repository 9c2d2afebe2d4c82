use clap::{Arg, ArgAction, Command};

pub(super) fn root_cli() -> Command {
    Command::new("procwin")
        .about("Processing-time aligned windowing")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(add_processor_subcommand())
        .subcommand(add_gate_subcommand())
}

fn add_processor_subcommand() -> Command {
    Command::new("processor")
        .about("Windows `[key] value` lines read from stdin and writes the results as JSON lines")
        .arg(
            Arg::new("no-metrics")
                .long("no-metrics")
                .action(ArgAction::SetTrue)
                .help("Do not serve Prometheus metrics"),
        )
}

fn add_gate_subcommand() -> Command {
    Command::new("gate").about("Serves the access gate for administrative endpoints")
}
