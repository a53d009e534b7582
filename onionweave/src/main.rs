use commands::command_argument_builder;
use onionweave::handlers::{
    handle_graph, handle_init, handle_metrics_list, handle_metrics_query, handle_reclaim,
    handle_run, handle_seed, handle_status, handle_worker, print_banner,
};

mod commands;

#[tokio::main]
async fn main() {
    let cmd = command_argument_builder();
    let chosen_command = cmd.get_matches();
    let quiet = chosen_command.get_flag("quiet");

    // Show banner unless --quiet flag is set
    if !quiet {
        print_banner();
    }

    if chosen_command.subcommand().is_none() {
        // No subcommand provided, just show the banner
        return;
    }

    match chosen_command.subcommand() {
        Some(("init", primary_command)) => handle_init(primary_command),
        Some(("run", primary_command)) => handle_run(primary_command).await,
        Some(("worker", primary_command)) => {
            // Workers block on the filesystem for their whole life
            let args = primary_command.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || handle_worker(&args)).await {
                eprintln!("Worker panicked: {}", e);
                std::process::exit(1);
            }
        }
        Some(("reclaim", primary_command)) => handle_reclaim(primary_command),
        Some(("seed", primary_command)) => handle_seed(primary_command),
        Some(("status", primary_command)) => handle_status(primary_command),
        Some(("graph", primary_command)) => handle_graph(primary_command),
        Some(("metrics", primary_command)) => match primary_command.subcommand() {
            Some(("list", secondary_command)) => handle_metrics_list(secondary_command),
            Some(("query", secondary_command)) => handle_metrics_query(secondary_command),
            _ => unreachable!("clap should ensure we don't get here"),
        },
        _ => unreachable!("clap should ensure we don't get here"),
    }
}

pub const CLAP_STYLING: clap::builder::styling::Styles = clap::builder::styling::Styles::styled()
    .header(clap_cargo::style::HEADER)
    .usage(clap_cargo::style::USAGE)
    .literal(clap_cargo::style::LITERAL)
    .placeholder(clap_cargo::style::PLACEHOLDER)
    .error(clap_cargo::style::ERROR)
    .valid(clap_cargo::style::VALID)
    .invalid(clap_cargo::style::INVALID);
