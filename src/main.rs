use std::{panic, path::PathBuf};

use clap::Parser;

use collab_tasks::{
    cli::{self, GlobalOptions, RootCommand},
    logging::{init_logging, print_log_location},
};

#[derive(Parser, Debug)]
#[command(
    name = "collab-tasks",
    about = "Terminal client for shared task lists",
    long_about = "Manage shared task lists from the terminal and get notified when collaborators change them.",
    version = env!("COLLAB_TASKS_BUILD_VERSION"),
    author
)]
struct Cli {
    /// Use a local SQLite store instead of the service
    #[arg(long, global = true, value_name = "DB")]
    local: Option<PathBuf>,

    /// Acting user's email when using --local
    #[arg(long = "as", global = true, value_name = "EMAIL")]
    acting_as: Option<String>,

    /// Service base URL, overriding settings.toml
    #[arg(long, global = true, value_name = "URL")]
    server: Option<String>,

    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: RootCommand,
}

#[tokio::main]
async fn main() {
    let log_path = match init_logging() {
        Ok(path) => Some(path),
        Err(err) => {
            eprintln!("warning: failed to initialize logging: {err}");
            None
        }
    };
    if let Some(path) = log_path.as_ref() {
        install_panic_hook_with_log(path.clone());
    }

    let code = run_app().await;
    if code != 0
        && let Some(path) = log_path.as_ref()
    {
        print_log_location(path);
    }
    std::process::exit(code);
}

async fn run_app() -> i32 {
    let cli = Cli::parse();
    let options = GlobalOptions {
        local: cli.local,
        acting_as: cli.acting_as,
        server: cli.server,
        json: cli.json,
        quiet: cli.quiet,
    };

    cli::run(options, cli.command).await
}

fn install_panic_hook_with_log(log_path: PathBuf) {
    let previous_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        eprintln!();
        print_log_location(&log_path);
        eprintln!();
        previous_hook(panic_info);
    }));
}
