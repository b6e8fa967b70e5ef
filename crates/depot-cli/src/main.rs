//! depot - game content delivery CLI

use anyhow::Result;
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use depot_cli::cmd;
use depot_cli::{Cli, Commands, EngineCommands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let (home, quiet) = (cli.home, cli.quiet);

    match cli.command {
        Commands::Update(args) => {
            let ctx = cmd::open_context(home, quiet)?;
            cmd::update::update(ctx, &args).await
        }
        Commands::Engine { command } => match command {
            EngineCommands::Ensure { version } => {
                let ctx = cmd::open_context(home, quiet)?;
                cmd::engine::ensure(&ctx, &version).await
            }
        },
        Commands::Resolve {
            version,
            platform,
            no_follow,
            json,
        } => {
            let ctx = cmd::open_context(home, quiet)?;
            cmd::resolve::resolve(&ctx, &version, platform.as_deref(), no_follow, json).await
        }
        Commands::List => cmd::list::list(&cmd::open_context(home, quiet)?),
        Commands::Ls { fork } => cmd::ls::ls(&cmd::open_context(home, quiet)?, &fork),
        Commands::Cat { fork, path } => {
            let ctx = cmd::open_context(home, quiet)?;
            cmd::cat::cat(&ctx, &fork, &path).await
        }
        Commands::LaunchInfo { fork, json } => {
            cmd::launch_info::launch_info(&cmd::open_context(home, quiet)?, &fork, json)
        }
        Commands::Cull => cmd::cull::cull(cmd::open_context(home, quiet)?).await,
        Commands::Prefs {
            max_versions,
            max_fork_versions,
        } => cmd::prefs::prefs(&cmd::open_context(home, quiet)?, max_versions, max_fork_versions),
        Commands::Remove { forks } => cmd::remove::remove(&cmd::open_context(home, quiet)?, &forks),
        Commands::Clear { yes } => {
            let ctx = cmd::open_context(home, quiet)?;
            cmd::clear::clear(&ctx, yes).await
        }
        Commands::Platform { available } => cmd::platform::platform(&available),
        Commands::Completions { shell } => {
            let mut stdout = std::io::stdout();
            clap_complete::generate(shell, &mut Cli::command(), "depot", &mut stdout);
            Ok(())
        }
    }
}
