use anyhow::{Context as _, Result};
use crossterm::style::Stylize;
use depot_core::Config;
use depot_schema::PlatformGraph;

/// Print the detected platform, and the best match among `available` if given.
pub fn platform(available: &[String]) -> Result<()> {
    let config = Config::from_env()?;
    let graph = PlatformGraph::builtin().context("Built-in platform graph is malformed")?;
    let current = config
        .platform
        .unwrap_or_else(|| graph.current_platform());
    println!("{current}");

    if !available.is_empty() {
        let found = graph.find_best(&current, available)?;
        println!(
            "  {} {} ({} hops)",
            "best match".dark_grey(),
            found.platform.as_str().cyan(),
            found.hops
        );
    }
    Ok(())
}
