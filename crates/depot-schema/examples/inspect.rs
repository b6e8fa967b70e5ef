use depot_schema::{BuildManifest, PlatformGraph};
use std::path::Path;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(path) = args.get(1) else {
        anyhow::bail!("usage: inspect <manifest.json> [platform]");
    };

    let json = std::fs::read_to_string(Path::new(path))?;
    let manifest = BuildManifest::from_json(&json)?;
    let graph = PlatformGraph::builtin()?;
    let platform = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| graph.current_platform());

    println!("Versions ({}):", manifest.len());
    for (version, entry) in &manifest.versions {
        if let Some(target) = &entry.redirect {
            println!(" - {version} -> {target}");
            continue;
        }

        let pick = graph
            .find_best(&platform, entry.platforms.keys())
            .map_or_else(|_| "none".to_string(), |m| m.platform);
        let flag = if entry.insecure { " [insecure]" } else { "" };
        println!(" - {version}{flag}: {} builds, {platform} uses {pick}", entry.platforms.len());
    }

    Ok(())
}
