//! Config command - show or validate configuration

use anyhow::{Context, Result, bail};
use std::path::PathBuf;

use crate::cli::args::ConfigArgs;
use crate::config::{Config, config_search_paths, find_config_file, load_config};

/// Render a configuration in the requested format
fn render(config: &Config, format: &str) -> Result<String> {
    match format {
        "json" => serde_json::to_string_pretty(config).context("Failed to serialize config"),
        _ => toml::to_string_pretty(config).context("Failed to serialize config"),
    }
}

/// Execute the config command
pub async fn execute(args: ConfigArgs, config_path: Option<PathBuf>) -> Result<()> {
    if args.paths {
        println!("Configuration is read from the first existing file:");
        for (i, location) in config_search_paths().iter().enumerate() {
            let found = if location.path.is_file() { " (found)" } else { "" };
            println!(
                "  {}. {} [{}]{}",
                i + 1,
                location.path.display(),
                location.label,
                found
            );
        }
        return Ok(());
    }

    if args.show_default {
        println!("{}", render(&Config::default(), &args.format)?);
        return Ok(());
    }

    let Some(path) = config_path.or_else(find_config_file) else {
        if args.validate {
            eprintln!("No configuration file found.");
            eprintln!("Searched locations (use --paths for details):");
            for location in config_search_paths() {
                eprintln!("  - {}", location.path.display());
            }
            bail!("No configuration file to validate");
        }
        println!("# No configuration file found, showing defaults");
        println!("# Use 'config --paths' to see search locations");
        println!();
        println!("{}", render(&Config::default(), &args.format)?);
        return Ok(());
    };

    let file = load_config(&path)?;
    // Expansion checks addresses, durations and paths
    let expanded = file
        .config
        .expand()
        .with_context(|| format!("Configuration file is invalid: {}", path.display()))?;

    if args.validate {
        println!("Configuration file is valid: {}", path.display());
        println!("  listen:    {}", expanded.listen);
        println!("  host key:  {}", expanded.host_key.display());
        println!("  directory: {}", expanded.directory.host);
        match &expanded.control_socket {
            Some(socket) => println!("  control:   {}", socket.display()),
            None => println!("  control:   (none)"),
        }
        if !expanded.host_key.is_file() {
            eprintln!("Warning: host key does not exist: {}", expanded.host_key.display());
        }
        return Ok(());
    }

    if args.format == "toml" {
        println!("# Configuration from: {}", path.display());
        println!();
    }
    println!("{}", render(&file.config, &args.format)?);

    Ok(())
}
