//! Configuration management commands
//!
//! warden config show     - Show the effective configuration
//! warden config validate - Validate configuration
//! warden config init     - Write a default configuration file

use super::output::{print_error, print_success, print_warn};
use super::{Context, Exit};
use crate::config::AppConfig;
use anyhow::{Context as _, Result};
use clap::Subcommand;

/// Configuration-related commands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show the effective configuration (files + environment) as TOML
    Show {
        /// Configuration section to show
        #[arg(short, long)]
        section: Option<String>,
    },

    /// Validate configuration (exit 1 on errors)
    Validate,

    /// Write default.toml with built-in defaults
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl ConfigCommands {
    pub fn run(self, ctx: &Context) -> Result<Exit> {
        match self {
            Self::Show { section } => show_config(ctx, section.as_deref()),
            Self::Validate => validate_config(ctx),
            Self::Init { force } => init_config(ctx, force),
        }
    }
}

/// Lines of `rendered` belonging to `[section]` and its sub-tables
fn extract_section(rendered: &str, section: &str) -> String {
    let mut out = Vec::new();
    let mut in_section = false;
    for line in rendered.lines() {
        if let Some(header) = line.strip_prefix('[') {
            let name = header.trim_end_matches(']');
            in_section = name == section || name.starts_with(&format!("{section}."));
        }
        if in_section {
            out.push(line);
        }
    }
    out.join("\n")
}

fn show_config(ctx: &Context, section: Option<&str>) -> Result<Exit> {
    let rendered = ctx.config.to_toml().context("rendering configuration")?;
    match section {
        Some(section) => {
            let text = extract_section(&rendered, section);
            if text.is_empty() {
                print_warn(&format!("no section [{section}]"));
                return Ok(Exit::Unhealthy);
            }
            println!("{text}");
        }
        None => println!("{rendered}"),
    }
    Ok(Exit::Success)
}

fn validate_config(ctx: &Context) -> Result<Exit> {
    match ctx.config.validate() {
        Ok(()) => {
            print_success(&format!(
                "configuration valid ({} workers, {} contracts)",
                ctx.config.workers.len(),
                ctx.config.health.contracts.len()
            ));
            Ok(Exit::Success)
        }
        Err(errors) => {
            for e in &errors {
                print_error(e);
            }
            Ok(Exit::Unhealthy)
        }
    }
}

fn init_config(ctx: &Context, force: bool) -> Result<Exit> {
    let path = ctx.config_dir.join("default.toml");
    if path.exists() && !force {
        print_warn(&format!("{} exists; use --force to overwrite", path.display()));
        return Ok(Exit::Unhealthy);
    }
    std::fs::create_dir_all(&ctx.config_dir)
        .with_context(|| format!("creating {}", ctx.config_dir.display()))?;
    let rendered = AppConfig::default().to_toml()?;
    std::fs::write(&path, rendered).with_context(|| format!("writing {}", path.display()))?;
    print_success(&format!("wrote {}", path.display()));
    Ok(Exit::Success)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_section_includes_subtables() {
        let rendered = "[store]\nroot = \"/x\"\n\n[health]\ninterval_secs = 2\n\n[health.contracts.feeder]\nttl_seconds = 10\n\n[breaker]\ninterval_secs = 5\n";
        let health = extract_section(rendered, "health");
        assert!(health.contains("interval_secs = 2"));
        assert!(health.contains("ttl_seconds = 10"));
        assert!(!health.contains("root"));
        assert!(!health.contains("[breaker]"));
    }

    #[test]
    fn test_init_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = Context::new(
            AppConfig::default(),
            crate::domain::SystemClock::shared(),
            "test",
        );
        ctx.config_dir = dir.path().join("config");

        assert_eq!(init_config(&ctx, false).unwrap(), Exit::Success);
        assert_eq!(init_config(&ctx, false).unwrap(), Exit::Unhealthy);

        let loaded = AppConfig::load_from(&ctx.config_dir).unwrap();
        assert_eq!(loaded.autoheal.window_secs, 600);
        assert!(loaded.health.contracts.contains_key("feeder"));
    }
}
