//! Config command implementation.

use anyhow::{bail, Result};

use roomdrop_core::config::Config;

use super::{ConfigAction, ConfigArgs};

/// Run the config command.
pub async fn run(args: ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let config = Config::load()?;
            print!("{}", config.to_toml()?);
            if let Err(e) = config.validate() {
                eprintln!();
                eprintln!("  Warning: {}", e);
            }
        }
        ConfigAction::Path => {
            println!("{}", Config::config_path().display());
        }
        ConfigAction::Init { force } => {
            let path = Config::config_path();
            if path.exists() && !force {
                bail!(
                    "{} already exists, use --force to overwrite",
                    path.display()
                );
            }
            Config::default().save()?;
            println!("  Wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}
