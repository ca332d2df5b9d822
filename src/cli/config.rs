use crate::config::generate::generate_starter_config;
use std::fs;
use std::path::PathBuf;

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_content = generate_starter_config();
    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    // Prefer ~/.config/streamlake, fall back to /etc/streamlake
    let config_path = dirs::home_dir()
        .map(|home| home.join(".config/streamlake/config.yml"))
        .filter(|path| path.parent().is_some_and(|parent| fs::create_dir_all(parent).is_ok()))
        .unwrap_or_else(|| {
            eprintln!("Warning: Could not create ~/.config/streamlake, falling back to /etc/streamlake/config.yml");
            PathBuf::from("/etc/streamlake/config.yml")
        });

    if config_path.exists() {
        return Err(format!(
            "Config file already exists at {}. Remove it first or use --stdout to print the config",
            config_path.display()
        )
        .into());
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&config_path, config_content)?;

    println!("Config file written to {}", config_path.display());
    Ok(())
}

pub fn validate(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;

    println!("Validating config file: {}", path.display());
    let config = crate::config::load_config(&path)?;
    println!("Config is valid ({} stream(s))", config.streams.len());
    Ok(())
}
