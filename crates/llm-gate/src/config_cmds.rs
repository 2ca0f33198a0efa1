use anyhow::Result;
use gate_config::GateConfig;
use gate_core::OutputFormat;
use tracing::warn;

/// Effective configuration as TOML, headed by the paths it resolves to.
fn render_config(config: &GateConfig) -> Result<String> {
    let config_path = GateConfig::config_path()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|_| "(unavailable)".to_string());
    let mut out = format!(
        "# config file:      {config_path}\n# state file:       {}\n# coordination dir: {}\n\n",
        config.state_path().display(),
        config.coordination_dir().display()
    );
    out.push_str(&toml::to_string_pretty(config)?);
    Ok(out)
}

pub(crate) fn handle_config_show(config: &GateConfig, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let json_str = serde_json::to_string_pretty(config)?;
            println!("{}", json_str);
        }
        OutputFormat::Text => print!("{}", render_config(config)?),
    }
    Ok(())
}

pub(crate) fn handle_config_init() -> Result<()> {
    let path = GateConfig::config_path()?;
    if path.exists() {
        warn!(path = %path.display(), "Config already exists, leaving it untouched");
        eprintln!("Config already exists at: {}", path.display());
        return Ok(());
    }
    let path = GateConfig::save_default_template()?;
    eprintln!("Generated config template at: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_render_config_round_trips_through_toml() {
        let mut config = GateConfig::default();
        config.coordinator.total_max_llm = 12;
        config.coordinator.runtime_dir = Some(PathBuf::from("/tmp/gate-test/coordinator"));

        let text = render_config(&config).unwrap();
        assert!(text.contains("# coordination dir: /tmp/gate-test/coordinator"));

        let body: String = text
            .lines()
            .filter(|line| !line.starts_with('#'))
            .collect::<Vec<_>>()
            .join("\n");
        let parsed: GateConfig = toml::from_str(&body).unwrap();
        assert_eq!(parsed, config);
    }
}
