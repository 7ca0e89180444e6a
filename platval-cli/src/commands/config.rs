//! `platval config` command handler

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use platval_core::config::PlatvalConfig;

use crate::cli::{ConfigAction, ConfigArgs};
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

pub const SECTIONS: &[&str] = &[
    "general", "sut", "sut2", "host", "bmc", "timeouts", "drivers", "network", "stress", "vm",
    "bios", "seamless",
];

pub async fn execute(
    args: ConfigArgs,
    config_path: &Path,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    match args.action {
        ConfigAction::Validate => execute_validate(config_path, writer).await,
        ConfigAction::Show { section } => execute_show(config_path, section, writer).await,
    }
}

/// Loads and validates the file, reporting any error.
///
/// # Errors
///
/// `CliError::Config` when the file is missing, malformed or invalid.
async fn execute_validate(config_path: &Path, writer: &OutputWriter) -> Result<(), CliError> {
    info!(path = %config_path.display(), "validating configuration");

    let report = match PlatvalConfig::load(config_path).await {
        Ok(_) => ConfigValidationReport {
            source: config_path.display().to_string(),
            valid: true,
            errors: Vec::new(),
        },
        Err(e) => ConfigValidationReport {
            source: config_path.display().to_string(),
            valid: false,
            errors: vec![e.to_string()],
        },
    };

    writer.render(&report)?;

    if !report.valid {
        return Err(CliError::Config("configuration is invalid".to_owned()));
    }
    Ok(())
}

/// Shows the effective configuration with the BMC password redacted.
async fn execute_show(
    config_path: &Path,
    section: Option<String>,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    info!(path = %config_path.display(), "loading configuration");

    let config = PlatvalConfig::load(config_path).await?;
    let report = ConfigReport {
        source: config_path.display().to_string(),
        config_toml: render_section(&redacted(config), section.as_deref())?,
        section,
    };
    writer.render(&report)?;
    Ok(())
}

fn redacted(mut config: PlatvalConfig) -> PlatvalConfig {
    config.bmc = config.bmc.redacted();
    config
}

fn to_toml<T: Serialize>(value: &T) -> String {
    toml::to_string_pretty(value).unwrap_or_else(|e| format!("(serialization error: {e})"))
}

/// TOML text of the whole configuration or of one section.
pub fn render_section(config: &PlatvalConfig, section: Option<&str>) -> Result<String, CliError> {
    let Some(name) = section else {
        return Ok(to_toml(config));
    };
    let text = match name {
        "general" => to_toml(&config.general),
        "sut" => to_toml(&config.sut),
        "sut2" => match &config.sut2 {
            Some(sut2) => to_toml(sut2),
            None => "# no second SUT configured\n".to_owned(),
        },
        "host" => to_toml(&config.host),
        "bmc" => to_toml(&config.bmc),
        "timeouts" => to_toml(&config.timeouts),
        "drivers" => to_toml(&config.drivers),
        "network" => to_toml(&config.network),
        "stress" => to_toml(&config.stress),
        "vm" => to_toml(&config.vm),
        "bios" => to_toml(&config.bios),
        "seamless" => to_toml(&config.seamless),
        other => {
            return Err(CliError::Command(format!(
                "unknown section: {other} (expected one of: {})",
                SECTIONS.join(", ")
            )));
        }
    };
    Ok(text)
}

/// Configuration display report. The TOML text is only rendered as text.
#[derive(Serialize)]
pub struct ConfigReport {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(skip)]
    pub config_toml: String,
}

impl Render for ConfigReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        match &self.section {
            Some(section) => writeln!(
                w,
                "Configuration {} (source: {})",
                format!("[{section}]").bold(),
                self.source
            )?,
            None => writeln!(w, "Configuration (source: {})", self.source.bold())?,
        }
        writeln!(w)?;
        write!(w, "{}", self.config_toml)
    }
}

#[derive(Serialize)]
pub struct ConfigValidationReport {
    pub source: String,
    pub valid: bool,
    /// Empty when valid
    pub errors: Vec<String>,
}

impl Render for ConfigValidationReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "Config Validation: {}", self.source.bold())?;
        if self.valid {
            writeln!(w, "  Result: {}", "VALID".green().bold())?;
        } else {
            writeln!(w, "  Result: {}", "INVALID".red().bold())?;
            for err in &self.errors {
                writeln!(w, "  Error: {}", err.red())?;
            }
        }
        Ok(())
    }
}
