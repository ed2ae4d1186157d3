//! Config file plus flag overrides.

use anyhow::Context;
use pyconv_core::ConverterConfig;

use super::args::GlobalArgs;

/// Load the config file (if any), apply flag/env overrides, validate.
pub fn load(global: &GlobalArgs) -> anyhow::Result<ConverterConfig> {
    let mut config = match &global.config {
        Some(path) => ConverterConfig::load(path)?,
        None => ConverterConfig::default(),
    };

    if let Some(interpreter) = &global.interpreter {
        config.interpreter = interpreter.clone();
    }
    if let Some(secs) = global.timeout {
        config.sandbox.timeout_secs = secs;
    }
    if let Some(label) = &global.host_version {
        config.host_version = Some(label.clone());
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "interpreter: python3.9\nsandbox:\n  timeout_secs: 30").unwrap();

        let global = GlobalArgs {
            config: Some(file.path().to_path_buf()),
            timeout: Some(5),
            host_version: Some("3.9".into()),
            ..GlobalArgs::default()
        };
        let config = load(&global).unwrap();

        assert_eq!(config.interpreter, "python3.9");
        assert_eq!(config.sandbox.timeout_secs, 5);
        assert_eq!(config.host_version.as_deref(), Some("3.9"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let global = GlobalArgs {
            timeout: Some(0),
            ..GlobalArgs::default()
        };
        let err = load(&global).unwrap_err();
        assert!(format!("{err:#}").contains("timeout_secs"));
    }
}
