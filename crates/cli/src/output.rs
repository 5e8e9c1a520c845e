//! Structured output for tabletctl commands.

use serde::Serialize;

#[derive(clap::ValueEnum, Clone, Debug, Default, PartialEq, Eq, Copy)]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
    Yaml,
}

impl OutputFormat {
    /// Returns true if the output format is intended for machine consumption
    pub fn is_machine_readable(&self) -> bool {
        match self {
            OutputFormat::Human => false,
            OutputFormat::Json | OutputFormat::Yaml => true,
        }
    }
}

/// Envelope around every machine-readable report.
#[derive(Serialize)]
pub struct CommandResponse<T> {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub exit_code: i32,
    #[serde(flatten)]
    pub data: T,
}

impl<T> CommandResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            message: None,
            exit_code: crate::exit_codes::SUCCESS,
            data,
        }
    }

    pub fn error(message: String, exit_code: i32, data: T) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(message),
            exit_code,
            data,
        }
    }
}

pub fn render<T: Serialize>(format: OutputFormat, data: &T) -> anyhow::Result<Option<String>> {
    Ok(match format {
        // Human output is printed by the commands themselves.
        OutputFormat::Human => None,
        OutputFormat::Json => Some(serde_json::to_string_pretty(data)?),
        OutputFormat::Yaml => Some(serde_yaml::to_string(data)?),
    })
}

pub fn print_output<T: Serialize>(format: OutputFormat, data: T) -> anyhow::Result<()> {
    if let Some(text) = render(format, &data)? {
        println!("{}", text);
    }
    Ok(())
}

pub fn print_success<T: Serialize>(format: OutputFormat, data: T) -> anyhow::Result<()> {
    print_output(format, CommandResponse::success(data))
}

/// Errors in human mode go to stderr from main.
pub fn print_error<T: Serialize + Default>(
    format: OutputFormat,
    message: &str,
    exit_code: i32,
) -> anyhow::Result<()> {
    print_output(
        format,
        CommandResponse::error(message.to_string(), exit_code, T::default()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Default)]
    struct Report {
        rules: usize,
    }

    #[test]
    fn test_success_envelope_flattens_data() {
        let json = render(OutputFormat::Json, &CommandResponse::success(Report { rules: 2 }))
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["exit_code"], 0);
        assert_eq!(value["rules"], 2);
        assert!(value.get("message").is_none());
    }

    #[test]
    fn test_error_envelope_as_yaml() {
        let yaml = render(
            OutputFormat::Yaml,
            &CommandResponse::error("bad file".into(), 3, Report::default()),
        )
        .unwrap()
        .unwrap();
        assert!(yaml.contains("status: error"));
        assert!(yaml.contains("message: bad file"));
        assert!(yaml.contains("exit_code: 3"));
    }

    #[test]
    fn test_human_renders_nothing() {
        assert!(render(OutputFormat::Human, &Report::default()).unwrap().is_none());
    }
}
