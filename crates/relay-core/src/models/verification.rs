use serde::{Deserialize, Serialize};

/// How a subtask's result should be verified.
///
/// The engine forwards these fields to a [`Verifier`](crate::workflow::Verifier)
/// without interpreting them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VerificationSpec {
    Command {
        command: String,
    },
    Api {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default = "default_expected_status")]
        expected_status: u16,
    },
    Browser {
        url: String,
        selector: String,
        #[serde(default)]
        expected_text: Option<String>,
    },
    E2e {
        command: String,
    },
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_expected_status() -> u16 {
    200
}

impl VerificationSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::Api { .. } => "api",
            Self::Browser { .. } => "browser",
            Self::E2e { .. } => "e2e",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub subtask_id: String,
    pub passed: bool,
    pub attempts: u32,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_api_spec_defaults() {
        let spec: VerificationSpec =
            serde_yaml::from_str("type: api\nurl: http://localhost:3000/health\n").unwrap();
        assert_eq!(
            spec,
            VerificationSpec::Api {
                url: "http://localhost:3000/health".to_string(),
                method: "GET".to_string(),
                expected_status: 200,
            }
        );
        assert_eq!(spec.kind(), "api");
    }

    #[test]
    fn test_parse_browser_spec() {
        let yaml = "type: browser\nurl: http://localhost\nselector: '#title'\nexpected_text: Hello\n";
        let spec: VerificationSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.kind(), "browser");
    }
}
