use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Cpp,
}

impl Language {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Cpp => "cpp",
        }
    }
}

/// Body of `POST /execute/{python,cpp}`.
#[derive(Debug, Default, Deserialize)]
pub struct ExecutionRequest {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
}

/// Why an execution did not produce a normal result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    CompileError,
    Timeout,
    SandboxUnavailable,
    RuntimeFault,
}

/// An image written by the program, as a data URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Image {
    pub filename: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub output: String,
    pub images: Vec<Image>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ExecutionResult {
    pub fn output(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            images: Vec::new(),
            error_kind: None,
        }
    }

    pub fn failed(output: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            output: output.into(),
            images: Vec::new(),
            error_kind: Some(kind),
        }
    }
}
