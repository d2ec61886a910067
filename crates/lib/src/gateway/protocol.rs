//! Wire types for `POST /run`.

use serde::{Deserialize, Serialize};

/// Request body: `{ "command", "args", "cwd" }`. The credential travels in the `X-Admin-Token` header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: String,
}

/// Response body for every request that passed auth and validation, whether or not the process started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_args_default_to_empty() {
        let req: RunRequest =
            serde_json::from_str(r#"{ "command": "go", "cwd": "/home/a/projects" }"#).unwrap();
        assert_eq!(req.command, "go");
        assert!(req.args.is_empty());
    }

    #[test]
    fn request_without_cwd_is_malformed() {
        assert!(serde_json::from_str::<RunRequest>(r#"{ "command": "go" }"#).is_err());
    }

    #[test]
    fn response_uses_snake_case_exit_code() {
        let res = RunResponse {
            stdout: "ok\n".into(),
            stderr: String::new(),
            exit_code: 3,
        };
        let v = serde_json::to_value(&res).unwrap();
        assert_eq!(v["exit_code"], 3);
        assert_eq!(v["stdout"], "ok\n");
    }
}
