//! cloud-config user-data rendering.
//!
//! Only the `write_files` module is emitted; that is all the in-guest agent needs.

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

pub const CLOUD_CONFIG_HEADER: &str = "#cloud-config";
pub const DEFAULT_AUTHFILE_LIMIT: usize = 12288;

const RESOURCES_KEY: &str = "default/credential/test";

/// Anything that can produce the user-data document for a pod VM.
pub trait CloudConfigGenerator: Send + Sync {
    fn generate(&self) -> anyhow::Result<String>;
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct CloudConfig {
    #[serde(default)]
    pub write_files: Vec<WriteFile>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct WriteFile {
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner: String,
    /// Octal mode as text, e.g. `0600`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub permissions: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encoding: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub append: bool,
}

impl WriteFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            ..Default::default()
        }
    }
}

impl CloudConfig {
    /// `#cloud-config` header followed by the YAML body. File content is carried byte for byte.
    pub fn render(&self) -> anyhow::Result<String> {
        let body = serde_yaml::to_string(self).context("encoding cloud-config")?;
        Ok(format!("{}\n{}", CLOUD_CONFIG_HEADER, body))
    }
}

impl CloudConfigGenerator for CloudConfig {
    fn generate(&self) -> anyhow::Result<String> {
        self.render()
    }
}

/// Wrap a registry auth document into the resources JSON the guest expects.
pub fn auth_json_to_resources_json(auth_json: &str) -> String {
    format!(
        "{{\"{}\":\"{}\"}}",
        RESOURCES_KEY,
        BASE64.encode(auth_json.as_bytes())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_back(rendered: &str) -> CloudConfig {
        let body = rendered
            .strip_prefix("#cloud-config\n")
            .expect("cloud-config header");
        serde_yaml::from_str(body).unwrap()
    }

    #[test]
    fn renders_write_files() {
        let cfg = CloudConfig {
            write_files: vec![
                WriteFile::new("/123", "Hello\n"),
                WriteFile {
                    owner: "root:root".to_string(),
                    ..WriteFile::new("/456", "Hello\nWorld\n")
                },
            ],
        };
        let rendered = cfg.generate().unwrap();
        assert!(rendered.starts_with("#cloud-config\nwrite_files:\n"));
        assert!(rendered.contains("path: /123\n"));
        assert!(!rendered.contains("append"));
        assert_eq!(parse_back(&rendered), cfg);
    }

    #[test]
    fn empty_config_keeps_the_header() {
        let rendered = CloudConfig::default().render().unwrap();
        assert!(rendered.starts_with("#cloud-config\n"));
        assert_eq!(parse_back(&rendered), CloudConfig::default());
    }

    #[test]
    fn content_and_values_survive_a_parse() {
        let cfg = CloudConfig {
            write_files: vec![
                WriteFile::new("/etc/leading", "  leading\nnext\n"),
                WriteFile::new("/etc/no-newline", "no-newline"),
                WriteFile::new("/etc/crlf", "a\r\nb\r\n"),
                WriteFile::new("/etc/blank", "a\n\n  b\nc"),
                WriteFile::new("/a: b #c", "x\n"),
                WriteFile {
                    owner: "root: #wheel".to_string(),
                    ..WriteFile::new("/etc/owner", "y\n")
                },
            ],
        };
        assert_eq!(parse_back(&cfg.render().unwrap()), cfg);
    }

    #[test]
    fn optional_keys_round_trip_as_text() {
        let cfg = CloudConfig {
            write_files: vec![WriteFile {
                path: "/bin.dat".to_string(),
                content: "aGVsbG8=".to_string(),
                owner: "root".to_string(),
                permissions: "0600".to_string(),
                encoding: "b64".to_string(),
                append: true,
            }],
        };
        let rendered = cfg.render().unwrap();
        assert!(rendered.contains("append: true"));
        assert!(!rendered.contains("permissions: 0600\n"));
        let back = parse_back(&rendered);
        assert_eq!(back.write_files[0].permissions, "0600");
        assert_eq!(back, cfg);
    }

    #[test]
    fn resources_json_wraps_auth() {
        let out = auth_json_to_resources_json("{\"auths\":{}}");
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        let encoded = v["default/credential/test"].as_str().unwrap();
        assert_eq!(BASE64.decode(encoded).unwrap(), b"{\"auths\":{}}");
    }
}
