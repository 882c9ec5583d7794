use crate::http::request::Method;

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Status code to error-page path, relative to the resolved root.
pub type ErrorPages = BTreeMap<u16, String>;

/// Top of the configuration tree. Built once at startup, never mutated.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Hard cap on a single buffered request, head and body together.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub error_pages: ErrorPages,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: Listen,
    #[serde(default)]
    pub server_names: Vec<String>,
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub upload_dir: Option<PathBuf>,
    #[serde(default)]
    pub max_body_size: Option<usize>,
    #[serde(default)]
    pub redirect: Option<Redirect>,
    #[serde(default)]
    pub error_pages: ErrorPages,
    /// Keyed by URI prefix. Selection is longest-prefix, never map order.
    #[serde(default)]
    pub locations: BTreeMap<String, LocationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocationConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_index")]
    pub index: String,
    #[serde(default)]
    pub autoindex: bool,
    #[serde(default = "default_methods")]
    pub methods: Vec<Method>,
    #[serde(default)]
    pub cgi: bool,
    #[serde(default)]
    pub cgi_extensions: Vec<String>,
    #[serde(default)]
    pub cgi_interpreter: Option<String>,
    #[serde(default)]
    pub upload_dir: Option<PathBuf>,
    #[serde(default)]
    pub max_body_size: Option<usize>,
    #[serde(default)]
    pub redirect: Option<Redirect>,
    #[serde(default)]
    pub error_pages: ErrorPages,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            root: None,
            index: default_index(),
            autoindex: false,
            methods: default_methods(),
            cgi: false,
            cgi_extensions: Vec::new(),
            cgi_interpreter: None,
            upload_dir: None,
            max_body_size: None,
            redirect: None,
            error_pages: ErrorPages::new(),
        }
    }
}

/// Address and port a virtual host listens on. Unique across the tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "ListenValue")]
pub struct Listen {
    pub address: String,
    pub port: u16,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListenValue {
    Port(u16),
    Text(String),
}

impl TryFrom<ListenValue> for Listen {
    type Error = String;

    fn try_from(value: ListenValue) -> Result<Self, Self::Error> {
        match value {
            ListenValue::Port(port) => Ok(Listen { address: "0.0.0.0".into(), port }),
            ListenValue::Text(text) => text.parse(),
        }
    }
}

impl std::str::FromStr for Listen {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim();
        let (address, port) = match text.rsplit_once(':') {
            Some((address, port)) => (address, port),
            None => ("", text),
        };
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port number for listen: {:?}", text))?;
        let address = if address.is_empty() { "0.0.0.0" } else { address };
        Ok(Listen { address: address.to_string(), port })
    }
}

impl fmt::Display for Listen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// `return <code> <target>`; `$request_uri` in the target is substituted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Redirect {
    pub code: u16,
    pub to: String,
}

impl Redirect {
    pub fn location_for(&self, request_uri: &str) -> String {
        self.to.replace("$request_uri", request_uri)
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("./www")
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("./www/uploads")
}

fn default_max_body_size() -> usize {
    DEFAULT_MAX_BODY_SIZE
}

fn default_max_request_bytes() -> usize {
    DEFAULT_MAX_REQUEST_BYTES
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_index() -> String {
    "index.html".to_string()
}

fn default_methods() -> Vec<Method> {
    vec![Method::Get, Method::Post, Method::Delete]
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            upload_dir: default_upload_dir(),
            max_body_size: default_max_body_size(),
            max_request_bytes: default_max_request_bytes(),
            timeout_seconds: default_timeout_seconds(),
            log_level: default_log_level(),
            error_pages: ErrorPages::new(),
            servers: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen: Listen) -> Self {
        Self {
            listen,
            server_names: Vec::new(),
            root: None,
            upload_dir: None,
            max_body_size: None,
            redirect: None,
            error_pages: ErrorPages::new(),
            locations: BTreeMap::new(),
        }
    }
}
