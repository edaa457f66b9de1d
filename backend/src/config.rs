use std::env;
use std::path::PathBuf;

pub const HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_WEIGHTS_PATH: &str = "weights/densenet121.safetensors";

/// Origins of the local development frontends.
pub const ALLOWED_ORIGINS: [&str; 2] = ["http://localhost:5173", "http://localhost:8080"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value '{0}'")]
    InvalidPort(String),
    #[error("MODEL_WEIGHTS is set but empty")]
    EmptyWeightsPath,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// DenseNet-121 weights in safetensors or libtorch archive format, with
    /// torchvision parameter names.
    pub weights_path: PathBuf,
    pub port: u16,
}

impl Settings {
    /// Reads `MODEL_WEIGHTS` and `PORT`. Call after `dotenv` so a `.env` file
    /// can supply them.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let weights_path = match lookup("MODEL_WEIGHTS") {
            Some(path) if path.trim().is_empty() => return Err(ConfigError::EmptyWeightsPath),
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_WEIGHTS_PATH),
        };
        let port = match lookup("PORT") {
            Some(port) => port
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(port.clone()))?,
            None => DEFAULT_PORT,
        };
        Ok(Self { weights_path, port })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", HOST, self.port)
    }
}
