//! Configuration model.
//!
//! Loaded once at startup and immutable afterwards. A host knows its own
//! address, whether it accepts commands, an optional time role, and a table
//! of partners it shares secrets with. Validation problems are fatal at
//! load time; there is no partial configuration.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroize;

use crate::datagram::{KEY_LEN, MAX_ADDRESS_LEN};

/// A pre-shared 16-byte AES key. Zeroized on drop, redacted in debug
/// output, hex-encoded on disk.
#[derive(Clone, PartialEq, Eq)]
pub struct PartnerKey([u8; KEY_LEN]);

impl PartnerKey {
    /// Wrap raw key bytes.
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl Drop for PartnerKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for PartnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PartnerKey(..)")
    }
}

impl Serialize for PartnerKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PartnerKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(D::Error::custom)?;
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            D::Error::custom(format!("key has wrong length (expected 16 but was {})", b.len()))
        })?;
        Ok(Self(bytes))
    }
}

/// A partner the host shares secrets with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partner {
    /// Pre-shared AES-128 key.
    pub key: PartnerKey,

    /// Pre-shared HMAC passphrase.
    pub passphrase: String,
}

/// Address and passphrase of a time-role counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeConfig {
    /// Peer address.
    pub addr: String,

    /// Shared passphrase for the time frames.
    pub passphrase: String,
}

/// The full host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// This host's own address.
    #[serde(rename = "host-addr", default)]
    pub host_address: String,

    /// Whether this host runs a session server and accepts commands.
    #[serde(rename = "accepts-commands", default)]
    pub accepts_commands: bool,

    /// Set when this host answers time requests.
    #[serde(rename = "time-server", default)]
    pub time_server: Option<TimeConfig>,

    /// Set when this host tracks a remote time server.
    #[serde(rename = "time-client", default)]
    pub time_client: Option<TimeConfig>,

    /// Known partners by address.
    #[serde(default)]
    pub partners: HashMap<String, Partner>,
}

impl ClientConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)?;
        Self::from_slice(&data)
    }

    /// Parse and validate configuration bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_slice(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host_address.is_empty() {
            return Err(ConfigError::MissingHostAddress);
        }
        validate_address(&self.host_address)?;

        if self.time_server.is_some() && self.time_client.is_some() {
            return Err(ConfigError::BothTimeRoles);
        }
        if let Some(time) = &self.time_server {
            time.validate()?;
        }
        if let Some(time) = &self.time_client {
            time.validate()?;
        }

        for (address, partner) in &self.partners {
            validate_address(address)?;
            if partner.passphrase.is_empty() {
                return Err(ConfigError::MissingPartnerPassphrase(address.clone()));
            }
        }

        Ok(())
    }
}

impl TimeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.addr.is_empty() {
            return Err(ConfigError::MissingTimeAddress);
        }
        validate_address(&self.addr)?;
        if self.passphrase.is_empty() {
            return Err(ConfigError::MissingTimePassphrase);
        }
        Ok(())
    }
}

fn validate_address(address: &str) -> Result<(), ConfigError> {
    if address.is_empty() || address.len() > MAX_ADDRESS_LEN || !address.is_ascii() {
        return Err(ConfigError::InvalidAddress(address.to_string()));
    }
    Ok(())
}

/// Configuration loading failures. All fatal.
#[derive(Debug)]
pub enum ConfigError {
    /// Could not read the file.
    Io(std::io::Error),

    /// The file is not valid JSON or a field has the wrong shape.
    Parse(serde_json::Error),

    /// `host-addr` is missing or empty.
    MissingHostAddress,

    /// An address is empty, too long, or not ASCII.
    InvalidAddress(String),

    /// Both `time-server` and `time-client` are set.
    BothTimeRoles,

    /// A time role is missing its `addr`.
    MissingTimeAddress,

    /// A time role is missing its `passphrase`.
    MissingTimePassphrase,

    /// A partner entry is missing its `passphrase`.
    MissingPartnerPassphrase(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "cannot read config file: {}", err),
            Self::Parse(err) => write!(f, "cannot parse config file: {}", err),
            Self::MissingHostAddress => write!(f, "missing 'host-addr'"),
            Self::InvalidAddress(addr) => write!(f, "invalid address '{}'", addr),
            Self::BothTimeRoles => {
                write!(f, "cannot have both 'time-server' and 'time-client'")
            }
            Self::MissingTimeAddress => write!(f, "missing 'addr' in time role"),
            Self::MissingTimePassphrase => write!(f, "missing 'passphrase' in time role"),
            Self::MissingPartnerPassphrase(name) => {
                write!(f, "missing 'passphrase' for partner '{}'", name)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Parse(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err)
    }
}
