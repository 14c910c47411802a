//! Command-line interface and layered configuration for `relay-server`.
//!
//! Configuration is layered defaults → dotfile (`relay.toml`) →
//! environment (`RELAY_*`) → CLI flags, each layer overriding the last.

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

/// Fully-resolved runtime configuration for the `relay-server` binary.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppConfig {
    /// Address to bind the WebSocket listener to.
    pub bind: String,
    /// Protocol version advertised in the welcome frame.
    pub protocol_version: u32,
    /// Include handler failure messages and a synthetic stack trace in
    /// generic 500 responses.
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self { Self { bind: "0.0.0.0:5500".to_owned(), protocol_version: 3, dev_mode: true } }
}

/// Command-line overrides for [`AppConfig`].
///
/// Every field is optional so that an absent flag does not shadow a
/// lower-precedence layer (dotfile/env) when merged into the [`Figment`];
/// only flags the caller actually supplied are serialized into the merge.
#[derive(Parser, Serialize, Debug, Clone, Default)]
pub struct Cli {
    /// Address to bind the WebSocket listener to.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
    /// Protocol version advertised in the welcome frame.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u32>,
    /// Include handler failure messages and a synthetic stack trace in
    /// generic 500 responses.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_mode: Option<bool>,
}

impl AppConfig {
    /// Load configuration from defaults, `relay.toml`, the `RELAY_` env
    /// prefix, and the given CLI arguments, in ascending precedence.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if any layer fails to parse or merge.
    pub fn load_from_iter<I, S>(args: I) -> Result<Self, figment::Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<std::ffi::OsString> + Clone,
    {
        let cli = Cli::parse_from(args);
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file("relay.toml"))
            .merge(Env::prefixed("RELAY_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}
