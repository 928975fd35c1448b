// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else {
        let mut config_path = PathBuf::from("/etc/netconfd");
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// The directory holding the schema model files. Every .xml file in
    /// it is loaded at startup.
    pub schema_dir: Option<String>,

    /// Restrict loading to these model names. All models load when unset.
    pub models: Option<Vec<String>>,

    /// The file enumerating the operations to audit, one space separated
    /// line of tokens such as `get edit-config lock`. The file is
    /// re-read whenever it changes; auditing is off without it.
    pub audit_file: Option<String>,

    /// The unix socket to listen on for sessions handed over by the
    /// transport front-end. Defaults to /run/netconfd/netconfd.socket.
    pub socket: Option<String>,
}
