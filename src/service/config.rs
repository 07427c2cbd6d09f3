// Copyright 2025 jonefeewang@gmail.com
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

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Prefix of environment variables overriding file values,
/// e.g. `AGENT__NETWORK__PORT=2000`.
const ENV_PREFIX: &str = "AGENT";

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    /// server id, attached to every log line emitted by the server
    pub id: i32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig { id: 1000 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    /// upper bound of a single frame body, larger frames terminate the connection
    pub max_package_size: usize,
    pub conn_read_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            host: "127.0.0.1".to_string(),
            port: 1922,
            max_package_size: 1024 * 1024,
            conn_read_buffer_size: 4 * 1024,
        }
    }
}

impl NetworkConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EventQueueConfig {
    pub capacity: usize,
    /// how long a producer waits on a full queue before the event is dropped
    pub push_timeout_ms: u64,
}

impl Default for EventQueueConfig {
    fn default() -> Self {
        EventQueueConfig {
            capacity: 1024,
            push_timeout_ms: 5000,
        }
    }
}

impl EventQueueConfig {
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub event_queue: EventQueueConfig,
}

impl AgentConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<AgentConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let agent_config: AgentConfig = config.try_deserialize()?;
        agent_config.validate()?;
        Ok(agent_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.event_queue.capacity == 0 {
            return Err(AppError::InvalidValue(
                "event_queue.capacity must be greater than 0".to_string(),
            ));
        }
        if self.network.max_package_size > u32::MAX as usize {
            return Err(AppError::InvalidValue(format!(
                "network.max_package_size {} does not fit the u32 length prefix",
                self.network.max_package_size
            )));
        }
        Ok(())
    }
}
