use serde::{Deserialize, Serialize};
use std::fmt;

/// Liveness published on an entity's availability topic
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvailabilityStatus {
    Online,
    Offline,
}

impl AvailabilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AvailabilityStatus::Online => "online",
            AvailabilityStatus::Offline => "offline",
        }
    }
}

/// `{"status": "online"}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityMessage {
    pub status: AvailabilityStatus,
}

/// `{"state": "running"}`; also the command echo on the select's state topic
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    pub state: String,
}

/// Options offered by the command select
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandOption {
    Start,
    Stop,
    Reboot,
    Reset,
    Shutdown,
}

impl CommandOption {
    /// Order in which the hub lists the options
    pub const ALL: [CommandOption; 5] = [
        CommandOption::Start,
        CommandOption::Stop,
        CommandOption::Shutdown,
        CommandOption::Reboot,
        CommandOption::Reset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandOption::Start => "start",
            CommandOption::Stop => "stop",
            CommandOption::Reboot => "reboot",
            CommandOption::Reset => "reset",
            CommandOption::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CommandOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{"command": "start"}` received on the command topic
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command: CommandOption,
}
