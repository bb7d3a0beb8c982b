//! Worker machine entities and instance lifecycle messages.

use drender_id::InstanceId;
use serde::{Deserialize, Serialize};

use crate::cloud::MachineImage;

/// A provisioned worker machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderInstance {
    pub id: InstanceId,

    #[serde(rename = "publicIP")]
    pub public_ip: String,

    #[serde(rename = "privateIP", skip_serializing_if = "Option::is_none", default)]
    pub private_ip: Option<String>,

    #[serde(rename = "cloudAMI")]
    pub cloud_ami: MachineImage,

    pub state: InstanceState,
}

/// Lifecycle state of a worker machine, as last reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Rebooting,
    Terminated,
}

/// Recovery and lifecycle actions carried on instance messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceAction {
    StartNewMachine,
    RestartMachine,
    KillMachine,
    HeartbeatCheck,
}

/// Inbound control message about a specific instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceHeartbeat {
    pub instance: RenderInstance,
    pub action: InstanceAction,
}

/// Request to the machine provider. The payload depends on the action:
/// spawning names an image and a count, restart and termination name the
/// affected instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub action: InstanceAction,

    #[serde(rename = "cloudAMI", skip_serializing_if = "Option::is_none", default)]
    pub cloud_ami: Option<MachineImage>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub count: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub instances: Option<Vec<InstanceId>>,
}

impl InstanceRequest {
    pub fn spawn(cloud_ami: MachineImage, count: usize) -> Self {
        Self {
            action: InstanceAction::StartNewMachine,
            cloud_ami: Some(cloud_ami),
            count: Some(count),
            instances: None,
        }
    }

    pub fn restart(instances: Vec<InstanceId>) -> Self {
        Self {
            action: InstanceAction::RestartMachine,
            cloud_ami: None,
            count: None,
            instances: Some(instances),
        }
    }

    pub fn terminate(instances: Vec<InstanceId>) -> Self {
        Self {
            action: InstanceAction::KillMachine,
            cloud_ami: None,
            count: None,
            instances: Some(instances),
        }
    }
}

/// Reply from the machine provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceResponse {
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub instances: Option<Vec<RenderInstance>>,
}
