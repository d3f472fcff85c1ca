//! Local participant profile, replicated to every peer through the
//! default shared channel.

use crate::media::StreamInfo;
use crate::types::{StreamId, UserId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Device metadata attached to the local user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub agent: String,
    pub platform: String,
    pub arch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl DeviceInfo {
    /// Describe the host this session runs on
    #[must_use]
    pub fn current() -> Self {
        Self {
            agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            hostname: hostname::get().ok().and_then(|h| h.into_string().ok()),
        }
    }
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self::current()
    }
}

/// The local participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalUser {
    pub id: UserId,
    pub nickname: String,
    pub send_only: bool,
    pub stream_info: IndexMap<StreamId, StreamInfo>,
    pub device: DeviceInfo,
    /// Application fields supplied through [`LocalUserData::extra`]
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LocalUser {
    /// Built-in defaults: generated id, empty nickname, no streams
    #[must_use]
    pub fn with_defaults(send_only: bool) -> Self {
        Self {
            id: UserId::generate(),
            nickname: String::new(),
            send_only,
            stream_info: IndexMap::new(),
            device: DeviceInfo::current(),
            extra: Map::new(),
        }
    }

    /// Overlay caller supplied data on top of the defaults
    #[must_use]
    pub fn merged(mut self, data: LocalUserData) -> Self {
        if let Some(id) = data.id {
            self.id = id;
        }
        if let Some(nickname) = data.nickname {
            self.nickname = nickname;
        }
        if let Some(send_only) = data.send_only {
            self.send_only = send_only;
        }
        if let Some(device) = data.device {
            self.device = device;
        }
        self.extra.extend(data.extra);
        self
    }
}

/// Caller overrides for [`LocalUser`]; unset fields keep their defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalUserData {
    pub id: Option<UserId>,
    pub nickname: Option<String>,
    pub send_only: Option<bool>,
    pub device: Option<DeviceInfo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
