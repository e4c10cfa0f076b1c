//! Hub configuration model and activity state events.
//!
//! The hub answers the `config` command with a JSON document listing its
//! activities and devices.  Each activity carries control groups, and each
//! control group lists the functions (buttons) available while the activity
//! runs.  Activity changes arrive as `connect.stateDigest?notify` events whose
//! JSON body is a [`StateDigest`]; sessions turn those into [`HubEvent`]s.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Activity id the hub reports when everything is switched off.
pub const POWER_OFF_ACTIVITY: &str = "-1";

// ── Configuration ─────────────────────────────────────────────────────────────

/// Parsed reply to the `config` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub activity: Vec<Activity>,
    #[serde(default)]
    pub device: Vec<Device>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub control_group: Vec<ControlGroup>,
    #[serde(default, rename = "isAVActivity")]
    pub is_av_activity: bool,
    #[serde(default)]
    pub activity_order: Option<i64>,
}

impl Activity {
    /// Finds a function by its `name` across all control groups.
    pub fn find_function(&self, name: &str) -> Option<&Function> {
        self.control_group
            .iter()
            .flat_map(|group| group.function.iter())
            .find(|function| function.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub label: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub control_group: Vec<ControlGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlGroup {
    pub name: String,
    #[serde(default)]
    pub function: Vec<Function>,
}

/// A pressable function.  `action` is an opaque JSON string sent back verbatim
/// in `holdAction` requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub action: String,
    pub name: String,
    #[serde(default)]
    pub label: String,
}

// ── Activity lookup ───────────────────────────────────────────────────────────

/// Activities indexed by id and by lowercase label.
#[derive(Debug, Clone, Default)]
pub struct ActivityTable {
    by_key: HashMap<String, Arc<Activity>>,
    count: usize,
}

impl ActivityTable {
    pub fn from_config(config: &HubConfig) -> Self {
        let mut by_key = HashMap::with_capacity(config.activity.len() * 2);
        for activity in &config.activity {
            let activity = Arc::new(activity.clone());
            by_key.insert(activity.id.clone(), Arc::clone(&activity));
            by_key.insert(activity.label.to_lowercase(), activity);
        }
        Self {
            by_key,
            count: config.activity.len(),
        }
    }

    /// Resolves an activity by id or by label, case-insensitively.
    pub fn resolve(&self, id_or_label: &str) -> Option<Arc<Activity>> {
        self.by_key
            .get(id_or_label)
            .or_else(|| self.by_key.get(&id_or_label.to_lowercase()))
            .cloned()
    }

    pub fn label_for(&self, id: &str) -> Option<String> {
        self.resolve(id).map(|a| a.label.clone())
    }

    /// Number of distinct activities.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

// ── State events ──────────────────────────────────────────────────────────────

/// Lifecycle of the hub's current activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ActivityStatus {
    #[default]
    Off = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl TryFrom<u8> for ActivityStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ActivityStatus::Off),
            1 => Ok(ActivityStatus::Starting),
            2 => Ok(ActivityStatus::Running),
            3 => Ok(ActivityStatus::Stopping),
            other => Err(format!("unknown activity status {other}")),
        }
    }
}

impl From<ActivityStatus> for u8 {
    fn from(status: ActivityStatus) -> Self {
        status as u8
    }
}

/// Raw body of a `connect.stateDigest?notify` event.
///
/// Only the activity fields are typed; everything else the hub sends
/// (time zone, versions, sync state) is kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDigest {
    #[serde(default, deserialize_with = "id_string")]
    pub activity_id: String,
    #[serde(default, deserialize_with = "id_string")]
    pub running_activity_list: String,
    #[serde(default)]
    pub activity_status: ActivityStatus,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Hubs send ids as strings, but some firmware sends bare numbers.
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Normalized activity event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubEvent {
    /// Name of the hub that emitted the event, stamped by the orchestrator.
    pub friendly_name: Option<String>,
    pub activity_id: String,
    pub activity_label: Option<String>,
    pub running_activity_id: Option<String>,
    pub running_activity_label: Option<String>,
    pub activity_status: ActivityStatus,
}

impl HubEvent {
    /// Builds an event from a raw digest, resolving labels through `table`.
    pub fn from_digest(digest: &StateDigest, table: &ActivityTable) -> Self {
        let running = Some(digest.running_activity_list.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        Self {
            friendly_name: None,
            activity_id: digest.activity_id.clone(),
            activity_label: table.label_for(&digest.activity_id),
            running_activity_label: running.as_deref().and_then(|id| table.label_for(id)),
            running_activity_id: running,
            activity_status: digest.activity_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG_JSON: &str = r#"{
        "activity": [
            {
                "id": "-1",
                "label": "PowerOff",
                "isAVActivity": false,
                "controlGroup": []
            },
            {
                "id": "12345",
                "label": "Watch TV",
                "isAVActivity": true,
                "activityOrder": 1,
                "icon": "tv.png",
                "controlGroup": [
                    {
                        "name": "Volume",
                        "function": [
                            {"action": "{\"command\":\"Mute\",\"deviceId\":\"1\"}", "name": "Mute", "label": "Mute"},
                            {"action": "{\"command\":\"VolumeUp\",\"deviceId\":\"1\"}", "name": "VolumeUp", "label": "Volume Up"}
                        ]
                    }
                ]
            }
        ],
        "device": [
            {"id": "1", "label": "Amp", "type": "Amplifier", "controlGroup": []}
        ],
        "global": {"locale": "en-US"}
    }"#;

    fn table() -> ActivityTable {
        let config: HubConfig = serde_json::from_str(CONFIG_JSON).unwrap();
        ActivityTable::from_config(&config)
    }

    #[test]
    fn test_config_parses_activities_and_devices() {
        let config: HubConfig = serde_json::from_str(CONFIG_JSON).unwrap();
        assert_eq!(config.activity.len(), 2);
        assert_eq!(config.device[0].kind.as_deref(), Some("Amplifier"));
        assert!(config.activity[1].is_av_activity);
    }

    #[test]
    fn test_resolve_by_id_and_label() {
        // Arrange
        let table = table();

        // Act / Assert
        assert_eq!(table.resolve("12345").unwrap().label, "Watch TV");
        assert_eq!(table.resolve("watch tv").unwrap().id, "12345");
        assert_eq!(table.resolve("WATCH TV").unwrap().id, "12345");
        assert!(table.resolve("Listen Music").is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_find_function_across_groups() {
        let activity = table().resolve("12345").unwrap();
        let mute = activity.find_function("Mute").unwrap();
        assert!(mute.action.contains("\"command\":\"Mute\""));
        assert!(activity.find_function("Play").is_none());
    }

    #[test]
    fn test_activity_status_from_number() {
        let status: ActivityStatus = serde_json::from_str("2").unwrap();
        assert_eq!(status, ActivityStatus::Running);
        assert!(serde_json::from_str::<ActivityStatus>("7").is_err());
        assert_eq!(serde_json::to_string(&ActivityStatus::Stopping).unwrap(), "3");
    }

    #[test]
    fn test_hub_event_resolves_labels() {
        // Arrange
        let digest: StateDigest = serde_json::from_str(
            r#"{"activityId":"12345","runningActivityList":"12345","activityStatus":2,"hubSwVersion":"4.15"}"#,
        )
        .unwrap();

        // Act
        let event = HubEvent::from_digest(&digest, &table());

        // Assert
        assert_eq!(event.activity_label.as_deref(), Some("Watch TV"));
        assert_eq!(event.running_activity_id.as_deref(), Some("12345"));
        assert_eq!(event.running_activity_label.as_deref(), Some("Watch TV"));
        assert_eq!(event.activity_status, ActivityStatus::Running);
        assert_eq!(event.friendly_name, None);
        assert_eq!(digest.extra["hubSwVersion"], "4.15");
    }

    #[test]
    fn test_hub_event_empty_running_list_is_none() {
        let digest: StateDigest =
            serde_json::from_str(r#"{"activityId":"-1","runningActivityList":"","activityStatus":0}"#)
                .unwrap();
        let event = HubEvent::from_digest(&digest, &table());
        assert_eq!(event.running_activity_id, None);
        assert_eq!(event.running_activity_label, None);
        assert_eq!(event.activity_label.as_deref(), Some("PowerOff"));
    }

    #[test]
    fn test_state_digest_accepts_numeric_ids() {
        let digest: StateDigest =
            serde_json::from_str(r#"{"activityId":12345,"activityStatus":1}"#).unwrap();
        assert_eq!(digest.activity_id, "12345");
        assert_eq!(digest.running_activity_list, "");
        assert_eq!(digest.activity_status, ActivityStatus::Starting);
    }
}
