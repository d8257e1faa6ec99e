//! Wire contract exchanged between extension contexts.
//!
//! Every payload is a JSON object discriminated by `type`, then by `action`
//! or `computation`. Anything that does not decode into [`Message`] is
//! rejected by the messaging sanitizers.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::{ComicId, ComicSnapshot, ComicSource};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Action(Action),
    Computation(Computation),
    Query(Query),
}

impl Message {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        // Every variant is a plain struct of strings, numbers and maps.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn notification(notification: Notification) -> Self {
        Self::Action(Action::Notification(notification))
    }

    pub fn as_action(&self) -> Option<&Action> {
        match self {
            Self::Action(action) => Some(action),
            _ => None,
        }
    }

    pub fn as_notification(&self) -> Option<&Notification> {
        match self {
            Self::Action(Action::Notification(notification)) => Some(notification),
            _ => None,
        }
    }

    pub fn is_comic_information_query(&self) -> bool {
        matches!(
            self,
            Self::Query(Query {
                action: QueryAction::ComicInformation
            })
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action")]
pub enum Action {
    #[serde(rename = "register")]
    Register {
        label: String,
        comic: ComicSnapshot,
        source: ComicSource,
    },
    #[serde(rename = "alias")]
    Alias {
        comic: ComicSnapshot,
        source: ComicSource,
    },
    /// Deletes one source when `source` is set, the whole comic otherwise.
    #[serde(rename = "delete")]
    Delete {
        comic: ComicSnapshot,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<ComicSource>,
    },
    #[serde(rename = "urlopen")]
    UrlOpen { url: String },
    #[serde(rename = "notification")]
    Notification(Notification),
    ShowSidePanel,
    HideSidePanel,
    /// Sent by the side panel; asks the content script to refresh the panel.
    Refresh,
    CheckSidebar,
    IFrameResize {
        #[serde(rename = "fullSize")]
        full_size: FlagValue,
    },
    #[serde(rename = "setup")]
    Setup { operation: String },
    #[serde(rename = "toggle")]
    Toggle { module: String },
    /// Sent by the content script to the side panel.
    #[serde(rename = "refresh")]
    RefreshPanel { module: String },
    #[serde(rename = "export")]
    Export,
    #[serde(rename = "import")]
    Import { payload: String },
    #[serde(rename = "configure")]
    Configure {
        module: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        target: String,
    },
}

/// Outcome report for an operation, broadcast to UI contexts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comic: Option<ComicSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ComicSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl Notification {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Self::default()
        }
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    pub fn with_comic(mut self, comic: Option<ComicSnapshot>, source: Option<ComicSource>) -> Self {
        self.comic = comic;
        self.source = source;
        self
    }

    pub fn is_operation(&self, operation: &str) -> bool {
        self.operation.as_deref() == Some(operation)
    }
}

/// Boolean flag that some senders encode as the strings `"true"`/`"false"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Text(String),
}

impl FlagValue {
    pub fn is_set(&self) -> bool {
        match self {
            Self::Bool(value) => *value,
            Self::Text(value) => value == "true",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Computation {
    pub module: ComputationModule,
    pub computation: ComputationKind,
    #[serde(default)]
    pub resource: UrlResource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl Computation {
    pub fn url_request(id: ComicId, reader: impl Into<String>) -> Self {
        Self {
            module: ComputationModule::Sources,
            computation: ComputationKind::UrlGenerateRequest,
            resource: UrlResource {
                id: Some(id),
                reader: Some(reader.into()),
                ..UrlResource::default()
            },
            err: None,
        }
    }

    pub fn url_response(url: Option<String>, err: Option<String>) -> Self {
        Self {
            module: ComputationModule::Sources,
            computation: ComputationKind::UrlGenerateResponse,
            resource: UrlResource {
                url,
                ..UrlResource::default()
            },
            err,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ComputationModule {
    #[serde(rename = "sources")]
    Sources,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ComputationKind {
    #[serde(rename = "URL:Generate:Request")]
    UrlGenerateRequest,
    #[serde(rename = "URL:Generate:Response")]
    UrlGenerateResponse,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UrlResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ComicId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Query {
    pub action: QueryAction,
}

impl Query {
    pub fn comic_information() -> Self {
        Self {
            action: QueryAction::ComicInformation,
        }
    }
}

/// Query names are matched case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryAction {
    ComicInformation,
}

impl Serialize for QueryAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::ComicInformation => serializer.serialize_str("comic information"),
        }
    }
}

impl<'de> Deserialize<'de> for QueryAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.to_ascii_lowercase().as_str() {
            "comic information" => Ok(Self::ComicInformation),
            other => Err(serde::de::Error::unknown_variant(other, &["comic information"])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tracking;
    use serde_json::json;

    #[test]
    fn register_action_matches_wire_shape() {
        let raw = json!({
            "type": "action",
            "action": "register",
            "label": "Naruto",
            "comic": {"label": null, "id": null, "tracking": {"chapter": 5, "page": 3}},
            "source": {"reader": "mangakakalot.com", "name": "naruto", "info": {"id": "nrt"}}
        });

        let message = Message::from_value(raw).unwrap();
        let Message::Action(Action::Register { label, comic, source }) = &message else {
            panic!("unexpected message {message:?}");
        };
        assert_eq!(label, "Naruto");
        assert_eq!(comic.id, None);
        assert_eq!(comic.tracking, Tracking::new(5, Some(3)));
        assert_eq!(source.reader, "mangakakalot.com");

        let value = message.to_value();
        assert_eq!(value["type"], "action");
        assert_eq!(value["action"], "register");
    }

    #[test]
    fn unit_actions_and_string_flags_decode() {
        let show = Message::from_value(json!({"type": "action", "action": "ShowSidePanel"})).unwrap();
        assert_eq!(show, Message::Action(Action::ShowSidePanel));

        let resize = Message::from_value(json!({
            "type": "action",
            "action": "IFrameResize",
            "fullSize": "true"
        }))
        .unwrap();
        let Message::Action(Action::IFrameResize { full_size }) = resize else {
            panic!("expected resize");
        };
        assert!(full_size.is_set());
        assert!(!FlagValue::Text("false".to_owned()).is_set());
    }

    #[test]
    fn both_refresh_spellings_are_distinct() {
        let upper = Message::from_value(json!({"type": "action", "action": "Refresh"})).unwrap();
        let lower = Message::from_value(json!({
            "type": "action",
            "action": "refresh",
            "module": "sidebar"
        }))
        .unwrap();
        assert_eq!(upper, Message::Action(Action::Refresh));
        assert!(matches!(lower, Message::Action(Action::RefreshPanel { .. })));
    }

    #[test]
    fn query_name_is_case_insensitive() {
        let original = Message::from_value(json!({"type": "query", "action": "Comic Information"})).unwrap();
        assert!(original.is_comic_information_query());
        assert_eq!(original.to_value()["action"], "comic information");
    }

    #[test]
    fn computation_round_trips_through_json() {
        let request = Message::Computation(Computation::url_request(4, "fanfox.net"));
        let value = request.to_value();
        assert_eq!(value["module"], "sources");
        assert_eq!(value["computation"], "URL:Generate:Request");
        assert_eq!(value["resource"]["id"], 4);
        assert_eq!(Message::from_value(value).unwrap(), request);
    }

    #[test]
    fn unknown_or_malformed_payloads_are_rejected() {
        assert!(Message::from_value(json!({"type": "broadcast"})).is_err());
        assert!(Message::from_value(json!({"type": "action", "action": "explode"})).is_err());
        assert!(Message::from_value(json!({"type": "action", "action": "urlopen"})).is_err());
        assert!(Message::from_value(json!({
            "type": "computation",
            "module": "storage",
            "computation": "URL:Generate:Request"
        }))
        .is_err());
        assert!(Message::from_value(json!("action")).is_err());
    }

    #[test]
    fn notification_omits_unset_fields() {
        let message = Message::notification(Notification::new("track").with_error(None));
        let value = message.to_value();
        assert_eq!(
            value,
            json!({"type": "action", "action": "notification", "operation": "track"})
        );
        assert!(message.as_notification().unwrap().is_operation("track"));
    }
}
