// Wire message definitions
// Request / Response / Event envelopes exchanged as one JSON object per line

use std::fmt;

use serde_json::{Map, Value};

use crate::constants::{
    FIELD_APPLICATION, FIELD_ERROR, FIELD_MESSAGE_ID, FIELD_REQUEST_TYPE, FIELD_STATUS,
    FIELD_UPDATE_TYPE,
};
use crate::error::MessageError;

/// Fields carried alongside the required ones, preserved verbatim
pub type Extras = Map<String, Value>;

/// The three message kinds of the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Response,
    Event,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Request => "Request",
            MessageKind::Response => "Response",
            MessageKind::Event => "Event",
        };
        f.write_str(name)
    }
}

/// Response status, lowercase on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
}

impl Status {
    /// Case-insensitive match against `ok` / `error`
    pub fn parse(value: &str) -> Option<Status> {
        if value.eq_ignore_ascii_case("ok") {
            Some(Status::Ok)
        } else if value.eq_ignore_ascii_case("error") {
            Some(Status::Error)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Error => "error",
        }
    }
}

/// Request addressed to an application (or to the broker itself)
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub application: String,
    pub request_type: String,
    pub id: u64,
    pub extras: Extras,
}

/// Response correlated to a request by id
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Always set for `Status::Ok`; may be unknown for errors
    pub id: Option<u64>,
    pub status: Status,
    /// Empty unless status is error
    pub error: String,
    pub extras: Extras,
}

/// Event published by a registered application to its subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub update_type: String,
    pub extras: Extras,
}

/// Any classified wire message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Event(Event),
}

impl Request {
    pub fn new(application: impl Into<String>, request_type: impl Into<String>, id: u64) -> Self {
        Request {
            application: application.into(),
            request_type: request_type.into(),
            id,
            extras: Extras::new(),
        }
    }

    /// Add an extra field
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    /// Extra field as a non-empty string
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extras
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Parse text that must be a request
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let obj = parse_object(text)?;
        validate_request_fields(&obj)?;
        Ok(Self::from_validated(obj))
    }

    fn from_validated(mut obj: Extras) -> Self {
        let application = take_string(&mut obj, FIELD_APPLICATION);
        let request_type = take_string(&mut obj, FIELD_REQUEST_TYPE);
        let id = obj
            .remove(FIELD_MESSAGE_ID)
            .and_then(|v| coerce_id(MessageKind::Request, &v).ok().flatten())
            .unwrap_or_default();
        Request {
            application,
            request_type,
            id,
            extras: obj,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut obj = self.extras.clone();
        obj.insert(FIELD_APPLICATION.to_string(), Value::from(self.application.as_str()));
        obj.insert(FIELD_REQUEST_TYPE.to_string(), Value::from(self.request_type.as_str()));
        obj.insert(FIELD_MESSAGE_ID.to_string(), Value::from(self.id));
        Value::Object(obj)
    }
}

impl Response {
    pub fn ok(id: u64) -> Self {
        Response {
            id: Some(id),
            status: Status::Ok,
            error: String::new(),
            extras: Extras::new(),
        }
    }

    pub fn error(error: impl Into<String>, id: Option<u64>) -> Self {
        Response {
            id,
            status: Status::Error,
            error: error.into(),
            extras: Extras::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Parse text that must be a response
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let obj = parse_object(text)?;
        validate_response_fields(&obj)?;
        Ok(Self::from_validated(obj))
    }

    fn from_validated(mut obj: Extras) -> Self {
        let id = obj
            .remove(FIELD_MESSAGE_ID)
            .and_then(|v| coerce_id(MessageKind::Response, &v).ok().flatten());
        let status = obj
            .remove(FIELD_STATUS)
            .as_ref()
            .and_then(Value::as_str)
            .and_then(Status::parse)
            .unwrap_or(Status::Error);
        // An ok response never carries error text
        let error = match status {
            Status::Error => take_string(&mut obj, FIELD_ERROR),
            Status::Ok => {
                obj.remove(FIELD_ERROR);
                String::new()
            }
        };
        Response {
            id,
            status,
            error,
            extras: obj,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut obj = self.extras.clone();
        obj.insert(
            FIELD_MESSAGE_ID.to_string(),
            self.id.map(Value::from).unwrap_or(Value::Null),
        );
        obj.insert(FIELD_STATUS.to_string(), Value::from(self.status.as_str()));
        let error = match self.status {
            Status::Ok => "",
            Status::Error => self.error.as_str(),
        };
        obj.insert(FIELD_ERROR.to_string(), Value::from(error));
        Value::Object(obj)
    }
}

impl Event {
    pub fn new(update_type: impl Into<String>) -> Self {
        Event {
            update_type: update_type.into(),
            extras: Extras::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    /// Parse text that must be an event
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let obj = parse_object(text)?;
        validate_event_fields(&obj)?;
        Ok(Self::from_validated(obj))
    }

    fn from_validated(mut obj: Extras) -> Self {
        let update_type = take_string(&mut obj, FIELD_UPDATE_TYPE);
        Event {
            update_type,
            extras: obj,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut obj = self.extras.clone();
        obj.insert(FIELD_UPDATE_TYPE.to_string(), Value::from(self.update_type.as_str()));
        Value::Object(obj)
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request(_) => MessageKind::Request,
            Message::Response(_) => MessageKind::Response,
            Message::Event(_) => MessageKind::Event,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Message::Request(r) => r.to_value(),
            Message::Response(r) => r.to_value(),
            Message::Event(e) => e.to_value(),
        }
    }

    /// Serialize as a single wire line (without the trailing newline)
    pub fn to_line(&self) -> String {
        self.to_value().to_string()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Message::Request(r)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Message::Response(r)
    }
}

impl From<Event> for Message {
    fn from(e: Event) -> Self {
        Message::Event(e)
    }
}

/// Classify arbitrary inbound text.
///
/// Tries Event, then Request, then Response; the first kind whose required
/// fields are all present and valid wins. Text that is not a JSON object is
/// `Malformed`. An object whose `message-id` can't be coerced is `InvalidId`,
/// any other object matching no kind is `Unclassifiable`.
pub fn classify(text: &str) -> Result<Message, MessageError> {
    let obj = parse_object(text)?;

    if validate_event_fields(&obj).is_ok() {
        return Ok(Message::Event(Event::from_validated(obj)));
    }

    // A bad id outranks "matches nothing"
    let mut bad_id = None;
    match validate_request_fields(&obj) {
        Ok(()) => return Ok(Message::Request(Request::from_validated(obj))),
        Err(e @ MessageError::InvalidId { .. }) => bad_id = Some(e),
        Err(_) => {}
    }
    match validate_response_fields(&obj) {
        Ok(()) => return Ok(Message::Response(Response::from_validated(obj))),
        Err(e @ MessageError::InvalidId { .. }) => bad_id = bad_id.or(Some(e)),
        Err(_) => {}
    }

    Err(bad_id.unwrap_or(MessageError::Unclassifiable))
}

/// Check `application`, `request-type` and `message-id`
pub fn validate_request_fields(obj: &Extras) -> Result<(), MessageError> {
    let kind = MessageKind::Request;
    let id = recover_id(kind, obj)?;

    require_str(obj, kind, FIELD_APPLICATION, id)?;
    require_str(obj, kind, FIELD_REQUEST_TYPE, id)?;

    match obj.get(FIELD_MESSAGE_ID) {
        None => Err(MessageError::MissingField {
            kind,
            field: FIELD_MESSAGE_ID,
            id,
        }),
        Some(Value::Null) => Err(MessageError::EmptyField {
            kind,
            field: FIELD_MESSAGE_ID,
            id,
        }),
        Some(_) => Ok(()),
    }
}

/// Check `message-id`, `status` and, for error responses, `error`
pub fn validate_response_fields(obj: &Extras) -> Result<(), MessageError> {
    let kind = MessageKind::Response;

    if !obj.contains_key(FIELD_MESSAGE_ID) {
        return Err(MessageError::MissingField {
            kind,
            field: FIELD_MESSAGE_ID,
            id: None,
        });
    }
    let id = recover_id(kind, obj)?;

    let status = match obj.get(FIELD_STATUS) {
        None => {
            return Err(MessageError::MissingField {
                kind,
                field: FIELD_STATUS,
                id,
            })
        }
        Some(Value::Null) => {
            return Err(MessageError::EmptyField {
                kind,
                field: FIELD_STATUS,
                id,
            })
        }
        Some(Value::String(s)) if s.is_empty() => {
            return Err(MessageError::EmptyField {
                kind,
                field: FIELD_STATUS,
                id,
            })
        }
        Some(Value::String(s)) => Status::parse(s).ok_or_else(|| MessageError::InvalidStatus {
            value: s.clone(),
            id,
        })?,
        Some(other) => {
            return Err(MessageError::InvalidStatus {
                value: other.to_string(),
                id,
            })
        }
    };

    match status {
        Status::Error => require_str(obj, kind, FIELD_ERROR, id)?,
        Status::Ok if id.is_none() => {
            return Err(MessageError::EmptyField {
                kind,
                field: FIELD_MESSAGE_ID,
                id,
            })
        }
        Status::Ok => {}
    }

    Ok(())
}

/// Check `update-type`
pub fn validate_event_fields(obj: &Extras) -> Result<(), MessageError> {
    require_str(obj, MessageKind::Event, FIELD_UPDATE_TYPE, None)
}

fn parse_object(text: &str) -> Result<Extras, MessageError> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(obj)) => Ok(obj),
        _ => Err(MessageError::Malformed),
    }
}

fn recover_id(kind: MessageKind, obj: &Extras) -> Result<Option<u64>, MessageError> {
    match obj.get(FIELD_MESSAGE_ID) {
        Some(value) => coerce_id(kind, value),
        None => Ok(None),
    }
}

/// Accept a non-negative integer or a decimal string; null means "no id"
fn coerce_id(kind: MessageKind, value: &Value) -> Result<Option<u64>, MessageError> {
    let invalid = || MessageError::InvalidId {
        kind,
        value: value.to_string(),
    };
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n.as_u64().map(Some).ok_or_else(invalid),
        Value::String(s) => s.trim().parse::<u64>().map(Some).map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

fn require_str(
    obj: &Extras,
    kind: MessageKind,
    field: &'static str,
    id: Option<u64>,
) -> Result<(), MessageError> {
    match obj.get(field) {
        None => Err(MessageError::MissingField { kind, field, id }),
        Some(Value::String(s)) if !s.is_empty() => Ok(()),
        Some(_) => Err(MessageError::EmptyField { kind, field, id }),
    }
}

fn take_string(obj: &mut Extras, field: &str) -> String {
    match obj.remove(field) {
        Some(Value::String(s)) => s,
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_request() {
        let line = r#"{"application": "App1", "request-type": "GetScene", "message-id": 5, "scene": "main"}"#;
        match classify(line).unwrap() {
            Message::Request(req) => {
                assert_eq!(req.application, "App1");
                assert_eq!(req.request_type, "GetScene");
                assert_eq!(req.id, 5);
                assert_eq!(req.extras.get("scene"), Some(&json!("main")));
                assert_eq!(req.extras.len(), 1);
            }
            other => panic!("Expected Request, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_event_wins_over_request() {
        let line = r#"{"update-type": "SceneChanged", "application": "App1", "request-type": "X", "message-id": 1}"#;
        let msg = classify(line).unwrap();
        assert_eq!(msg.kind(), MessageKind::Event);
    }

    #[test]
    fn test_classify_response_after_request() {
        let line = r#"{"message-id": "12", "status": "OK", "error": "ignored"}"#;
        match classify(line).unwrap() {
            Message::Response(resp) => {
                assert_eq!(resp.id, Some(12));
                assert_eq!(resp.status, Status::Ok);
                assert_eq!(resp.error, "");
                assert!(resp.extras.is_empty());
            }
            other => panic!("Expected Response, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_vs_unclassifiable() {
        assert_eq!(classify("not json"), Err(MessageError::Malformed));
        assert_eq!(classify("[1, 2, 3]"), Err(MessageError::Malformed));
        assert_eq!(classify(r#"{"foo": "bar"}"#), Err(MessageError::Unclassifiable));
    }

    #[test]
    fn test_request_zero_id_is_valid() {
        let req = Request::parse(r#"{"application": "A", "request-type": "B", "message-id": 0}"#).unwrap();
        assert_eq!(req.id, 0);
    }

    #[test]
    fn test_request_missing_field_keeps_id() {
        let err = Request::parse(r#"{"request-type": "B", "message-id": 9}"#).unwrap_err();
        assert_eq!(
            err,
            MessageError::MissingField {
                kind: MessageKind::Request,
                field: FIELD_APPLICATION,
                id: Some(9),
            }
        );
        assert_eq!(err.message_id(), Some(9));
    }

    #[test]
    fn test_request_empty_application() {
        let err = Request::parse(r#"{"application": "", "request-type": "B", "message-id": 1}"#).unwrap_err();
        assert!(matches!(err, MessageError::EmptyField { field: FIELD_APPLICATION, .. }));
    }

    #[test]
    fn test_invalid_id_is_reported() {
        let err = Request::parse(r#"{"application": "A", "request-type": "B", "message-id": "abc"}"#).unwrap_err();
        match err {
            MessageError::InvalidId { value, .. } => assert_eq!(value, "\"abc\""),
            other => panic!("Expected InvalidId, got {:?}", other),
        }
        assert!(Request::parse(r#"{"application": "A", "request-type": "B", "message-id": -1}"#).is_err());
    }

    #[test]
    fn test_classify_reports_invalid_id() {
        let err = classify(r#"{"application": "A", "request-type": "B", "message-id": "abc"}"#).unwrap_err();
        assert!(matches!(err, MessageError::InvalidId { kind: MessageKind::Request, .. }));

        let err = classify(r#"{"message-id": [1], "status": "ok"}"#).unwrap_err();
        assert!(matches!(err, MessageError::InvalidId { .. }));

        // No protocol fields at all
        assert_eq!(classify(r#"{"message-id": "abc"}"#), Err(MessageError::InvalidId {
            kind: MessageKind::Request,
            value: "\"abc\"".to_string(),
        }));
    }

    #[test]
    fn test_response_status_case_insensitive() {
        let resp = Response::parse(r#"{"message-id": 1, "status": "Error", "error": "boom"}"#).unwrap();
        assert_eq!(resp.status, Status::Error);
        assert_eq!(resp.error, "boom");

        let err = Response::parse(r#"{"message-id": 1, "status": "maybe", "error": ""}"#).unwrap_err();
        assert!(matches!(err, MessageError::InvalidStatus { .. }));
    }

    #[test]
    fn test_response_error_requires_error_text() {
        let err = Response::parse(r#"{"message-id": 1, "status": "error"}"#).unwrap_err();
        assert!(matches!(err, MessageError::MissingField { field: FIELD_ERROR, .. }));
    }

    #[test]
    fn test_response_ok_requires_id() {
        let err = Response::parse(r#"{"message-id": null, "status": "ok", "error": ""}"#).unwrap_err();
        assert!(matches!(err, MessageError::EmptyField { field: FIELD_MESSAGE_ID, .. }));

        let resp = Response::parse(r#"{"message-id": null, "status": "error", "error": "x"}"#).unwrap();
        assert_eq!(resp.id, None);
    }

    #[test]
    fn test_serialize_error_response() {
        let value = Response::error("You have no subscriptions", Some(5)).to_value();
        assert_eq!(
            value,
            json!({"message-id": 5, "status": "error", "error": "You have no subscriptions"})
        );

        let value = Response::error("Invalid message", None).to_value();
        assert_eq!(value["message-id"], Value::Null);
    }

    #[test]
    fn test_ok_response_never_carries_error() {
        let mut resp = Response::ok(3);
        resp.error = "leftover".to_string();
        assert_eq!(resp.to_value()["error"], json!(""));
    }

    #[test]
    fn test_line_roundtrip() {
        let messages: Vec<Message> = vec![
            Request::new("App1", "Start", 42).with("delay", 3).into(),
            Response::ok(42).with("scene", "live").into(),
            Response::error("nope", None).into(),
            Event::new("UnsubscribedFrom").with("name", "App1").into(),
        ];
        for msg in messages {
            assert_eq!(classify(&msg.to_line()).unwrap(), msg);
        }
    }
}
