//! NIP-01 frame codec: JSON arrays exchanged with relays.

use serde_json::{json, Value};

use crate::error::Result;
use crate::event::Event;
use crate::filter::Filter;

/// Frames sent from the client to a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    Close {
        subscription_id: String,
    },
    Event(Event),
    Auth(Event),
    Count {
        subscription_id: String,
        filters: Vec<Filter>,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> Value {
        match self {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => with_filters("REQ", subscription_id, filters),
            ClientMessage::Count {
                subscription_id,
                filters,
            } => with_filters("COUNT", subscription_id, filters),
            ClientMessage::Close { subscription_id } => json!(["CLOSE", subscription_id]),
            ClientMessage::Event(ev) => json!(["EVENT", ev]),
            ClientMessage::Auth(ev) => json!(["AUTH", ev]),
        }
    }

    /// Text frame payload.
    pub fn as_text(&self) -> String {
        self.to_json().to_string()
    }
}

fn with_filters(verb: &str, subscription_id: &str, filters: &[Filter]) -> Value {
    let mut arr = vec![
        Value::String(verb.into()),
        Value::String(subscription_id.into()),
    ];
    arr.extend(filters.iter().map(Filter::to_json));
    Value::Array(arr)
}

/// Frames received from a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Event,
    },
    EndOfStoredEvents {
        subscription_id: String,
    },
    Notice {
        message: String,
    },
    Auth {
        challenge: String,
    },
    Count {
        subscription_id: String,
        count: u64,
        approximate: bool,
    },
    Closed {
        subscription_id: String,
        message: String,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
}

impl RelayMessage {
    /// Decode a text frame. Returns `Ok(None)` for well-formed JSON that is not a
    /// recognised relay frame; malformed JSON is an error.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let val: Value = serde_json::from_str(text)?;
        let Some(arr) = val.as_array() else {
            return Ok(None);
        };
        let str_at = |i: usize| arr.get(i).and_then(|v| v.as_str()).map(str::to_string);
        let msg = match arr.first().and_then(|v| v.as_str()) {
            Some("EVENT") if arr.len() >= 3 => {
                let Some(subscription_id) = str_at(1) else {
                    return Ok(None);
                };
                let event: Event = serde_json::from_value(arr[2].clone())?;
                RelayMessage::Event {
                    subscription_id,
                    event,
                }
            }
            Some("EOSE") => match str_at(1) {
                Some(subscription_id) => RelayMessage::EndOfStoredEvents { subscription_id },
                None => return Ok(None),
            },
            Some("NOTICE") => RelayMessage::Notice {
                message: str_at(1).unwrap_or_default(),
            },
            Some("AUTH") => match str_at(1) {
                Some(challenge) => RelayMessage::Auth { challenge },
                None => return Ok(None),
            },
            Some("COUNT") if arr.len() >= 3 => {
                let Some(subscription_id) = str_at(1) else {
                    return Ok(None);
                };
                let Some(count) = arr[2].get("count").and_then(|v| v.as_u64()) else {
                    return Ok(None);
                };
                let approximate = arr[2]
                    .get("approximate")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                RelayMessage::Count {
                    subscription_id,
                    count,
                    approximate,
                }
            }
            Some("CLOSED") => match str_at(1) {
                Some(subscription_id) => RelayMessage::Closed {
                    subscription_id,
                    message: str_at(2).unwrap_or_default(),
                },
                None => return Ok(None),
            },
            Some("OK") if arr.len() >= 3 => {
                let (Some(event_id), Some(accepted)) = (str_at(1), arr[2].as_bool()) else {
                    return Ok(None);
                };
                RelayMessage::Ok {
                    event_id,
                    accepted,
                    message: str_at(3).unwrap_or_default(),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }

    /// Subscription id the frame belongs to, if it is subscription-scoped.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            RelayMessage::Event {
                subscription_id, ..
            }
            | RelayMessage::EndOfStoredEvents { subscription_id }
            | RelayMessage::Count {
                subscription_id, ..
            }
            | RelayMessage::Closed {
                subscription_id, ..
            } => Some(subscription_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;

    fn sample_event() -> Event {
        Event {
            id: "aa11".into(),
            pubkey: "p1".into(),
            created_at: 1,
            kind: 1,
            tags: vec![Tag::new(["t", "news"])],
            content: "hi".into(),
            sig: "sig".into(),
        }
    }

    #[test]
    fn encodes_req_with_multiple_filters() {
        let msg = ClientMessage::Req {
            subscription_id: "s".into(),
            filters: vec![Filter::new().kinds([1]), Filter::new().authors(["a"])],
        };
        assert_eq!(
            msg.to_json(),
            json!(["REQ", "s", {"kinds": [1]}, {"authors": ["a"]}])
        );
    }

    #[test]
    fn encodes_close_event_auth_count() {
        let ev = sample_event();
        assert_eq!(
            ClientMessage::Close {
                subscription_id: "s".into()
            }
            .as_text(),
            r#"["CLOSE","s"]"#
        );
        assert_eq!(ClientMessage::Event(ev.clone()).to_json()[0], "EVENT");
        assert_eq!(ClientMessage::Event(ev.clone()).to_json()[1]["id"], "aa11");
        assert_eq!(ClientMessage::Auth(ev).to_json()[0], "AUTH");
        let count = ClientMessage::Count {
            subscription_id: "c".into(),
            filters: vec![Filter::new().kinds([7])],
        };
        assert_eq!(count.to_json(), json!(["COUNT", "c", {"kinds": [7]}]));
    }

    #[test]
    fn decodes_event_frame() {
        let text = json!(["EVENT", "s", sample_event()]).to_string();
        let msg = RelayMessage::parse(&text).unwrap().unwrap();
        assert_eq!(
            msg,
            RelayMessage::Event {
                subscription_id: "s".into(),
                event: sample_event()
            }
        );
        assert_eq!(msg.subscription_id(), Some("s"));
    }

    #[test]
    fn decodes_control_frames() {
        assert_eq!(
            RelayMessage::parse(r#"["EOSE","s"]"#).unwrap(),
            Some(RelayMessage::EndOfStoredEvents {
                subscription_id: "s".into()
            })
        );
        assert_eq!(
            RelayMessage::parse(r#"["NOTICE","slow down"]"#).unwrap(),
            Some(RelayMessage::Notice {
                message: "slow down".into()
            })
        );
        assert_eq!(
            RelayMessage::parse(r#"["AUTH","challenge-1"]"#).unwrap(),
            Some(RelayMessage::Auth {
                challenge: "challenge-1".into()
            })
        );
        assert_eq!(
            RelayMessage::parse(r#"["COUNT","c",{"count":12,"approximate":true}]"#).unwrap(),
            Some(RelayMessage::Count {
                subscription_id: "c".into(),
                count: 12,
                approximate: true
            })
        );
        assert_eq!(
            RelayMessage::parse(r#"["COUNT","c",{"count":3}]"#).unwrap(),
            Some(RelayMessage::Count {
                subscription_id: "c".into(),
                count: 3,
                approximate: false
            })
        );
        assert_eq!(
            RelayMessage::parse(r#"["CLOSED","s","auth-required: login"]"#).unwrap(),
            Some(RelayMessage::Closed {
                subscription_id: "s".into(),
                message: "auth-required: login".into()
            })
        );
        assert_eq!(
            RelayMessage::parse(r#"["OK","e1",false,"blocked: spam"]"#).unwrap(),
            Some(RelayMessage::Ok {
                event_id: "e1".into(),
                accepted: false,
                message: "blocked: spam".into()
            })
        );
    }

    #[test]
    fn unknown_and_short_frames_are_skipped() {
        assert_eq!(RelayMessage::parse("{}").unwrap(), None);
        assert_eq!(RelayMessage::parse(r#"["WAT"]"#).unwrap(), None);
        assert_eq!(RelayMessage::parse(r#"["EVENT","s"]"#).unwrap(), None);
        assert_eq!(RelayMessage::parse(r#"["COUNT","c",{}]"#).unwrap(), None);
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(RelayMessage::parse("not json").is_err());
        assert!(RelayMessage::parse(r#"["EVENT","s",{"id":1}]"#).is_err());
    }
}
