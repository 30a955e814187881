//! Downstream protocol: request parsing and frame builders.
//!
//! Quote frames are schemaless by design (the `quotes` member is a map of
//! display symbols to quote objects or diffs), so the protocol layer
//! works in `serde_json::Value` throughout. The `ctp_connected` key in
//! the welcome frame is part of the wire contract with existing clients.

use chrono::Utc;
use serde_json::{json, Value};

use crate::error::{GatewayError, Result};

/// A parsed client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// `{"aid":"subscribe_quote","ins_list":"EX1.INST1,EX2.INST2"}`
    SubscribeQuote { ins_list: String },
    /// `{"aid":"peek_message"}`
    PeekMessage,
    /// Action-style debug commands.
    Action(ActionRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionRequest {
    Subscribe { instruments: Vec<String> },
    Unsubscribe { instruments: Vec<String> },
    ListInstruments,
    SearchInstruments { pattern: String },
}

/// Parse one inbound text frame.
pub fn parse_request(text: &str) -> Result<ClientRequest> {
    let doc: Value = serde_json::from_str(text)
        .map_err(|_| GatewayError::Protocol("Invalid JSON format".into()))?;

    if let Some(aid) = doc.get("aid").and_then(Value::as_str) {
        return match aid {
            "subscribe_quote" => {
                let ins_list = doc
                    .get("ins_list")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        GatewayError::Protocol("Missing or invalid 'ins_list' field".into())
                    })?;
                Ok(ClientRequest::SubscribeQuote {
                    ins_list: ins_list.to_string(),
                })
            }
            "peek_message" => Ok(ClientRequest::PeekMessage),
            other => Err(GatewayError::Protocol(format!("Unknown aid: {other}"))),
        };
    }

    let action = doc
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Protocol("Missing or invalid 'action' field".into()))?;

    match action {
        "subscribe" => Ok(ClientRequest::Action(ActionRequest::Subscribe {
            instruments: instrument_array(&doc)?,
        })),
        "unsubscribe" => Ok(ClientRequest::Action(ActionRequest::Unsubscribe {
            instruments: instrument_array(&doc)?,
        })),
        "list_instruments" => Ok(ClientRequest::Action(ActionRequest::ListInstruments)),
        "search_instruments" => {
            let pattern = doc
                .get("pattern")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    GatewayError::Protocol("Missing or invalid 'pattern' field".into())
                })?;
            Ok(ClientRequest::Action(ActionRequest::SearchInstruments {
                pattern: pattern.to_string(),
            }))
        }
        other => Err(GatewayError::Protocol(format!("Unknown action: {other}"))),
    }
}

fn instrument_array(doc: &Value) -> Result<Vec<String>> {
    let array = doc
        .get("instruments")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::Protocol("Missing or invalid 'instruments' field".into()))?;
    Ok(array
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect())
}

pub fn welcome_frame(session_id: &str, upstream_connected: bool) -> Value {
    json!({
        "type": "welcome",
        "message": "Connected to market data server",
        "session_id": session_id,
        "ctp_connected": upstream_connected,
        "timestamp": Utc::now().timestamp_millis(),
    })
}

pub fn subscribe_ok_frame() -> Value {
    json!({"aid": "subscribe_quote", "status": "ok"})
}

pub fn error_frame(message: &str) -> Value {
    json!({
        "type": "error",
        "message": message,
        "timestamp": Utc::now().timestamp_millis(),
    })
}

/// `rtn_data` frame around a quotes map (full snapshot or diff).
pub fn rtn_data_frame(quotes: Value) -> Value {
    json!({
        "aid": "rtn_data",
        "data": [
            {"quotes": quotes},
            {"account_id": "", "ins_list": "", "mdhis_more_data": false},
        ],
    })
}

pub fn empty_rtn_data_frame() -> Value {
    rtn_data_frame(json!({}))
}

/// Ack for the action-style subscribe/unsubscribe commands.
pub fn action_ack_frame(response_type: &str, subscribed_count: usize) -> Value {
    json!({
        "type": response_type,
        "status": "success",
        "subscribed_count": subscribed_count,
    })
}

pub fn instrument_list_frame(instruments: &[String]) -> Value {
    json!({
        "type": "instrument_list",
        "instruments": instruments,
        "count": instruments.len(),
    })
}

pub fn search_result_frame(pattern: &str, instruments: &[String]) -> Value {
    json!({
        "type": "search_result",
        "pattern": pattern,
        "instruments": instruments,
        "count": instruments.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscribe_quote() {
        let request =
            parse_request(r#"{"aid":"subscribe_quote","ins_list":"SHFE.cu2501,SHFE.rb2505"}"#)
                .unwrap();
        assert_eq!(
            request,
            ClientRequest::SubscribeQuote {
                ins_list: "SHFE.cu2501,SHFE.rb2505".to_string()
            }
        );
    }

    #[test]
    fn parses_peek_message() {
        assert_eq!(
            parse_request(r#"{"aid":"peek_message"}"#).unwrap(),
            ClientRequest::PeekMessage
        );
    }

    #[test]
    fn subscribe_quote_requires_ins_list() {
        let err = parse_request(r#"{"aid":"subscribe_quote"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Missing or invalid 'ins_list' field");
    }

    #[test]
    fn parses_action_commands() {
        let request =
            parse_request(r#"{"action":"subscribe","instruments":["cu2501","rb2505"]}"#).unwrap();
        assert_eq!(
            request,
            ClientRequest::Action(ActionRequest::Subscribe {
                instruments: vec!["cu2501".to_string(), "rb2505".to_string()]
            })
        );

        assert_eq!(
            parse_request(r#"{"action":"list_instruments"}"#).unwrap(),
            ClientRequest::Action(ActionRequest::ListInstruments)
        );

        assert_eq!(
            parse_request(r#"{"action":"search_instruments","pattern":"cu"}"#).unwrap(),
            ClientRequest::Action(ActionRequest::SearchInstruments {
                pattern: "cu".to_string()
            })
        );
    }

    #[test]
    fn rejects_garbage_and_unknown_actions() {
        assert_eq!(
            parse_request("not json").unwrap_err().to_string(),
            "Invalid JSON format"
        );
        assert_eq!(
            parse_request(r#"{"foo":1}"#).unwrap_err().to_string(),
            "Missing or invalid 'action' field"
        );
        assert_eq!(
            parse_request(r#"{"action":"fly"}"#).unwrap_err().to_string(),
            "Unknown action: fly"
        );
    }

    #[test]
    fn rtn_data_frame_shape() {
        let frame = rtn_data_frame(json!({"SHFE.cu2501": {"last_price": 71230.0}}));
        assert_eq!(frame["aid"], "rtn_data");
        assert_eq!(frame["data"][0]["quotes"]["SHFE.cu2501"]["last_price"], 71230.0);
        assert_eq!(frame["data"][1]["account_id"], "");
        assert_eq!(frame["data"][1]["ins_list"], "");
        assert_eq!(frame["data"][1]["mdhis_more_data"], false);
    }

    #[test]
    fn empty_rtn_data_has_empty_quotes_object() {
        let frame = empty_rtn_data_frame();
        assert!(frame["data"][0]["quotes"].as_object().unwrap().is_empty());
    }

    #[test]
    fn welcome_frame_reports_upstream_state() {
        let frame = welcome_frame("abc", true);
        assert_eq!(frame["type"], "welcome");
        assert_eq!(frame["session_id"], "abc");
        assert_eq!(frame["ctp_connected"], true);
        assert!(frame["timestamp"].is_i64());
    }
}
