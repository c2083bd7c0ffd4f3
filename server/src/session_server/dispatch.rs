//! Command dispatcher: one inbound text frame in, one session operation out.
//!
//! Every failure, from an unparseable envelope to a refused operation, is
//! turned into an `error` event here. Nothing a client sends closes the
//! connection.

use tdsweb_protocol::{ClientMessage, ServerMessage};

use crate::session_server::session::{Session, SessionError};

/// Handle one inbound message on the delivery thread.
pub fn dispatch(session: &mut Session, text: &str) {
    if let Err(err) = route(session, text) {
        log::debug!("Request failed: {}", err);
        session.outbox().send(ServerMessage::error(err.to_string()));
    }
}

fn route(session: &mut Session, text: &str) -> Result<(), SessionError> {
    let msg = ClientMessage::parse(text)?;
    log::trace!("Dispatching {}", msg.kind());

    match msg {
        ClientMessage::Login(req) => session.login(req.username.as_deref(), req.password.as_deref()),
        ClientMessage::Logout(_) => session.logout(),
        ClientMessage::Query(req) => session.query(req.query.as_deref(), req.wants_spreadsheet()),
        ClientMessage::Cancel(_) => {
            session.cancel();
            Ok(())
        }
        ClientMessage::ChangeDatabase(req) => session.change_database(req.database.as_deref()),
        ClientMessage::Ping(_) => {
            session.ping();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_server::outbox::Outbox;
    use crate::session_server::session::SessionSettings;
    use crate::session_server::testing::{int, row, table, ScriptedConnector};
    use serde_json::json;
    use crate::session_server::outbox::Events;
    use std::sync::Arc;
    use tdsweb_tds::SqlType;

    fn setup() -> (ScriptedConnector, Session, Events) {
        let connector = ScriptedConnector::new("luthien", "p", &["master", "model", "test"]);
        let (outbox, rx) = Outbox::channel();
        let session = Session::new(Arc::new(connector.clone()), SessionSettings::default(), outbox);
        (connector, session, rx)
    }

    fn drain(rx: &Events) -> Vec<serde_json::Value> {
        rx.take_all().into_iter().map(|m| serde_json::to_value(m).unwrap()).collect()
    }

    #[test]
    fn test_protocol_errors_become_events() {
        let (_connector, mut session, rx) = setup();
        dispatch(&mut session, "not json");
        dispatch(&mut session, r#"{"username":"u"}"#);
        dispatch(&mut session, r#"{"type":"drop_table"}"#);

        let events = drain(&rx);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["type"], json!("error"));
        assert!(events[0]["message"].as_str().unwrap().starts_with("Malformed message: "));
        assert_eq!(events[1], json!({"type": "error", "message": "No message type given."}));
        assert_eq!(events[2], json!({"type": "error", "message": "Unrecognized message type \"drop_table\"."}));
    }

    #[test]
    fn test_session_errors_become_events() {
        let (_connector, mut session, rx) = setup();
        dispatch(&mut session, r#"{"type":"login","password":"p"}"#);
        dispatch(&mut session, r#"{"type":"logout"}"#);
        dispatch(&mut session, r#"{"type":"query"}"#);
        dispatch(&mut session, r#"{"type":"query","query":"SELECT 1"}"#);
        dispatch(&mut session, r#"{"type":"change_database","database":"master"}"#);

        assert_eq!(
            drain(&rx),
            vec![
                json!({"type": "error", "message": "Username not provided."}),
                json!({"type": "error", "message": "Can't logout as not logged in."}),
                json!({"type": "error", "message": "No query given."}),
                json!({"type": "error", "message": "Not logged in."}),
                json!({"type": "error", "message": "Not logged in."}),
            ]
        );
    }

    #[test]
    fn test_cancel_and_ping_need_no_login() {
        let (_connector, mut session, rx) = setup();
        dispatch(&mut session, r#"{"type":"cancel"}"#);
        dispatch(&mut session, r#"{"type":"ping"}"#);
        assert_eq!(drain(&rx), vec![json!({"type": "pong"})]);
    }

    #[test]
    fn test_full_conversation() {
        let (connector, mut session, rx) = setup();
        connector.script("SELECT 1 AS n", vec![table(&[("n", SqlType::Int)]), row(vec![int(1)])]);

        dispatch(&mut session, r#"{"type":"login","username":"u","password":"p"}"#);
        dispatch(&mut session, r#"{"type":"query","query":"SELECT 1 AS n"}"#);
        session.wait_for_query();
        dispatch(&mut session, r#"{"type":"logout"}"#);

        assert_eq!(
            drain(&rx),
            vec![
                json!({
                    "type": "login",
                    "success": true,
                    "server": "luthien",
                    "username": "u",
                    "database": "test",
                    "databases": ["master", "model", "test"]
                }),
                json!({"type": "table", "columns": [{"name": "n", "type": "int"}]}),
                json!({"type": "row", "columns": [1]}),
                json!({"type": "query_finished"}),
                json!({"type": "logout", "success": true}),
            ]
        );
    }

    #[test]
    fn test_unknown_export_mode_streams() {
        let (connector, mut session, rx) = setup();
        connector.script("q", vec![table(&[("n", SqlType::Int)])]);
        dispatch(&mut session, r#"{"type":"login","username":"u","password":"p"}"#);
        dispatch(&mut session, r#"{"type":"query","query":"q","export":"csv"}"#);
        session.wait_for_query();

        let kinds: Vec<_> = drain(&rx).iter().map(|e| e["type"].as_str().unwrap().to_string()).collect();
        assert_eq!(kinds, vec!["login", "table", "query_finished"]);
    }
}
