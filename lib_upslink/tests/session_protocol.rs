//! Wire-level tests for the protocol session, against a scripted mock
//! UPS server on a loopback socket.

mod common;

use common::{spawn_upsd, CLOSE};
use lib_upslink::client::{ClientError, ConnectFlags, ServerError, Session, TlsPolicy};

fn plaintext_upsd_base(line: &str) -> Option<Vec<String>> {
    match line {
        "STARTTLS" => Some(vec!["ERR FEATURE-NOT-SUPPORTED".to_string()]),
        "USERNAME monuser" => Some(vec!["OK".to_string()]),
        "PASSWORD secret" => Some(vec!["OK".to_string()]),
        "LOGIN myups" => Some(vec!["OK".to_string()]),
        "LOGOUT" => Some(vec!["OK Goodbye".to_string()]),
        _ => None,
    }
}

#[tokio::test]
async fn auth_ladder_and_status_poll() {
    let addr = spawn_upsd(|line| {
        plaintext_upsd_base(line).unwrap_or_else(|| match line {
            "GET VAR myups ups.status" => {
                vec!["VAR myups ups.status \"OB LB\"".to_string()]
            }
            _ => vec!["ERR UNKNOWN-COMMAND".to_string()],
        })
    })
    .await;

    let policy = TlsPolicy::default();
    let mut session = Session::connect(
        "127.0.0.1",
        addr.port(),
        ConnectFlags::TRY_TLS,
        &policy,
    )
    .await
    .unwrap();

    // server refused STARTTLS, TRY_TLS carries on in plaintext
    assert!(!session.is_tls());

    session.username("monuser").await.unwrap();
    session.password("secret").await.unwrap();
    session.login("myups").await.unwrap();

    // the quoted multi-word value arrives as one word
    let status = session.ups_status("myups").await.unwrap();
    assert_eq!(status, "OB LB");

    session.disconnect().await;
}

#[tokio::test]
async fn require_tls_fails_against_plaintext_server() {
    let addr = spawn_upsd(|line| match line {
        "STARTTLS" => vec!["ERR FEATURE-NOT-SUPPORTED".to_string()],
        _ => vec!["ERR UNKNOWN-COMMAND".to_string()],
    })
    .await;

    let policy = TlsPolicy::default();
    let err = Session::connect(
        "127.0.0.1",
        addr.port(),
        ConnectFlags::REQUIRE_TLS,
        &policy,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ClientError::TlsRequired));
}

#[tokio::test]
async fn primary_falls_back_to_the_master_keyword() {
    let addr = spawn_upsd(|line| {
        plaintext_upsd_base(line).unwrap_or_else(|| match line {
            "PRIMARY myups" => vec!["ERR UNKNOWN-COMMAND".to_string()],
            "MASTER myups" => vec!["OK".to_string()],
            _ => vec!["ERR UNKNOWN-COMMAND".to_string()],
        })
    })
    .await;

    let policy = TlsPolicy::default();
    let mut session =
        Session::connect("127.0.0.1", addr.port(), ConnectFlags::empty(), &policy)
            .await
            .unwrap();

    session.primary("myups").await.unwrap();
    session.disconnect().await;
}

#[tokio::test]
async fn primary_denied_on_both_keywords_reports_the_server_error() {
    let addr = spawn_upsd(|line| match line {
        "PRIMARY myups" => vec!["ERR UNKNOWN-COMMAND".to_string()],
        "MASTER myups" => vec!["ERR ACCESS-DENIED".to_string()],
        _ => vec!["ERR UNKNOWN-COMMAND".to_string()],
    })
    .await;

    let policy = TlsPolicy::default();
    let mut session =
        Session::connect("127.0.0.1", addr.port(), ConnectFlags::empty(), &policy)
            .await
            .unwrap();

    let err = session.primary("myups").await.unwrap_err();
    assert_eq!(err.server_error(), Some(ServerError::AccessDenied));

    // an application-level denial leaves the session usable
    assert!(!err.is_transport());
}

#[tokio::test]
async fn server_error_tokens_map_to_kinds_and_keep_the_session() {
    let mut stale = true;
    let addr = spawn_upsd(move |line| match line {
        "GET VAR myups ups.status" => {
            if stale {
                stale = false;
                vec!["ERR DATA-STALE".to_string()]
            } else {
                vec!["VAR myups ups.status OL".to_string()]
            }
        }
        _ => vec!["ERR UNKNOWN-COMMAND".to_string()],
    })
    .await;

    let policy = TlsPolicy::default();
    let mut session =
        Session::connect("127.0.0.1", addr.port(), ConnectFlags::empty(), &policy)
            .await
            .unwrap();

    let err = session.ups_status("myups").await.unwrap_err();
    assert_eq!(err.server_error(), Some(ServerError::DataStale));
    assert!(!err.is_transport());

    // same session recovers on the next poll
    assert_eq!(session.ups_status("myups").await.unwrap(), "OL");
}

#[tokio::test]
async fn unknown_error_tokens_map_to_unknown() {
    let addr = spawn_upsd(|_| vec!["ERR SOMETHING-NEW".to_string()]).await;

    let policy = TlsPolicy::default();
    let mut session =
        Session::connect("127.0.0.1", addr.port(), ConnectFlags::empty(), &policy)
            .await
            .unwrap();

    let err = session.get(&["VAR", "myups", "ups.status"]).await.unwrap_err();
    assert_eq!(err.server_error(), Some(ServerError::Unknown));
}

#[tokio::test]
async fn response_must_echo_the_query() {
    let addr = spawn_upsd(|line| match line {
        "GET VAR myups ups.status" => {
            vec!["VAR otherups ups.status OL".to_string()]
        }
        _ => vec!["ERR UNKNOWN-COMMAND".to_string()],
    })
    .await;

    let policy = TlsPolicy::default();
    let mut session =
        Session::connect("127.0.0.1", addr.port(), ConnectFlags::empty(), &policy)
            .await
            .unwrap();

    let err = session.ups_status("myups").await.unwrap_err();
    assert!(matches!(err, ClientError::Protocol));
}

#[tokio::test]
async fn list_iteration_until_the_end_sentinel() {
    let addr = spawn_upsd(|line| match line {
        "LIST VAR myups" => vec![
            "BEGIN LIST VAR myups".to_string(),
            "VAR myups battery.charge \"100\"".to_string(),
            "VAR myups ups.mfr \"Example Power, Inc.\"".to_string(),
            "VAR myups ups.status \"OL\"".to_string(),
            "END LIST VAR myups".to_string(),
        ],
        _ => vec!["ERR UNKNOWN-COMMAND".to_string()],
    })
    .await;

    let policy = TlsPolicy::default();
    let mut session =
        Session::connect("127.0.0.1", addr.port(), ConnectFlags::empty(), &policy)
            .await
            .unwrap();

    let query = ["VAR", "myups"];
    session.list_start(&query).await.unwrap();

    let mut items = Vec::new();
    while let Some(words) = session.list_next(&query).await.unwrap() {
        items.push(words);
    }

    assert_eq!(items.len(), 3);
    assert_eq!(items[0], vec!["VAR", "myups", "battery.charge", "100"]);
    assert_eq!(items[1][3], "Example Power, Inc.");
    assert_eq!(items[2][3], "OL");
}

#[tokio::test]
async fn numlogins_parses_the_count() {
    let addr = spawn_upsd(|line| match line {
        "GET NUMLOGINS myups" => vec!["NUMLOGINS myups 3".to_string()],
        _ => vec!["ERR UNKNOWN-COMMAND".to_string()],
    })
    .await;

    let policy = TlsPolicy::default();
    let mut session =
        Session::connect("127.0.0.1", addr.port(), ConnectFlags::empty(), &policy)
            .await
            .unwrap();

    assert_eq!(session.numlogins("myups").await.unwrap(), 3);
}

#[tokio::test]
async fn hangup_mid_request_reads_as_server_disconnected() {
    let addr = spawn_upsd(|line| match line {
        "GET VAR myups ups.status" => vec![CLOSE.to_string()],
        _ => vec!["ERR UNKNOWN-COMMAND".to_string()],
    })
    .await;

    let policy = TlsPolicy::default();
    let mut session =
        Session::connect("127.0.0.1", addr.port(), ConnectFlags::empty(), &policy)
            .await
            .unwrap();

    let err = session.ups_status("myups").await.unwrap_err();
    assert!(matches!(err, ClientError::ServerDisconnected));
    assert!(err.is_transport());

    // the session is gone; further use is rejected locally
    let err = session.ups_status("myups").await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidArgument));
}

#[tokio::test]
async fn connect_to_a_dead_port_is_a_transport_error() {
    // bind-then-drop to find a port nothing listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let policy = TlsPolicy::default();
    let err = Session::connect("127.0.0.1", port, ConnectFlags::empty(), &policy)
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::ConnectFailure(_)));
    assert!(err.is_transport());
}
