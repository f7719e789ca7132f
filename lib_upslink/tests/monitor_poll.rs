//! End-to-end polling tests: a tracker driving a real session against
//! the scripted mock server, through connect, the auth ladder, status
//! interpretation and the shutdown-side verbs.

mod common;

use common::spawn_upsd;
use lib_upslink::client::{ConnectFlags, TlsPolicy, UpsIdentity};
use lib_upslink::monitor::notify::NotifyEvent;
use lib_upslink::monitor::tracker::{PollContext, Role, Timing, UpsTracker};

fn tracker_for(addr: std::net::SocketAddr, role: Role) -> UpsTracker {
    let sys = format!("myups@127.0.0.1:{}", addr.port());
    UpsTracker::new(
        sys.clone(),
        UpsIdentity::parse(&sys).unwrap(),
        1,
        "monuser".to_string(),
        "secret".to_string(),
        role,
    )
}

/// Scripted server for a primary-mode monitor whose UPS walks through
/// OL -> OB -> OB LB, the classic battery-then-low sequence.
fn battery_then_low_script() -> impl FnMut(&str) -> Vec<String> + Send + 'static {
    let mut polls = 0usize;
    move |line: &str| match line {
        "STARTTLS" => vec!["ERR FEATURE-NOT-SUPPORTED".to_string()],
        "USERNAME monuser" => vec!["OK".to_string()],
        "PASSWORD secret" => vec!["OK".to_string()],
        "LOGIN myups" => vec!["OK".to_string()],
        "PRIMARY myups" => vec!["OK".to_string()],
        "GET VAR myups ups.status" => {
            polls += 1;
            let status = match polls {
                1 => "OL",
                2 => "OB",
                _ => "OB LB",
            };
            vec![format!("VAR myups ups.status \"{status}\"")]
        }
        "GET NUMLOGINS myups" => vec!["NUMLOGINS myups 1".to_string()],
        "FSD myups" => vec!["OK".to_string()],
        "LOGOUT" => vec!["OK Goodbye".to_string()],
        _ => vec!["ERR UNKNOWN-COMMAND".to_string()],
    }
}

#[tokio::test]
async fn battery_then_low_drives_a_primary_critical() {
    let addr = spawn_upsd(battery_then_low_script()).await;
    let mut tracker = tracker_for(addr, Role::Primary);

    let policy = TlsPolicy::default();
    let timing = Timing::default();
    let ctx = PollContext {
        policy: &policy,
        af_flags: ConnectFlags::empty(),
        timing: &timing,
        throttle_max: -1,
        pollfreq: 5,
    };

    // cycle 1: connects, authenticates, sees OL; startup stays quiet
    let events = tracker.poll(&ctx).await;
    assert!(events.is_empty());
    assert!(!tracker.is_critical(std::time::Instant::now(), &timing));

    // cycle 2: wall power lost
    let events = tracker.poll(&ctx).await;
    assert_eq!(events, vec![NotifyEvent::OnBatt]);
    assert!(tracker.is_hot());

    // cycle 3: battery is low - a primary is critical at once
    let events = tracker.poll(&ctx).await;
    assert_eq!(events, vec![NotifyEvent::LowBatt]);
    assert!(tracker.is_critical(std::time::Instant::now(), &timing));

    // the shutdown-side verbs the coordinator would now issue
    let upsname = tracker.identity().upsname().to_string();
    let session = tracker.session_mut().expect("still connected");
    assert_eq!(session.numlogins(&upsname).await.unwrap(), 1);
    session.fsd(&upsname).await.unwrap();
}

#[tokio::test]
async fn auth_failure_leaves_the_tracker_polling_later() {
    // server that refuses the password outright
    let addr = spawn_upsd(|line: &str| match line {
        "STARTTLS" => vec!["ERR FEATURE-NOT-SUPPORTED".to_string()],
        "USERNAME monuser" => vec!["OK".to_string()],
        "PASSWORD secret" => vec!["ERR PASSWORD-INCORRECT".to_string()],
        _ => vec!["ERR UNKNOWN-COMMAND".to_string()],
    })
    .await;

    let mut tracker = tracker_for(addr, Role::Secondary);
    let policy = TlsPolicy::default();
    let timing = Timing::default();
    let ctx = PollContext {
        policy: &policy,
        af_flags: ConnectFlags::empty(),
        timing: &timing,
        throttle_max: -1,
        pollfreq: 5,
    };

    // no status, no notifications; just a logged failure
    let events = tracker.poll(&ctx).await;
    assert!(events.is_empty());

    // and crucially, an unauthenticated UPS is not critical
    assert!(!tracker.is_critical(std::time::Instant::now(), &timing));
}

#[tokio::test]
async fn unreachable_server_announces_the_loss() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let sys = format!("myups@127.0.0.1:{port}");
    let mut tracker = UpsTracker::new(
        sys.clone(),
        UpsIdentity::parse(&sys).unwrap(),
        1,
        "monuser".to_string(),
        "secret".to_string(),
        Role::Secondary,
    );

    let policy = TlsPolicy::default();
    let timing = Timing::default();
    let ctx = PollContext {
        policy: &policy,
        af_flags: ConnectFlags::empty(),
        timing: &timing,
        throttle_max: -1,
        pollfreq: 5,
    };

    // first failed contact announces the loss...
    let events = tracker.poll(&ctx).await;
    assert_eq!(events, vec![NotifyEvent::CommBad]);

    // ...then, with no successful poll ever recorded, the persistent
    // NOCOMM nag fires immediately...
    let events = tracker.poll(&ctx).await;
    assert_eq!(events, vec![NotifyEvent::NoComm]);

    // ...and is paced by NOCOMMWARNTIME afterwards
    let events = tracker.poll(&ctx).await;
    assert!(events.is_empty());

    // a never-seen UPS is not critical: it still counts toward power
    assert!(!tracker.is_critical(std::time::Instant::now(), &timing));
}

#[tokio::test]
async fn primary_keeps_polling_without_managerial_permissions() {
    // old server grants LOGIN but denies both PRIMARY and MASTER
    let addr = spawn_upsd(|line: &str| match line {
        "STARTTLS" => vec!["ERR FEATURE-NOT-SUPPORTED".to_string()],
        "USERNAME monuser" => vec!["OK".to_string()],
        "PASSWORD secret" => vec!["OK".to_string()],
        "LOGIN myups" => vec!["OK".to_string()],
        "PRIMARY myups" => vec!["ERR UNKNOWN-COMMAND".to_string()],
        "MASTER myups" => vec!["ERR ACCESS-DENIED".to_string()],
        "GET VAR myups ups.status" => vec!["VAR myups ups.status \"OL\"".to_string()],
        _ => vec!["ERR UNKNOWN-COMMAND".to_string()],
    })
    .await;

    let mut tracker = tracker_for(addr, Role::Primary);
    let policy = TlsPolicy::default();
    let timing = Timing::default();
    let ctx = PollContext {
        policy: &policy,
        af_flags: ConnectFlags::empty(),
        timing: &timing,
        throttle_max: -1,
        pollfreq: 5,
    };

    // the denial is logged, the poll itself still delivers status
    let events = tracker.poll(&ctx).await;
    assert!(events.is_empty());
    assert!(tracker.status().contains(lib_upslink::monitor::Status::ONLINE));
}
