//! Integration tests for the ServerQuery client against a scripted server.
//!
//! Each test binds a TCP listener on `127.0.0.1:0`, plays the server side of
//! the protocol line by line and checks what the client sends and resolves.
//!
//! # Running
//!
//! ```bash
//! RUST_LOG=ts3_serverquery=debug cargo test --test query_integration -- --nocapture
//! ```

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use ts3_serverquery::commands::KickReason;
use ts3_serverquery::query::{
    ConnectionEvent, ConnectionState, NotificationKind, Notification, TextMessageTargetMode,
};
use ts3_serverquery::{ClientConfig, Command, NotifyEvent, QueryClient, QueryError};

/// Timeout for individual test operations.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const WELCOME: &str = "Welcome to the TeamSpeak 3 ServerQuery interface, type \"help\" for a list of commands and \"help <command>\" for information on a specific command.";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Server side of one scripted connection.
struct FakeServer {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl FakeServer {
    /// Next line sent by the client.
    async fn expect_line(&mut self) -> String {
        timeout(TEST_TIMEOUT, self.lines.next_line())
            .await
            .expect("Test timed out")
            .expect("Read failed")
            .expect("Client closed the connection")
    }

    /// Assert the client sends nothing for a short while.
    async fn expect_silence(&mut self) {
        let result = timeout(Duration::from_millis(150), self.lines.next_line()).await;
        assert!(result.is_err(), "Unexpected line from client: {:?}", result);
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\n\r", line).as_bytes())
            .await
            .expect("Write failed");
    }
}

/// Accept one connection and send `preamble` on it.
async fn listen(preamble: &'static [&'static str]) -> (u16, JoinHandle<FakeServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut server = FakeServer {
            lines: BufReader::new(reader).lines(),
            writer,
        };
        for line in preamble {
            server.send(line).await;
        }
        server
    });

    (port, handle)
}

/// Connected client plus the server side of its connection.
async fn connected() -> (QueryClient, FakeServer) {
    init_tracing();
    let (port, handle) = listen(&["TS3", WELCOME]).await;
    let client = timeout(TEST_TIMEOUT, QueryClient::connect("127.0.0.1", port))
        .await
        .expect("Test timed out")
        .expect("Should connect");
    let server = handle.await.unwrap();
    (client, server)
}

#[tokio::test]
async fn test_login_and_typed_responses() {
    let (client, mut server) = connected().await;
    assert_eq!(client.state(), ConnectionState::Ready);

    let login = tokio::spawn({
        let client = client.clone();
        async move { client.login("serveradmin", "p@ss word").await }
    });
    assert_eq!(
        server.expect_line().await,
        "login client_login_name=serveradmin client_login_password=p@ss\\sword"
    );
    server.send("error id=0 msg=ok").await;
    let response = login.await.unwrap().unwrap();
    assert_eq!(response.status_id(), 0);
    assert!(response.error.is_none());

    let whoami = tokio::spawn({
        let client = client.clone();
        async move { client.whoami().await }
    });
    assert_eq!(server.expect_line().await, "whoami");
    server
        .send("virtualserver_status=online virtualserver_id=1 virtualserver_unique_identifier=abc= virtualserver_port=9987 client_id=3 client_channel_id=1 client_nickname=serveradmin\\sfrom\\s127.0.0.1:51234 client_database_id=1 client_login_name=serveradmin client_unique_identifier=serveradmin client_origin_server_id=0")
        .await;
    server.send("error id=0 msg=ok").await;

    let me = whoami.await.unwrap().unwrap();
    assert_eq!(me.virtualserver_port, 9987);
    assert_eq!(me.virtualserver_unique_identifier, "abc=");
    assert_eq!(me.client_nickname, "serveradmin from 127.0.0.1:51234");
}

#[tokio::test]
async fn test_commands_complete_in_submission_order() {
    let (client, mut server) = connected().await;

    let first = client.submit(Command::new("version")).unwrap();
    let second = client.submit(Command::new("use").param("sid", 1)).unwrap();
    let third = client.submit(Command::new("serverlist")).unwrap();

    assert_eq!(server.expect_line().await, "version");
    // Only one command is in flight at a time.
    server.expect_silence().await;
    assert_eq!(client.pending().await.unwrap().len(), 2);

    server
        .send("version=3.13.7 build=1655727713 platform=Linux")
        .await;
    server.send("error id=0 msg=ok").await;
    assert_eq!(server.expect_line().await, "use sid=1");
    server.send("error id=0 msg=ok").await;
    assert_eq!(server.expect_line().await, "serverlist");
    server.send("virtualserver_id=1 virtualserver_port=9987 virtualserver_status=online virtualserver_name=TeamSpeak\\s]I[\\sServer").await;
    server.send("error id=0 msg=ok").await;

    let version = timeout(TEST_TIMEOUT, first).await.expect("Test timed out").unwrap();
    assert_eq!(version.first().and_then(|r| r.get_string("platform")).as_deref(), Some("Linux"));
    assert_eq!(version.first().and_then(|r| r.get_int("build")), Some(1655727713));

    let used = timeout(TEST_TIMEOUT, second).await.expect("Test timed out").unwrap();
    assert_eq!(used.cmd, "use");
    assert!(used.response.is_none());

    let servers = timeout(TEST_TIMEOUT, third).await.expect("Test timed out").unwrap();
    assert_eq!(
        servers.first().and_then(|r| r.get_string("virtualserver_name")).as_deref(),
        Some("TeamSpeak ]I[ Server")
    );
}

#[tokio::test]
async fn test_error_status_rejects_only_that_command() {
    let (client, mut server) = connected().await;

    let bad = client.submit(Command::new("use").param("sid", 9)).unwrap();
    let good = client.submit(Command::new("version")).unwrap();

    assert_eq!(server.expect_line().await, "use sid=9");
    server.send("error id=1024 msg=invalid\\sserverID").await;
    assert_eq!(server.expect_line().await, "version");
    server.send("version=3.13.7 build=1 platform=Linux").await;
    server.send("error id=0 msg=ok").await;

    match timeout(TEST_TIMEOUT, bad).await.expect("Test timed out") {
        Err(QueryError::Query(response)) => {
            assert_eq!(response.status_id(), 1024);
            assert_eq!(response.status_message(), "invalid serverID");
            assert_eq!(response.text, "use sid=9");
        }
        other => panic!("Expected query error, got {:?}", other),
    }
    assert!(timeout(TEST_TIMEOUT, good).await.expect("Test timed out").is_ok());
    assert_eq!(client.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_notifications_interleaved_with_response() {
    let (client, mut server) = connected().await;
    let mut joins = client.subscribe_to(NotificationKind::ClientEnterView);
    let mut events = client.subscribe();

    let list = client.submit(Command::new("clientlist")).unwrap();
    assert_eq!(server.expect_line().await, "clientlist");

    server.send("clid=1 cid=1 client_database_id=1 client_nickname=serveradmin client_type=1").await;
    server.send("notifycliententerview cfid=0 ctid=1 reasonid=0 clid=5 client_nickname=alice").await;
    server.send("error id=0 msg=ok").await;

    let response = timeout(TEST_TIMEOUT, list).await.expect("Test timed out").unwrap();
    assert_eq!(response.records().len(), 1);
    assert_eq!(response.first().and_then(|r| r.get_int("clid")), Some(1));

    let joined = timeout(TEST_TIMEOUT, joins.recv())
        .await
        .expect("Test timed out")
        .expect("Subscription ended");
    assert_eq!(joined.name(), "cliententerview");
    let record = &joined.records()[0];
    assert_eq!(record.get_string("client_nickname").as_deref(), Some("alice"));
    assert_eq!(record.get_int("clid"), Some(5));

    let event = timeout(TEST_TIMEOUT, events.recv()).await.expect("Test timed out");
    assert!(matches!(event, Some(ConnectionEvent::Notification(_))));
}

#[tokio::test]
async fn test_text_message_notification_is_typed() {
    let (client, mut server) = connected().await;
    let mut messages = client.subscribe_to(NotificationKind::TextMessage);

    let register = tokio::spawn({
        let client = client.clone();
        async move { client.register_notifications(NotifyEvent::TextPrivate).await }
    });
    assert_eq!(server.expect_line().await, "servernotifyregister event=textprivate");
    server.send("error id=0 msg=ok").await;
    register.await.unwrap().unwrap();

    server
        .send("notifytextmessage targetmode=1 msg=hi\\sthere\\p! target=3 invokerid=5 invokername=alice invokeruid=x1Y2z3=")
        .await;

    let notification = timeout(TEST_TIMEOUT, messages.recv())
        .await
        .expect("Test timed out")
        .expect("Subscription ended");
    match notification {
        Notification::TextMessage { message, records } => {
            assert_eq!(records.len(), 1);
            assert_eq!(message.targetmode, Some(TextMessageTargetMode::Client));
            assert_eq!(message.msg, "hi there|!");
            assert_eq!(message.target, Some(3));
            assert_eq!(message.invoker_name.as_deref(), Some("alice"));
            assert_eq!(message.invoker_uid.as_deref(), Some("x1Y2z3="));
        }
        other => panic!("Expected text message, got {:?}", other),
    }
}

#[tokio::test]
async fn test_wrappers_escape_parameters() {
    let (client, mut server) = connected().await;

    let send = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .send_text_message(TextMessageTargetMode::Channel, 1, "a/b c|d")
                .await
        }
    });
    assert_eq!(
        server.expect_line().await,
        "sendtextmessage targetmode=2 target=1 msg=a\\/b\\sc\\pd"
    );
    server.send("error id=0 msg=ok").await;
    send.await.unwrap().unwrap();

    let kick = tokio::spawn({
        let client = client.clone();
        async move { client.client_kick(&[5, 6], KickReason::Channel, Some("bye now")).await }
    });
    assert_eq!(
        server.expect_line().await,
        "clientkick reasonid=4 reasonmsg=bye\\snow clid=5|clid=6"
    );
    server.send("error id=0 msg=ok").await;
    kick.await.unwrap().unwrap();

    let channels = tokio::spawn({
        let client = client.clone();
        async move { client.channel_list(&["topic"]).await }
    });
    assert_eq!(server.expect_line().await, "channellist -topic");
    server
        .send("cid=1 pid=0 channel_order=0 channel_name=Default\\sChannel channel_topic=Default\\sChannel\\shas\\sno\\stopic total_clients=1 channel_needed_subscribe_power=0|cid=2 pid=0 channel_order=1 channel_name=007 channel_topic= total_clients=0 channel_needed_subscribe_power=0")
        .await;
    server.send("error id=0 msg=ok").await;

    let channels = channels.await.unwrap().unwrap();
    assert_eq!(channels.len(), 2);
    assert_eq!(channels[0].channel_name, "Default Channel");
    assert_eq!(
        channels[0].channel_topic.as_deref(),
        Some("Default Channel has no topic")
    );
    assert_eq!(channels[1].channel_name, "007");
}

#[tokio::test]
async fn test_strict_greeting_rejects_other_services() {
    init_tracing();
    let (port, _handle) = listen(&["SSH-2.0-OpenSSH_9.6", "banner"]).await;

    let result = timeout(TEST_TIMEOUT, QueryClient::connect("127.0.0.1", port))
        .await
        .expect("Test timed out");
    match result {
        Err(QueryError::Handshake(msg)) => assert!(msg.contains("not a ServerQuery endpoint")),
        other => panic!("Expected handshake error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_lenient_greeting_accepts_any_preamble() {
    init_tracing();
    let (port, handle) = listen(&["TS3-compatible proxy", "hello"]).await;

    let mut config = ClientConfig::new("127.0.0.1", port);
    config.strict_greeting = false;
    let client = timeout(TEST_TIMEOUT, QueryClient::connect_with(&config))
        .await
        .expect("Test timed out")
        .expect("Should connect");
    let mut server = handle.await.unwrap();

    let version = client.submit(Command::new("version")).unwrap();
    assert_eq!(server.expect_line().await, "version");
    server.send("error id=0 msg=ok").await;
    assert!(timeout(TEST_TIMEOUT, version).await.expect("Test timed out").is_ok());
}

#[tokio::test]
async fn test_connect_refused() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let result = timeout(TEST_TIMEOUT, QueryClient::connect("127.0.0.1", port))
        .await
        .expect("Test timed out");
    assert!(matches!(result, Err(QueryError::ConnectionFailed(_))));
}

#[tokio::test]
async fn test_server_close_rejects_outstanding_commands() {
    let (client, mut server) = connected().await;
    let mut events = client.subscribe();

    let in_flight = client.submit(Command::new("clientlist")).unwrap();
    let queued = client.submit(Command::new("channellist")).unwrap();
    assert_eq!(server.expect_line().await, "clientlist");
    drop(server);

    assert!(matches!(
        timeout(TEST_TIMEOUT, in_flight).await.expect("Test timed out"),
        Err(QueryError::ConnectionClosed)
    ));
    assert!(matches!(
        timeout(TEST_TIMEOUT, queued).await.expect("Test timed out"),
        Err(QueryError::ConnectionClosed)
    ));

    let pending = loop {
        match timeout(TEST_TIMEOUT, events.recv()).await.expect("Test timed out") {
            Some(ConnectionEvent::Closed { pending }) => break pending,
            Some(_) => continue,
            None => panic!("Event stream ended without Closed"),
        }
    };
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].text, "channellist");
    assert!(events.recv().await.is_none());

    assert!(client.is_closed());
    assert!(matches!(
        client.submit(Command::new("version")),
        Err(QueryError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_clear_pending_leaves_in_flight_command() {
    let (client, mut server) = connected().await;

    let in_flight = client.submit(Command::new("whoami")).unwrap();
    let kept = client.submit(Command::new("version")).unwrap();
    let dropped = client.submit(Command::new("hostinfo")).unwrap();
    assert_eq!(server.expect_line().await, "whoami");

    let mut removed = client.clear_pending().await.unwrap();
    assert_eq!(removed.len(), 2);
    assert_eq!(removed[0].text(), "version");
    assert!(client.pending().await.unwrap().is_empty());

    removed.truncate(1);
    removed
        .pop()
        .unwrap()
        .reject(QueryError::Decode("removed by test".into()));

    server.send("error id=0 msg=ok").await;
    assert!(timeout(TEST_TIMEOUT, in_flight).await.expect("Test timed out").is_ok());
    assert!(matches!(
        timeout(TEST_TIMEOUT, kept).await.expect("Test timed out"),
        Err(QueryError::Decode(_))
    ));
    assert!(matches!(
        timeout(TEST_TIMEOUT, dropped).await.expect("Test timed out"),
        Err(QueryError::Cancelled)
    ));

    // Removed commands were never transmitted.
    let next = client.submit(Command::new("serverlist")).unwrap();
    assert_eq!(server.expect_line().await, "serverlist");
    server.send("error id=0 msg=ok").await;
    assert!(timeout(TEST_TIMEOUT, next).await.expect("Test timed out").is_ok());
}

#[tokio::test]
async fn test_idle_timeout_closes_connection() {
    let (client, _server) = connected().await;
    let mut events = client.subscribe();

    client
        .set_idle_timeout(Some(Duration::from_millis(100)))
        .unwrap();

    let event = timeout(TEST_TIMEOUT, events.recv()).await.expect("Test timed out");
    assert!(matches!(event, Some(ConnectionEvent::Timeout)));
    let event = timeout(TEST_TIMEOUT, events.recv()).await.expect("Test timed out");
    assert!(matches!(event, Some(ConnectionEvent::Closed { .. })));

    timeout(TEST_TIMEOUT, client.closed()).await.expect("Test timed out");
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_shutdown_then_subscribe_finishes_immediately() {
    let (client, _server) = connected().await;
    client.shutdown();
    timeout(TEST_TIMEOUT, client.closed()).await.expect("Test timed out");

    let mut events = client.subscribe();
    assert!(timeout(TEST_TIMEOUT, events.recv()).await.expect("Test timed out").is_none());

    let mut notifications = client.subscribe_to(NotificationKind::ClientMoved);
    assert!(timeout(TEST_TIMEOUT, notifications.recv())
        .await
        .expect("Test timed out")
        .is_none());
}
