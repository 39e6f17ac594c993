//! A gateway forwarding requests for a remote server to the agent running
//! on it.

mod common;

use common::{read_until, TestServer};
use termgate::lines::Finish;
use termgate::protocol::{BatchDeleteAllTerminals, CreateTerminal, ExecuteTerminal};
use termgate::target::{InitTerminal, Target, TerminalRecreateMode};

const AGENT_CONFIG: &str = r#"
    [[users]]
    name = "gateway"
    api_key = "gw-key"
    api_secret = "gw-secret"
    admin = true

    [[servers]]
    id = "edge"
"#;

/// The agent, and a gateway that reaches `edge` through it.
async fn pair() -> (TestServer, TestServer) {
    let agent = TestServer::start_with(AGENT_CONFIG).await;
    let gateway_config = format!(
        r#"{}
    [[servers]]
    id = "edge"
    address = "{}"
    key = "gw-key"
    secret = "gw-secret"
"#,
        common::BASE_CONFIG,
        agent.url()
    );
    let gateway = TestServer::start_with(&gateway_config).await;
    (agent, gateway)
}

fn edge_terminal(name: &str) -> CreateTerminal {
    CreateTerminal {
        name: name.into(),
        target: Target::server("edge"),
        command: Some("cat".into()),
        mode: None,
        recreate: TerminalRecreateMode::Never,
        tags: vec!["remote".into()],
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn create_and_list_land_on_the_agent() {
    let (agent, gateway) = pair().await;
    let client = gateway.ops();

    let summary = client.create_terminal(&edge_terminal("far")).await.unwrap();
    assert_eq!(summary.target, Target::server("edge"));
    assert_eq!(agent.state.registry().len(), 1);
    assert!(gateway.state.registry().is_empty());

    let listed = client
        .list_terminals(Some(&Target::server("edge")))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "far");

    // Unfiltered listing only covers the gateway's own terminals.
    assert!(client.list_terminals(None).await.unwrap().is_empty());

    assert!(client
        .delete_terminal(&Target::server("edge"), "far")
        .await
        .unwrap());
    assert!(agent.state.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_errors_keep_their_status() {
    let (_agent, gateway) = pair().await;
    let client = gateway.ops();
    client.create_terminal(&edge_terminal("twice")).await.unwrap();
    let err = client.create_terminal(&edge_terminal("twice")).await.unwrap_err();
    assert_eq!(err.status(), Some(409));
}

#[tokio::test(flavor = "multi_thread")]
async fn execute_is_streamed_through() {
    let (_agent, gateway) = pair().await;
    let request = ExecuteTerminal {
        target: Target::server("edge"),
        terminal: None,
        command: "echo from-edge; exit 4".into(),
        init: None,
    };
    let (lines, finish) = gateway.ops().execute_collect(&request).await.unwrap();
    assert_eq!(lines, vec!["from-edge"]);
    assert_eq!(finish, Finish::ExitCode("4".into()));
}

#[tokio::test(flavor = "multi_thread")]
async fn terminal_socket_is_relayed() {
    let (agent, gateway) = pair().await;
    let init = InitTerminal {
        command: Some("sh".into()),
        ..Default::default()
    };
    let mut conn = gateway
        .ops()
        .connect_terminal(&Target::server("edge"), Some("relay"), Some(&init))
        .await
        .unwrap();
    conn.send_stdin("echo relayed-$((2+3))\n").await.unwrap();
    read_until(&mut conn, "relayed-5").await;
    assert_eq!(agent.state.registry().len(), 1);
    conn.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_delete_reaches_every_server() {
    let (agent, gateway) = pair().await;
    gateway.ops().create_terminal(&edge_terminal("r1")).await.unwrap();
    let local = CreateTerminal {
        target: Target::server("local"),
        ..edge_terminal("l1")
    };
    gateway.ops().create_terminal(&local).await.unwrap();

    let deleted = gateway
        .root()
        .batch_delete_all_terminals(&BatchDeleteAllTerminals {
            servers: vec![],
            tags: vec!["remote".into()],
        })
        .await
        .unwrap();
    assert_eq!(deleted, 2);
    assert!(agent.state.registry().is_empty());
    assert!(gateway.state.registry().is_empty());
}

#[tokio::test]
async fn unreachable_agent_is_a_bad_gateway() {
    let config = format!(
        r#"{}
    [[servers]]
    id = "edge"
    address = "http://127.0.0.1:9"
    key = "k"
    secret = "s"
"#,
        common::BASE_CONFIG
    );
    let gateway = TestServer::start_with(&config).await;
    let err = gateway
        .ops()
        .create_terminal(&edge_terminal("nowhere"))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(502));
}
