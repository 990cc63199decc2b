/// Operational Datastore Integration Tests
///
/// Composition of the operational view with live providers: replacement of
/// running data by provider output, timeout handling, static predicate
/// pruning of disjoint subscriptions, merge-mode providers, stored overlay
/// edits, and config/state trimming.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use yangstore::conn::Connection;
use yangstore::rendezvous::{CallbackError, OperRequest};
use yangstore::schema::{ModuleDef, ModuleSchema, NodeSchema, SchemaNodeKind};
use yangstore::session::Subscription;
use yangstore::tree::{Node, Origin, Tree};
use yangstore::xpath::XPath;
use yangstore::{Config, Datastore, ErrorKind, GetOpts, OperSubKind, SUB_OPER_MERGE};

const T: Duration = Duration::from_secs(3);

fn connect(temp: &TempDir, prefix: &str) -> Arc<Connection> {
    let mut cfg = Config::default();
    cfg.repository.path = temp.path().join("repo");
    cfg.shm.dir = temp.path().join("shm");
    cfg.shm.prefix = prefix.to_string();
    Connection::connect(cfg).unwrap()
}

fn if_def() -> ModuleDef {
    ModuleDef::new(
        ModuleSchema::new("if", None)
            .with_node(NodeSchema::new("/interfaces", SchemaNodeKind::Container))
            .with_node(NodeSchema::new("/interfaces/interface", SchemaNodeKind::List).with_keys(&["name"]))
            .with_node(NodeSchema::new("/interfaces/interface/name", SchemaNodeKind::Leaf))
            .with_node(NodeSchema::new("/interfaces/interface/oper-state", SchemaNodeKind::Leaf)),
    )
}

fn running_eth0(state: &str) -> Tree {
    Tree::with_root(
        Node::container("if", "interfaces").with_child(
            Node::list("if", "interface", &[("name", "eth0")])
                .with_child(Node::leaf("if", "oper-state", state)),
        ),
    )
}

fn provider_fragment(name: &str, state: &str) -> Tree {
    Tree::with_root(
        Node::container("if", "interfaces").with_child(
            Node::list("if", "interface", &[("name", name)])
                .with_child(Node::leaf("if", "oper-state", state)),
        ),
    )
}

/// Run `body` while a thread keeps dispatching `sub`'s events.
fn with_provider_loop<R>(sub: &Subscription, body: impl FnOnce() -> R) -> R {
    let stop = AtomicBool::new(false);
    std::thread::scope(|scope| {
        let stop_ref = &stop;
        scope.spawn(move || {
            while !stop_ref.load(Ordering::SeqCst) {
                let _ = sub.process_events(Duration::from_millis(20));
            }
        });
        let result = body();
        stop.store(true, Ordering::SeqCst);
        result
    })
}

#[test]
fn test_provider_replaces_running_state() {
    let temp = TempDir::new().unwrap();
    let conn = connect(&temp, "op1");
    conn.install_module(if_def()).unwrap();
    let session = conn.session_start("admin").unwrap();

    session.apply_edit(Datastore::Running, running_eth0("down"), T).unwrap();

    // Whole-module change subscription makes running data visible
    // operationally.
    let _enable = session
        .subscribe_changes("if", Datastore::Running, None, 0, 0, |_| {})
        .unwrap();
    let oper_sub = session
        .subscribe_oper(
            "if",
            "/if:interfaces/if:interface/if:oper-state",
            OperSubKind::State,
            0,
            |_req: &OperRequest| Ok(Some(provider_fragment("eth0", "up"))),
        )
        .unwrap();

    let tree = with_provider_loop(&oper_sub, || {
        session
            .get_data(
                Datastore::Operational,
                "/if:interfaces/if:interface[name='eth0']",
                GetOpts::default(),
                T,
            )
            .unwrap()
    });

    let state = tree.eval(&XPath::parse("/if:interfaces/if:interface[name='eth0']/if:oper-state").unwrap());
    assert_eq!(state.len(), 1);
    // The provider's answer replaced the stale running value.
    assert_eq!(state[0].value.as_deref(), Some("up"));
}

#[test]
fn test_provider_timeout_fails_whole_request() {
    let temp = TempDir::new().unwrap();
    let conn = connect(&temp, "op2");
    conn.install_module(if_def()).unwrap();
    let session = conn.session_start("admin").unwrap();

    session.apply_edit(Datastore::Running, running_eth0("down"), T).unwrap();
    let _enable = session
        .subscribe_changes("if", Datastore::Running, None, 0, 0, |_| {})
        .unwrap();
    // Subscribed but nobody dispatches events.
    let _oper_sub = session
        .subscribe_oper(
            "if",
            "/if:interfaces/if:interface/if:oper-state",
            OperSubKind::State,
            0,
            |_req: &OperRequest| Ok(None),
        )
        .unwrap();

    let err = session
        .get_data(
            Datastore::Operational,
            "/if:interfaces/if:interface[name='eth0']",
            GetOpts::default(),
            Duration::from_millis(300),
        )
        .unwrap_err();
    // Timeout maps to a callback failure and no partial tree is returned.
    assert_eq!(err.kind(), ErrorKind::CallbackFailed);
}

#[test]
fn test_provider_error_propagates() {
    let temp = TempDir::new().unwrap();
    let conn = connect(&temp, "op3");
    conn.install_module(if_def()).unwrap();
    let session = conn.session_start("admin").unwrap();

    session.apply_edit(Datastore::Running, running_eth0("down"), T).unwrap();
    let _enable = session
        .subscribe_changes("if", Datastore::Running, None, 0, 0, |_| {})
        .unwrap();
    let oper_sub = session
        .subscribe_oper(
            "if",
            "/if:interfaces/if:interface/if:oper-state",
            OperSubKind::State,
            0,
            |_req: &OperRequest| {
                Err(CallbackError {
                    message: "hardware poll failed".to_string(),
                    path: None,
                    tag: None,
                })
            },
        )
        .unwrap();

    let err = with_provider_loop(&oper_sub, || {
        session
            .get_data(
                Datastore::Operational,
                "/if:interfaces/if:interface[name='eth0']",
                GetOpts::default(),
                T,
            )
            .unwrap_err()
    });
    assert_eq!(err.kind(), ErrorKind::CallbackFailed);
    assert!(err.message().contains("hardware poll failed"));
}

#[test]
fn test_disjoint_predicate_prunes_provider() {
    let temp = TempDir::new().unwrap();
    let conn = connect(&temp, "op4");
    conn.install_module(ModuleDef::new(
        ModuleSchema::new("a", None)
            .with_node(NodeSchema::new("/list", SchemaNodeKind::List).with_keys(&["key"]))
            .with_node(NodeSchema::new("/list/key", SchemaNodeKind::Leaf))
            .with_node(NodeSchema::new("/list/leaf", SchemaNodeKind::Leaf)),
    ))
    .unwrap();
    let session = conn.session_start("admin").unwrap();

    // Running has both instances, so the subscription's parent exists and
    // only the static prune can prevent the callout.
    session
        .apply_edit(
            Datastore::Running,
            Tree {
                roots: vec![
                    Node::list("a", "list", &[("key", "x")])
                        .with_child(Node::leaf("a", "leaf", "vx")),
                    Node::list("a", "list", &[("key", "y")])
                        .with_child(Node::leaf("a", "leaf", "vy")),
                ],
            },
            T,
        )
        .unwrap();
    let _enable = session
        .subscribe_changes("a", Datastore::Running, None, 0, 0, |_| {})
        .unwrap();

    let invoked = Arc::new(AtomicBool::new(false));
    let invoked2 = Arc::clone(&invoked);
    let oper_sub = session
        .subscribe_oper(
            "a",
            "/a:list[key='y']/a:leaf",
            OperSubKind::State,
            0,
            move |_req: &OperRequest| {
                invoked2.store(true, Ordering::SeqCst);
                Ok(None)
            },
        )
        .unwrap();

    let tree = with_provider_loop(&oper_sub, || {
        session
            .get_data(
                Datastore::Operational,
                "/a:list[key='x']/a:leaf",
                GetOpts::default(),
                T,
            )
            .unwrap()
    });

    // The request completed from enabled data alone; the provider for the
    // disjoint key was never consulted.
    assert!(!invoked.load(Ordering::SeqCst));
    let leaf = tree.eval(&XPath::parse("/a:list[key='x']/a:leaf").unwrap());
    assert_eq!(leaf[0].value.as_deref(), Some("vx"));
}

#[test]
fn test_merge_subscription_adds_instead_of_replacing() {
    let temp = TempDir::new().unwrap();
    let conn = connect(&temp, "op5");
    conn.install_module(if_def()).unwrap();
    let session = conn.session_start("admin").unwrap();

    session.apply_edit(Datastore::Running, running_eth0("down"), T).unwrap();
    let _enable = session
        .subscribe_changes("if", Datastore::Running, None, 0, 0, |_| {})
        .unwrap();
    let oper_sub = session
        .subscribe_oper(
            "if",
            "/if:interfaces/if:interface",
            OperSubKind::Mixed,
            SUB_OPER_MERGE,
            |_req: &OperRequest| Ok(Some(provider_fragment("eth1", "up"))),
        )
        .unwrap();

    let tree = with_provider_loop(&oper_sub, || {
        session
            .get_data(Datastore::Operational, "/if:interfaces", GetOpts::default(), T)
            .unwrap()
    });

    // Both the running instance and the provider-added one are present.
    let names = tree.eval(&XPath::parse("/if:interfaces/if:interface").unwrap());
    assert_eq!(names.len(), 2);
    let eth0 = tree.eval(&XPath::parse("/if:interfaces/if:interface[name='eth0']/if:oper-state").unwrap());
    assert_eq!(eth0[0].value.as_deref(), Some("down"));
    let eth1 = tree.eval(&XPath::parse("/if:interfaces/if:interface[name='eth1']/if:oper-state").unwrap());
    assert_eq!(eth1[0].value.as_deref(), Some("up"));
}

#[test]
fn test_operational_edit_persists_into_overlay() {
    let temp = TempDir::new().unwrap();
    let conn = connect(&temp, "op6");
    conn.install_module(if_def()).unwrap();
    let session = conn.session_start("admin").unwrap();

    session.apply_edit(Datastore::Running, running_eth0("down"), T).unwrap();
    let _enable = session
        .subscribe_changes("if", Datastore::Running, None, 0, 0, |_| {})
        .unwrap();

    // Store a learned entry into the operational overlay.
    let edit = Tree::with_root(
        Node::container("if", "interfaces").with_child(
            Node::list("if", "interface", &[("name", "lo")])
                .with_child(Node::leaf("if", "oper-state", "up").with_origin(Origin::Learned)),
        ),
    );
    session.apply_edit(Datastore::Operational, edit, T).unwrap();

    let mut opts = GetOpts::default();
    opts.with_origin = true;
    let tree = session
        .get_data(Datastore::Operational, "/if:interfaces", opts, T)
        .unwrap();
    let lo = tree.eval(&XPath::parse("/if:interfaces/if:interface[name='lo']/if:oper-state").unwrap());
    assert_eq!(lo.len(), 1);
    assert_eq!(lo[0].value.as_deref(), Some("up"));
    assert_eq!(lo[0].origin, Some(Origin::Learned));

    // NO_STORED hides the overlay again.
    let mut opts = GetOpts::default();
    opts.no_stored = true;
    let tree = session
        .get_data(Datastore::Operational, "/if:interfaces", opts, T)
        .unwrap();
    assert!(tree
        .eval(&XPath::parse("/if:interfaces/if:interface[name='lo']").unwrap())
        .is_empty());
}

#[test]
fn test_trim_flags() {
    let temp = TempDir::new().unwrap();
    let conn = connect(&temp, "op7");
    conn.install_module(ModuleDef::new(
        ModuleSchema::new("mix", None)
            .with_node(NodeSchema::new("/box", SchemaNodeKind::Container))
            .with_node(NodeSchema::new("/box/conf", SchemaNodeKind::Leaf))
            .with_node(NodeSchema::new("/box/stat", SchemaNodeKind::Leaf).state()),
    ))
    .unwrap();
    let session = conn.session_start("admin").unwrap();

    session
        .apply_edit(
            Datastore::Running,
            Tree::with_root(Node::container("mix", "box").with_child(Node::leaf("mix", "conf", "c"))),
            T,
        )
        .unwrap();
    let _enable = session
        .subscribe_changes("mix", Datastore::Running, None, 0, 0, |_| {})
        .unwrap();

    // Add state through the overlay.
    let mut stat = Node::leaf("mix", "stat", "s");
    stat.config = false;
    let edit = Tree::with_root(Node::container("mix", "box").with_child(stat));
    session.apply_edit(Datastore::Operational, edit, T).unwrap();

    let mut opts = GetOpts::default();
    opts.no_state = true;
    let tree = session.get_data(Datastore::Operational, "/mix:box", opts, T).unwrap();
    assert_eq!(tree.eval(&XPath::parse("/mix:box/conf").unwrap()).len(), 1);
    assert!(tree.eval(&XPath::parse("/mix:box/stat").unwrap()).is_empty());

    let mut opts = GetOpts::default();
    opts.no_config = true;
    let tree = session.get_data(Datastore::Operational, "/mix:box", opts, T).unwrap();
    assert!(tree.eval(&XPath::parse("/mix:box/conf").unwrap()).is_empty());
    assert_eq!(tree.eval(&XPath::parse("/mix:box/stat").unwrap()).len(), 1);
}

#[test]
fn test_yang_library_and_monitoring_visible_operationally() {
    let temp = TempDir::new().unwrap();
    let conn = connect(&temp, "op8");
    conn.install_module(if_def()).unwrap();
    let session = conn.session_start("admin").unwrap();

    let tree = session
        .get_data(
            Datastore::Operational,
            "/ietf-yang-library:modules-state/module[name='if']",
            GetOpts::default(),
            T,
        )
        .unwrap();
    assert_eq!(
        tree.eval(&XPath::parse("/ietf-yang-library:modules-state/module[name='if']").unwrap()).len(),
        1
    );

    let tree = session
        .get_data(
            Datastore::Operational,
            "/yangstore-monitoring:connections/connection",
            GetOpts::default(),
            T,
        )
        .unwrap();
    // At least our own connection is listed.
    assert!(!tree
        .eval(&XPath::parse("/yangstore-monitoring:connections/connection").unwrap())
        .is_empty());
}
