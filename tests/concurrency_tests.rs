/// Concurrency Integration Tests
///
/// Cross-connection behavior: canonical lock order preventing deadlocks
/// between writers that touch the same modules in different textual orders,
/// version-counted serialization of commits, and cache coherence across
/// connections.
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use yangstore::conn::Connection;
use yangstore::schema::{ModuleDef, ModuleSchema, NodeSchema, SchemaNodeKind};
use yangstore::tree::{Node, Tree};
use yangstore::xpath::XPath;
use yangstore::{Config, Datastore, GetOpts};

const T: Duration = Duration::from_secs(10);

fn test_config(temp: &TempDir, prefix: &str) -> Config {
    let mut cfg = Config::default();
    cfg.repository.path = temp.path().join("repo");
    cfg.shm.dir = temp.path().join("shm");
    cfg.shm.prefix = prefix.to_string();
    cfg
}

fn leaf_module(name: &str) -> ModuleDef {
    ModuleDef::new(
        ModuleSchema::new(name, None)
            .with_node(NodeSchema::new("/root", SchemaNodeKind::Container))
            .with_node(NodeSchema::new("/root/v", SchemaNodeKind::Leaf)),
    )
}

fn set_v(module: &str, value: &str) -> Node {
    Node::container(module, "root").with_child(Node::leaf(module, "v", value))
}

#[test]
fn test_cross_module_writers_do_not_deadlock() {
    let temp = TempDir::new().unwrap();
    let cfg = test_config(&temp, "cc1");
    let setup = Connection::connect(cfg.clone()).unwrap();
    setup.install_module(leaf_module("x")).unwrap();
    setup.install_module(leaf_module("y")).unwrap();

    // Both writers touch both modules, one naming them x-then-y, the other
    // y-then-x. The canonical lock order makes the textual order
    // irrelevant.
    let mut handles = Vec::new();
    for flip in [false, true] {
        let cfg = cfg.clone();
        handles.push(std::thread::spawn(move || {
            let conn = Connection::connect(cfg).unwrap();
            conn.load_schema(
                ModuleSchema::new("x", None)
                    .with_node(NodeSchema::new("/root", SchemaNodeKind::Container))
                    .with_node(NodeSchema::new("/root/v", SchemaNodeKind::Leaf)),
            );
            conn.load_schema(
                ModuleSchema::new("y", None)
                    .with_node(NodeSchema::new("/root", SchemaNodeKind::Container))
                    .with_node(NodeSchema::new("/root/v", SchemaNodeKind::Leaf)),
            );
            let session = conn.session_start("writer").unwrap();
            for i in 0..15 {
                let value = format!("{}-{}", flip, i);
                let roots = if flip {
                    vec![set_v("y", &value), set_v("x", &value)]
                } else {
                    vec![set_v("x", &value), set_v("y", &value)]
                };
                session
                    .apply_edit(Datastore::Running, Tree { roots }, T)
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // 30 commits, each changing both modules.
    assert_eq!(setup.module_version("x").unwrap(), 30);
    assert_eq!(setup.module_version("y").unwrap(), 30);
}

#[test]
fn test_commit_serialization_counts_versions() {
    let temp = TempDir::new().unwrap();
    let cfg = test_config(&temp, "cc2");
    let setup = Connection::connect(cfg.clone()).unwrap();
    setup.install_module(leaf_module("m")).unwrap();

    let mut handles = Vec::new();
    for writer in 0..3u32 {
        let cfg = cfg.clone();
        handles.push(std::thread::spawn(move || {
            let conn = Connection::connect(cfg).unwrap();
            conn.load_schema(
                ModuleSchema::new("m", None)
                    .with_node(NodeSchema::new("/root", SchemaNodeKind::Container))
                    .with_node(NodeSchema::new("/root/v", SchemaNodeKind::Leaf)),
            );
            let session = conn.session_start("writer").unwrap();
            let mut committed = 0u32;
            for i in 0..10 {
                let value = format!("w{}-{}", writer, i);
                session
                    .apply_edit(Datastore::Running, Tree::with_root(set_v("m", &value)), T)
                    .unwrap();
                committed += 1;
            }
            committed
        }));
    }

    let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 30);
    // Every successful running write bumped the version exactly once.
    assert_eq!(setup.module_version("m").unwrap(), 30);
}

#[test]
fn test_cache_coherence_across_connections() {
    let temp = TempDir::new().unwrap();
    let cfg = test_config(&temp, "cc3");
    let writer_conn = Connection::connect(cfg.clone()).unwrap();
    writer_conn.install_module(leaf_module("m")).unwrap();
    let writer = writer_conn.session_start("writer").unwrap();

    let reader_conn = Connection::connect(cfg).unwrap();
    reader_conn.load_schema(
        ModuleSchema::new("m", None)
            .with_node(NodeSchema::new("/root", SchemaNodeKind::Container))
            .with_node(NodeSchema::new("/root/v", SchemaNodeKind::Leaf)),
    );
    let reader = reader_conn.session_start("reader").unwrap();

    for i in 0..10 {
        let value = format!("v{}", i);
        writer
            .apply_edit(Datastore::Running, Tree::with_root(set_v("m", &value)), T)
            .unwrap();

        // The reader's cache must observe the new version before any old
        // data: a stale hit here would return the previous value.
        let tree = reader
            .get_data(Datastore::Running, "/m:root/v", GetOpts::default(), T)
            .unwrap();
        assert_eq!(
            tree.eval(&XPath::parse("/m:root/v").unwrap())[0].value.as_deref(),
            Some(value.as_str())
        );
    }
}

#[test]
fn test_readers_run_concurrently_with_each_other() {
    let temp = TempDir::new().unwrap();
    let cfg = test_config(&temp, "cc4");
    let setup = Connection::connect(cfg.clone()).unwrap();
    setup.install_module(leaf_module("m")).unwrap();
    let session = setup.session_start("admin").unwrap();
    session
        .apply_edit(Datastore::Running, Tree::with_root(set_v("m", "base")), T)
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let cfg = cfg.clone();
        handles.push(std::thread::spawn(move || {
            let conn = Connection::connect(cfg).unwrap();
            let session = conn.session_start("reader").unwrap();
            for _ in 0..20 {
                let tree = session
                    .get_data(Datastore::Running, "/m:root/v", GetOpts::default(), T)
                    .unwrap();
                assert_eq!(
                    tree.eval(&XPath::parse("/m:root/v").unwrap())[0].value.as_deref(),
                    Some("base")
                );
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_subscription_churn_under_commits() {
    let temp = TempDir::new().unwrap();
    let cfg = test_config(&temp, "cc5");
    let setup = Connection::connect(cfg.clone()).unwrap();
    setup.install_module(leaf_module("m")).unwrap();

    let writer_cfg = cfg.clone();
    let writer = std::thread::spawn(move || {
        let conn = Connection::connect(writer_cfg).unwrap();
        conn.load_schema(
            ModuleSchema::new("m", None)
                .with_node(NodeSchema::new("/root", SchemaNodeKind::Container))
                .with_node(NodeSchema::new("/root/v", SchemaNodeKind::Leaf)),
        );
        let session = conn.session_start("writer").unwrap();
        for i in 0..10 {
            session
                .apply_edit(
                    Datastore::Running,
                    Tree::with_root(set_v("m", &i.to_string())),
                    T,
                )
                .unwrap();
        }
    });

    // Subscriptions come and go while commits run; the Ext SHM tables must
    // stay consistent throughout (including defragmentation on unlock).
    let churn = std::thread::spawn(move || {
        let conn = Connection::connect(cfg).unwrap();
        let session = conn.session_start("subscriber").unwrap();
        for _ in 0..10 {
            let sub = session
                .subscribe_changes("m", Datastore::Running, Some("/m:root/v"), 0, 0, |_| {})
                .unwrap();
            drop(sub);
        }
    });

    writer.join().unwrap();
    churn.join().unwrap();
    assert_eq!(setup.module_version("m").unwrap(), 10);
}
