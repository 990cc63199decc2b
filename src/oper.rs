/// Operational Composer
///
/// Assembles the operational view of a module: duplicate the subtrees of
/// running data that change subscriptions enable, apply the stored
/// operational overlay with origin-aware merging, generate the internal
/// modules' state, pull live data from providers through the rendezvous
/// (shallowest subscription first, statically pruning subscriptions that
/// cannot intersect the request), and finally trim config/state per the
/// caller's options.
use tracing::debug;

use crate::conn::Connection;
use crate::error::StoreResult;
use crate::modinfo::{DepKind, ModInfo};
use crate::registry;
use crate::rendezvous::{self, Event, OperRequest};
use crate::store::{self, Datastore, GetOpts, OperParams};
use crate::subscr;
use crate::tree::{Node, Origin, OriginAware, Tree};
use crate::xpath::{paths_overlap, XPath};
use crate::{MONITORING_MODULE, YANG_LIBRARY_MODULE};

/// Base assembly for one requested module: enabled-subtree duplication from
/// running data, stored-overlay application, internal-module state.
pub fn compose_module_base(
    conn: &Connection,
    mod_idx: u32,
    module: &str,
    running: Tree,
    opts: &GetOpts,
) -> StoreResult<Tree> {
    let mut base = dup_enabled_subtrees(conn, mod_idx, module, running)?;

    // Recreate state non-presence containers so provider output has a
    // skeleton to land on.
    {
        let schemas = conn.schemas.read();
        if let Some(schema) = schemas.get(module) {
            crate::schema::add_np_containers(schema, &mut base, true);
        }
    }

    if opts.with_origin {
        base.stamp_origin();
    }

    if !opts.no_stored {
        let overlay = store::load_module_file(
            conn.config(),
            conn.prefix(),
            module,
            Datastore::Operational,
        )?;
        if !overlay.is_empty() {
            base.apply_diff(&overlay);
        }
    }

    if module == YANG_LIBRARY_MODULE {
        base.merge(yang_library_tree(conn)?, &OriginAware);
    } else if module == MONITORING_MODULE {
        base.merge(monitoring_tree(conn)?, &OriginAware);
    }

    Ok(base)
}

/// Decides which parts of running data are visible operationally. A
/// non-passive whole-module change subscription enables everything;
/// otherwise each non-passive subscription's subtree is duplicated together
/// with its parent chain.
fn dup_enabled_subtrees(
    conn: &Connection,
    mod_idx: u32,
    module: &str,
    running: Tree,
) -> StoreResult<Tree> {
    let subs = {
        let _guard = conn.shm_read(conn.config().lock_timeout())?;
        subscr::change_subs(&conn.shm, mod_idx, Datastore::Running.index())?
    };

    if subs.iter().any(|s| s.xpath.is_none() && !s.is_passive()) {
        return Ok(running);
    }

    let mut enabled = Tree::new();
    for sub in subs.iter().filter(|s| !s.is_passive()) {
        if let Some(xpath) = &sub.xpath {
            let path = XPath::parse(xpath)?;
            enabled.merge(running.select_with_parents(&path), &crate::tree::LastWins);
        }
    }
    if !subs.iter().any(|s| !s.is_passive()) {
        debug!(
            target: "yangstore::oper",
            "no enabled subtrees for '{}': no active change subscriptions", module
        );
    }
    Ok(enabled)
}

/// Provider callouts for every requested module, ordered shallowest
/// subscription first. A provider error or timeout halts composition.
pub fn provider_callouts(minfo: &mut ModInfo<'_>, params: &OperParams<'_>) -> StoreResult<()> {
    let conn = minfo.conn;
    let cfg = conn.config();
    let prefix = conn.prefix();

    let req_entries: Vec<(u32, String)> = minfo
        .entries
        .iter()
        .filter(|e| e.kind == DepKind::Req)
        .map(|e| (e.idx, e.name.clone()))
        .collect();

    for (idx, module) in req_entries {
        let subs = {
            let _guard = conn.shm_read(cfg.lock_timeout())?;
            subscr::oper_subs(&conn.shm, idx)?
        };

        for sub in subs {
            let sub_path = XPath::parse(&sub.xpath)?;

            // Static prune: a subscription provably disjoint from the
            // request never reaches its provider.
            if let Some(request) = params.request_xpath {
                if !paths_overlap(request, &sub_path) {
                    debug!(
                        target: "yangstore::oper",
                        "pruned subscription '{}' for request '{}'", sub.xpath, request
                    );
                    continue;
                }
            }

            if !sub.is_merge() {
                // The provider replaces whatever is currently there.
                minfo.data.remove(&sub_path);
            }

            let parents: Vec<Option<Node>> = match sub_path.parent() {
                None => vec![None],
                Some(parent_path) => {
                    let hits = minfo.data.eval(&parent_path);
                    if hits.is_empty() {
                        // No anchor instance: nothing for the provider to
                        // attach under.
                        continue;
                    }
                    hits.into_iter().map(|n| Some(n.clone_shallow())).collect()
                }
            };

            for parent in parents {
                let event = Event::Oper(OperRequest {
                    module: module.clone(),
                    sub_xpath: sub.xpath.clone(),
                    request_xpath: params.request_xpath.map(|p| p.to_string()),
                    parent,
                    sid: params.sid,
                });
                let reply =
                    rendezvous::request_reply(cfg, prefix, sub.evpipe, &event, params.timeout)?;
                if let Some(fragment) = reply {
                    minfo.data.merge(fragment, &OriginAware);
                }
            }
        }
    }
    Ok(())
}

/// Final trim per caller options; origin metadata is stripped unless asked
/// to keep it.
pub fn finish_composition(minfo: &mut ModInfo<'_>, opts: &GetOpts) {
    if opts.no_state {
        minfo.data.trim_state();
    }
    if opts.no_config {
        minfo.data.trim_config();
    }
    if !opts.with_origin {
        minfo.data.strip_origin();
    }
}

/// Generated state of the yang-library module: the installed module list
/// with revisions and features, plus the four standard datastores.
pub fn yang_library_tree(conn: &Connection) -> StoreResult<Tree> {
    let _guard = conn.shm_read(conn.config().lock_timeout())?;

    let mut modules_state = Node::container(YANG_LIBRARY_MODULE, "modules-state").with_config(false);
    let count = conn.shm.main.mod_count()?;
    for idx in 0..count {
        let desc = conn.shm.main.read_descriptor(idx)?;
        let name = registry::module_name(&conn.shm, &desc)?;
        let mut entry = Node::list(YANG_LIBRARY_MODULE, "module", &[("name", &name)]).with_config(false);
        entry
            .children
            .push(Node::leaf(YANG_LIBRARY_MODULE, "name", &name).with_config(false));
        if let Some(rev) = conn.shm.ext.read_opt_str(desc.rev_off)? {
            entry
                .children
                .push(Node::leaf(YANG_LIBRARY_MODULE, "revision", &rev).with_config(false));
        }
        for feature in registry::features(&conn.shm, &desc)? {
            entry
                .children
                .push(Node::leaf_list(YANG_LIBRARY_MODULE, "feature", &feature).with_config(false));
        }
        entry
            .children
            .push(Node::leaf(YANG_LIBRARY_MODULE, "conformance-type", "implement").with_config(false));
        modules_state.children.push(entry);
    }

    let mut datastores = Node::container(YANG_LIBRARY_MODULE, "datastores").with_config(false);
    for ds in ["startup", "running", "candidate", "operational"] {
        let mut entry = Node::list(YANG_LIBRARY_MODULE, "datastore", &[("name", ds)]).with_config(false);
        entry
            .children
            .push(Node::leaf(YANG_LIBRARY_MODULE, "name", ds).with_config(false));
        datastores.children.push(entry);
    }

    let mut tree = Tree {
        roots: vec![modules_state, datastores],
    };
    stamp_system_origin(&mut tree);
    Ok(tree)
}

/// Generated state of the monitoring module: per-module subscriptions, RPC
/// subscriptions, and per-connection lock holdings, each carrying the
/// owning connection id.
pub fn monitoring_tree(conn: &Connection) -> StoreResult<Tree> {
    let _guard = conn.shm_read(conn.config().lock_timeout())?;

    let mut modules = Node::container(MONITORING_MODULE, "modules").with_config(false);
    let count = conn.shm.main.mod_count()?;
    for idx in 0..count {
        let desc = conn.shm.main.read_descriptor(idx)?;
        let name = registry::module_name(&conn.shm, &desc)?;
        let mut entry = Node::list(MONITORING_MODULE, "module", &[("name", &name)]).with_config(false);
        entry
            .children
            .push(Node::leaf(MONITORING_MODULE, "name", &name).with_config(false));

        for ds in [
            Datastore::Startup,
            Datastore::Running,
            Datastore::Candidate,
            Datastore::Operational,
        ] {
            for sub in subscr::change_subs(&conn.shm, idx, ds.index())? {
                let mut rec = Node::container(MONITORING_MODULE, "change-sub").with_config(false);
                rec.children
                    .push(Node::leaf(MONITORING_MODULE, "datastore", ds.as_str()).with_config(false));
                if let Some(xp) = &sub.xpath {
                    rec.children
                        .push(Node::leaf(MONITORING_MODULE, "xpath", xp).with_config(false));
                }
                rec.children.push(
                    Node::leaf(MONITORING_MODULE, "priority", &sub.priority.to_string())
                        .with_config(false),
                );
                rec.children.push(
                    Node::leaf(MONITORING_MODULE, "cid", &sub.cid.to_string()).with_config(false),
                );
                entry.children.push(rec);
            }
        }

        for sub in subscr::oper_subs(&conn.shm, idx)? {
            let mut rec = Node::container(MONITORING_MODULE, "oper-sub").with_config(false);
            rec.children
                .push(Node::leaf(MONITORING_MODULE, "xpath", &sub.xpath).with_config(false));
            rec.children
                .push(Node::leaf(MONITORING_MODULE, "cid", &sub.cid.to_string()).with_config(false));
            entry.children.push(rec);
        }

        for sub in subscr::notif_subs(&conn.shm, idx)? {
            let mut rec = Node::container(MONITORING_MODULE, "notif-sub").with_config(false);
            rec.children.push(
                Node::leaf(MONITORING_MODULE, "sub-id", &sub.sub_id.to_string()).with_config(false),
            );
            rec.children.push(
                Node::leaf(MONITORING_MODULE, "suspended", if sub.suspended { "true" } else { "false" })
                    .with_config(false),
            );
            rec.children
                .push(Node::leaf(MONITORING_MODULE, "cid", &sub.cid.to_string()).with_config(false));
            entry.children.push(rec);
        }

        modules.children.push(entry);
    }

    let mut rpcs = Node::container(MONITORING_MODULE, "rpcs").with_config(false);
    for sub in subscr::rpc_subs(&conn.shm)? {
        let mut rec = Node::container(MONITORING_MODULE, "rpc-sub").with_config(false);
        rec.children
            .push(Node::leaf(MONITORING_MODULE, "path", &sub.path).with_config(false));
        rec.children.push(
            Node::leaf(MONITORING_MODULE, "priority", &sub.priority.to_string()).with_config(false),
        );
        rec.children
            .push(Node::leaf(MONITORING_MODULE, "cid", &sub.cid.to_string()).with_config(false));
        rpcs.children.push(rec);
    }

    let mut connections = Node::container(MONITORING_MODULE, "connections").with_config(false);
    let header = conn.shm.main.read_header()?;
    let conn_entries: Vec<crate::shm::ConnEntryShm> = conn
        .shm
        .ext
        .array_get(header.conn_list_off, header.conn_count)?;
    for entry in conn_entries {
        let mut rec =
            Node::list(MONITORING_MODULE, "connection", &[("cid", &entry.cid.to_string())])
                .with_config(false);
        rec.children.push(
            Node::leaf(MONITORING_MODULE, "cid", &entry.cid.to_string()).with_config(false),
        );
        rec.children.push(
            Node::leaf(MONITORING_MODULE, "pid", &entry.pid.to_string()).with_config(false),
        );

        // Per-module, per-datastore locks this connection holds.
        for idx in 0..count {
            let desc = conn.shm.main.read_descriptor(idx)?;
            let name = registry::module_name(&conn.shm, &desc)?;
            for ds in [
                Datastore::Startup,
                Datastore::Running,
                Datastore::Candidate,
                Datastore::Operational,
            ] {
                let state = conn
                    .shm
                    .main
                    .read_lock_state(registry::data_lock_off(idx, ds.index()))?;
                let mode = if state.writer_cid == entry.cid {
                    Some("write")
                } else if state.rcids.contains(&entry.cid) {
                    if state.upgr_cid == entry.cid {
                        Some("read-upgr")
                    } else {
                        Some("read")
                    }
                } else {
                    None
                };
                if let Some(mode) = mode {
                    let mut lock = Node::container(MONITORING_MODULE, "held-lock").with_config(false);
                    lock.children
                        .push(Node::leaf(MONITORING_MODULE, "module", &name).with_config(false));
                    lock.children.push(
                        Node::leaf(MONITORING_MODULE, "datastore", ds.as_str()).with_config(false),
                    );
                    lock.children
                        .push(Node::leaf(MONITORING_MODULE, "mode", mode).with_config(false));
                    rec.children.push(lock);
                }
            }
        }
        connections.children.push(rec);
    }

    let mut tree = Tree {
        roots: vec![modules, rpcs, connections],
    };
    stamp_system_origin(&mut tree);
    Ok(tree)
}

fn stamp_system_origin(tree: &mut Tree) {
    fn rec(node: &mut Node) {
        if node.origin.is_none() {
            node.origin = Some(Origin::System);
        }
        for child in &mut node.children {
            rec(child);
        }
    }
    for root in &mut tree.roots {
        rec(root);
    }
}
