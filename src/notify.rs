/// Change-Notification Generator
///
/// After a successful commit to startup or running, builds the standardized
/// config-change notification from the merged diff: who changed what, in
/// which datastore, with one (target, operation) entry per changed node.
/// Internal diff operations map onto the standardized set {create, replace,
/// delete, merge}; moves of user-ordered instances fold to merge. Candidate
/// and operational stores are exempt.
///
/// A replay copy is appended when the notification module was installed
/// with replay support, then the notification is delivered to its active,
/// non-suspended subscribers.
use chrono::Utc;
use std::io::Write;

use tracing::{debug, warn};

use crate::conn::Connection;
use crate::error::{StoreError, StoreResult};
use crate::registry;
use crate::rendezvous::{self, ChangeEvent, Event, NotifEvent};
use crate::shm::MOD_FLAG_REPLAY;
use crate::store::Datastore;
use crate::subscr;
use crate::tree::{DiffOp, Node, Tree};
use crate::NOTIF_MODULE;

/// Flatten a diff into (target path, standardized operation) entries, in
/// depth-first document order.
pub fn diff_to_edits(diff: &Tree) -> Vec<(String, &'static str)> {
    let mut out = Vec::new();
    fn walk(nodes: &[Node], prefix: &str, out: &mut Vec<(String, &'static str)>) {
        for node in nodes {
            let path = format!("{}/{}", prefix, node.path_segment());
            let op = match node.diff_op {
                DiffOp::Create => Some("create"),
                DiffOp::Delete => Some("delete"),
                DiffOp::Replace => Some("replace"),
                DiffOp::Move => Some("merge"),
                DiffOp::None => None,
            };
            if let Some(op) = op {
                out.push((path.clone(), op));
            }
            walk(&node.children, &path, out);
        }
    }
    walk(&diff.roots, "", &mut out);
    out
}

/// Build the notification tree itself.
pub fn build_changes_notif(user: &str, sid: u32, ds: Datastore, diff: &Tree) -> Option<Tree> {
    let edits = diff_to_edits(diff);
    if edits.is_empty() {
        // No effective operation: the notification is suppressed entirely.
        return None;
    }

    let changed_by = Node::container(NOTIF_MODULE, "changed-by")
        .with_child(Node::leaf(NOTIF_MODULE, "username", user))
        .with_child(Node::leaf(NOTIF_MODULE, "session-id", &sid.to_string()));

    let mut notif = Node::container(NOTIF_MODULE, "netconf-config-change")
        .with_child(changed_by)
        .with_child(Node::leaf(NOTIF_MODULE, "datastore", ds.as_str()));

    for (target, operation) in edits {
        notif.children.push(
            Node::container(NOTIF_MODULE, "edit")
                .with_child(Node::leaf(NOTIF_MODULE, "target", &target))
                .with_child(Node::leaf(NOTIF_MODULE, "operation", operation)),
        );
    }
    Some(Tree::with_root(notif))
}

/// Generate and deliver the config-change notification for a commit.
/// Returns `Ok` when there was nothing to do (exempt datastore, empty diff,
/// notification module not installed).
pub fn generate_changes_notif(
    conn: &Connection,
    ds: Datastore,
    diff: &Tree,
    sid: u32,
    user: &str,
) -> StoreResult<()> {
    if !matches!(ds, Datastore::Startup | Datastore::Running) {
        return Ok(());
    }
    let Some(notif) = build_changes_notif(user, sid, ds, diff) else {
        return Ok(());
    };

    let Some((idx, desc)) = registry::find_module(&conn.shm, NOTIF_MODULE)? else {
        debug!(target: "yangstore::notify", "'{}' not installed, skipping notification", NOTIF_MODULE);
        return Ok(());
    };

    let event = NotifEvent {
        module: NOTIF_MODULE.to_string(),
        notif,
        timestamp: Utc::now(),
    };

    if desc.flags & MOD_FLAG_REPLAY != 0 {
        replay_append(conn, NOTIF_MODULE, &event)?;
    }

    deliver_notif(conn, idx, &event)
}

/// Deliver a notification event to every active subscriber of the module.
pub fn deliver_notif(conn: &Connection, mod_idx: u32, event: &NotifEvent) -> StoreResult<()> {
    let subs = {
        let _guard = conn.shm_read(conn.config().lock_timeout())?;
        subscr::notif_subs(&conn.shm, mod_idx)?
    };

    let mut first_err: Option<StoreError> = None;
    for sub in subs.iter().filter(|s| !s.suspended) {
        if let Err(e) = rendezvous::publish_event(
            conn.config(),
            conn.prefix(),
            sub.evpipe,
            &Event::Notif(event.clone()),
        ) {
            warn!(
                target: "yangstore::notify",
                "notification delivery to pipe {} failed: {}", sub.evpipe, e
            );
            first_err = Some(match first_err {
                None => e,
                Some(prev) => prev.merge(e),
            });
        }
    }
    match first_err {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// Deliver per-module change events to change subscribers after a commit.
/// Delivery is best-effort; failures are logged, never surfaced.
pub fn deliver_change_events(
    conn: &Connection,
    ds: Datastore,
    diff: &Tree,
    changed_modules: &[String],
    sid: u32,
    user: &str,
) {
    for module in changed_modules {
        let subs = match (|| -> StoreResult<Vec<subscr::ChangeSub>> {
            let (idx, _) = registry::find_module(&conn.shm, module)?
                .ok_or_else(|| StoreError::new(crate::error::ErrorKind::NotFound, "module gone"))?;
            let _guard = conn.shm_read(conn.config().lock_timeout())?;
            subscr::change_subs(&conn.shm, idx, ds.index())
        })() {
            Ok(subs) => subs,
            Err(e) => {
                warn!(target: "yangstore::notify", "change-event lookup for '{}' failed: {}", module, e);
                continue;
            }
        };

        let module_diff = diff.module_data(module);
        if module_diff.is_empty() {
            continue;
        }
        for sub in subs {
            let event = Event::Change(ChangeEvent {
                module: module.clone(),
                ds,
                diff: module_diff.clone(),
                sid,
                user: user.to_string(),
            });
            if let Err(e) =
                rendezvous::publish_event(conn.config(), conn.prefix(), sub.evpipe, &event)
            {
                debug!(
                    target: "yangstore::notify",
                    "change event to pipe {} not delivered: {}", sub.evpipe, e
                );
            }
        }
    }
}

/// Append a replay copy: length-prefixed bincode records in the module's
/// notification log.
pub fn replay_append(conn: &Connection, module: &str, event: &NotifEvent) -> StoreResult<()> {
    let dir = conn.config().notif_dir();
    std::fs::create_dir_all(&dir)
        .map_err(|e| StoreError::sys(format!("failed to create {:?}", dir), e))?;
    let path = dir.join(format!("{}.notif", module));

    let bytes = bincode::serialize(event).map_err(|e| {
        StoreError::new(
            crate::error::ErrorKind::Internal,
            format!("notification encoding failed: {}", e),
        )
    })?;

    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
        .map_err(|e| StoreError::sys(format!("failed to open {:?}", path), e))?;
    file.write_all(&(bytes.len() as u32).to_le_bytes())
        .and_then(|_| file.write_all(&bytes))
        .map_err(|e| StoreError::sys(format!("failed to append to {:?}", path), e))?;
    Ok(())
}
