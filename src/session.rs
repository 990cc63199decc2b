/// Session API
///
/// Sessions drive the engine: data retrieval, edits and commits, wholesale
/// config replacement, datastore copies, subscriptions, RPC routing, and
/// notification sending. Each operation assembles a module-info set, walks
/// the canonical pipeline (closure, permission gate, locking, load, apply,
/// validate, write, notify), and releases its locks before returning.
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::conn::Connection;
use crate::edit;
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::modinfo::{DepKind, EditModIter, ModInfo, WITH_DEPS, WITH_INV_DEPS};
use crate::notify;
use crate::registry;
use crate::rendezvous::{
    self, ChangeEvent, Event, NotifEvent, OperProvider, RpcHandler, RpcRequest, Subscriber,
};
use crate::shm::{MOD_FLAG_REPLAY, OFF_NEXT_EVPIPE, OFF_NEXT_SUB_ID};
use crate::store::{self, Datastore, GetOpts, OperParams};
use crate::subscr::{self, OperSubKind};
use crate::tree::Tree;
use crate::xpath::XPath;
use crate::MONITORING_MODULE;

pub struct Session {
    conn: Arc<Connection>,
    sid: u32,
    user: String,
}

impl Session {
    pub(crate) fn new(conn: Arc<Connection>, sid: u32, user: &str) -> Session {
        Session {
            conn,
            sid,
            user: user.to_string(),
        }
    }

    pub fn sid(&self) -> u32 {
        self.sid
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Retrieve data selected by `xpath` from a datastore. Modules the user
    /// cannot read are silently dropped from the result.
    pub fn get_data(
        &self,
        ds: Datastore,
        xpath: &str,
        opts: GetOpts,
        timeout: Duration,
    ) -> StoreResult<Tree> {
        let path = XPath::parse(xpath)?;
        let mut minfo = ModInfo::new(&self.conn, ds);

        match path.first_module() {
            Some(module) if module != "*" => {
                let want = if ds == Datastore::Operational { WITH_DEPS } else { 0 };
                minfo.add_mod(module, DepKind::Req, want)?;
            }
            _ => {
                for name in self.conn.installed_modules()? {
                    minfo.add_mod(&name, DepKind::Req, 0)?;
                }
            }
        }
        minfo.finalize();
        minfo.perm_check(false, false)?;
        minfo.rdlock(false, timeout)?;

        let params = OperParams {
            request_xpath: Some(&path),
            sid: self.sid,
            timeout,
        };
        let result = store::load_modinfo(&mut minfo, &opts, true, Some(&params));
        let out = match result {
            Ok(()) => Ok(minfo.eval_data(&path)),
            Err(e) => Err(e),
        };
        minfo.unlock();
        out
    }

    /// Apply an edit to a datastore. Conventional datastores run the full
    /// commit pipeline; the operational datastore folds the induced diff
    /// into its stored overlay, owned by this connection.
    ///
    /// When the commit itself persists but the change notification cannot
    /// be delivered, the returned error chains the notification failure and
    /// states that the data was applied.
    pub fn apply_edit(&self, ds: Datastore, edit: Tree, timeout: Duration) -> StoreResult<()> {
        if edit.is_empty() {
            return Ok(());
        }
        for root in &edit.roots {
            if root.module == MONITORING_MODULE {
                return Err(StoreError::new(
                    ErrorKind::Unsupported,
                    format!("the internal module '{}' cannot be edited", MONITORING_MODULE),
                ));
            }
        }
        if ds == Datastore::Operational {
            return self.apply_oper_edit(edit, timeout);
        }

        let mut minfo = ModInfo::new(&self.conn, ds);
        for (module, _) in EditModIter::new(&edit) {
            minfo.add_mod(&module, DepKind::Req, WITH_DEPS | WITH_INV_DEPS)?;
        }
        minfo.finalize();
        minfo.perm_check(true, true)?;
        minfo.wrlock(timeout)?;

        let result = (|| -> StoreResult<()> {
            store::load_modinfo(&mut minfo, &GetOpts::default(), false, None)?;
            edit::edit_apply(&mut minfo, &edit, true)?;
            if !minfo.has_changes() {
                debug!(target: "yangstore::session", "edit produced no changes");
                return Ok(());
            }
            self.finish_commit(&mut minfo)
        })();
        minfo.unlock();
        result
    }

    /// Tail of every successful write pipeline: defaults, validation of the
    /// requested and revalidation modules, persistence, event delivery.
    fn finish_commit(&self, minfo: &mut ModInfo<'_>) -> StoreResult<()> {
        edit::add_defaults(minfo, true)?;
        edit::validate(minfo, &[DepKind::Req, DepKind::InvDep])?;
        store::store_modinfo(minfo, None)?;

        let changed: Vec<String> = minfo
            .entries
            .iter()
            .filter(|e| e.changed)
            .map(|e| e.name.clone())
            .collect();
        notify::deliver_change_events(&self.conn, minfo.ds, &minfo.diff, &changed, self.sid, &self.user);

        if let Err(e) =
            notify::generate_changes_notif(&self.conn, minfo.ds, &minfo.diff, self.sid, &self.user)
        {
            return Err(StoreError::new(
                e.kind(),
                "changes were applied but the change notification failed",
            )
            .caused_by(e));
        }
        info!(
            target: "yangstore::session",
            "session {} committed {} module(s) to {}",
            self.sid,
            changed.len(),
            minfo.ds.as_str()
        );
        Ok(())
    }

    /// Operational edit: applied against running + stored overlay, with the
    /// resulting diff merged into the overlay under this connection's
    /// ownership.
    fn apply_oper_edit(&self, edit: Tree, timeout: Duration) -> StoreResult<()> {
        let mut minfo = ModInfo::new(&self.conn, Datastore::Operational);
        for (module, _) in EditModIter::new(&edit) {
            minfo.add_mod(&module, DepKind::Req, 0)?;
        }
        minfo.finalize();
        minfo.perm_check(true, true)?;
        minfo.wrlock(timeout)?;

        let result = (|| -> StoreResult<()> {
            let opts = GetOpts {
                no_subs: true,
                with_origin: true,
                ..GetOpts::default()
            };
            store::load_modinfo(&mut minfo, &opts, false, None)?;
            edit::edit_apply(&mut minfo, &edit, true)?;
            if !minfo.has_changes() {
                return Ok(());
            }
            store::store_modinfo(&mut minfo, Some(self.conn.cid()))
        })();
        minfo.unlock();
        result
    }

    /// Replace the configuration of every module present in `src`.
    pub fn replace_config(&self, ds: Datastore, src: Tree, timeout: Duration) -> StoreResult<()> {
        if !ds.is_conventional() {
            return Err(StoreError::new(
                ErrorKind::Unsupported,
                "replace-config targets conventional datastores only",
            ));
        }
        let mut minfo = ModInfo::new(&self.conn, ds);
        for module in src.modules() {
            minfo.add_mod(&module, DepKind::Req, WITH_DEPS | WITH_INV_DEPS)?;
        }
        minfo.finalize();
        minfo.perm_check(true, true)?;
        minfo.wrlock(timeout)?;

        let result = (|| -> StoreResult<()> {
            store::load_modinfo(&mut minfo, &GetOpts::default(), false, None)?;
            edit::replace(&mut minfo, src)?;
            if !minfo.has_changes() {
                return Ok(());
            }
            self.finish_commit(&mut minfo)
        })();
        minfo.unlock();
        result
    }

    /// Copy one conventional datastore onto another, diff-driven: modules
    /// whose content is identical are untouched.
    pub fn copy_config(&self, from: Datastore, to: Datastore, timeout: Duration) -> StoreResult<()> {
        if !from.is_conventional() || !to.is_conventional() {
            return Err(StoreError::new(
                ErrorKind::Unsupported,
                "copy-config operates on conventional datastores only",
            ));
        }
        if from == to {
            return Err(StoreError::new(ErrorKind::InvalArg, "source and target are the same"));
        }

        let src = {
            let mut src_minfo = ModInfo::new(&self.conn, from);
            for name in self.conn.installed_modules()? {
                src_minfo.add_mod(&name, DepKind::Req, 0)?;
            }
            src_minfo.finalize();
            src_minfo.perm_check(false, false)?;
            src_minfo.rdlock(false, timeout)?;
            let result = store::load_modinfo(&mut src_minfo, &GetOpts::default(), false, None);
            let src = std::mem::take(&mut src_minfo.data);
            src_minfo.unlock();
            result?;
            src
        };

        self.replace_config(to, src, timeout)
    }

    /// Discard a module's candidate overlay.
    pub fn reset_candidate(&self, module: &str) -> StoreResult<()> {
        store::candidate_reset(self.conn.config(), self.conn.prefix(), module)
    }

    // ----- subscriptions -----

    fn new_sub_ids(&self) -> StoreResult<(u32, u32)> {
        let evpipe = self.conn.shm.main.next_id(OFF_NEXT_EVPIPE)?;
        let sub_id = self.conn.shm.main.next_id(OFF_NEXT_SUB_ID)?;
        Ok((evpipe, sub_id))
    }

    fn module_idx(&self, module: &str) -> StoreResult<u32> {
        registry::find_module(&self.conn.shm, module)?
            .map(|(idx, _)| idx)
            .ok_or_else(|| {
                StoreError::new(ErrorKind::NotFound, format!("module '{}' is not installed", module))
            })
    }

    /// Subscribe to configuration changes of a module in one datastore.
    pub fn subscribe_changes(
        &self,
        module: &str,
        ds: Datastore,
        xpath: Option<&str>,
        priority: u32,
        opts: u32,
        on_change: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) -> StoreResult<Subscription> {
        let idx = self.module_idx(module)?;
        let (evpipe, sub_id) = self.new_sub_ids()?;
        let mut subscriber = Subscriber::open(self.conn.config(), self.conn.prefix(), evpipe)?;
        subscriber.on_change = Some(Box::new(on_change));

        {
            let _guard = self.conn.shm_write(self.conn.config().lock_timeout())?;
            subscr::change_sub_add(
                &self.conn.shm,
                idx,
                ds.index(),
                xpath,
                priority,
                opts,
                evpipe,
                self.conn.cid(),
            )?;
        }
        Ok(Subscription {
            conn: Arc::clone(&self.conn),
            target: SubTarget::Change {
                module: module.to_string(),
                ds,
            },
            evpipe,
            sub_id,
            subscriber,
        })
    }

    /// Subscribe as an operational-data provider for an xpath of a module.
    pub fn subscribe_oper(
        &self,
        module: &str,
        xpath: &str,
        kind: OperSubKind,
        opts: u32,
        provider: impl OperProvider + 'static,
    ) -> StoreResult<Subscription> {
        let idx = self.module_idx(module)?;
        let (evpipe, sub_id) = self.new_sub_ids()?;
        let mut subscriber = Subscriber::open(self.conn.config(), self.conn.prefix(), evpipe)?;
        subscriber.oper = Some(Box::new(provider));

        {
            let _guard = self.conn.shm_write(self.conn.config().lock_timeout())?;
            subscr::oper_sub_add(&self.conn.shm, idx, xpath, kind, opts, evpipe, self.conn.cid())?;
        }
        Ok(Subscription {
            conn: Arc::clone(&self.conn),
            target: SubTarget::Oper {
                module: module.to_string(),
            },
            evpipe,
            sub_id,
            subscriber,
        })
    }

    /// Subscribe to notifications of a module.
    pub fn subscribe_notif(
        &self,
        module: &str,
        xpath: Option<&str>,
        on_notif: impl Fn(&NotifEvent) + Send + Sync + 'static,
    ) -> StoreResult<Subscription> {
        let idx = self.module_idx(module)?;
        let (evpipe, sub_id) = self.new_sub_ids()?;
        let mut subscriber = Subscriber::open(self.conn.config(), self.conn.prefix(), evpipe)?;
        subscriber.on_notif = Some(Box::new(on_notif));

        {
            let _guard = self.conn.shm_write(self.conn.config().lock_timeout())?;
            subscr::notif_sub_add(&self.conn.shm, idx, xpath, sub_id, evpipe, self.conn.cid())?;
        }
        Ok(Subscription {
            conn: Arc::clone(&self.conn),
            target: SubTarget::Notif {
                module: module.to_string(),
                sub_id,
            },
            evpipe,
            sub_id,
            subscriber,
        })
    }

    /// Suspend or resume one of this connection's notification
    /// subscriptions.
    pub fn notif_suspend(&self, module: &str, sub_id: u32, suspended: bool) -> StoreResult<()> {
        let idx = self.module_idx(module)?;
        let _guard = self.conn.shm_write(self.conn.config().lock_timeout())?;
        subscr::notif_sub_suspend(&self.conn.shm, idx, sub_id, suspended)
    }

    /// Subscribe as the handler of an RPC/action path.
    pub fn subscribe_rpc(
        &self,
        path: &str,
        priority: u32,
        handler: impl RpcHandler + 'static,
    ) -> StoreResult<Subscription> {
        let (evpipe, sub_id) = self.new_sub_ids()?;
        let mut subscriber = Subscriber::open(self.conn.config(), self.conn.prefix(), evpipe)?;
        subscriber.rpc = Some(Box::new(handler));

        {
            let _guard = self.conn.shm_write(self.conn.config().lock_timeout())?;
            subscr::rpc_sub_add(&self.conn.shm, path, priority, sub_id, evpipe, self.conn.cid())?;
        }
        Ok(Subscription {
            conn: Arc::clone(&self.conn),
            target: SubTarget::Rpc { sub_id },
            evpipe,
            sub_id,
            subscriber,
        })
    }

    /// Invoke an RPC/action. Routing picks the matching subscriber with the
    /// highest priority; equal priorities route to the earliest-registered
    /// subscription (lowest subscription id).
    pub fn rpc_send(&self, path: &str, input: Tree, timeout: Duration) -> StoreResult<Tree> {
        let mut matching: Vec<subscr::RpcSub> = {
            let _guard = self.conn.shm_read(self.conn.config().lock_timeout())?;
            subscr::rpc_subs(&self.conn.shm)?
                .into_iter()
                .filter(|s| s.path == path)
                .collect()
        };
        if matching.is_empty() {
            return Err(StoreError::new(
                ErrorKind::NotFound,
                format!("no subscriber for RPC '{}'", path),
            ));
        }
        matching.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.sub_id.cmp(&b.sub_id)));
        let target = &matching[0];

        let event = Event::Rpc(RpcRequest {
            path: path.to_string(),
            input,
            sid: self.sid,
        });
        let reply =
            rendezvous::request_reply(self.conn.config(), self.conn.prefix(), target.evpipe, &event, timeout)?;
        Ok(reply.unwrap_or_default())
    }

    /// Send a notification to a module's subscribers. The data parent of a
    /// nested notification must exist in the operational datastore (checked
    /// against stored data; providers are not consulted to avoid
    /// re-entry).
    pub fn send_notif(&self, module: &str, notif: Tree, timeout: Duration) -> StoreResult<()> {
        let root_module = notif
            .roots
            .first()
            .map(|n| n.module.clone())
            .ok_or_else(|| StoreError::new(ErrorKind::InvalArg, "notification tree is empty"))?;

        let oper = self.get_data(
            Datastore::Operational,
            &format!("/{}:*", root_module),
            GetOpts {
                no_subs: true,
                ..GetOpts::default()
            },
            timeout,
        )?;
        edit::op_validate(&oper, &notif)?;

        let idx = self.module_idx(module)?;
        let desc = self.conn.shm.main.read_descriptor(idx)?;
        let event = NotifEvent {
            module: module.to_string(),
            notif,
            timestamp: Utc::now(),
        };
        if desc.flags & MOD_FLAG_REPLAY != 0 {
            notify::replay_append(&self.conn, module, &event)?;
        }
        notify::deliver_notif(&self.conn, idx, &event)
    }
}

enum SubTarget {
    Change { module: String, ds: Datastore },
    Oper { module: String },
    Notif { module: String, sub_id: u32 },
    Rpc { sub_id: u32 },
}

/// A live subscription: owns the provider-side rendezvous end and the SHM
/// registration, both torn down on drop.
pub struct Subscription {
    conn: Arc<Connection>,
    target: SubTarget,
    evpipe: u32,
    sub_id: u32,
    subscriber: Subscriber,
}

impl Subscription {
    pub fn evpipe(&self) -> u32 {
        self.evpipe
    }

    pub fn sub_id(&self) -> u32 {
        self.sub_id
    }

    /// Wait up to `wait` for events and dispatch them to the registered
    /// handlers. Returns the number of events handled.
    pub fn process_events(&self, wait: Duration) -> StoreResult<u32> {
        self.subscriber.process_events(wait)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let result = (|| -> StoreResult<()> {
            let _guard = self.conn.shm_write(Duration::from_secs(2))?;
            match &self.target {
                SubTarget::Change { module, ds } => {
                    if let Some((idx, _)) = registry::find_module(&self.conn.shm, module)? {
                        subscr::change_sub_del(&self.conn.shm, idx, ds.index(), self.evpipe)?;
                    }
                }
                SubTarget::Oper { module } => {
                    if let Some((idx, _)) = registry::find_module(&self.conn.shm, module)? {
                        subscr::oper_sub_del(&self.conn.shm, idx, self.evpipe)?;
                    }
                }
                SubTarget::Notif { module, sub_id } => {
                    if let Some((idx, _)) = registry::find_module(&self.conn.shm, module)? {
                        subscr::notif_sub_del(&self.conn.shm, idx, *sub_id)?;
                    }
                }
                SubTarget::Rpc { sub_id } => {
                    subscr::rpc_sub_del(&self.conn.shm, *sub_id)?;
                }
            }
            Ok(())
        })();
        if let Err(e) = result {
            warn!(target: "yangstore::session", "subscription teardown incomplete: {}", e);
        }
        subscr::evpipe_remove(self.conn.config(), self.evpipe);
        let _ = std::fs::remove_file(
            self.conn
                .config()
                .sub_shm_path(self.conn.prefix(), self.evpipe),
        );
    }
}
