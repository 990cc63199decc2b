/// Provider Rendezvous
///
/// The shared-memory request/reply mechanism between the engine and external
/// providers. Each event pipe owns one slot file: a small state machine
/// (idle, claimed, request, reply, error) followed by a bincode payload.
/// The engine publishes a request into the slot, rings the subscriber's
/// FIFO with a single byte, and polls for the reply under the caller's
/// absolute deadline. Providers run a `Subscriber` that drains the FIFO,
/// dispatches the event to the registered handler, and publishes the reply.
///
/// Change and notification events reuse the slot one-way: the subscriber
/// consumes them and returns the slot to idle without a reply.
use chrono::{DateTime, Utc};
use memmap2::MmapMut;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::store::Datastore;
use crate::subscr;
use crate::tree::{Node, Tree};

const STATE_IDLE: u32 = 0;
const STATE_CLAIMED: u32 = 1;
const STATE_REQUEST: u32 = 2;
const STATE_REPLY: u32 = 3;
const STATE_ERROR: u32 = 4;

const OFF_STATE: usize = 0;
const OFF_SEQ: usize = 4;
const OFF_LEN: usize = 8;
const SLOT_HEADER: usize = 16;
const SLOT_INITIAL_SIZE: usize = 64 * 1024;

const POLL_SLEEP: Duration = Duration::from_micros(500);

/// Structured error a provider hands back through the rendezvous.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct CallbackError {
    pub message: String,
    pub path: Option<String>,
    pub tag: Option<String>,
}

impl CallbackError {
    pub fn new(message: impl Into<String>) -> CallbackError {
        CallbackError {
            message: message.into(),
            path: None,
            tag: None,
        }
    }
}

/// Operational-data pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperRequest {
    pub module: String,
    pub sub_xpath: String,
    pub request_xpath: Option<String>,
    /// Snapshot of the data parent the provider anchors under.
    pub parent: Option<Node>,
    pub sid: u32,
}

/// One-way change event delivered after a commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub module: String,
    pub ds: Datastore,
    pub diff: Tree,
    pub sid: u32,
    pub user: String,
}

/// One-way notification delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifEvent {
    pub module: String,
    pub notif: Tree,
    pub timestamp: DateTime<Utc>,
}

/// RPC/action invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub path: String,
    pub input: Tree,
    pub sid: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Event {
    Oper(OperRequest),
    Change(ChangeEvent),
    Notif(NotifEvent),
    Rpc(RpcRequest),
}

#[derive(Serialize, Deserialize)]
struct ReplyBody {
    tree: Option<Tree>,
}

/// The slot file backing one event pipe.
struct Slot {
    file: File,
    map: RwLock<MmapMut>,
}

impl Slot {
    fn open(path: &Path) -> StoreResult<Slot> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::sys(format!("failed to create {:?}", parent), e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| StoreError::sys(format!("failed to open slot {:?}", path), e))?;
        let len = file
            .metadata()
            .map_err(|e| StoreError::sys(format!("failed to stat slot {:?}", path), e))?
            .len() as usize;
        if len < SLOT_INITIAL_SIZE {
            file.set_len(SLOT_INITIAL_SIZE as u64)
                .map_err(|e| StoreError::sys(format!("failed to size slot {:?}", path), e))?;
        }
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| StoreError::sys(format!("failed to map slot {:?}", path), e))?;
        Ok(Slot {
            file,
            map: RwLock::new(map),
        })
    }

    fn atomic<R>(&self, off: usize, f: impl FnOnce(&AtomicU32) -> R) -> R {
        let guard = self.map.read();
        let atomic = unsafe { &*(guard.as_ptr().add(off) as *const AtomicU32) };
        f(atomic)
    }

    fn state(&self) -> u32 {
        self.atomic(OFF_STATE, |a| a.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: u32) {
        self.atomic(OFF_STATE, |a| a.store(state, Ordering::SeqCst));
    }

    fn cas_state(&self, current: u32, new: u32) -> bool {
        self.atomic(OFF_STATE, |a| {
            a.compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        })
    }

    fn bump_seq(&self) {
        self.atomic(OFF_SEQ, |a| a.fetch_add(1, Ordering::SeqCst));
    }

    fn write_payload(&self, bytes: &[u8]) -> StoreResult<()> {
        let needed = SLOT_HEADER + bytes.len();
        {
            let guard = self.map.read();
            if guard.len() < needed {
                drop(guard);
                let mut wguard = self.map.write();
                if wguard.len() < needed {
                    self.file
                        .set_len(needed as u64)
                        .map_err(|e| StoreError::sys("failed to grow slot", e))?;
                    *wguard = unsafe { MmapMut::map_mut(&self.file) }
                        .map_err(|e| StoreError::sys("failed to remap slot", e))?;
                }
            }
        }
        let mut guard = self.map.write();
        guard[SLOT_HEADER..needed].copy_from_slice(bytes);
        drop(guard);
        self.atomic(OFF_LEN, |a| a.store(bytes.len() as u32, Ordering::SeqCst));
        Ok(())
    }

    fn read_payload(&self) -> StoreResult<Vec<u8>> {
        let len = self.atomic(OFF_LEN, |a| a.load(Ordering::SeqCst)) as usize;
        let needed = SLOT_HEADER + len;
        {
            let guard = self.map.read();
            if guard.len() < needed {
                drop(guard);
                let mut wguard = self.map.write();
                if wguard.len() < needed {
                    *wguard = unsafe { MmapMut::map_mut(&self.file) }
                        .map_err(|e| StoreError::sys("failed to remap slot", e))?;
                }
            }
        }
        let guard = self.map.read();
        if guard.len() < needed {
            return Err(StoreError::new(ErrorKind::Internal, "slot payload beyond mapping"));
        }
        Ok(guard[SLOT_HEADER..needed].to_vec())
    }
}

fn encode_event(event: &Event) -> StoreResult<Vec<u8>> {
    bincode::serialize(event)
        .map_err(|e| StoreError::new(ErrorKind::Internal, format!("event encoding failed: {}", e)))
}

/// Engine side: publish `event` to the subscriber behind `evpipe` and wait
/// for its reply. A missing listener or an expired deadline surfaces as
/// `CallbackFailed`.
pub fn request_reply(
    cfg: &Config,
    prefix: &str,
    evpipe: u32,
    event: &Event,
    timeout: Duration,
) -> StoreResult<Option<Tree>> {
    let payload = encode_event(event)?;
    let slot = Slot::open(&cfg.sub_shm_path(prefix, evpipe))?;
    let deadline = Instant::now() + timeout;

    claim_slot(&slot, deadline)?;
    if let Err(e) = slot.write_payload(&payload) {
        slot.set_state(STATE_IDLE);
        return Err(e);
    }
    slot.bump_seq();
    slot.set_state(STATE_REQUEST);

    if let Err(e) = subscr::evpipe_notify(&cfg.evpipe_path(evpipe)) {
        slot.set_state(STATE_IDLE);
        return Err(e);
    }

    loop {
        match slot.state() {
            STATE_REPLY => {
                let payload = slot.read_payload()?;
                slot.set_state(STATE_IDLE);
                let body: ReplyBody = bincode::deserialize(&payload).map_err(|e| {
                    StoreError::new(ErrorKind::Internal, format!("reply decoding failed: {}", e))
                })?;
                return Ok(body.tree);
            }
            STATE_ERROR => {
                let payload = slot.read_payload()?;
                slot.set_state(STATE_IDLE);
                let cb: CallbackError = serde_json::from_slice(&payload).unwrap_or_else(|_| {
                    CallbackError::new("provider returned an undecodable error")
                });
                let mut err = StoreError::new(
                    ErrorKind::CallbackFailed,
                    format!("provider callback failed: {}", cb.message),
                );
                if let Some(path) = &cb.path {
                    err = err.with_path(path.clone());
                }
                return Err(err);
            }
            _ => {
                if Instant::now() >= deadline {
                    // Abandon the exchange; the provider may still answer
                    // into a slot nobody reads, which the next claim resets.
                    slot.set_state(STATE_IDLE);
                    return Err(StoreError::new(
                        ErrorKind::CallbackFailed,
                        format!("provider on event pipe {} did not answer in time", evpipe),
                    ));
                }
                std::thread::sleep(POLL_SLEEP);
            }
        }
    }
}

/// Engine side: one-way delivery with no reply wait (change events,
/// notifications).
pub fn publish_event(cfg: &Config, prefix: &str, evpipe: u32, event: &Event) -> StoreResult<()> {
    let payload = encode_event(event)?;
    let slot = Slot::open(&cfg.sub_shm_path(prefix, evpipe))?;
    // One-way events tolerate a slow consumer only briefly.
    let deadline = Instant::now() + Duration::from_millis(500);

    claim_slot(&slot, deadline)?;
    if let Err(e) = slot.write_payload(&payload) {
        slot.set_state(STATE_IDLE);
        return Err(e);
    }
    slot.bump_seq();
    slot.set_state(STATE_REQUEST);

    match subscr::evpipe_notify(&cfg.evpipe_path(evpipe)) {
        Ok(()) => Ok(()),
        Err(e) => {
            slot.set_state(STATE_IDLE);
            Err(e)
        }
    }
}

fn claim_slot(slot: &Slot, deadline: Instant) -> StoreResult<()> {
    loop {
        if slot.cas_state(STATE_IDLE, STATE_CLAIMED) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(StoreError::new(
                ErrorKind::CallbackFailed,
                "rendezvous slot is busy",
            ));
        }
        std::thread::sleep(POLL_SLEEP);
    }
}

/// Provider-side handler for operational-data pulls.
pub trait OperProvider: Send + Sync {
    fn oper_data(&self, request: &OperRequest) -> Result<Option<Tree>, CallbackError>;
}

impl<F> OperProvider for F
where
    F: Fn(&OperRequest) -> Result<Option<Tree>, CallbackError> + Send + Sync,
{
    fn oper_data(&self, request: &OperRequest) -> Result<Option<Tree>, CallbackError> {
        self(request)
    }
}

/// Provider-side handler for RPC/action invocations.
pub trait RpcHandler: Send + Sync {
    fn invoke(&self, request: &RpcRequest) -> Result<Tree, CallbackError>;
}

impl<F> RpcHandler for F
where
    F: Fn(&RpcRequest) -> Result<Tree, CallbackError> + Send + Sync,
{
    fn invoke(&self, request: &RpcRequest) -> Result<Tree, CallbackError> {
        self(request)
    }
}

/// The subscriber end of one event pipe: owns the FIFO read end and the
/// slot, and dispatches incoming events to the registered handlers.
pub struct Subscriber {
    evpipe: u32,
    fifo: File,
    slot: Slot,
    pub(crate) oper: Option<Box<dyn OperProvider>>,
    pub(crate) rpc: Option<Box<dyn RpcHandler>>,
    pub(crate) on_change: Option<Box<dyn Fn(&ChangeEvent) + Send + Sync>>,
    pub(crate) on_notif: Option<Box<dyn Fn(&NotifEvent) + Send + Sync>>,
}

impl Subscriber {
    pub(crate) fn open(cfg: &Config, prefix: &str, evpipe: u32) -> StoreResult<Subscriber> {
        let fifo_path = subscr::evpipe_create(cfg, evpipe)?;
        let fifo = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&fifo_path)
            .map_err(|e| StoreError::sys(format!("failed to open {:?}", fifo_path), e))?;
        let slot = Slot::open(&cfg.sub_shm_path(prefix, evpipe))?;
        Ok(Subscriber {
            evpipe,
            fifo,
            slot,
            oper: None,
            rpc: None,
            on_change: None,
            on_notif: None,
        })
    }

    pub fn evpipe(&self) -> u32 {
        self.evpipe
    }

    /// Wait up to `wait` for events and dispatch them. Returns the number
    /// of events handled.
    pub fn process_events(&self, wait: Duration) -> StoreResult<u32> {
        let deadline = Instant::now() + wait;
        let mut handled = 0;
        loop {
            self.drain_fifo();
            if self.slot.state() == STATE_REQUEST {
                handled += self.dispatch()?;
            }
            if handled > 0 || Instant::now() >= deadline {
                return Ok(handled);
            }
            std::thread::sleep(POLL_SLEEP);
        }
    }

    fn drain_fifo(&self) {
        let mut buf = [0u8; 64];
        loop {
            // The fifo is non-blocking; EWOULDBLOCK ends the drain.
            match (&self.fifo).read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }

    fn dispatch(&self) -> StoreResult<u32> {
        let payload = self.slot.read_payload()?;
        let event: Event = match bincode::deserialize(&payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(target: "yangstore::rendezvous", "undecodable event on pipe {}: {}", self.evpipe, e);
                self.slot.set_state(STATE_IDLE);
                return Ok(0);
            }
        };

        match event {
            Event::Oper(request) => {
                let result = match &self.oper {
                    Some(provider) => provider.oper_data(&request),
                    None => Err(CallbackError::new("no operational provider registered")),
                };
                self.reply(result)?;
            }
            Event::Rpc(request) => {
                let result = match &self.rpc {
                    Some(handler) => handler.invoke(&request).map(Some),
                    None => Err(CallbackError::new("no RPC handler registered")),
                };
                self.reply(result)?;
            }
            Event::Change(event) => {
                if let Some(cb) = &self.on_change {
                    cb(&event);
                }
                self.slot.set_state(STATE_IDLE);
            }
            Event::Notif(event) => {
                if let Some(cb) = &self.on_notif {
                    cb(&event);
                }
                self.slot.set_state(STATE_IDLE);
            }
        }
        debug!(target: "yangstore::rendezvous", "dispatched event on pipe {}", self.evpipe);
        Ok(1)
    }

    fn reply(&self, result: Result<Option<Tree>, CallbackError>) -> StoreResult<()> {
        match result {
            Ok(tree) => {
                let body = ReplyBody { tree };
                let bytes = bincode::serialize(&body).map_err(|e| {
                    StoreError::new(ErrorKind::Internal, format!("reply encoding failed: {}", e))
                })?;
                self.slot.write_payload(&bytes)?;
                self.slot.set_state(STATE_REPLY);
            }
            Err(cb) => {
                let bytes = serde_json::to_vec(&cb).map_err(|e| {
                    StoreError::new(ErrorKind::Internal, format!("error encoding failed: {}", e))
                })?;
                self.slot.write_payload(&bytes)?;
                self.slot.set_state(STATE_ERROR);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_cfg(temp: &TempDir) -> Config {
        let mut cfg = Config::default();
        cfg.repository.path = temp.path().join("repo");
        cfg.shm.dir = temp.path().join("shm");
        std::fs::create_dir_all(&cfg.repository.path).unwrap();
        std::fs::create_dir_all(&cfg.shm.dir).unwrap();
        cfg
    }

    fn provider_thread(
        cfg: Config,
        evpipe: u32,
        stop: Arc<AtomicBool>,
        provider: impl OperProvider + 'static,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let mut sub = Subscriber::open(&cfg, "rv", evpipe).unwrap();
            sub.oper = Some(Box::new(provider));
            while !stop.load(Ordering::SeqCst) {
                let _ = sub.process_events(Duration::from_millis(20));
            }
        })
    }

    #[test]
    fn test_oper_request_round_trip() {
        let temp = TempDir::new().unwrap();
        let cfg = test_cfg(&temp);
        let stop = Arc::new(AtomicBool::new(false));

        let handle = provider_thread(
            cfg.clone(),
            1,
            Arc::clone(&stop),
            |req: &OperRequest| {
                assert_eq!(req.module, "if");
                Ok(Some(Tree::with_root(Node::leaf("if", "oper-state", "up"))))
            },
        );
        // Give the subscriber time to open the fifo read end.
        std::thread::sleep(Duration::from_millis(50));

        let event = Event::Oper(OperRequest {
            module: "if".to_string(),
            sub_xpath: "/if:interfaces".to_string(),
            request_xpath: None,
            parent: None,
            sid: 1,
        });
        let reply = request_reply(&cfg, "rv", 1, &event, Duration::from_secs(2)).unwrap();
        let tree = reply.unwrap();
        assert_eq!(tree.roots[0].value.as_deref(), Some("up"));

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn test_provider_error_surfaces_as_callback_failed() {
        let temp = TempDir::new().unwrap();
        let cfg = test_cfg(&temp);
        let stop = Arc::new(AtomicBool::new(false));

        let handle = provider_thread(
            cfg.clone(),
            2,
            Arc::clone(&stop),
            |_req: &OperRequest| {
                Err(CallbackError {
                    message: "sensor unavailable".to_string(),
                    path: Some("/if:interfaces".to_string()),
                    tag: None,
                })
            },
        );
        std::thread::sleep(Duration::from_millis(50));

        let event = Event::Oper(OperRequest {
            module: "if".to_string(),
            sub_xpath: "/if:interfaces".to_string(),
            request_xpath: None,
            parent: None,
            sid: 1,
        });
        let err = request_reply(&cfg, "rv", 2, &event, Duration::from_secs(2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CallbackFailed);
        assert!(err.message().contains("sensor unavailable"));
        assert_eq!(err.path(), Some("/if:interfaces"));

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn test_no_listener_fails_fast() {
        let temp = TempDir::new().unwrap();
        let cfg = test_cfg(&temp);

        let event = Event::Oper(OperRequest {
            module: "if".to_string(),
            sub_xpath: "/if:x".to_string(),
            request_xpath: None,
            parent: None,
            sid: 1,
        });
        // No fifo exists at all.
        let err = request_reply(&cfg, "rv", 9, &event, Duration::from_millis(200)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CallbackFailed);
    }

    #[test]
    fn test_unanswered_request_times_out_as_callback_failed() {
        let temp = TempDir::new().unwrap();
        let cfg = test_cfg(&temp);

        // A subscriber that never dispatches: open the fifo read end only.
        let _sub = Subscriber::open(&cfg, "rv", 3).unwrap();

        let event = Event::Oper(OperRequest {
            module: "if".to_string(),
            sub_xpath: "/if:x".to_string(),
            request_xpath: None,
            parent: None,
            sid: 1,
        });
        let start = Instant::now();
        let err = request_reply(&cfg, "rv", 3, &event, Duration::from_millis(150)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CallbackFailed);
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_one_way_publish_consumed() {
        let temp = TempDir::new().unwrap();
        let cfg = test_cfg(&temp);
        let stop = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(AtomicBool::new(false));

        let seen2 = Arc::clone(&seen);
        let cfg2 = cfg.clone();
        let stop2 = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            let mut sub = Subscriber::open(&cfg2, "rv", 4).unwrap();
            sub.on_notif = Some(Box::new(move |event: &NotifEvent| {
                assert_eq!(event.module, "alarms");
                seen2.store(true, Ordering::SeqCst);
            }));
            while !stop2.load(Ordering::SeqCst) {
                let _ = sub.process_events(Duration::from_millis(20));
            }
        });
        std::thread::sleep(Duration::from_millis(50));

        let event = Event::Notif(NotifEvent {
            module: "alarms".to_string(),
            notif: Tree::with_root(Node::container("alarms", "alarm")),
            timestamp: Utc::now(),
        });
        publish_event(&cfg, "rv", 4, &event).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !seen.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(seen.load(Ordering::SeqCst));

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }
}
