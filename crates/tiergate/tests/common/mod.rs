//! Common helpers for integration tests.
//! Some helpers are only used by specific test binaries; allow dead_code to avoid per-binary warnings.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tiergate::abi::encode_subscription;
use tiergate::{
    DecodedSubscription, EntitlementRecord, EntitlementStore, GetMethodResult, LedgerQuery,
    MemoryStore, QueryError, RowUpdate, StackEntry, StoreError, Tier,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

pub const CONTRACT: &str = "EQsubscription";
pub const NOW: u64 = 1_700_000_000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("tiergate=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// How a scripted address misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Timeout,
    Transport,
    ShortStack,
    Garbage,
}

/// Ledger whose per-address answers are set by the test. Unknown addresses get the
/// absence marker.
#[derive(Default)]
pub struct ScriptedLedger {
    answers: Mutex<HashMap<String, Result<DecodedSubscription, Fault>>>,
    calls: AtomicUsize,
}

impl ScriptedLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, address: &str, tier: Tier, expires_at: u64) {
        self.answers
            .lock()
            .unwrap()
            .insert(address.to_string(), Ok(DecodedSubscription { tier, expires_at }));
    }

    pub fn fail(&self, address: &str, fault: Fault) {
        self.answers
            .lock()
            .unwrap()
            .insert(address.to_string(), Err(fault));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerQuery for ScriptedLedger {
    async fn query(
        &self,
        contract: &str,
        _method: &str,
        args: &[StackEntry],
    ) -> Result<GetMethodResult, QueryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(contract, CONTRACT);
        let address = args.first().map(|a| a.value.clone()).unwrap_or_default();
        let answer = self
            .answers
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .unwrap_or(Ok(DecodedSubscription::absent()));
        let stack = match answer {
            Ok(sub) => encode_subscription(&sub),
            Err(Fault::Timeout) => return Err(QueryError::Timeout),
            Err(Fault::Transport) => {
                return Err(QueryError::Transport("connection reset".into()))
            }
            Err(Fault::ShortStack) => vec![StackEntry::num(2)],
            Err(Fault::Garbage) => vec![StackEntry::new("cell", "te6cc"), StackEntry::num(1)],
        };
        Ok(GetMethodResult {
            exit_code: 0,
            stack,
        })
    }
}

/// MemoryStore that counts flushes and can be told to fail them.
#[derive(Default)]
pub struct CountingStore {
    pub inner: MemoryStore,
    flushes: AtomicUsize,
    rows_written: AtomicUsize,
    fail_flush: AtomicBool,
}

impl CountingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written.load(Ordering::SeqCst)
    }

    pub fn set_fail_flush(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EntitlementStore for CountingStore {
    async fn link_wallet(&self, address: &str, now: u64) -> Result<EntitlementRecord, StoreError> {
        self.inner.link_wallet(address, now).await
    }

    async fn manual_upgrade(
        &self,
        address: &str,
        tier: Tier,
        expires_at: u64,
        now: u64,
    ) -> Result<EntitlementRecord, StoreError> {
        self.inner.manual_upgrade(address, tier, expires_at, now).await
    }

    async fn get(&self, address: &str) -> Result<Option<EntitlementRecord>, StoreError> {
        self.inner.get(address).await
    }

    async fn linked_records(&self) -> Result<Vec<EntitlementRecord>, StoreError> {
        self.inner.linked_records().await
    }

    async fn apply_batch(&self, updates: Vec<RowUpdate>) -> Result<usize, StoreError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk full".into()));
        }
        let n = self.inner.apply_batch(updates).await?;
        self.rows_written.fetch_add(n, Ordering::SeqCst);
        Ok(n)
    }
}

/// Canned reply for the stub HTTP server.
#[derive(Debug, Clone)]
pub enum StubReply {
    Json { status: u16, body: String },
    /// Read the request, then never answer.
    Hang,
}

/// One request seen by the stub server.
#[derive(Debug, Clone)]
pub struct Captured {
    pub head: String,
    pub body: String,
}

/// Serve `reply` to every connection on an ephemeral port. Returns the base URL and the
/// captured requests.
pub async fn spawn_stub(reply: StubReply) -> (String, Arc<Mutex<Vec<Captured>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
    let base_url = format!("http://{}/api/v2", listener.local_addr().unwrap());
    let captured = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&captured);
    tokio::spawn(async move {
        while let Ok((sock, _)) = listener.accept().await {
            let reply = reply.clone();
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                let _ = serve_one(sock, reply, seen).await;
            });
        }
    });
    (base_url, captured)
}

async fn serve_one(
    mut sock: TcpStream,
    reply: StubReply,
    seen: Arc<Mutex<Vec<Captured>>>,
) -> std::io::Result<()> {
    let request = read_request(&mut sock).await?;
    seen.lock().unwrap().push(request);
    match reply {
        StubReply::Json { status, body } => {
            let resp = format!(
                "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(resp.as_bytes()).await?;
            sock.shutdown().await
        }
        StubReply::Hang => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }
}

async fn read_request(sock: &mut TcpStream) -> std::io::Result<Captured> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = sock.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_string();
            let len = head
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            let body_start = end + 4;
            if buf.len() >= body_start + len {
                let body = String::from_utf8_lossy(&buf[body_start..body_start + len]).to_string();
                return Ok(Captured { head, body });
            }
        }
    }
    Ok(Captured {
        head: String::from_utf8_lossy(&buf).to_string(),
        body: String::new(),
    })
}
