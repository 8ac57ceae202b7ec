//! Named shared/exclusive resource locks with a fixed acquisition order.
//!
//! Every structural chain operation takes the same three locks in the same
//! order: the domain (shared), the image namespace (exclusive) and the base
//! volume lease (exclusive). [`LockPlan`] refuses any other order, and
//! [`HeldLocks`] releases in reverse.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::sync::RwLock;

use crate::{
    ids::{DomainId, ImageId, VolumeId},
    Error, Result,
};

/// Default time to wait for a contended resource.
pub const DEFAULT_RESOURCE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Resource namespaces, in acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ResourceKind {
    Domain,
    Image,
    VolumeLease,
}

impl ResourceKind {
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Domain => 0,
            Self::Image => 1,
            Self::VolumeLease => 2,
        }
    }
}

/// One named lock request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRequest {
    pub kind: ResourceKind,
    pub name: String,
    pub mode: LockMode,
}

impl ResourceRequest {
    #[must_use]
    pub fn domain(domain: &DomainId, mode: LockMode) -> Self {
        Self {
            kind: ResourceKind::Domain,
            name: domain.to_string(),
            mode,
        }
    }

    #[must_use]
    pub fn image(domain: &DomainId, image: &ImageId, mode: LockMode) -> Self {
        Self {
            kind: ResourceKind::Image,
            name: format!("{domain}/{image}"),
            mode,
        }
    }

    #[must_use]
    pub fn volume_lease(domain: &DomainId, volume: &VolumeId, mode: LockMode) -> Self {
        Self {
            kind: ResourceKind::VolumeLease,
            name: format!("{domain}/{volume}"),
            mode,
        }
    }

    /// Fully qualified lock key.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.kind, self.name)
    }
}

impl fmt::Display for ResourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.key(), self.mode)
    }
}

/// An ordered list of lock requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockPlan {
    requests: Vec<ResourceRequest>,
}

impl LockPlan {
    /// Build a plan, rejecting requests that are not in namespace order.
    pub fn new(requests: Vec<ResourceRequest>) -> Result<Self> {
        if let Some(pair) = requests
            .windows(2)
            .find(|pair| pair[1].kind.rank() < pair[0].kind.rank())
        {
            return Err(Error::LockOrderViolation {
                held: pair[0].to_string(),
                requested: pair[1].to_string(),
            });
        }
        Ok(Self { requests })
    }

    /// The locks every chain merge step holds.
    pub fn for_merge(domain: &DomainId, image: &ImageId, base: &VolumeId) -> Result<Self> {
        Self::new(vec![
            ResourceRequest::domain(domain, LockMode::Shared),
            ResourceRequest::image(domain, image, LockMode::Exclusive),
            ResourceRequest::volume_lease(domain, base, LockMode::Exclusive),
        ])
    }

    #[must_use]
    pub fn requests(&self) -> &[ResourceRequest] {
        &self.requests
    }
}

/// A held resource. Dropping it releases the lock.
pub struct ResourceGuard {
    request: ResourceRequest,
    _held: Box<dyn Send + Sync>,
}

impl ResourceGuard {
    pub fn new(request: ResourceRequest, held: impl Send + Sync + 'static) -> Self {
        Self {
            request,
            _held: Box::new(held),
        }
    }

    #[must_use]
    pub const fn request(&self) -> &ResourceRequest {
        &self.request
    }
}

impl fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        tracing::debug!("Released resource {}", self.request);
    }
}

/// In-process named lock provider.
#[async_trait::async_trait]
pub trait ResourceManager: Send + Sync {
    async fn acquire(&self, request: &ResourceRequest) -> Result<ResourceGuard>;
}

/// Guards taken for one plan, released in reverse acquisition order.
#[derive(Debug, Default)]
pub struct HeldLocks {
    guards: Vec<ResourceGuard>,
}

impl HeldLocks {
    #[must_use]
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    pub fn release(mut self) {
        self.release_all();
    }

    fn release_all(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Acquire every lock of `plan` in order.
///
/// On failure the locks already taken are released before the error
/// propagates.
pub async fn acquire_all(manager: &dyn ResourceManager, plan: &LockPlan) -> Result<HeldLocks> {
    let mut held = HeldLocks::default();
    for request in plan.requests() {
        let guard = manager.acquire(request).await?;
        tracing::debug!("Acquired resource {request}");
        held.guards.push(guard);
    }
    Ok(held)
}

type LockTable = Arc<Mutex<HashMap<String, Arc<RwLock<()>>>>>;

/// Resource manager backed by tokio read/write locks.
///
/// A table entry lives only while someone holds or waits on it.
#[derive(Debug)]
pub struct LocalResourceManager {
    locks: LockTable,
    timeout: Duration,
}

impl Default for LocalResourceManager {
    fn default() -> Self {
        Self::new(DEFAULT_RESOURCE_TIMEOUT)
    }
}

impl LocalResourceManager {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    fn lock_for(&self, key: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }
}

/// Remove `key` from the table unless another holder or waiter shares it.
fn prune(table: &LockTable, key: &str) {
    let mut locks = table.lock().unwrap_or_else(PoisonError::into_inner);
    if locks
        .get(key)
        .is_some_and(|lock| Arc::strong_count(lock) == 1)
    {
        locks.remove(key);
    }
}

/// A held table lock; releasing it prunes the table entry.
struct TableGuard<G> {
    held: Option<G>,
    key: String,
    table: LockTable,
}

impl<G> Drop for TableGuard<G> {
    fn drop(&mut self) {
        drop(self.held.take());
        prune(&self.table, &self.key);
    }
}

#[async_trait::async_trait]
impl ResourceManager for LocalResourceManager {
    async fn acquire(&self, request: &ResourceRequest) -> Result<ResourceGuard> {
        let key = request.key();
        let lock = self.lock_for(&key);
        let table = Arc::clone(&self.locks);
        let acquired = match request.mode {
            LockMode::Shared => tokio::time::timeout(self.timeout, lock.read_owned())
                .await
                .map(|held| {
                    let held = TableGuard { held: Some(held), key: key.clone(), table };
                    ResourceGuard::new(request.clone(), held)
                }),
            LockMode::Exclusive => tokio::time::timeout(self.timeout, lock.write_owned())
                .await
                .map(|held| {
                    let held = TableGuard { held: Some(held), key: key.clone(), table };
                    ResourceGuard::new(request.clone(), held)
                }),
        };
        acquired.map_err(|_| {
            prune(&self.locks, &key);
            Error::ResourceTimeout(request.to_string())
        })
    }
}
