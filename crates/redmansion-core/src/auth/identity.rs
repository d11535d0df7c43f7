//! Stale-while-revalidate cache of the signed-in identity.
//!
//! The identity is mirrored in memory and persisted for the lifetime of the
//! session. When a snapshot exists, navigation renders with it immediately
//! (Optimistic) and checks it against the remote service in the background.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::RemoteService;
use crate::cache::SessionStorage;
use crate::models::IdentityRecord;

/// Storage key of the identity snapshot
pub const IDENTITY_NAMESPACE: &str = "redmansion_user_cache";

/// Buffer for state change notifications.
const EVENT_BUFFER_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum IdentityState {
    /// Nothing cached and nothing fetched yet
    Unknown,
    /// First fetch in flight with no cached identity to show
    Loading,
    /// Showing the cached identity while it is revalidated
    Optimistic(IdentityRecord),
    /// Confirmed by the remote service
    Validated(IdentityRecord),
    /// A cached identity failed revalidation
    Expired,
    /// No identity: never signed in, or logged out
    SignedOut,
}

impl IdentityState {
    pub fn identity(&self) -> Option<&IdentityRecord> {
        match self {
            IdentityState::Optimistic(identity) | IdentityState::Validated(identity) => {
                Some(identity)
            }
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, IdentityState::Loading)
    }

    /// Expired and SignedOut look the same to views.
    pub fn is_signed_out(&self) -> bool {
        matches!(self, IdentityState::Expired | IdentityState::SignedOut)
    }
}

struct IdentityCore {
    state: IdentityState,
    cached: Option<IdentityRecord>,
    /// Bumped whenever the identity is cleared or replaced
    generation: u64,
    has_mounted: bool,
}

struct Inner {
    storage: Arc<dyn SessionStorage>,
    remote: Arc<dyn RemoteService>,
    core: Mutex<IdentityCore>,
    revalidating: AtomicBool,
    events: broadcast::Sender<IdentityState>,
}

/// Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct IdentitySession {
    inner: Arc<Inner>,
}

impl IdentitySession {
    pub fn new(storage: Arc<dyn SessionStorage>, remote: Arc<dyn RemoteService>) -> Self {
        let cached = Self::load_snapshot(storage.as_ref());
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);

        Self {
            inner: Arc::new(Inner {
                storage,
                remote,
                core: Mutex::new(IdentityCore {
                    state: IdentityState::Unknown,
                    cached,
                    generation: 0,
                    has_mounted: false,
                }),
                revalidating: AtomicBool::new(false),
                events,
            }),
        }
    }

    fn load_snapshot(storage: &dyn SessionStorage) -> Option<IdentityRecord> {
        match storage.get_item(IDENTITY_NAMESPACE) {
            Ok(Some(contents)) => match serde_json::from_str(&contents) {
                Ok(identity) => Some(identity),
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable identity snapshot");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Failed to read identity snapshot");
                None
            }
        }
    }

    /// Receive every state transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<IdentityState> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> IdentityState {
        self.inner.lock_core().state.clone()
    }

    /// The in-memory identity, if any.
    pub fn current(&self) -> Option<IdentityRecord> {
        self.inner.lock_core().cached.clone()
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock_core().generation
    }

    pub fn is_revalidating(&self) -> bool {
        self.inner.revalidating.load(Ordering::SeqCst)
    }

    /// Called on mount and on every navigation.
    ///
    /// Returns the background revalidation task, or `None` when one is
    /// already in flight.
    pub fn on_navigate(&self) -> Option<JoinHandle<()>> {
        if self
            .inner
            .revalidating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Identity revalidation already in flight");
            return None;
        }

        let generation = {
            let mut core = self.inner.lock_core();
            let next = match core.cached.clone() {
                Some(identity) => Some(IdentityState::Optimistic(identity)),
                // Only the very first mount shows a loading state
                None if !core.has_mounted => Some(IdentityState::Loading),
                None => None,
            };
            if let Some(next) = next {
                self.inner.transition(&mut core, next);
            }
            core.generation
        };

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime, skipping identity revalidation");
                self.inner.revalidating.store(false, Ordering::SeqCst);
                return None;
            }
        };

        let inner = self.inner.clone();
        Some(handle.spawn(async move { inner.revalidate(generation).await }))
    }

    /// Clear the identity locally, then tell the remote service.
    /// Views depending on the identity must be rebuilt afterwards.
    pub async fn logout(&self) {
        {
            let mut core = self.inner.lock_core();
            core.cached = None;
            core.generation += 1;
            core.has_mounted = true;
            self.inner.remove_snapshot();
            self.inner.transition(&mut core, IdentityState::SignedOut);
        }
        info!("Signed out");

        if let Err(e) = self.inner.remote.logout().await {
            warn!(error = %e, "Remote logout failed");
        }
    }
}

impl Inner {
    fn lock_core(&self) -> MutexGuard<'_, IdentityCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, core: &mut IdentityCore, next: IdentityState) {
        if core.state == next {
            return;
        }
        debug!(from = ?core.state, to = ?next, "Identity state transition");
        core.state = next.clone();
        // No subscribers is fine
        let _ = self.events.send(next);
    }

    fn save_snapshot(&self, identity: &IdentityRecord) {
        let result = serde_json::to_string(identity)
            .map_err(crate::cache::StorageError::from)
            .and_then(|contents| self.storage.set_item(IDENTITY_NAMESPACE, &contents));
        if let Err(e) = result {
            warn!(error = %e, "Failed to save identity snapshot");
        }
    }

    fn remove_snapshot(&self) {
        if let Err(e) = self.storage.remove_item(IDENTITY_NAMESPACE) {
            warn!(error = %e, "Failed to remove identity snapshot");
        }
    }

    async fn revalidate(&self, generation: u64) {
        let result = self.remote.fetch_identity().await;

        {
            let mut core = self.lock_core();
            if core.generation != generation {
                debug!("Identity changed during revalidation, discarding result");
            } else {
                core.has_mounted = true;
                match result {
                    Ok(identity) => {
                        let changed = core
                            .cached
                            .as_ref()
                            .map(|cached| cached.id != identity.id)
                            .unwrap_or(true);
                        if changed {
                            debug!(id = %identity.id, "Identity changed, updating snapshot");
                            self.save_snapshot(&identity);
                            core.cached = Some(identity);
                            core.generation += 1;
                        }
                        let validated = core.cached.clone().map(IdentityState::Validated);
                        if let Some(validated) = validated {
                            self.transition(&mut core, validated);
                        }
                    }
                    Err(e) => {
                        if !e.is_auth_failure() {
                            warn!(error = %e, "Identity revalidation failed, treating as signed out");
                        }
                        let had_identity = core.cached.take().is_some();
                        self.remove_snapshot();
                        if had_identity {
                            info!(error = %e, "Cached identity failed revalidation");
                            core.generation += 1;
                            self.transition(&mut core, IdentityState::Expired);
                        } else {
                            debug!(error = %e, "Not signed in");
                            self.transition(&mut core, IdentityState::SignedOut);
                        }
                    }
                }
            }
        }

        self.revalidating.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStorage;
    use crate::testing::FakeRemote;

    fn drain(rx: &mut broadcast::Receiver<IdentityState>) -> Vec<IdentityState> {
        let mut states = Vec::new();
        while let Ok(state) = rx.try_recv() {
            states.push(state);
        }
        states
    }

    fn seeded_storage(identity: &IdentityRecord) -> Arc<MemoryStorage> {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .set_item(IDENTITY_NAMESPACE, &serde_json::to_string(identity).unwrap())
            .unwrap();
        storage
    }

    #[tokio::test]
    async fn test_first_load_without_snapshot_shows_loading() {
        let storage = Arc::new(MemoryStorage::new());
        let fake = Arc::new(FakeRemote::new());
        fake.set_identity(Some(IdentityRecord::new("u1")));
        let session = IdentitySession::new(storage.clone(), fake.clone());
        let mut rx = session.subscribe();

        session.on_navigate().unwrap().await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                IdentityState::Loading,
                IdentityState::Validated(IdentityRecord::new("u1")),
            ]
        );
        assert!(storage.get_item(IDENTITY_NAMESPACE).unwrap().is_some());
        assert_eq!(session.current().unwrap().id, "u1");
    }

    #[tokio::test]
    async fn test_snapshot_renders_optimistically_then_validates() {
        let cached = IdentityRecord::new("u1");
        let fake = Arc::new(FakeRemote::new());
        fake.set_identity(Some(cached.clone()));
        fake.identity_gate.close();
        let session = IdentitySession::new(seeded_storage(&cached), fake.clone());

        let task = session.on_navigate().unwrap();
        // Before the remote answers, the cached identity is already shown
        assert_eq!(session.state(), IdentityState::Optimistic(cached.clone()));

        fake.identity_gate.release();
        task.await.unwrap();
        assert_eq!(session.state(), IdentityState::Validated(cached));
    }

    #[tokio::test]
    async fn test_failed_revalidation_goes_straight_to_expired() {
        let cached = IdentityRecord::new("u1");
        let storage = seeded_storage(&cached);
        let fake = Arc::new(FakeRemote::new()); // identity fetch fails
        let session = IdentitySession::new(storage.clone(), fake.clone());
        let mut rx = session.subscribe();
        let generation = session.generation();

        session.on_navigate().unwrap().await.unwrap();

        let states = drain(&mut rx);
        assert_eq!(
            states,
            vec![IdentityState::Optimistic(cached), IdentityState::Expired]
        );
        assert!(states.iter().all(|s| !s.is_loading()));
        assert!(session.state().is_signed_out());
        assert!(session.current().is_none());
        assert!(storage.get_item(IDENTITY_NAMESPACE).unwrap().is_none());
        assert!(session.generation() > generation);
    }

    #[tokio::test]
    async fn test_different_identity_replaces_snapshot() {
        let storage = seeded_storage(&IdentityRecord::new("old"));
        let fake = Arc::new(FakeRemote::new());
        let mut fresh = IdentityRecord::new("new");
        fresh.email = Some("new@example.com".to_string());
        fake.set_identity(Some(fresh.clone()));
        let session = IdentitySession::new(storage.clone(), fake.clone());

        session.on_navigate().unwrap().await.unwrap();

        assert_eq!(session.current(), Some(fresh.clone()));
        let persisted: IdentityRecord =
            serde_json::from_str(&storage.get_item(IDENTITY_NAMESPACE).unwrap().unwrap()).unwrap();
        assert_eq!(persisted, fresh);
    }

    #[tokio::test]
    async fn test_concurrent_navigations_share_one_revalidation() {
        let cached = IdentityRecord::new("u1");
        let fake = Arc::new(FakeRemote::new());
        fake.set_identity(Some(cached.clone()));
        fake.identity_gate.close();
        let session = IdentitySession::new(seeded_storage(&cached), fake.clone());

        let task = session.on_navigate().unwrap();
        assert!(session.on_navigate().is_none());
        assert!(session.clone().on_navigate().is_none());
        assert!(session.is_revalidating());

        fake.identity_gate.release();
        task.await.unwrap();
        assert_eq!(fake.identity_calls(), 1);
        assert!(!session.is_revalidating());

        // Once finished, the next navigation revalidates again
        session.on_navigate().unwrap().await.unwrap();
        assert_eq!(fake.identity_calls(), 2);
    }

    #[tokio::test]
    async fn test_later_navigation_without_identity_shows_no_loading() {
        let fake = Arc::new(FakeRemote::new());
        let session = IdentitySession::new(Arc::new(MemoryStorage::new()), fake.clone());

        session.on_navigate().unwrap().await.unwrap();
        assert_eq!(session.state(), IdentityState::SignedOut);

        let mut rx = session.subscribe();
        session.on_navigate().unwrap().await.unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(session.state(), IdentityState::SignedOut);
    }

    #[tokio::test]
    async fn test_logout_clears_synchronously_and_discards_inflight_revalidation() {
        let cached = IdentityRecord::new("u1");
        let storage = seeded_storage(&cached);
        let fake = Arc::new(FakeRemote::new());
        fake.set_identity(Some(cached.clone()));
        fake.identity_gate.close();
        let session = IdentitySession::new(storage.clone(), fake.clone());

        let task = session.on_navigate().unwrap();
        session.logout().await;
        assert_eq!(session.state(), IdentityState::SignedOut);
        assert!(storage.get_item(IDENTITY_NAMESPACE).unwrap().is_none());
        assert_eq!(fake.logout_calls(), 1);

        // The revalidation that started before logout must not sign back in
        fake.identity_gate.release();
        task.await.unwrap();
        assert_eq!(session.state(), IdentityState::SignedOut);
        assert!(session.current().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_treated_as_absent() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_item(IDENTITY_NAMESPACE, "not json").unwrap();
        let fake = Arc::new(FakeRemote::new());
        let session = IdentitySession::new(storage, fake.clone());

        assert!(session.current().is_none());
        let mut rx = session.subscribe();
        session.on_navigate().unwrap().await.unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![IdentityState::Loading, IdentityState::SignedOut]
        );
    }

    #[test]
    fn test_navigation_without_runtime_does_not_wedge() {
        let fake = Arc::new(FakeRemote::new());
        let session = IdentitySession::new(Arc::new(MemoryStorage::new()), fake);

        assert!(session.on_navigate().is_none());
        assert!(!session.is_revalidating());
    }
}
