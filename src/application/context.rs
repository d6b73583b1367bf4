use super::locks::EntityLocks;
use super::outbox::Outbox;
use super::repository::Repository;
use crate::domain::ports::{ClockRef, LedgerStoreRef};

/// Shared handles every service needs: typed storage, the entity lock registry, the
/// webhook outbox and the clock.
#[derive(Clone)]
pub struct LedgerContext {
    pub repo: Repository,
    pub locks: EntityLocks,
    pub outbox: Outbox,
    pub clock: ClockRef,
}

impl LedgerContext {
    pub fn new(store: LedgerStoreRef, clock: ClockRef) -> Self {
        let repo = Repository::new(store);
        Self {
            outbox: Outbox::new(repo.clone()),
            repo,
            locks: EntityLocks::new(),
            clock,
        }
    }
}
