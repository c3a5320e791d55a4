use crate::replica::entry_store::EntryStore;
use crate::replica::peers::ReplicaId;
use std::fmt;
use std::io;

#[derive(Copy, Clone, Default, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub(crate) struct Term(u64);

impl Term {
    pub(crate) fn new(term: u64) -> Self {
        Term(term)
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn next(&self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The durable election state of a replica. `current_term` never decreases, and `voted_for` is
/// only cleared when `current_term` advances.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct TermInfo {
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<ReplicaId>,
}

impl TermInfo {
    pub(crate) fn new(current_term: Term, voted_for: Option<ReplicaId>) -> Self {
        TermInfo {
            current_term,
            voted_for,
        }
    }
}

/// TermStore is used whenever raft requires that the term or vote is persisted to a durable
/// store before anyone can observe it. The in-memory copy is only updated after the journal
/// accepted the write, so a failed write leaves the old state in place and the caller aborts.
///
/// Store methods are CAS-like. Similar to most CAS method signatures, they return true if we
/// have mutated state.
pub(crate) struct TermStore {
    my_replica_id: ReplicaId,
    term_info: TermInfo,
}

impl TermStore {
    pub(crate) fn new(my_replica_id: ReplicaId, recovered: TermInfo) -> Self {
        TermStore {
            my_replica_id,
            term_info: recovered,
        }
    }

    pub(crate) fn current_term(&self) -> Term {
        self.term_info.current_term
    }

    pub(crate) fn term_info(&self) -> &TermInfo {
        &self.term_info
    }

    pub(crate) fn voted_for_current_term(&self) -> (Term, Option<&ReplicaId>) {
        (self.term_info.current_term, self.term_info.voted_for.as_ref())
    }

    /// Persist `new_term`/`voted_for`, then make it visible.
    pub(crate) fn update_and_persist(
        &mut self,
        store: &mut EntryStore,
        new_term: Term,
        voted_for: Option<ReplicaId>,
    ) -> io::Result<()> {
        if new_term < self.term_info.current_term {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Refusing to move term backwards from {:?} to {:?}",
                    self.term_info.current_term, new_term
                ),
            ));
        }
        if new_term == self.term_info.current_term {
            if let Some(existing) = &self.term_info.voted_for {
                if voted_for.as_ref() != Some(existing) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("Already voted for {:?} in term {:?}", existing, new_term),
                    ));
                }
            }
        }

        let new_info = TermInfo::new(new_term, voted_for);
        store.persist_term_info(&new_info)?;
        self.term_info = new_info;

        Ok(())
    }

    /// Set current term to `new_term` and clear the vote, iff it is larger than current term.
    pub(crate) fn store_term_if_increased(&mut self, store: &mut EntryStore, new_term: Term) -> io::Result<bool> {
        if new_term <= self.term_info.current_term {
            return Ok(false);
        }

        self.update_and_persist(store, new_term, None)?;
        Ok(true)
    }

    /// Store our vote iff the current term is `expected_term` and we haven't voted in it yet.
    pub(crate) fn store_vote_for_term_if_unvoted(
        &mut self,
        store: &mut EntryStore,
        expected_term: Term,
        vote: ReplicaId,
    ) -> io::Result<bool> {
        if expected_term != self.term_info.current_term || self.term_info.voted_for.is_some() {
            return Ok(false);
        }

        self.update_and_persist(store, expected_term, Some(vote))?;
        Ok(true)
    }

    /// Return the new term. Used when transitioning to candidate.
    pub(crate) fn increment_term_and_vote_for_self(&mut self, store: &mut EntryStore) -> io::Result<Term> {
        let new_term = self.term_info.current_term.next();
        self.update_and_persist(store, new_term, Some(self.my_replica_id.clone()))?;

        Ok(new_term)
    }

    /// Adopt a term carried by an installed snapshot, if it is ahead of ours.
    pub(crate) fn adopt_if_newer(&mut self, store: &mut EntryStore, other: &TermInfo) -> io::Result<bool> {
        if other.current_term <= self.term_info.current_term {
            return Ok(false);
        }

        self.update_and_persist(store, other.current_term, other.voted_for.clone())?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::journal::{InMemoryJournal, JournalRecord};
    use crate::replica::entry_store::EntryStore;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn term_and_vote_cas() {
        let (actor_client, _rx) = ActorClient::new(10);
        let journal = InMemoryJournal::new();
        let mut store = EntryStore::new(test_logger(), Box::new(journal.clone()), actor_client.weak());
        let mut terms = TermStore::new(ReplicaId::new("me"), TermInfo::default());

        assert!(!terms.store_term_if_increased(&mut store, Term::new(0)).unwrap());
        assert!(terms.store_term_if_increased(&mut store, Term::new(3)).unwrap());
        assert_eq!(terms.voted_for_current_term(), (Term::new(3), None));

        // Wrong term, then success, then already voted.
        assert!(!terms
            .store_vote_for_term_if_unvoted(&mut store, Term::new(2), ReplicaId::new("a"))
            .unwrap());
        assert!(terms
            .store_vote_for_term_if_unvoted(&mut store, Term::new(3), ReplicaId::new("a"))
            .unwrap());
        assert!(!terms
            .store_vote_for_term_if_unvoted(&mut store, Term::new(3), ReplicaId::new("b"))
            .unwrap());

        assert_eq!(terms.increment_term_and_vote_for_self(&mut store).unwrap(), Term::new(4));
        assert_eq!(
            terms.term_info(),
            &TermInfo::new(Term::new(4), Some(ReplicaId::new("me")))
        );

        let persisted: Vec<TermInfo> = journal
            .records()
            .into_iter()
            .filter_map(|r| match r {
                JournalRecord::TermInfo(info) => Some(info),
                _ => None,
            })
            .collect();
        assert_eq!(persisted.last(), Some(terms.term_info()));
        assert_eq!(persisted.len(), 3);
    }

    #[tokio::test]
    async fn term_never_decreases_and_vote_is_sticky() {
        let (actor_client, _rx) = ActorClient::new(10);
        let mut store = EntryStore::new(test_logger(), Box::new(InMemoryJournal::new()), actor_client.weak());
        let mut terms = TermStore::new(
            ReplicaId::new("me"),
            TermInfo::new(Term::new(5), Some(ReplicaId::new("a"))),
        );

        assert!(terms.update_and_persist(&mut store, Term::new(4), None).is_err());
        assert!(terms
            .update_and_persist(&mut store, Term::new(5), Some(ReplicaId::new("b")))
            .is_err());
        assert_eq!(terms.current_term(), Term::new(5));
    }

    #[tokio::test]
    async fn failed_persist_leaves_state_untouched() {
        let (actor_client, _rx) = ActorClient::new(10);
        let journal = InMemoryJournal::new();
        let mut store = EntryStore::new(test_logger(), Box::new(journal.clone()), actor_client.weak());
        let mut terms = TermStore::new(ReplicaId::new("me"), TermInfo::default());

        journal.fail_writes(true);
        assert!(terms.increment_term_and_vote_for_self(&mut store).is_err());
        assert_eq!(terms.term_info(), &TermInfo::default());
    }
}
