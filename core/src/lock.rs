//! Reader/writer admission control for transactions.
//!
//! Transactions that share a store name conflict when at least one of them is
//! write-mode. Conflicting transactions serialize in FIFO order; everything
//! else runs in parallel. A pending writer blocks later conflicting readers,
//! so writers cannot starve.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::warn;

use crate::error::StorageError;

/// Proof of admission returned by [`TransactionLockHelper::open_transaction`].
/// Must be handed back through `transaction_complete` or `transaction_failed`
/// to release the locks it represents.
#[derive(Debug)]
pub struct TransactionToken {
    id: u64,
    pub store_names: Vec<String>,
    pub write: bool,
}

struct Pending {
    id: u64,
    store_names: Vec<String>,
    write: bool,
    admit: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockState {
    next_id: u64,
    active: HashMap<u64, (Vec<String>, bool)>,
    pending: VecDeque<Pending>,
    closing: bool,
    drain_waiters: Vec<oneshot::Sender<()>>,
}

#[derive(Default)]
pub struct TransactionLockHelper {
    state: Mutex<LockState>,
}

fn conflicts(a_stores: &[String], a_write: bool, b_stores: &[String], b_write: bool) -> bool {
    (a_write || b_write) && a_stores.iter().any(|s| b_stores.contains(s))
}

impl TransactionLockHelper {
    pub fn new() -> Self { Self::default() }

    /// Suspend until the requested store set is admissible, then yield a
    /// token. Fails with `DatabaseClosing` once [`close_when_possible`] has
    /// been called.
    ///
    /// [`close_when_possible`]: TransactionLockHelper::close_when_possible
    pub async fn open_transaction(&self, store_names: Vec<String>, write: bool) -> Result<TransactionToken, StorageError> {
        let (id, rx) = {
            let mut st = self.state.lock().expect("lock state poisoned");
            if st.closing {
                return Err(StorageError::DatabaseClosing);
            }
            let id = st.next_id;
            st.next_id += 1;

            let active_clear = st.active.values().all(|(s, w)| !conflicts(&store_names, write, s, *w));
            let queue_clear = st.pending.iter().all(|p| !conflicts(&store_names, write, &p.store_names, p.write));
            if active_clear && queue_clear {
                st.active.insert(id, (store_names.clone(), write));
                return Ok(TransactionToken { id, store_names, write });
            }

            let (tx, rx) = oneshot::channel();
            st.pending.push_back(Pending { id, store_names: store_names.clone(), write, admit: tx });
            (id, rx)
        };

        match rx.await {
            Ok(()) => Ok(TransactionToken { id, store_names, write }),
            // The helper only drops admit senders while draining for close.
            Err(_) => Err(StorageError::DatabaseClosing),
        }
    }

    /// Release the token's locks after a successful transaction.
    pub fn transaction_complete(&self, token: TransactionToken) {
        let mut st = self.state.lock().expect("lock state poisoned");
        st.active.remove(&token.id);
        Self::pump(&mut st);
    }

    /// Release the token's locks after a failed transaction. Queued waiters
    /// are unblocked exactly as on success; the failure is the caller's to
    /// surface.
    pub fn transaction_failed(&self, token: TransactionToken, err: &StorageError) {
        warn!("transaction over {:?} failed: {}", token.store_names, err);
        self.transaction_complete(token);
    }

    /// Refuse new transactions and resolve once active and queued ones drain.
    pub async fn close_when_possible(&self) {
        let rx = {
            let mut st = self.state.lock().expect("lock state poisoned");
            st.closing = true;
            if st.active.is_empty() && st.pending.is_empty() {
                return;
            }
            let (tx, rx) = oneshot::channel();
            st.drain_waiters.push(tx);
            rx
        };
        let _ = rx.await;
    }

    /// Admit every queued transaction that no longer conflicts with active
    /// transactions or with queued transactions ahead of it.
    fn pump(st: &mut LockState) {
        let mut i = 0;
        while i < st.pending.len() {
            let admissible = {
                let p = &st.pending[i];
                st.active.values().all(|(s, w)| !conflicts(&p.store_names, p.write, s, *w))
                    && st.pending.iter().take(i).all(|q| !conflicts(&p.store_names, p.write, &q.store_names, q.write))
            };
            if admissible {
                let p = st.pending.remove(i).expect("index checked above");
                // A failed send means the waiter gave up; its slot just frees.
                if p.admit.send(()).is_ok() {
                    st.active.insert(p.id, (p.store_names, p.write));
                }
            } else {
                i += 1;
            }
        }
        if st.closing && st.active.is_empty() && st.pending.is_empty() {
            for w in st.drain_waiters.drain(..) {
                let _ = w.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn names(names: &[&str]) -> Vec<String> { names.iter().map(|s| s.to_string()).collect() }

    #[tokio::test]
    async fn test_parallel_readers() {
        let locks = TransactionLockHelper::new();
        let a = locks.open_transaction(names(&["s"]), false).await.unwrap();
        let b = locks.open_transaction(names(&["s"]), false).await.unwrap();
        locks.transaction_complete(a);
        locks.transaction_complete(b);
    }

    #[tokio::test]
    async fn test_disjoint_writers_overlap() {
        let locks = TransactionLockHelper::new();
        let a = locks.open_transaction(names(&["a"]), true).await.unwrap();
        let b = locks.open_transaction(names(&["b"]), true).await.unwrap();
        locks.transaction_complete(a);
        locks.transaction_complete(b);
    }

    #[tokio::test]
    async fn test_writer_blocks_conflicting_reader() {
        let locks = Arc::new(TransactionLockHelper::new());
        let writer = locks.open_transaction(names(&["s"]), true).await.unwrap();

        let reader_ran = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn({
            let locks = locks.clone();
            let reader_ran = reader_ran.clone();
            async move {
                let token = locks.open_transaction(names(&["s"]), false).await.unwrap();
                reader_ran.store(true, Ordering::SeqCst);
                locks.transaction_complete(token);
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader_ran.load(Ordering::SeqCst), "reader admitted while writer held the store");

        locks.transaction_complete(writer);
        handle.await.unwrap();
        assert!(reader_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_pending_writer_blocks_later_reader() {
        let locks = Arc::new(TransactionLockHelper::new());
        let first = locks.open_transaction(names(&["s"]), false).await.unwrap();

        // Queued writer conflicts with the active reader.
        let writer = tokio::spawn({
            let locks = locks.clone();
            async move { locks.open_transaction(names(&["s"]), true).await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // A later reader must wait behind the queued writer.
        let late_ran = Arc::new(AtomicBool::new(false));
        let late = tokio::spawn({
            let locks = locks.clone();
            let late_ran = late_ran.clone();
            async move {
                let token = locks.open_transaction(names(&["s"]), false).await.unwrap();
                late_ran.store(true, Ordering::SeqCst);
                locks.transaction_complete(token);
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!late_ran.load(Ordering::SeqCst));

        locks.transaction_complete(first);
        let writer_token = writer.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!late_ran.load(Ordering::SeqCst), "reader admitted while writer active");

        locks.transaction_complete(writer_token);
        late.await.unwrap();
        assert!(late_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failure_releases_locks() {
        let locks = Arc::new(TransactionLockHelper::new());
        let writer = locks.open_transaction(names(&["s"]), true).await.unwrap();
        let waiter = tokio::spawn({
            let locks = locks.clone();
            async move { locks.open_transaction(names(&["s"]), true).await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        locks.transaction_failed(writer, &StorageError::TransactionAborted("boom".into()));
        let token = waiter.await.unwrap();
        locks.transaction_complete(token);
    }

    #[tokio::test]
    async fn test_close_refuses_new_and_drains() {
        let locks = Arc::new(TransactionLockHelper::new());
        let open = locks.open_transaction(names(&["s"]), true).await.unwrap();

        let closer = tokio::spawn({
            let locks = locks.clone();
            async move { locks.close_when_possible().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(
            locks.open_transaction(names(&["s"]), false).await,
            Err(StorageError::DatabaseClosing)
        ));

        locks.transaction_complete(open);
        closer.await.unwrap();
    }
}
