//! Transaction lifecycle.
//!
//! The API-facing [`Transaction`] handle is a thin facade over an
//! [`InternalTransaction`] that tracks the server-side transaction state.
//! The internal side is driven from two directions: API calls emit T-SQL
//! through the session's write pipeline, and transaction environment
//! change tokens parsed out of the read pipeline confirm or terminate the
//! transaction. Once terminal, the internal transaction "zombies": it
//! severs the handle link and detaches from the session's registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::io::{AsyncRead, AsyncWrite};

use tds_protocol::{EnvChange, EnvChangeType};

use crate::error::{Result, SessionError};
use crate::session::Session;

/// Server-side state of an internal transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Requested but not yet confirmed by the server.
    Pending,
    /// Confirmed by a BeginTransaction environment change.
    Active,
    /// Rolled back (terminal).
    Aborted,
    /// Committed (terminal).
    Committed,
    /// Outcome unknown, e.g. after a DTC defect (terminal).
    Unknown,
}

impl TransactionState {
    /// Whether the transaction has reached a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Aborted | Self::Committed | Self::Unknown)
    }
}

/// How an internal transaction came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    /// Observed in a user's `BEGIN TRANSACTION` T-SQL.
    LocalFromTsql,
    /// Started through the session API.
    LocalFromApi,
    /// Delegated to a distributed transaction coordinator.
    Delegated,
    /// Fully distributed.
    Distributed,
    /// Ambient context transaction.
    Context,
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read uncommitted (dirty reads allowed).
    ReadUncommitted,
    /// Read committed (default for SQL Server).
    #[default]
    ReadCommitted,
    /// Repeatable read.
    RepeatableRead,
    /// Serializable (highest isolation).
    Serializable,
    /// Snapshot isolation (requires database support).
    Snapshot,
}

impl IsolationLevel {
    /// Get the SQL statement to set this isolation level.
    #[must_use]
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED",
            Self::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            Self::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            Self::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
            Self::Snapshot => "SET TRANSACTION ISOLATION LEVEL SNAPSHOT",
        }
    }

    /// Get the isolation level name as used in SQL Server.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
            Self::Snapshot => "SNAPSHOT",
        }
    }
}

/// State shared between an API handle and its internal transaction.
///
/// The internal side holds only a weak reference, so an abandoned handle
/// can be reclaimed without server-side rollback ordering concerns.
#[derive(Debug, Default)]
pub(crate) struct HandleShared {
    zombied: AtomicBool,
}

impl HandleShared {
    pub(crate) fn is_zombied(&self) -> bool {
        self.zombied.load(Ordering::Acquire)
    }

    pub(crate) fn set_zombied(&self) {
        self.zombied.store(true, Ordering::Release);
    }
}

#[derive(Debug)]
struct TxnInner {
    descriptor: u64,
    open_results: i32,
    state: TransactionState,
    txn_type: TransactionType,
    handle: Weak<HandleShared>,
    attached: bool,
}

/// The session-side transaction record.
#[derive(Debug)]
pub struct InternalTransaction {
    inner: parking_lot::Mutex<TxnInner>,
}

impl InternalTransaction {
    pub(crate) fn new(txn_type: TransactionType, handle: Weak<HandleShared>) -> Self {
        Self {
            inner: parking_lot::Mutex::new(TxnInner {
                descriptor: 0,
                open_results: 0,
                state: TransactionState::Pending,
                txn_type,
                handle,
                attached: true,
            }),
        }
    }

    /// The transaction descriptor sent in request headers; 0 means none.
    #[must_use]
    pub fn descriptor(&self) -> u64 {
        self.inner.lock().descriptor
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// How this transaction originated.
    #[must_use]
    pub fn transaction_type(&self) -> TransactionType {
        self.inner.lock().txn_type
    }

    /// Result sets currently open under this transaction.
    #[must_use]
    pub fn open_result_count(&self) -> i32 {
        self.inner.lock().open_results
    }

    /// Whether this transaction is still attached to its session registry.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.inner.lock().attached
    }

    /// Confirm the transaction with the server-assigned descriptor.
    pub(crate) fn activate(&self, descriptor: u64) {
        let mut inner = self.inner.lock();
        if inner.state == TransactionState::Pending {
            inner.descriptor = descriptor;
            inner.state = TransactionState::Active;
        }
    }

    /// Count a result set opened under this transaction.
    pub(crate) fn open_result(&self) {
        self.inner.lock().open_results += 1;
    }

    /// Count a result set closed under this transaction.
    pub(crate) fn close_result(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.open_results == 0 {
            return Err(SessionError::OpenResultCountExceeded);
        }
        inner.open_results -= 1;
        Ok(())
    }

    /// Move to a terminal state; returns the open results that were never
    /// closed so the session can adopt them.
    pub(crate) fn complete(&self, state: TransactionState) -> i32 {
        debug_assert!(state.is_terminal());
        let mut inner = self.inner.lock();
        if !inner.state.is_terminal() {
            inner.state = state;
        }
        std::mem::take(&mut inner.open_results)
    }

    /// Zombie: sever the API handle link and detach from the session.
    pub(crate) fn zombie(&self) {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.handle.upgrade() {
            handle.set_zombied();
        }
        inner.handle = Weak::new();
        inner.attached = false;
    }
}

/// The session's transaction registry.
///
/// The session owns transactions by descriptor; transactions hold no
/// reference back, which breaks the session/transaction cycle. Terminal
/// state removes the entry from the map.
#[derive(Debug, Default)]
pub(crate) struct TransactionRegistry {
    active: HashMap<u64, Arc<InternalTransaction>>,
    pending: Option<Arc<InternalTransaction>>,
    current: Option<u64>,
    non_transacted_open_results: i32,
    deferred_rollback: bool,
}

impl TransactionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Descriptor stamped into request headers; 0 in auto-commit mode.
    pub(crate) fn current_descriptor(&self) -> u64 {
        self.current.unwrap_or(0)
    }

    /// The current transaction, if one is active.
    pub(crate) fn current(&self) -> Option<&Arc<InternalTransaction>> {
        self.current.and_then(|d| self.active.get(&d))
    }

    /// Whether any transaction is active or awaiting confirmation.
    pub(crate) fn has_transaction(&self) -> bool {
        self.current.is_some() || self.pending.is_some()
    }

    /// Result sets opened outside any transaction, plus those adopted from
    /// terminated transactions, awaiting cleanup.
    pub(crate) fn non_transacted_open_results(&self) -> i32 {
        self.non_transacted_open_results
    }

    /// Register a transaction awaiting server confirmation.
    pub(crate) fn enlist_pending(&mut self, txn: Arc<InternalTransaction>) {
        self.pending = Some(txn);
    }

    /// Forget the transaction with the given descriptor without completing
    /// it (the partial-zombie rollback path).
    pub(crate) fn forget(&mut self, descriptor: u64) {
        if let Some(txn) = self.active.remove(&descriptor) {
            txn.zombie();
        }
        if self.current == Some(descriptor) {
            self.current = None;
        }
        self.pending = None;
    }

    /// Count a result set opened; routed to the current transaction when
    /// one exists.
    pub(crate) fn open_result(&mut self) {
        match self.current() {
            Some(txn) => txn.open_result(),
            None => self.non_transacted_open_results += 1,
        }
    }

    /// Count a result set closed.
    pub(crate) fn close_result(&mut self) -> Result<()> {
        match self.current() {
            Some(txn) => txn.close_result(),
            None => {
                if self.non_transacted_open_results == 0 {
                    return Err(SessionError::OpenResultCountExceeded);
                }
                self.non_transacted_open_results -= 1;
                Ok(())
            }
        }
    }

    /// Schedule an implicit rollback for an abandoned handle.
    pub(crate) fn set_deferred_rollback(&mut self) {
        self.deferred_rollback = true;
    }

    /// Take the deferred rollback flag.
    pub(crate) fn take_deferred_rollback(&mut self) -> bool {
        std::mem::take(&mut self.deferred_rollback)
    }

    /// Drive the state machine from a transaction environment change.
    pub(crate) fn apply_env_change(&mut self, env: &EnvChange) {
        match env.env_type {
            EnvChangeType::BeginTransaction | EnvChangeType::EnlistDtcTransaction => {
                let descriptor = env.transaction_descriptor().unwrap_or(0);
                let txn = self.pending.take().unwrap_or_else(|| {
                    // A transaction the user started with raw T-SQL.
                    Arc::new(InternalTransaction::new(
                        TransactionType::LocalFromTsql,
                        Weak::new(),
                    ))
                });
                txn.activate(descriptor);
                tracing::debug!(
                    descriptor = format!("0x{descriptor:016X}"),
                    txn_type = ?txn.transaction_type(),
                    "transaction confirmed by server"
                );
                self.active.insert(descriptor, txn);
                self.current = Some(descriptor);
            }
            EnvChangeType::CommitTransaction => {
                self.terminate_current(TransactionState::Committed);
            }
            EnvChangeType::RollbackTransaction => {
                self.terminate_current(TransactionState::Aborted);
            }
            EnvChangeType::DefectTransaction | EnvChangeType::TransactionEnded => {
                self.terminate_current(TransactionState::Unknown);
            }
            EnvChangeType::PromoteTransaction => {
                tracing::debug!("transaction promoted to distributed");
            }
            _ => {}
        }
    }

    fn terminate_current(&mut self, state: TransactionState) {
        let Some(descriptor) = self.current.take() else {
            return;
        };
        if let Some(txn) = self.active.remove(&descriptor) {
            let orphaned_results = txn.complete(state);
            self.non_transacted_open_results += orphaned_results;
            txn.zombie();
            tracing::debug!(
                descriptor = format!("0x{descriptor:016X}"),
                ?state,
                orphaned_results,
                "transaction terminated"
            );
        }
    }
}

/// Quote a transaction or savepoint name as a bracketed identifier.
fn quote_name(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(SessionError::NullEmptyTransactionName);
    }
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// An API-facing transaction handle.
///
/// Obtained from [`Session::begin_transaction`]. Once the internal
/// transaction completes, the handle is zombied: every operation except the
/// legacy partial-zombie `rollback` raises
/// [`SessionError::TransactionZombied`].
pub struct Transaction<'a, T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    session: &'a mut Session<T>,
    shared: Arc<HandleShared>,
    internal: Option<Arc<InternalTransaction>>,
    isolation: IsolationLevel,
}

impl<'a, T> Transaction<'a, T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(
        session: &'a mut Session<T>,
        shared: Arc<HandleShared>,
        internal: Arc<InternalTransaction>,
        isolation: IsolationLevel,
    ) -> Self {
        Self {
            session,
            shared,
            internal: Some(internal),
            isolation,
        }
    }

    /// The isolation level agreed when the transaction began.
    #[must_use]
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    /// Whether the handle has been zombied.
    ///
    /// True from the moment a commit is written until it is confirmed, and
    /// forever after the transaction completes.
    #[must_use]
    pub fn is_zombied(&self) -> bool {
        self.shared.is_zombied()
    }

    /// The transaction descriptor assigned by the server.
    #[must_use]
    pub fn descriptor(&self) -> u64 {
        self.internal.as_ref().map_or(0, |txn| txn.descriptor())
    }

    /// Commit the transaction.
    ///
    /// The commit is written, then the server's environment change is
    /// awaited. In that window the handle already reports zombied, but it
    /// retains its internal reference so a subsequent [`rollback`]
    /// (the partial-zombie case) clears silently instead of throwing.
    ///
    /// # Errors
    ///
    /// [`SessionError::TransactionZombied`] when already completed. A
    /// wait-timeout while awaiting confirmation aborts the connection.
    ///
    /// [`rollback`]: Self::rollback
    pub async fn commit(&mut self) -> Result<()> {
        if self.shared.is_zombied() || self.internal.is_none() {
            return Err(SessionError::TransactionZombied);
        }

        self.session.send_sql_batch("COMMIT TRANSACTION").await?;
        // Partial-zombie window opens: committed on the wire, not yet
        // confirmed.
        self.shared.set_zombied();

        match self.session.run_to_completion().await {
            Ok(_) => {
                let confirmed = self
                    .internal
                    .as_ref()
                    .is_some_and(|txn| txn.state() == TransactionState::Committed);
                if confirmed {
                    self.internal = None;
                }
                Ok(())
            }
            Err(SessionError::Timeout) => {
                // The native wait-timeout during commit confirmation:
                // the connection's fate is unknowable, abort it.
                self.session.mark_broken();
                Err(SessionError::Timeout)
            }
            Err(other) => Err(other),
        }
    }

    /// Roll back the transaction.
    ///
    /// Permitted on a partially zombied handle (commit written, completion
    /// pending): that case clears the internal reference silently, with no
    /// wire traffic.
    pub async fn rollback(&mut self) -> Result<()> {
        let Some(internal) = self.internal.take() else {
            return Err(SessionError::TransactionZombied);
        };

        if self.shared.is_zombied() {
            // Partial zombie: the commit outcome belongs to the server now.
            tracing::debug!("rollback on partially zombied handle; clearing silently");
            self.session.registry_mut().forget(internal.descriptor());
            internal.zombie();
            return Ok(());
        }

        let result = async {
            self.session
                .send_sql_batch("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION")
                .await?;
            self.session.run_to_completion().await.map(|_| ())
        }
        .await;

        self.shared.set_zombied();
        self.session.registry_mut().forget(internal.descriptor());
        internal.zombie();
        result
    }

    /// Roll back to a named savepoint. The transaction stays open.
    pub async fn rollback_to(&mut self, name: &str) -> Result<()> {
        self.ensure_live()?;
        let quoted = quote_name(name)?;
        self.session
            .send_sql_batch(&format!("ROLLBACK TRANSACTION {quoted}"))
            .await?;
        self.session.run_to_completion().await.map(|_| ())
    }

    /// Create a named savepoint.
    pub async fn save(&mut self, name: &str) -> Result<()> {
        self.ensure_live()?;
        let quoted = quote_name(name)?;
        self.session
            .send_sql_batch(&format!("SAVE TRANSACTION {quoted}"))
            .await?;
        self.session.run_to_completion().await.map(|_| ())
    }

    fn ensure_live(&self) -> Result<()> {
        if self.shared.is_zombied() || self.internal.is_none() {
            return Err(SessionError::TransactionZombied);
        }
        Ok(())
    }
}

impl<T> Drop for Transaction<'_, T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn drop(&mut self) {
        if let Some(internal) = &self.internal {
            if !internal.state().is_terminal() && !self.shared.is_zombied() {
                // Implicit rollback: emitted before the session's next
                // request; errors there are swallowed.
                tracing::debug!("transaction handle dropped while open; deferring rollback");
                self.session.registry_mut().set_deferred_rollback();
            }
        }
    }
}

impl<T> std::fmt::Debug for Transaction<'_, T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("isolation", &self.isolation)
            .field("zombied", &self.is_zombied())
            .finish_non_exhaustive()
    }
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Begin an explicit transaction at the given isolation level.
    ///
    /// Emits the isolation preamble and `BEGIN TRANSACTION`, then waits for
    /// the server's confirming environment change carrying the transaction
    /// descriptor.
    pub async fn begin_transaction(
        &mut self,
        isolation: IsolationLevel,
    ) -> Result<Transaction<'_, T>> {
        self.ensure_usable()?;

        let shared = Arc::new(HandleShared::default());
        let internal = Arc::new(InternalTransaction::new(
            TransactionType::LocalFromApi,
            Arc::downgrade(&shared),
        ));
        self.registry_mut().enlist_pending(Arc::clone(&internal));

        let sql = format!("{}; BEGIN TRANSACTION", isolation.as_sql());
        let result = async {
            self.send_sql_batch(&sql).await?;
            self.run_to_completion().await.map(|_| ())
        }
        .await;
        if let Err(err) = result {
            self.registry_mut().forget(internal.descriptor());
            internal.zombie();
            return Err(err);
        }

        if internal.state() != TransactionState::Active {
            self.registry_mut().forget(internal.descriptor());
            internal.zombie();
            return Err(SessionError::CorruptedStream {
                reason: "transaction begin not confirmed by server",
            });
        }

        tracing::debug!(
            session_id = self.session_id(),
            descriptor = format!("0x{:016X}", internal.descriptor()),
            isolation = isolation.name(),
            "transaction started"
        );
        Ok(Transaction::new(self, shared, internal, isolation))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tds_protocol::EnvChangeValue;

    fn begin_env(descriptor: u64) -> EnvChange {
        EnvChange {
            env_type: EnvChangeType::BeginTransaction,
            new_value: EnvChangeValue::Binary(Bytes::copy_from_slice(
                &descriptor.to_le_bytes(),
            )),
            old_value: EnvChangeValue::Binary(Bytes::new()),
        }
    }

    fn commit_env() -> EnvChange {
        EnvChange {
            env_type: EnvChangeType::CommitTransaction,
            new_value: EnvChangeValue::Binary(Bytes::new()),
            old_value: EnvChangeValue::Binary(Bytes::new()),
        }
    }

    #[test]
    fn test_state_machine_pending_active_committed() {
        let txn = InternalTransaction::new(TransactionType::LocalFromApi, Weak::new());
        assert_eq!(txn.state(), TransactionState::Pending);

        txn.activate(0xAB);
        assert_eq!(txn.state(), TransactionState::Active);
        assert_eq!(txn.descriptor(), 0xAB);

        txn.complete(TransactionState::Committed);
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(txn.state().is_terminal());
    }

    #[test]
    fn test_open_result_underflow() {
        let txn = InternalTransaction::new(TransactionType::LocalFromApi, Weak::new());
        txn.open_result();
        assert_eq!(txn.open_result_count(), 1);
        txn.close_result().unwrap();
        let err = txn.close_result().unwrap_err();
        assert!(matches!(err, SessionError::OpenResultCountExceeded));
        assert_eq!(txn.open_result_count(), 0);
    }

    #[test]
    fn test_zombie_severs_handle() {
        let handle = Arc::new(HandleShared::default());
        let txn = InternalTransaction::new(TransactionType::LocalFromApi, Arc::downgrade(&handle));

        assert!(!handle.is_zombied());
        txn.zombie();
        assert!(handle.is_zombied());
        assert!(!txn.is_attached());
    }

    #[test]
    fn test_registry_begin_commit_roundtrip() {
        let mut registry = TransactionRegistry::new();
        let handle = Arc::new(HandleShared::default());
        let txn = Arc::new(InternalTransaction::new(
            TransactionType::LocalFromApi,
            Arc::downgrade(&handle),
        ));
        registry.enlist_pending(Arc::clone(&txn));

        registry.apply_env_change(&begin_env(0xAB));
        assert_eq!(registry.current_descriptor(), 0xAB);
        assert_eq!(txn.state(), TransactionState::Active);

        registry.apply_env_change(&commit_env());
        assert_eq!(registry.current_descriptor(), 0);
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(handle.is_zombied());
        assert!(!registry.has_transaction());
    }

    #[test]
    fn test_tsql_transaction_observed() {
        let mut registry = TransactionRegistry::new();
        registry.apply_env_change(&begin_env(0xCD));

        let txn = registry.current().unwrap();
        assert_eq!(txn.transaction_type(), TransactionType::LocalFromTsql);
        assert_eq!(txn.state(), TransactionState::Active);
    }

    #[test]
    fn test_orphaned_results_transfer_on_termination() {
        let mut registry = TransactionRegistry::new();
        registry.apply_env_change(&begin_env(0xEF));
        registry.open_result();
        registry.open_result();

        registry.apply_env_change(&commit_env());
        assert_eq!(registry.non_transacted_open_results(), 2);

        // Cleanup closes them against the session-wide counter.
        registry.close_result().unwrap();
        registry.close_result().unwrap();
        assert!(registry.close_result().is_err());
    }

    #[test]
    fn test_quote_name() {
        assert_eq!(quote_name("sp1").unwrap(), "[sp1]");
        assert_eq!(quote_name("odd]name").unwrap(), "[odd]]name]");
        assert!(matches!(
            quote_name(""),
            Err(SessionError::NullEmptyTransactionName)
        ));
    }

    #[test]
    fn test_isolation_level_sql() {
        assert_eq!(
            IsolationLevel::ReadCommitted.as_sql(),
            "SET TRANSACTION ISOLATION LEVEL READ COMMITTED"
        );
        assert_eq!(IsolationLevel::Serializable.name(), "SERIALIZABLE");
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
    }
}
