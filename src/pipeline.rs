//! Command Pipelining
//!
//! A [`Batcher`] collects commands locally and sends them to the store in a
//! single exchange when flushed. The results come back in the order the
//! commands were enqueued, one slot per command.
//!
//! ## Flow
//!
//! ```text
//!   enqueue(SET a 1) ─► handle #0 ┐
//!   enqueue(INCR c)  ─► handle #1 ├─ pending (no I/O)
//!   enqueue(GET a)   ─► handle #2 ┘
//!          │
//!          ▼ flush(deadline)
//!   ┌─────────────────────────────┐
//!   │ Exchange::pipelined(3 cmds) │ ──► one round trip
//!   └─────────────────────────────┘
//!          │
//!          ▼
//!   BatchResults [Ok(OK), Ok(1), Ok("1")]
//! ```
//!
//! A command the store rejects only fails its own slot. A transport failure
//! (lost connection, elapsed deadline, cancellation, wrong number of answers)
//! fails every slot with the same error.

use crate::channel::{CommandChannel, Deadline, Exchange, SendError};
use crate::commands::Command;
use crate::error::{CommandError, CommandResult, TransportError};
use std::slice;
use std::vec;
use tracing::{debug, warn};

/// Identifies one enqueued command within the flush that carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchHandle {
    generation: u64,
    index: usize,
}

impl BatchHandle {
    /// Position of the command within its batch.
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Accumulates commands and sends them in one round trip.
///
/// # Example
///
/// ```
/// use flashkv_client::channel::{Deadline, MemoryStore};
/// use flashkv_client::{Batcher, Command, Reply};
///
/// # tokio_test::block_on(async {
/// let mut batch = Batcher::new(MemoryStore::new());
/// batch.enqueue(Command::set("visits", "10"));
/// let incr = batch.enqueue(Command::incr("visits"));
///
/// let results = batch.flush(&Deadline::none()).await;
/// assert_eq!(results.get(incr), Some(&Ok(Reply::integer(11))));
/// # });
/// ```
#[derive(Debug)]
pub struct Batcher<C> {
    channel: C,
    pending: Vec<Command>,
    generation: u64,
}

impl<C: CommandChannel> Batcher<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            pending: Vec::new(),
            generation: 0,
        }
    }

    /// Appends a command to the pending batch. No I/O happens.
    pub fn enqueue(&mut self, command: Command) -> BatchHandle {
        self.pending.push(command);
        BatchHandle {
            generation: self.generation,
            index: self.pending.len() - 1,
        }
    }

    /// Commands waiting for the next flush.
    pub fn pending(&self) -> &[Command] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drops the pending commands without sending them.
    ///
    /// Handles issued for them will not resolve in any later flush.
    pub fn discard(&mut self) -> Vec<Command> {
        self.generation += 1;
        std::mem::take(&mut self.pending)
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Sends every pending command in one exchange and clears the batch.
    ///
    /// Never fails as a whole: each command gets a slot, and transport
    /// failures are copied into all of them. An empty batch returns empty
    /// results without contacting the store.
    pub async fn flush(&mut self, deadline: &Deadline) -> BatchResults {
        let generation = self.generation;
        self.generation += 1;
        let commands = std::mem::take(&mut self.pending);
        let count = commands.len();

        if count == 0 {
            return BatchResults::new(generation, Vec::new());
        }

        let slots = match self.channel.send(Exchange::pipelined(commands), deadline).await {
            Ok(results) if results.len() == count => results,
            Ok(results) => {
                let error = TransportError::Protocol(format!(
                    "expected {} results, got {}",
                    count,
                    results.len()
                ));
                fail_all(count, error)
            }
            Err(SendError::Transport(error)) => fail_all(count, error),
            Err(other) => fail_all(
                count,
                TransportError::Protocol(format!("unexpected answer to pipeline: {}", other)),
            ),
        };

        let results = BatchResults::new(generation, slots);
        debug!(
            commands = count,
            failed = results.failures(),
            "Batch flushed"
        );
        results
    }
}

fn fail_all(count: usize, error: TransportError) -> Vec<CommandResult> {
    warn!(commands = count, error = %error, "Batch exchange failed");
    vec![Err(CommandError::Transport(error)); count]
}

/// Per-command results of one flush, in enqueue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResults {
    generation: u64,
    slots: Vec<CommandResult>,
}

impl BatchResults {
    fn new(generation: u64, slots: Vec<CommandResult>) -> Self {
        Self { generation, slots }
    }

    /// The result for a handle issued by this flush's batch.
    pub fn get(&self, handle: BatchHandle) -> Option<&CommandResult> {
        if handle.generation != self.generation {
            return None;
        }
        self.slots.get(handle.index)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of slots holding an error.
    pub fn failures(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_err()).count()
    }

    /// The transport error shared by every slot, if the exchange failed.
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self.slots.first()? {
            Err(CommandError::Transport(error)) => Some(error),
            _ => None,
        }
    }

    pub fn iter(&self) -> slice::Iter<'_, CommandResult> {
        self.slots.iter()
    }

    pub fn as_slice(&self) -> &[CommandResult] {
        &self.slots
    }

    pub fn into_vec(self) -> Vec<CommandResult> {
        self.slots
    }
}

impl IntoIterator for BatchResults {
    type Item = CommandResult;
    type IntoIter = vec::IntoIter<CommandResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.slots.into_iter()
    }
}

impl<'a> IntoIterator for &'a BatchResults {
    type Item = &'a CommandResult;
    type IntoIter = slice::Iter<'a, CommandResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.slots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MemoryStore, StoreConfig, VersionToken};
    use crate::reply::Reply;
    use bytes::Bytes;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    /// Fails every exchange with the same transport error.
    struct FailingChannel(TransportError);

    impl CommandChannel for FailingChannel {
        async fn send(
            &self,
            _exchange: Exchange,
            _deadline: &Deadline,
        ) -> Result<Vec<CommandResult>, SendError> {
            Err(SendError::Transport(self.0.clone()))
        }

        async fn fingerprint(
            &self,
            _key: &Bytes,
            _deadline: &Deadline,
        ) -> Result<VersionToken, TransportError> {
            Err(self.0.clone())
        }
    }

    /// Answers every exchange with one result too few.
    struct ShortChannel;

    impl CommandChannel for ShortChannel {
        async fn send(
            &self,
            exchange: Exchange,
            _deadline: &Deadline,
        ) -> Result<Vec<CommandResult>, SendError> {
            Ok(vec![Ok(Reply::ok()); exchange.len().saturating_sub(1)])
        }

        async fn fingerprint(
            &self,
            key: &Bytes,
            _deadline: &Deadline,
        ) -> Result<VersionToken, TransportError> {
            Ok(VersionToken::new(key.clone()))
        }
    }

    #[tokio::test]
    async fn test_empty_flush_sends_nothing() {
        let store = MemoryStore::new();
        let mut batch = Batcher::new(&store);

        let results = batch.flush(&Deadline::none()).await;

        assert!(results.is_empty());
        assert_eq!(store.stats().exchanges.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_single_command() {
        let store = MemoryStore::new();
        let mut batch = Batcher::new(&store);
        let handle = batch.enqueue(Command::set("k", "v"));

        let results = batch.flush(&Deadline::none()).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results.get(handle), Some(&Ok(Reply::ok())));
    }

    #[tokio::test]
    async fn test_many_commands_one_exchange_in_order() {
        let store = MemoryStore::new();
        let mut batch = Batcher::new(&store);

        let handles: Vec<BatchHandle> = (0..100)
            .map(|i| batch.enqueue(Command::rpush("list", [i.to_string()])))
            .collect();
        assert_eq!(batch.len(), 100);

        let results = batch.flush(&Deadline::none()).await;

        assert_eq!(results.len(), 100);
        assert!(batch.is_empty());
        assert_eq!(store.stats().exchanges.load(Ordering::Relaxed), 1);
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.index(), i);
            assert_eq!(results.get(handle), Some(&Ok(Reply::integer(i as i64 + 1))));
        }
    }

    #[tokio::test]
    async fn test_rejected_command_fails_only_its_slot() {
        let store = MemoryStore::new();
        let mut batch = Batcher::new(&store);
        batch.enqueue(Command::set("name", "Ariz"));
        let bad = batch.enqueue(Command::incr("name"));
        let after = batch.enqueue(Command::get("name"));

        let results = batch.flush(&Deadline::none()).await;

        assert_eq!(results.failures(), 1);
        assert!(matches!(results.get(bad), Some(Err(CommandError::Server(_)))));
        assert_eq!(results.get(after), Some(&Ok(Reply::bulk("Ariz"))));
        assert_eq!(results.transport_error(), None);
    }

    #[tokio::test]
    async fn test_transport_failure_fills_every_slot() {
        let lost = TransportError::ConnectionLost("broken pipe".into());
        let mut batch = Batcher::new(FailingChannel(lost.clone()));
        for i in 0..5 {
            batch.enqueue(Command::get(format!("k{}", i)));
        }

        let results = batch.flush(&Deadline::none()).await;

        assert_eq!(results.len(), 5);
        assert_eq!(results.transport_error(), Some(&lost));
        for slot in &results {
            assert_eq!(slot, &Err(CommandError::Transport(lost.clone())));
        }
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_result_count_mismatch_is_protocol_error() {
        let mut batch = Batcher::new(ShortChannel);
        batch.enqueue(Command::get("a"));
        batch.enqueue(Command::get("b"));

        let results = batch.flush(&Deadline::none()).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results.failures(), 2);
        assert!(matches!(
            results.transport_error(),
            Some(TransportError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_elapsed_deadline_fills_every_slot() {
        let store = MemoryStore::with_config(
            StoreConfig::default().with_latency(Duration::from_millis(200)),
        );
        let mut batch = Batcher::new(&store);
        batch.enqueue(Command::set("a", "1"));
        batch.enqueue(Command::set("b", "2"));

        let results = batch
            .flush(&Deadline::after(Duration::from_millis(10)))
            .await;

        let expected = Err(CommandError::Transport(TransportError::DeadlineElapsed));
        assert_eq!(results.as_slice(), &[expected.clone(), expected]);
        assert_eq!(store.execute(&Command::exists("a")), Ok(Reply::integer(0)));
    }

    #[tokio::test]
    async fn test_cancelled_flush_fills_every_slot() {
        let store = MemoryStore::new();
        let (deadline, cancel) = Deadline::cancellable();
        cancel.cancel();

        let mut batch = Batcher::new(&store);
        batch.enqueue(Command::set("a", "1"));
        let results = batch.flush(&deadline).await;

        assert_eq!(results.transport_error(), Some(&TransportError::Cancelled));
    }

    #[tokio::test]
    async fn test_handles_do_not_resolve_across_flushes() {
        let store = MemoryStore::new();
        let mut batch = Batcher::new(&store);

        let first = batch.enqueue(Command::set("a", "1"));
        let first_results = batch.flush(&Deadline::none()).await;

        let second = batch.enqueue(Command::get("a"));
        let second_results = batch.flush(&Deadline::none()).await;

        assert_eq!(first.index(), second.index());
        assert_eq!(second_results.get(first), None);
        assert_eq!(first_results.get(second), None);
        assert_eq!(second_results.get(second), Some(&Ok(Reply::bulk("1"))));
    }

    #[tokio::test]
    async fn test_discard_drops_pending() {
        let store = MemoryStore::new();
        let mut batch = Batcher::new(&store);
        let stale = batch.enqueue(Command::set("a", "1"));

        assert_eq!(batch.discard().len(), 1);
        let fresh = batch.enqueue(Command::set("b", "2"));
        let results = batch.flush(&Deadline::none()).await;

        assert_eq!(results.get(stale), None);
        assert_eq!(results.get(fresh), Some(&Ok(Reply::ok())));
        assert_eq!(store.execute(&Command::exists("a")), Ok(Reply::integer(0)));
    }
}
