//! FlashKV Client - demo driver
//!
//! Walks through every command family, a pipelined batch and a
//! watch-then-commit transaction against an in-process `MemoryStore`, then
//! runs concurrent read-modify-write workers to show the retry loop at work.

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use flashkv_client::channel::{Deadline, MemoryStore, StoreConfig};
use flashkv_client::transaction::{run_with_retries, RetryPolicy};
use flashkv_client::{Batcher, Command, Error, OptimisticTransaction, TransactionOutcome};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flashkv-client")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Which demo to run
    #[arg(short, long, value_enum, default_value_t = Section::All)]
    section: Section,

    /// Concurrent workers in the contention demo
    #[arg(short, long, default_value_t = 8)]
    workers: usize,

    /// Increments each worker commits in the contention demo
    #[arg(short, long, default_value_t = 50)]
    increments: usize,

    /// Attempts per transaction before giving up
    #[arg(short = 'm', long, default_value_t = 100)]
    max_attempts: u32,

    /// Simulated round-trip latency of the store, in milliseconds
    #[arg(short, long, default_value_t = 0)]
    latency_ms: u64,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Section {
    All,
    Strings,
    Hashes,
    Lists,
    Sets,
    Zsets,
    Keys,
    Pipeline,
    Transaction,
    Contention,
}

impl Section {
    fn includes(self, other: Section) -> bool {
        self == Section::All || self == other
    }
}

fn print_banner(cli: &Cli) {
    println!(
        r#"
FlashKV Client v{} - Pipelines and Optimistic Transactions
──────────────────────────────────────────────────────────────
Section: {:?}   Latency: {}ms   Max attempts: {}
"#,
        flashkv_client::VERSION,
        cli.section,
        cli.latency_ms,
        cli.max_attempts
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    print_banner(&cli);

    let config = StoreConfig::default().with_latency(Duration::from_millis(cli.latency_ms));
    let store = Arc::new(MemoryStore::with_config(config));
    let _sweeper = store.start_sweeper();
    info!("In-memory store ready, expiry sweeper started");

    let deadline = Deadline::none();
    let section = cli.section;

    if section.includes(Section::Strings) {
        show(
            &store,
            &deadline,
            "Strings",
            vec![
                Command::set("name", "Ariz"),
                Command::get("name"),
                Command::set_with_ttl("token", "abc123xyz", Duration::from_secs(10)),
                Command::ttl("token"),
                Command::exists("name"),
                Command::append("name", " K"),
                Command::strlen("name"),
            ],
        )
        .await?;
    }

    if section.includes(Section::Hashes) {
        show(
            &store,
            &deadline,
            "Hashes",
            vec![
                Command::hset(
                    "user:1001",
                    [("name", "Ariz"), ("age", "25"), ("email", "ariz@example.com")],
                ),
                Command::hget("user:1001", "name"),
                Command::hgetall("user:1001"),
                Command::hlen("user:1001"),
            ],
        )
        .await?;
    }

    if section.includes(Section::Lists) {
        show(
            &store,
            &deadline,
            "Lists",
            vec![
                Command::lpush("tasks", ["task1", "task2", "task3"]),
                Command::lrange("tasks", 0, -1),
                Command::rpop("tasks"),
                Command::llen("tasks"),
            ],
        )
        .await?;
    }

    if section.includes(Section::Sets) {
        show(
            &store,
            &deadline,
            "Sets",
            vec![
                Command::sadd("tags", ["rust", "redis", "tokio", "database"]),
                Command::smembers("tags"),
                Command::sismember("tags", "rust"),
                Command::scard("tags"),
            ],
        )
        .await?;
    }

    if section.includes(Section::Zsets) {
        show(
            &store,
            &deadline,
            "Sorted Sets",
            vec![
                Command::zadd("scores", [(95.5, "alice"), (88.0, "bob"), (92.5, "carol")]),
                Command::zrange("scores", 0, -1, true),
                Command::zrevrange("scores", 0, -1, true),
                Command::zscore("scores", "bob"),
            ],
        )
        .await?;
    }

    if section.includes(Section::Keys) {
        show(
            &store,
            &deadline,
            "Keys",
            vec![
                Command::set("session:1", "a"),
                Command::set("session:2", "b"),
                Command::keys("session:*"),
                Command::del("session:1"),
                Command::expire("session:2", Duration::from_secs(60)),
                Command::ttl("session:2"),
                Command::persist("session:2"),
                Command::key_type("session:2"),
            ],
        )
        .await?;
    }

    if section.includes(Section::Pipeline) {
        pipeline_demo(&store, &deadline).await?;
    }

    if section.includes(Section::Transaction) {
        transaction_demo(&store, &deadline).await?;
    }

    if section.includes(Section::Contention) {
        contention_demo(&store, &cli).await?;
    }

    let stats = store.stats();
    info!(
        exchanges = stats.exchanges.load(Ordering::Relaxed),
        commands = stats.commands.load(Ordering::Relaxed),
        fingerprints = stats.fingerprints.load(Ordering::Relaxed),
        conflicts = stats.conflicts.load(Ordering::Relaxed),
        "Demo complete"
    );
    Ok(())
}

/// Sends `commands` as one batch and prints each reply next to its command.
async fn show(
    store: &MemoryStore,
    deadline: &Deadline,
    title: &str,
    commands: Vec<Command>,
) -> anyhow::Result<()> {
    println!("\n========== {} ==========", title);

    let mut batch = Batcher::new(store);
    let handles: Vec<_> = commands
        .into_iter()
        .map(|command| {
            let text = command.to_string();
            (text, batch.enqueue(command))
        })
        .collect();

    let results = batch.flush(deadline).await;
    if let Some(err) = results.transport_error() {
        bail!("{} batch failed: {}", title, err);
    }

    for (text, handle) in handles {
        match results.get(handle) {
            Some(Ok(reply)) => println!("> {}\n{}", text, reply),
            Some(Err(err)) => println!("> {}\n(error) {}", text, err),
            None => {}
        }
    }
    Ok(())
}

async fn pipeline_demo(store: &MemoryStore, deadline: &Deadline) -> anyhow::Result<()> {
    println!("\n========== Pipeline ==========");

    let mut batch = Batcher::new(store);
    batch.enqueue(Command::set("pipeline:key1", "value1"));
    batch.enqueue(Command::set("pipeline:key2", "value2"));
    batch.enqueue(Command::incr("pipeline:counter"));
    batch.enqueue(Command::incr("pipeline:not-a-number"));
    batch.enqueue(Command::get("pipeline:key1"));

    // Plant a string that INCR cannot parse so one slot carries an error
    store
        .execute(&Command::set("pipeline:not-a-number", "abc"))
        .context("seeding pipeline demo")?;

    let started = Instant::now();
    let results = batch.flush(deadline).await;
    println!(
        "{} commands, 1 round trip, {} failed, {:?}",
        results.len(),
        results.failures(),
        started.elapsed()
    );
    for (index, result) in results.iter().enumerate() {
        match result {
            Ok(reply) => println!("  [{}] {}", index, reply),
            Err(err) => println!("  [{}] (error) {}", index, err),
        }
    }
    Ok(())
}

async fn transaction_demo(store: &MemoryStore, deadline: &Deadline) -> anyhow::Result<()> {
    println!("\n========== Transaction ==========");

    store
        .execute(&Command::set("account:balance", "100"))
        .context("seeding balance")?;

    let mut tx = OptimisticTransaction::new(store);
    tx.begin(["account:balance"], deadline).await?;
    let balance = parse_counter(tx.read("account:balance", deadline).await?);
    println!("WATCH account:balance -> {}", balance);

    tx.queue_write(Command::set("account:balance", (balance + 50).to_string()))?;
    match tx.commit(deadline).await? {
        TransactionOutcome::Committed(replies) => {
            println!("EXEC committed {} write(s), balance now {}", replies.len(), balance + 50)
        }
        other => bail!("uncontended transaction ended as {}", other.state()),
    }

    // Same read-modify-write, but another client writes in between
    tx.begin(["account:balance"], deadline).await?;
    let balance = parse_counter(tx.read("account:balance", deadline).await?);
    store
        .execute(&Command::decr_by("account:balance", 30))
        .context("concurrent withdrawal")?;
    tx.queue_write(Command::set("account:balance", (balance + 50).to_string()))?;

    match tx.commit(deadline).await? {
        TransactionOutcome::Aborted(conflict) => {
            println!("EXEC aborted, changed keys: {:?}", conflict.keys())
        }
        other => bail!("contended transaction ended as {}", other.state()),
    }

    let current = store
        .execute(&Command::get("account:balance"))
        .context("reading balance")?;
    println!("GET account:balance -> {}", current);
    Ok(())
}

async fn contention_demo(store: &Arc<MemoryStore>, cli: &Cli) -> anyhow::Result<()> {
    println!("\n========== Contention ==========");

    let key = Bytes::from_static(b"contention:counter");
    store
        .execute(&Command::del(key.clone()))
        .context("clearing counter")?;

    let policy = RetryPolicy::default().with_max_attempts(cli.max_attempts);
    let started = Instant::now();
    let mut workers = Vec::with_capacity(cli.workers);

    for worker in 0..cli.workers {
        let store = Arc::clone(store);
        let policy = policy.clone();
        let key = key.clone();
        let increments = cli.increments;

        workers.push(tokio::spawn(async move {
            let keys = [key.clone()];
            let deadline = Deadline::none();
            let mut attempts = 0u32;

            for _ in 0..increments {
                let key = key.clone();
                let report = run_with_retries(
                    Arc::clone(&store),
                    &keys,
                    &policy,
                    &deadline,
                    move |tx, deadline| {
                        let key = key.clone();
                        Box::pin(async move {
                            let current = parse_counter(tx.read(key.clone(), deadline).await?);
                            tx.queue_write(Command::set(key, (current + 1).to_string()))?;
                            Ok::<_, Error>(current)
                        })
                    },
                )
                .await?;
                attempts += report.attempts;
            }

            info!(worker, attempts, "Worker finished");
            Ok::<_, Error>(attempts)
        }));
    }

    let mut total_attempts = 0u32;
    for handle in workers {
        match handle.await.context("worker panicked")? {
            Ok(attempts) => total_attempts += attempts,
            Err(err) => {
                warn!(error = %err, "Worker gave up");
                return Err(err.into());
            }
        }
    }

    let expected = (cli.workers * cli.increments) as i64;
    let actual = parse_counter(
        store
            .execute(&Command::get(key))
            .context("reading counter")?
            .into_bytes(),
    );

    println!(
        "{} workers x {} increments: counter = {} (expected {}), {} attempts, {:?}",
        cli.workers,
        cli.increments,
        actual,
        expected,
        total_attempts,
        started.elapsed()
    );
    if actual != expected {
        bail!("lost update: counter is {} but {} increments committed", actual, expected);
    }
    Ok(())
}

/// Reads an integer counter, treating a missing or unparsable value as zero.
fn parse_counter(value: Option<Bytes>) -> i64 {
    value
        .as_deref()
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .and_then(|text| text.parse().ok())
        .unwrap_or(0)
}
