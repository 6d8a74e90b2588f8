use std::{
    collections::BTreeMap,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use crate::{
    Aggregate,
    aggregate::ProtocolAggregate,
    error::AggregationError,
    metric::ResultRecord,
    protocol::Protocol,
    report::{FinalReport, Report, Summary},
};

/// Records are kept in fixed-size chunks so a growing run never reallocates and
/// copies its whole history under the shard lock.
const RECORD_CHUNK: usize = 4096;

#[derive(Debug)]
struct Shard {
    aggregate: ProtocolAggregate,
    records: Vec<Vec<ResultRecord>>,
}

impl Shard {
    fn push(&mut self, record: ResultRecord) {
        match self.records.last_mut() {
            Some(chunk) if chunk.len() < RECORD_CHUNK => chunk.push(record),
            _ => {
                let mut chunk = Vec::with_capacity(RECORD_CHUNK);
                chunk.push(record);
                self.records.push(chunk);
            }
        }
    }
}

/// Thread-safe sink for [`ResultRecord`]s.
///
/// Each enabled protocol owns a separate shard behind its own lock, so users of
/// different protocols never contend with each other. The work done under a lock is
/// one histogram update and one push.
#[derive(Debug)]
pub struct MetricsCollector {
    shards: BTreeMap<Protocol, Mutex<Shard>>,
    finalized: AtomicBool,
    rejected: AtomicU64,
}

impl MetricsCollector {
    pub fn new(protocols: impl IntoIterator<Item = Protocol>) -> Self {
        let shards = protocols
            .into_iter()
            .map(|p| {
                let shard = Shard {
                    aggregate: ProtocolAggregate::new(),
                    records: Vec::new(),
                };
                (p, Mutex::new(shard))
            })
            .collect();
        Self {
            shards,
            finalized: AtomicBool::new(false),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn protocols(&self) -> impl Iterator<Item = Protocol> + '_ {
        self.shards.keys().copied()
    }

    /// Folds one record into its protocol's aggregate and keeps it for export.
    ///
    /// Records for a protocol this collector was not built with, or arriving after
    /// [`MetricsCollector::finalize`], are rejected and counted.
    pub fn record(&self, record: ResultRecord) -> Result<(), AggregationError> {
        if self.finalized.load(Ordering::Acquire) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(AggregationError::Finalized);
        }
        let Some(shard) = self.shards.get(&record.protocol) else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(AggregationError::UnknownProtocol(record.protocol));
        };
        let mut shard = lock(shard);
        shard.aggregate.consume(&record);
        shard.push(record);
        Ok(())
    }

    /// Number of records that were rejected so far.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every protocol's aggregate, safe to call during a run.
    pub fn snapshot(&self) -> BTreeMap<Protocol, ProtocolAggregate> {
        self.shards
            .iter()
            .map(|(p, shard)| (*p, lock(shard).aggregate.clone()))
            .collect()
    }

    /// Closes the collector and hands out everything it gathered.
    ///
    /// Only the first call succeeds; records arriving afterwards are rejected.
    pub fn finalize(&self) -> Result<FinalReport, AggregationError> {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return Err(AggregationError::Finalized);
        }

        let mut summaries = Vec::with_capacity(self.shards.len());
        let mut records = Vec::new();
        for (protocol, shard) in &self.shards {
            let mut shard = lock(shard);
            summaries.push(Summary::from_aggregate(*protocol, &shard.aggregate));
            records.extend(std::mem::take(&mut shard.records).into_iter().flatten());
        }
        records.sort_by_key(|r| r.timestamp);

        Ok(FinalReport {
            summaries,
            records,
            rejected: self.rejected(),
            run: None,
        })
    }
}

/// Locks a shard, ignoring poison left by a panicked user.
fn lock(shard: &Mutex<Shard>) -> MutexGuard<'_, Shard> {
    shard.lock().unwrap_or_else(PoisonError::into_inner)
}
