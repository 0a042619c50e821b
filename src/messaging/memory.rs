//! In-process log with the same group semantics as the broker-backed one.
//!
//! Nothing here survives the process, so it is only a stand-in for tests and
//! for running without a broker. A record is retained until every group
//! of its topic has acknowledged it (or indefinitely while the topic has no
//! group yet, so the first group replays it). Dropping a subscription hands
//! its unacknowledged records to the remaining members of its group (or
//! parks them until one subscribes).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::{Acknowledge, DurableLog, LogRecord, RecordStream};
use crate::error::LogError;

#[derive(Clone, Default)]
pub struct MemoryLog {
  shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
  state: Mutex<LogState>,
  fail_appends: AtomicBool,
}

#[derive(Default)]
struct LogState {
  topics: HashMap<String, Topic>,
  next_member: u64,
}

#[derive(Default)]
struct Topic {
  records: BTreeMap<usize, Arc<[u8]>>,
  next_offset: usize,
  groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Group {
  ready: VecDeque<(usize, bool)>,
  members: Vec<Member>,
  next: usize,
  // offset -> member holding it
  unacked: HashMap<usize, u64>,
}

struct Member {
  id: u64,
  tx: mpsc::UnboundedSender<LogRecord>,
}

struct Address<'a> {
  shared: &'a Arc<Shared>,
  topic: &'a str,
  group: &'a str,
}

impl Shared {
  fn lock(&self) -> MutexGuard<'_, LogState> {
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

impl Group {
  fn holds(&self, offset: usize) -> bool {
    self.unacked.contains_key(&offset) || self.ready.iter().any(|(o, _)| *o == offset)
  }

  fn dispatch(&mut self, at: &Address<'_>, records: &BTreeMap<usize, Arc<[u8]>>, offset: usize, redelivered: bool) {
    let Some(data) = records.get(&offset) else { return };
    while !self.members.is_empty() {
      let idx = self.next % self.members.len();
      self.next = self.next.wrapping_add(1);
      let member = &self.members[idx];
      let ack = MemoryAck {
        shared: Arc::downgrade(at.shared),
        topic: at.topic.to_string(),
        group: at.group.to_string(),
        offset,
        member: member.id,
      };
      let record = LogRecord::new(data.to_vec(), redelivered, ack);
      if member.tx.send(record).is_ok() {
        self.unacked.insert(offset, member.id);
        return;
      }
      self.members.remove(idx);
    }
    self.ready.push_back((offset, redelivered));
  }
}

impl MemoryLog {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make every subsequent `append` fail, as a broker outage would.
  pub fn fail_appends(&self, fail: bool) {
    self.shared.fail_appends.store(fail, Ordering::SeqCst);
  }

  /// Records of `topic` the group has not acknowledged yet.
  pub fn outstanding(&self, topic: &str, group: &str) -> usize {
    let state = self.shared.lock();
    let Some(topic) = state.topics.get(topic) else { return 0 };
    match topic.groups.get(group) {
      Some(group) => group.ready.len() + group.unacked.len(),
      None => topic.records.len(),
    }
  }

  /// Records of `topic` still retained by the log.
  pub fn record_count(&self, topic: &str) -> usize {
    self.shared.lock().topics.get(topic).map_or(0, |t| t.records.len())
  }

  /// Ends every open subscription, as a broker dropping its consumers would.
  /// Their unacknowledged records go back to the group once each stream is
  /// dropped.
  pub fn close_subscriptions(&self) {
    let mut state = self.shared.lock();
    for topic in state.topics.values_mut() {
      for group in topic.groups.values_mut() {
        group.members.clear();
      }
    }
    debug!("memory log subscriptions closed");
  }
}

impl Topic {
  fn release_if_done(&mut self, offset: usize) {
    if !self.groups.is_empty() && self.groups.values().all(|group| !group.holds(offset)) {
      self.records.remove(&offset);
    }
  }
}

#[async_trait]
impl DurableLog for MemoryLog {
  async fn append(&self, topic: &str, record: &[u8]) -> Result<(), LogError> {
    if self.shared.fail_appends.load(Ordering::SeqCst) {
      return Err(LogError::Unavailable("appends are failing".into()));
    }
    let mut state = self.shared.lock();
    let Topic { records, next_offset, groups } = state.topics.entry(topic.to_string()).or_default();
    let offset = *next_offset;
    *next_offset += 1;
    records.insert(offset, Arc::from(record));
    for (name, group) in groups.iter_mut() {
      let at = Address { shared: &self.shared, topic, group: name };
      group.dispatch(&at, records, offset, false);
    }
    Ok(())
  }

  async fn subscribe(&self, topic: &str, group: &str) -> Result<RecordStream, LogError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut state = self.shared.lock();
    let member = state.next_member;
    state.next_member += 1;

    let Topic { records, groups, .. } = state.topics.entry(topic.to_string()).or_default();
    let entry = groups.entry(group.to_string()).or_insert_with(|| Group {
      // a new group replays everything retained
      ready: records.keys().map(|offset| (*offset, false)).collect(),
      ..Group::default()
    });
    entry.members.push(Member { id: member, tx });

    let at = Address { shared: &self.shared, topic, group };
    for (offset, redelivered) in std::mem::take(&mut entry.ready) {
      entry.dispatch(&at, records, offset, redelivered);
    }
    debug!(topic, group, member, "memory log subscription opened");

    let subscription = Subscription {
      rx: UnboundedReceiverStream::new(rx),
      shared: Arc::downgrade(&self.shared),
      topic: topic.to_string(),
      group: group.to_string(),
      member,
    };
    Ok(subscription.boxed())
  }
}

struct Subscription {
  rx: UnboundedReceiverStream<LogRecord>,
  shared: Weak<Shared>,
  topic: String,
  group: String,
  member: u64,
}

impl Stream for Subscription {
  type Item = Result<LogRecord, LogError>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    Pin::new(&mut self.get_mut().rx).poll_next(cx).map(|record| record.map(Ok))
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    let Some(shared) = self.shared.upgrade() else { return };
    let mut state = shared.lock();
    let Some(Topic { records, groups, .. }) = state.topics.get_mut(&self.topic) else { return };
    let Some(group) = groups.get_mut(&self.group) else { return };

    group.members.retain(|m| m.id != self.member);
    let mut orphaned: Vec<usize> =
      group.unacked.iter().filter(|(_, holder)| **holder == self.member).map(|(offset, _)| *offset).collect();
    orphaned.sort_unstable();

    let at = Address { shared: &shared, topic: &self.topic, group: &self.group };
    for offset in orphaned {
      group.unacked.remove(&offset);
      group.dispatch(&at, records, offset, true);
    }
    debug!(topic = %self.topic, group = %self.group, member = self.member, "memory log subscription closed");
  }
}

struct MemoryAck {
  shared: Weak<Shared>,
  topic: String,
  group: String,
  offset: usize,
  member: u64,
}

#[async_trait]
impl Acknowledge for MemoryAck {
  async fn ack(&self) -> Result<(), LogError> {
    let shared = self.shared.upgrade().ok_or_else(|| LogError::Unavailable("log dropped".into()))?;
    let mut state = shared.lock();
    let Some(topic) = state.topics.get_mut(&self.topic) else { return Ok(()) };
    let Some(group) = topic.groups.get_mut(&self.group) else { return Ok(()) };
    // a record already handed to another member stays with that member
    if group.unacked.get(&self.offset) == Some(&self.member) {
      group.unacked.remove(&self.offset);
      topic.release_if_done(self.offset);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::FutureExt;

  async fn next(stream: &mut RecordStream) -> LogRecord {
    stream.next().await.unwrap().unwrap()
  }

  fn pending(stream: &mut RecordStream) -> bool {
    stream.next().now_or_never().is_none()
  }

  #[tokio::test]
  async fn new_groups_replay_retained_records() {
    let log = MemoryLog::new();
    log.append("tasks", b"one").await.unwrap();
    log.append("tasks", b"two").await.unwrap();

    let mut sub = log.subscribe("tasks", "g").await.unwrap();
    assert_eq!(next(&mut sub).await.data(), b"one");
    assert_eq!(next(&mut sub).await.data(), b"two");
    assert!(pending(&mut sub));
  }

  #[tokio::test]
  async fn each_record_goes_to_one_member_of_a_group() {
    let log = MemoryLog::new();
    let mut a = log.subscribe("tasks", "g").await.unwrap();
    let mut b = log.subscribe("tasks", "g").await.unwrap();
    let mut other = log.subscribe("tasks", "audit").await.unwrap();

    log.append("tasks", b"one").await.unwrap();
    log.append("tasks", b"two").await.unwrap();

    let first = next(&mut a).await;
    let second = next(&mut b).await;
    assert_ne!(first.data(), second.data());
    assert!(pending(&mut a) && pending(&mut b));

    assert_eq!(next(&mut other).await.data(), b"one");
    assert_eq!(next(&mut other).await.data(), b"two");
  }

  #[tokio::test]
  async fn unacked_records_move_on_when_a_member_leaves() {
    let log = MemoryLog::new();
    let mut a = log.subscribe("tasks", "g").await.unwrap();
    log.append("tasks", b"kept").await.unwrap();
    log.append("tasks", b"orphaned").await.unwrap();

    next(&mut a).await.ack().await.unwrap();
    let _held = next(&mut a).await;
    assert_eq!(log.outstanding("tasks", "g"), 1);
    drop(a);

    let mut b = log.subscribe("tasks", "g").await.unwrap();
    let record = next(&mut b).await;
    assert_eq!(record.data(), b"orphaned");
    assert!(record.redelivered());
    assert!(pending(&mut b));

    record.ack().await.unwrap();
    assert_eq!(log.outstanding("tasks", "g"), 0);
  }

  #[tokio::test]
  async fn records_are_released_once_every_group_acks() {
    let log = MemoryLog::new();
    let mut workers = log.subscribe("tasks", "g").await.unwrap();
    let mut audit = log.subscribe("tasks", "audit").await.unwrap();
    for _ in 0..100 {
      log.append("tasks", b"task").await.unwrap();
    }
    assert_eq!(log.record_count("tasks"), 100);

    for _ in 0..100 {
      next(&mut workers).await.ack().await.unwrap();
    }
    // still owed to the audit group
    assert_eq!(log.record_count("tasks"), 100);

    for _ in 0..100 {
      next(&mut audit).await.ack().await.unwrap();
    }
    assert_eq!(log.record_count("tasks"), 0);
    assert_eq!(log.outstanding("tasks", "g"), 0);

    let mut late = log.subscribe("tasks", "late").await.unwrap();
    assert!(pending(&mut late));
  }

  #[tokio::test]
  async fn closed_subscriptions_end_and_give_back_their_records() {
    let log = MemoryLog::new();
    let mut sub = log.subscribe("tasks", "g").await.unwrap();
    log.append("tasks", b"held").await.unwrap();
    let stale = next(&mut sub).await;

    log.close_subscriptions();
    assert!(sub.next().await.is_none());
    drop(sub);

    let mut again = log.subscribe("tasks", "g").await.unwrap();
    let record = next(&mut again).await;
    assert_eq!(record.data(), b"held");
    assert!(record.redelivered());

    // the copy from the closed subscription no longer settles anything
    stale.ack().await.unwrap();
    assert_eq!(log.outstanding("tasks", "g"), 1);
    record.ack().await.unwrap();
    assert_eq!(log.outstanding("tasks", "g"), 0);
    assert_eq!(log.record_count("tasks"), 0);
  }

  #[tokio::test]
  async fn failing_appends_write_nothing() {
    let log = MemoryLog::new();
    log.fail_appends(true);
    assert!(log.append("tasks", b"lost").await.is_err());
    assert_eq!(log.record_count("tasks"), 0);

    log.fail_appends(false);
    log.append("tasks", b"kept").await.unwrap();
    assert_eq!(log.record_count("tasks"), 1);
  }
}
