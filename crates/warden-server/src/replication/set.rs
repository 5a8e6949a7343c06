//! In-process replica set.
//!
//! Members are [`Node`]s in the same process. The primary pushes every
//! committed entry to the live secondaries; a secondary whose log no longer
//! extends from the primary's rolls back first. Elections are explicit.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{info, warn};
use warden_common::{Result, WardenError};

use super::{
    LogEntry, LogPosition, MemberId, MemberState, MemberStatusReport, ReplSetStatus,
    ReplicaSetControl,
};
use crate::config::Config;
use crate::node::Node;

/// Shape of one member.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberSpec {
    /// Votes in elections but holds no data
    pub arbiter: bool,
}

impl MemberSpec {
    pub fn data() -> Self {
        Self { arbiter: false }
    }

    pub fn arbiter() -> Self {
        Self { arbiter: true }
    }
}

struct Member {
    spec: MemberSpec,
    name: String,
    config: Config,
    node: Option<Arc<Node>>,
    up: bool,
}

impl Member {
    fn is_voter(&self) -> bool {
        self.spec.arbiter || self.node.as_ref().is_none_or(|n| n.is_voting())
    }
}

pub struct ReplicaSet {
    name: String,
    members: RwLock<Vec<Member>>,
    term: AtomicU64,
    /// Signalled whenever a member's log grows
    progress: Notify,
    this: Weak<ReplicaSet>,
}

impl ReplicaSet {
    /// Start every member as a secondary.
    ///
    /// With `base_dir`, each data member keeps its WAL under
    /// `base_dir/member-<id>` and survives restarts. Without it members are
    /// in-memory and come back empty.
    pub fn start(
        name: &str,
        specs: &[MemberSpec],
        template: &Config,
        base_dir: Option<&Path>,
    ) -> Result<Arc<Self>> {
        if specs.is_empty() {
            return Err(WardenError::Config("replica set needs at least one member".into()));
        }

        let mut members = Vec::with_capacity(specs.len());
        for (id, spec) in specs.iter().enumerate() {
            let mut config = template.clone();
            config.replication.set_name = Some(name.to_string());
            config.node.name = format!("{name}-{id}");
            config.storage.data_dir = base_dir.map(|dir| dir.join(format!("member-{id}")));

            let node = if spec.arbiter {
                None
            } else {
                Some(Arc::new(Node::open(config.clone(), id)?))
            };
            members.push(Member {
                spec: *spec,
                name: config.node.name.clone(),
                config,
                node,
                up: true,
            });
        }

        let term = members
            .iter()
            .filter_map(|m| m.node.as_ref())
            .map(|n| n.term())
            .max()
            .unwrap_or(0);

        let set = Arc::new_cyclic(|this: &Weak<ReplicaSet>| {
            let control: Weak<dyn ReplicaSetControl> = this.clone();
            for node in members.iter().filter_map(|m| m.node.as_ref()) {
                node.attach(control.clone());
            }
            ReplicaSet {
                name: name.to_string(),
                members: RwLock::new(members),
                term: AtomicU64::new(term),
                progress: Notify::new(),
                this: this.clone(),
            }
        });

        info!(set = name, members = specs.len(), "Replica set started");
        Ok(set)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    pub fn term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    /// The running node of member `id`, if it holds data and is up.
    pub fn node(&self, id: MemberId) -> Option<Arc<Node>> {
        self.members.read().get(id).and_then(|m| m.node.clone())
    }

    pub fn primary(&self) -> Option<Arc<Node>> {
        self.live_nodes()
            .into_iter()
            .map(|(_, node)| node)
            .find(|node| node.is_primary())
    }

    /// Make member `id` primary in a new term. Any other primary steps down
    /// and the remaining members sync from the winner.
    pub fn elect(&self, id: MemberId) -> Result<u64> {
        let candidate = self.node(id).ok_or_else(|| {
            WardenError::InvalidOperation(format!("member {id} is down or holds no data"))
        })?;
        if candidate.state() == MemberState::Fatal || !candidate.is_voting() {
            return Err(WardenError::InvalidOperation(format!(
                "member {id} is not electable"
            )));
        }

        let (live_voters, majority) = {
            let members = self.members.read();
            let live = members.iter().filter(|m| m.up && m.is_voter()).count();
            (live, majority_of(&members))
        };
        if live_voters < majority {
            return Err(WardenError::NotPrimary(format!(
                "only {live_voters} voters are up, {majority} needed"
            )));
        }

        let term = self
            .live_nodes()
            .iter()
            .map(|(_, n)| n.term())
            .chain(std::iter::once(self.term()))
            .max()
            .unwrap_or(0)
            + 1;
        self.term.store(term, Ordering::SeqCst);

        for (other, node) in self.live_nodes() {
            if other != id {
                node.step_down();
            }
        }
        candidate.become_primary(term)?;
        info!(set = %self.name, member = id, term, "Elected primary");

        self.sync_all();
        Ok(term)
    }

    /// Stop member `id`. Its connections are closed.
    pub fn stop(&self, id: MemberId) {
        let node = {
            let mut members = self.members.write();
            let Some(member) = members.get_mut(id) else {
                return;
            };
            member.up = false;
            member.node.take()
        };
        if let Some(node) = node {
            node.shutdown();
        }
        info!(set = %self.name, member = id, "Member stopped");
    }

    /// Restart member `id` from its WAL and sync it from the primary.
    ///
    /// A member that cannot roll back comes up `FATAL`.
    pub fn restart(&self, id: MemberId) -> Result<Option<Arc<Node>>> {
        let (spec, config) = {
            let members = self.members.read();
            let member = members
                .get(id)
                .ok_or_else(|| WardenError::NotFound(format!("member {id}")))?;
            if member.up {
                return Ok(member.node.clone());
            }
            (member.spec, member.config.clone())
        };

        let node = if spec.arbiter {
            None
        } else {
            let node = Arc::new(Node::open(config, id)?);
            if let Some(this) = self.this.upgrade() {
                let control: Weak<dyn ReplicaSetControl> = Arc::downgrade(&(this as Arc<dyn ReplicaSetControl>));
                node.attach(control);
            }
            Some(node)
        };

        {
            let mut members = self.members.write();
            if let Some(member) = members.get_mut(id) {
                member.node = node.clone();
                member.up = true;
            }
        }
        info!(set = %self.name, member = id, "Member restarted");

        if node.is_some()
            && let Err(e) = self.sync_member(id)
        {
            warn!(set = %self.name, member = id, error = %e, "Member could not sync after restart");
        }
        Ok(node)
    }

    /// Bring member `id` up to date with the primary.
    pub fn sync_member(&self, id: MemberId) -> Result<usize> {
        let (Some(primary), Some(target)) = (self.primary(), self.node(id)) else {
            return Ok(0);
        };
        if primary.id() == target.id() {
            return Ok(0);
        }
        let applied = target.sync_from(&primary.log_view());
        self.progress.notify_waiters();
        applied
    }

    fn sync_all(&self) {
        for (id, node) in self.live_nodes() {
            if node.is_primary() || !node.state().is_readable() {
                continue;
            }
            if let Err(e) = self.sync_member(id) {
                warn!(set = %self.name, member = id, error = %e, "Member sync failed");
            }
        }
    }

    /// Wait until every live data member holds the primary's last entry.
    pub async fn await_replication(&self, timeout: Duration) -> Result<()> {
        let primary = self
            .primary()
            .ok_or_else(|| WardenError::NotPrimary("replica set has no primary".into()))?;
        self.sync_all();
        let target = primary.storage().last_position();
        let live = self
            .live_nodes()
            .iter()
            .filter(|(_, n)| n.state().is_readable())
            .count();
        self.await_acks(primary.id(), target, live, timeout).await
    }

    fn live_nodes(&self) -> Vec<(MemberId, Arc<Node>)> {
        self.members
            .read()
            .iter()
            .enumerate()
            .filter(|(_, m)| m.up)
            .filter_map(|(id, m)| m.node.clone().map(|n| (id, n)))
            .collect()
    }

    /// Data-bearing members that hold the entry at `position`.
    fn ack_count(&self, position: LogPosition) -> usize {
        self.live_nodes()
            .iter()
            .filter(|(_, n)| n.state().is_readable() && n.storage().contains(position))
            .count()
    }
}

fn majority_of(members: &[Member]) -> usize {
    members.iter().filter(|m| m.is_voter()).count() / 2 + 1
}

#[async_trait]
impl ReplicaSetControl for ReplicaSet {
    fn append_log_entry(&self, origin: MemberId, entry: &LogEntry) -> Result<()> {
        let source = self
            .node(origin)
            .ok_or_else(|| WardenError::NotPrimary(format!("member {origin} is down")))?;
        let view = source.log_view();

        for (id, target) in self.live_nodes() {
            if id == origin || !target.state().is_readable() || target.is_primary() {
                continue;
            }
            if let Err(e) = target.sync_from(&view) {
                warn!(
                    set = %self.name,
                    member = id,
                    position = %entry.position,
                    error = %e,
                    "Replication to member failed"
                );
            }
        }
        self.progress.notify_waiters();
        Ok(())
    }

    async fn await_majority_ack(
        &self,
        origin: MemberId,
        position: LogPosition,
        timeout: Duration,
    ) -> Result<()> {
        let majority = majority_of(&self.members.read());
        self.await_acks(origin, position, majority, timeout).await
    }

    async fn await_acks(
        &self,
        _origin: MemberId,
        position: LogPosition,
        count: usize,
        timeout: Duration,
    ) -> Result<()> {
        let started = Instant::now();
        let wait = async {
            loop {
                let notified = self.progress.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.ack_count(position) >= count {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| WardenError::WriteConcernTimeout {
                position: position.to_string(),
                waited_ms: started.elapsed().as_millis() as u64,
            })
    }

    fn status(&self) -> ReplSetStatus {
        let members = self
            .members
            .read()
            .iter()
            .enumerate()
            .map(|(id, m)| match &m.node {
                Some(node) => node.status_report(),
                None => MemberStatusReport {
                    id,
                    name: m.name.clone(),
                    state: if m.up {
                        MemberState::Secondary
                    } else {
                        MemberState::Down
                    },
                    last_applied: LogPosition::ZERO,
                    voting: m.is_voter(),
                    arbiter: m.spec.arbiter,
                },
            })
            .collect();

        ReplSetStatus {
            set: self.name.clone(),
            term: self.term(),
            members,
        }
    }
}
