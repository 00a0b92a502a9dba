//! In-process message fabric connecting the ranks of one job
//!
//! Every (context, plane, source, destination, tag) combination owns one
//! queue. A sender waits for the receiver to acknowledge the message, so a
//! send completes only once the receiver has taken it. Aborting the job
//! closes the abort channel, which wakes every blocked send and receive.
//!
//! The queues of a group are dropped once every member has released it.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use conv::ConvUtil;
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::error::{Error, FailureKind, Result};
use crate::topology::Rank;
use crate::transport::{Packet, Plane, Transfer, Transport};
use crate::Tag;

/// Identifies a communication context.
pub(crate) type ContextId = u64;

/// Context of the world communicator
pub(crate) const WORLD_CONTEXT: ContextId = 0;

/// Addresses one queue; ranks are world ranks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
struct LinkKey {
    context: ContextId,
    plane: Plane,
    source: Rank,
    destination: Rank,
    tag: Tag,
}

impl LinkKey {
    fn disconnected(&self) -> Error {
        Error::Disconnected {
            source_rank: self.source,
            destination: self.destination,
        }
    }
}

struct Envelope {
    packet: Packet,
    taken: Sender<()>,
}

struct Link {
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
}

type GroupKey = (ContextId, Tag, Vec<Rank>);

struct Group {
    key: GroupKey,
    remaining: usize,
}

#[derive(Default)]
struct Contexts {
    ids: HashMap<GroupKey, ContextId>,
    groups: HashMap<ContextId, Group>,
    next: ContextId,
}

pub(crate) struct Fabric {
    names: Vec<String>,
    links: Mutex<HashMap<LinkKey, Link>>,
    contexts: Mutex<Contexts>,
    abort_tx: Mutex<Option<Sender<()>>>,
    abort_rx: Receiver<()>,
    abort_code: OnceCell<i32>,
}

impl Fabric {
    /// A fabric for one rank per entry of `names`, each naming the rank's node.
    pub fn new(names: Vec<String>) -> Fabric {
        let (abort_tx, abort_rx) = bounded(0);
        Fabric {
            names,
            links: Mutex::new(HashMap::new()),
            contexts: Mutex::new(Contexts {
                next: WORLD_CONTEXT + 1,
                ..Contexts::default()
            }),
            abort_tx: Mutex::new(Some(abort_tx)),
            abort_rx,
            abort_code: OnceCell::new(),
        }
    }

    pub fn processor_name(&self, rank: Rank) -> &str {
        usize::try_from(rank)
            .ok()
            .and_then(|rank| self.names.get(rank))
            .map_or("", String::as_str)
    }

    fn endpoints(&self, key: LinkKey) -> (Sender<Envelope>, Receiver<Envelope>) {
        let mut links = self.links.lock();
        let link = links.entry(key).or_insert_with(|| {
            let (tx, rx) = unbounded();
            Link { tx, rx }
        });
        (link.tx.clone(), link.rx.clone())
    }

    /// Queue `packet` on `key`; the returned channel fires once it is taken.
    fn post(&self, key: LinkKey, packet: Packet) -> Result<Receiver<()>> {
        self.check_abort()?;
        let (tx, _rx) = self.endpoints(key);
        let (taken, delivered) = bounded(1);
        tx.send(Envelope { packet, taken })
            .map_err(|_| key.disconnected())?;
        Ok(delivered)
    }

    fn await_delivery(&self, key: LinkKey, delivered: &Receiver<()>) -> Result<()> {
        select! {
            recv(delivered) -> taken => taken.map_err(|_| key.disconnected()),
            recv(self.abort_rx) -> _ => Err(self.aborted()),
        }
    }

    /// Hand `packet` to the receiver of `key`, blocking until it is taken.
    fn send(&self, key: LinkKey, packet: Packet) -> Result<()> {
        let delivered = self.post(key, packet)?;
        self.await_delivery(key, &delivered)
    }

    /// Take the next packet queued on `key`, blocking until one arrives.
    fn receive(&self, key: LinkKey) -> Result<Packet> {
        self.check_abort()?;
        let (_tx, rx) = self.endpoints(key);
        select! {
            recv(rx) -> envelope => match envelope {
                Ok(envelope) => {
                    // the sender may have given up already
                    let _ = envelope.taken.send(());
                    Ok(envelope.packet)
                }
                Err(_) => Err(key.disconnected()),
            },
            recv(self.abort_rx) -> _ => Err(self.aborted()),
        }
    }

    fn has_message(&self, key: LinkKey) -> bool {
        !self.endpoints(key).1.is_empty()
    }

    /// The context shared by every member creating a group from the same
    /// parent, tag and member list.
    pub fn context(&self, parent: ContextId, tag: Tag, members: &[Rank]) -> ContextId {
        let mut contexts = self.contexts.lock();
        let key = (parent, tag, members.to_vec());
        if let Some(&id) = contexts.ids.get(&key) {
            return id;
        }
        let id = contexts.next;
        contexts.next += 1;
        contexts.ids.insert(key.clone(), id);
        contexts.groups.insert(
            id,
            Group {
                key,
                remaining: members.len(),
            },
        );
        debug!(parent, tag, context = id, members = members.len(), "new context");
        id
    }

    /// One member is done with `context`; the last one drops its queues.
    fn release(&self, context: ContextId) {
        let mut contexts = self.contexts.lock();
        let Some(group) = contexts.groups.get_mut(&context) else {
            return;
        };
        group.remaining = group.remaining.saturating_sub(1);
        if group.remaining > 0 {
            return;
        }
        if let Some(group) = contexts.groups.remove(&context) {
            contexts.ids.remove(&group.key);
        }
        drop(contexts);
        self.links.lock().retain(|key, _| key.context != context);
        debug!(context, "released context");
    }

    /// Abort the job. The first code wins; later calls only return it.
    pub fn abort(&self, code: i32) -> Error {
        if self.abort_code.set(code).is_ok() {
            error!(code, reason = ?FailureKind::from_code(code), "aborting job");
        }
        self.abort_tx.lock().take();
        self.aborted()
    }

    pub fn abort_code(&self) -> Option<i32> {
        self.abort_code.get().copied()
    }

    fn check_abort(&self) -> Result<()> {
        match self.abort_code() {
            Some(code) => Err(Error::Aborted { code }),
            None => Ok(()),
        }
    }

    fn aborted(&self) -> Error {
        Error::Aborted {
            code: self.abort_code().unwrap_or(FailureKind::Setup.code()),
        }
    }
}

/// One rank's view of a communicator on the fabric
pub(crate) struct Endpoint {
    fabric: Arc<Fabric>,
    context: ContextId,
    members: Vec<Rank>,
    rank: Rank,
}

impl Endpoint {
    /// Rank `rank` of the world communicator of `fabric`.
    pub fn world(fabric: Arc<Fabric>, size: Rank, rank: Rank) -> Endpoint {
        Endpoint {
            fabric,
            context: WORLD_CONTEXT,
            members: (0..size).collect(),
            rank,
        }
    }

    fn world_rank(&self, rank: Rank) -> Result<Rank> {
        usize::try_from(rank)
            .ok()
            .and_then(|index| self.members.get(index))
            .copied()
            .ok_or(Error::InvalidRank {
                rank,
                size: self.members.len().value_as::<Rank>().unwrap_or(Rank::MAX),
            })
    }

    fn key(&self, plane: Plane, source: Rank, destination: Rank, tag: Tag) -> Result<LinkKey> {
        Ok(LinkKey {
            context: self.context,
            plane,
            source: self.world_rank(source)?,
            destination: self.world_rank(destination)?,
            tag,
        })
    }
}

impl Transport for Endpoint {
    fn send(&self, plane: Plane, destination: Rank, tag: Tag, packet: Packet) -> Result<()> {
        let key = self.key(plane, self.rank, destination, tag)?;
        trace!(?key, count = packet.count, "send");
        self.fabric.send(key, packet)
    }

    fn receive(&self, plane: Plane, source: Rank, tag: Tag) -> Result<Packet> {
        let key = self.key(plane, source, self.rank, tag)?;
        let packet = self.fabric.receive(key)?;
        trace!(?key, count = packet.count, "receive");
        Ok(packet)
    }

    fn post_send(
        &self,
        plane: Plane,
        destination: Rank,
        tag: Tag,
        packet: Packet,
    ) -> Result<Box<dyn Transfer>> {
        let key = self.key(plane, self.rank, destination, tag)?;
        let delivered = self.fabric.post(key, packet)?;
        Ok(Box::new(PostedSend {
            fabric: Arc::clone(&self.fabric),
            key,
            delivered,
        }))
    }

    fn post_receive(&self, plane: Plane, source: Rank, tag: Tag) -> Result<Box<dyn Transfer>> {
        let key = self.key(plane, source, self.rank, tag)?;
        Ok(Box::new(PostedReceive {
            fabric: Arc::clone(&self.fabric),
            key,
        }))
    }

    fn create_group(&self, ranks: &[Rank], tag: Tag) -> Result<Rc<dyn Transport>> {
        let members = ranks
            .iter()
            .map(|&rank| self.world_rank(rank))
            .collect::<Result<Vec<_>>>()?;
        let rank = ranks
            .iter()
            .position(|&rank| rank == self.rank)
            .and_then(|position| position.value_as::<Rank>().ok())
            .ok_or_else(|| {
                Error::ProtocolDefect(format!(
                    "rank {} creates a group it is not part of",
                    self.rank
                ))
            })?;
        let context = self.fabric.context(self.context, tag, &members);
        Ok(Rc::new(Endpoint {
            fabric: Arc::clone(&self.fabric),
            context,
            members,
            rank,
        }))
    }

    fn abort(&self, code: i32) -> Error {
        self.fabric.abort(code)
    }

    fn abort_code(&self) -> Option<i32> {
        self.fabric.abort_code()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if self.context != WORLD_CONTEXT {
            self.fabric.release(self.context);
        }
    }
}

struct PostedSend {
    fabric: Arc<Fabric>,
    key: LinkKey,
    delivered: Receiver<()>,
}

impl Transfer for PostedSend {
    fn wait(self: Box<Self>) -> Result<Option<Packet>> {
        self.fabric
            .await_delivery(self.key, &self.delivered)
            .map(|()| None)
    }

    fn is_complete(&self) -> bool {
        !self.delivered.is_empty()
    }
}

struct PostedReceive {
    fabric: Arc<Fabric>,
    key: LinkKey,
}

impl Transfer for PostedReceive {
    fn wait(self: Box<Self>) -> Result<Option<Packet>> {
        self.fabric.receive(self.key).map(Some)
    }

    fn is_complete(&self) -> bool {
        self.fabric.has_message(self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn key(tag: Tag) -> LinkKey {
        LinkKey {
            context: WORLD_CONTEXT,
            plane: Plane::PointToPoint,
            source: 0,
            destination: 1,
            tag,
        }
    }

    fn packet(byte: u8) -> Packet {
        Packet {
            signature: 1,
            count: 1,
            bytes: vec![byte],
        }
    }

    #[test]
    fn send_waits_for_receiver() {
        let fabric = Fabric::new(vec!["a".into(), "a".into()]);
        thread::scope(|s| {
            s.spawn(|| fabric.send(key(0), packet(42)).unwrap());
            let packet = fabric.receive(key(0)).unwrap();
            assert_eq!(packet.bytes, vec![42]);
        });
    }

    #[test]
    fn posted_send_completes_once_taken() {
        let fabric = Arc::new(Fabric::new(vec!["a".into(), "a".into()]));
        let sender = Endpoint::world(Arc::clone(&fabric), 2, 0);
        let receiver = Endpoint::world(Arc::clone(&fabric), 2, 1);

        let sent = sender.post_send(Plane::PointToPoint, 1, 3, packet(7)).unwrap();
        assert!(!sent.is_complete());
        let pending = receiver.post_receive(Plane::PointToPoint, 0, 3).unwrap();
        assert!(pending.is_complete());
        assert_eq!(pending.wait().unwrap(), Some(packet(7)));
        assert!(sent.is_complete());
        assert_eq!(sent.wait().unwrap(), None);
    }

    #[test]
    fn abort_wakes_blocked_receiver() {
        let fabric = Fabric::new(vec!["a".into(), "a".into()]);
        thread::scope(|s| {
            let waiter = s.spawn(|| fabric.receive(key(0)));
            fabric.abort(FailureKind::Transport.code());
            let result = waiter.join().unwrap();
            assert!(matches!(result, Err(Error::Aborted { code: 3 })));
        });
        // first code wins
        fabric.abort(FailureKind::Setup.code());
        assert_eq!(fabric.abort_code(), Some(3));
    }

    #[test]
    fn contexts_are_shared_per_member_list() {
        let fabric = Fabric::new(vec!["a".into(); 4]);
        let a = fabric.context(WORLD_CONTEXT, 7, &[0, 2]);
        let b = fabric.context(WORLD_CONTEXT, 7, &[0, 2]);
        let c = fabric.context(WORLD_CONTEXT, 7, &[0, 3]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, WORLD_CONTEXT);
    }

    #[test]
    fn released_groups_leave_no_queues() {
        let fabric = Arc::new(Fabric::new(vec!["a".into(); 3]));
        let first = Endpoint::world(Arc::clone(&fabric), 3, 0);
        let second = Endpoint::world(Arc::clone(&fabric), 3, 2);
        let first = first.create_group(&[0, 2], 7).unwrap();
        let second = second.create_group(&[0, 2], 7).unwrap();

        let sent = first.post_send(Plane::Collective, 1, 0, packet(1)).unwrap();
        assert_eq!(second.receive(Plane::Collective, 0, 0).unwrap(), packet(1));
        sent.wait().unwrap();
        assert_eq!(fabric.links.lock().len(), 1);

        drop(first);
        assert_eq!(fabric.links.lock().len(), 1);
        drop(second);
        assert!(fabric.links.lock().is_empty());
        assert!(fabric.contexts.lock().ids.is_empty());
    }
}
