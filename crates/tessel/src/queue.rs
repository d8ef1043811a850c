use crate::DfeError;
use ash::vk;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::{
    fmt::Display,
    ops::{BitOr, BitOrAssign},
};

///Upper bound of queues that can be registered. Limited by the width of [QueueMask].
pub const MAX_QUEUES: usize = 32;

///Dense index of a registered queue.
#[derive(Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub struct QueueIndex(pub(crate) u8);

impl QueueIndex {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Display for QueueIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "QueueIndex({})", self.0)
    }
}

///Bitset over registered queues. Bit `n` represents the queue with [QueueIndex] `n`.
#[derive(Hash, PartialEq, Eq, Debug, Clone, Copy, Default)]
pub struct QueueMask(pub u32);

impl QueueMask {
    pub const EMPTY: QueueMask = QueueMask(0);
    ///Every queue, including queues that are not registered yet.
    pub const ALL: QueueMask = QueueMask(u32::MAX);

    pub fn from_index(index: QueueIndex) -> Self {
        QueueMask(1 << index.0)
    }

    pub fn with(self, index: QueueIndex) -> Self {
        self | QueueMask::from_index(index)
    }

    pub fn contains(&self, index: QueueIndex) -> bool {
        (self.0 & (1 << index.0)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    ///True if every queue of `self` is also part of `completed`.
    pub fn is_satisfied_by(&self, completed: QueueMask) -> bool {
        (self.0 & completed.0) == self.0
    }
}

impl BitOr for QueueMask {
    type Output = QueueMask;
    fn bitor(self, rhs: Self) -> Self::Output {
        QueueMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for QueueMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

impl From<QueueIndex> for QueueMask {
    fn from(index: QueueIndex) -> Self {
        QueueMask::from_index(index)
    }
}

impl Display for QueueMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "QueueMask({:#b})", self.0)
    }
}

///Maps queue handles to [QueueIndex]s. Queues are registered on first sight and keep their index for the lifetime
/// of the registry.
pub struct QueueRegistry {
    max_queues: usize,
    queues: RwLock<SmallVec<[vk::Queue; 8]>>,
}

impl QueueRegistry {
    ///Creates a registry for at most `max_queues` queues. Clamped to [MAX_QUEUES].
    pub fn new(max_queues: usize) -> Self {
        QueueRegistry {
            max_queues: max_queues.min(MAX_QUEUES),
            queues: RwLock::new(SmallVec::new()),
        }
    }

    ///Returns the index of `queue`, registering it if it is seen for the first time.
    pub fn index_of(&self, queue: vk::Queue) -> Result<QueueIndex, DfeError> {
        if let Some(idx) = self.lookup(queue) {
            return Ok(idx);
        }

        let mut queues = self.queues.write();
        //might have been registered while we waited for the lock
        if let Some(idx) = queues.iter().position(|q| *q == queue) {
            return Ok(QueueIndex(idx as u8));
        }

        if queues.len() >= self.max_queues {
            #[cfg(feature = "logging")]
            log::error!(
                "Can't register queue {:?}, already tracking {} queues",
                queue,
                queues.len()
            );
            return Err(DfeError::TooManyQueues {
                max: self.max_queues,
            });
        }

        let idx = QueueIndex(queues.len() as u8);
        queues.push(queue);

        #[cfg(feature = "logging")]
        log::info!("Registered queue {:?} as {}", queue, idx);

        Ok(idx)
    }

    ///Returns the index of `queue` without registering it.
    pub fn lookup(&self, queue: vk::Queue) -> Option<QueueIndex> {
        self.queues
            .read()
            .iter()
            .position(|q| *q == queue)
            .map(|idx| QueueIndex(idx as u8))
    }

    ///Like [lookup](Self::lookup), but treats an unregistered queue as an error.
    pub fn known_index(&self, queue: vk::Queue) -> Result<QueueIndex, DfeError> {
        self.lookup(queue).ok_or(DfeError::UnknownQueue(queue))
    }

    pub fn queue(&self, index: QueueIndex) -> Option<vk::Queue> {
        self.queues.read().get(index.index()).copied()
    }

    pub fn len(&self) -> usize {
        self.queues.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_queues(&self) -> usize {
        self.max_queues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use static_assertions::assert_impl_all;

    #[test]
    fn impl_send_sync() {
        assert_impl_all!(QueueRegistry: Send, Sync);
    }

    #[test]
    fn stable_dense_indices() {
        let reg = QueueRegistry::new(4);
        let a = vk::Queue::from_raw(0xa);
        let b = vk::Queue::from_raw(0xb);

        assert_eq!(reg.index_of(a).unwrap().index(), 0);
        assert_eq!(reg.index_of(b).unwrap().index(), 1);
        assert_eq!(reg.index_of(a).unwrap().index(), 0);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.queue(QueueIndex(1)), Some(b));
    }

    #[test]
    fn bounded_registration() {
        let reg = QueueRegistry::new(2);
        reg.index_of(vk::Queue::from_raw(1)).unwrap();
        reg.index_of(vk::Queue::from_raw(2)).unwrap();
        assert_eq!(
            reg.index_of(vk::Queue::from_raw(3)),
            Err(DfeError::TooManyQueues { max: 2 })
        );
        //known queues still resolve
        assert!(reg.index_of(vk::Queue::from_raw(2)).is_ok());
        assert_eq!(
            reg.known_index(vk::Queue::from_raw(3)),
            Err(DfeError::UnknownQueue(vk::Queue::from_raw(3)))
        );
    }

    #[test]
    fn mask_satisfaction() {
        let m = QueueMask(0b11);
        assert!(!m.is_satisfied_by(QueueMask(0b01)));
        assert!(m.is_satisfied_by(QueueMask(0b111)));
        assert!(QueueMask::EMPTY.is_satisfied_by(QueueMask::EMPTY));
        assert!(QueueMask(0b10).contains(QueueIndex(1)));
    }

    #[test]
    fn max_is_clamped() {
        assert_eq!(QueueRegistry::new(100).max_queues(), MAX_QUEUES);
    }
}
