//! Slab arena for free-list nodes. Nodes are addressed by index plus a
//! generation counter, so a stale reference to a reclaimed slot is
//! detected instead of silently reading another node's data.

use trunkfs_types::{TrunkFullInfo, TrunkStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeRef {
    index: u32,
    gen: u32,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TrunkNode {
    pub info: TrunkFullInfo,
    pub status: TrunkStatus,
}

struct Slot {
    gen: u32,
    node: Option<TrunkNode>,
}

#[derive(Default)]
pub(crate) struct NodeArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl NodeArena {
    pub fn insert(&mut self, node: TrunkNode) -> NodeRef {
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeRef {
                    index,
                    gen: slot.gen,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    gen: 0,
                    node: Some(node),
                });
                NodeRef { index, gen: 0 }
            }
        }
    }

    pub fn get(&self, node_ref: NodeRef) -> Option<&TrunkNode> {
        let slot = self.slots.get(node_ref.index as usize)?;
        if slot.gen != node_ref.gen {
            return None;
        }
        slot.node.as_ref()
    }

    pub fn get_mut(&mut self, node_ref: NodeRef) -> Option<&mut TrunkNode> {
        let slot = self.slots.get_mut(node_ref.index as usize)?;
        if slot.gen != node_ref.gen {
            return None;
        }
        slot.node.as_mut()
    }

    /// Reclaim the slot; the generation bump invalidates outstanding
    /// references.
    pub fn remove(&mut self, node_ref: NodeRef) -> Option<TrunkNode> {
        let slot = self.slots.get_mut(node_ref.index as usize)?;
        if slot.gen != node_ref.gen {
            return None;
        }
        let node = slot.node.take()?;
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(node_ref.index);
        self.live -= 1;
        Some(node)
    }

    pub fn len(&self) -> usize {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use trunkfs_types::{TrunkFileInfo, TrunkPathInfo};

    use super::*;

    fn node(offset: u32, size: u32) -> TrunkNode {
        TrunkNode {
            info: TrunkFullInfo {
                path: TrunkPathInfo::default(),
                file: TrunkFileInfo {
                    id: 1,
                    offset,
                    size,
                },
            },
            status: TrunkStatus::Free,
        }
    }

    #[test]
    fn stale_ref_is_rejected_after_reuse() {
        let mut arena = NodeArena::default();
        let first = arena.insert(node(0, 100));
        assert!(arena.remove(first).is_some());

        // The freed index is reused with a bumped generation.
        let second = arena.insert(node(100, 200));
        assert_eq!(arena.len(), 1);
        assert!(arena.get(first).is_none());
        assert!(arena.remove(first).is_none());
        assert_eq!(arena.get(second).unwrap().info.file.offset, 100);
    }

    #[test]
    fn get_mut_updates_in_place() {
        let mut arena = NodeArena::default();
        let r = arena.insert(node(0, 100));
        arena.get_mut(r).unwrap().status = TrunkStatus::Hold;
        assert_eq!(arena.get(r).unwrap().status, TrunkStatus::Hold);
    }
}
