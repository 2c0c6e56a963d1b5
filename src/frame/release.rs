// Deferred release
//
// Objects removed from the scene may still be referenced by command buffers
// of frames in flight. They park here, one list per frame slot, and are
// dropped only after that slot's fence has been waited on again.

use crate::scene::{ObjectId, Retired};

#[derive(Default)]
pub struct DeferredRelease {
    lists: Vec<Vec<Retired>>,
}

impl DeferredRelease {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            lists: (0..frames_in_flight).map(|_| Vec::new()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Parks objects retired while recording into `slot`.
    pub fn schedule(&mut self, slot: usize, retired: impl IntoIterator<Item = Retired>) {
        self.lists[slot].extend(retired);
    }

    /// Drops everything parked for `slot`. Call only after its fence wait.
    pub fn release(&mut self, slot: usize) -> usize {
        let released = self.lists[slot].len();
        if released > 0 {
            log::debug!("Releasing {} deferred objects from slot {}", released, slot);
        }
        self.lists[slot].clear();
        released
    }

    pub fn pending(&self, slot: usize) -> usize {
        self.lists[slot].len()
    }

    pub fn contains(&self, slot: usize, id: ObjectId) -> bool {
        self.lists[slot].iter().any(|retired| retired.id == id)
    }

    /// Drops every list. Call only after the GPU is idle.
    pub fn release_all(&mut self) -> usize {
        (0..self.lists.len()).map(|slot| self.release(slot)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Blend, Scene};
    use crate::scene::testing::Quad;
    use std::sync::Arc;

    fn retire(scene: &mut Scene) -> (ObjectId, Vec<Retired>) {
        let quad = Arc::new(Quad::default());
        let id = scene.add_object(quad, Blend::Opaque, true);
        scene.remove(id);
        (id, scene.take_retired())
    }

    #[test]
    fn objects_stay_parked_until_their_slot_comes_around() {
        let mut scene = Scene::default();
        let mut deferred = DeferredRelease::new(2);

        let (id, retired) = retire(&mut scene);
        deferred.schedule(1, retired);
        assert!(deferred.contains(1, id));
        assert_eq!(deferred.pending(0), 0);

        assert_eq!(deferred.release(0), 0);
        assert!(deferred.contains(1, id));
        assert_eq!(deferred.release(1), 1);
        assert!(!deferred.contains(1, id));
    }

    #[test]
    fn release_drops_the_last_reference() {
        let mut scene = Scene::default();
        let mut deferred = DeferredRelease::new(3);
        let quad = Arc::new(Quad::default());
        let id = scene.add_object(quad.clone(), Blend::Opaque, true);
        scene.remove(id);
        deferred.schedule(2, scene.take_retired());

        assert!(Arc::strong_count(&quad) > 1);
        deferred.release_all();
        assert_eq!(Arc::strong_count(&quad), 1);
    }
}
