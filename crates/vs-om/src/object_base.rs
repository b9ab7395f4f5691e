//! The contract every object family implements, and the reference wrapper
//! client sets hold.

use crate::om::Om;
use std::sync::Arc;

/// Behaviour the engine requires of every interned object.
///
/// `sweep` and `replay` run on canonical instances only; a family's
/// destructor calls `sweep` when the last client reference drops.
pub trait ObjectBase: std::fmt::Display + Send + Sync + 'static {
    /// Enqueue delete commands if the object is programmed in the forwarder.
    fn sweep(&self);

    /// Re-enqueue create commands from current desired state.
    fn replay(&self);
}

/// Interning and diffing hooks the OM drives during commit.
pub trait OmObject: ObjectBase + Sized {
    /// Tag naming the family in client reference sets.
    const FAMILY: &'static str;

    /// Return the canonical instance matching this desired state,
    /// constructing and registering it when absent.
    fn singular(&self, om: &Om) -> Arc<Self>;

    /// Diff desired state against current HW items and enqueue commands.
    fn update(&self, desired: &Self);
}

/// A reference to an object held by one client, with the mark-and-sweep
/// state bit.  The bit is not part of identity; identity is the pointer.
pub struct ObjectRef {
    obj: Arc<dyn ObjectBase>,
    stale: bool,
}

impl ObjectRef {
    pub fn new(obj: Arc<dyn ObjectBase>) -> Self {
        ObjectRef { obj, stale: false }
    }

    pub fn obj(&self) -> &Arc<dyn ObjectBase> {
        &self.obj
    }

    /// Mark the referenced object as stale.
    pub fn mark(&mut self) {
        self.stale = true;
    }

    /// Clear the stale flag (the object was re-committed this epoch).
    pub fn clear(&mut self) {
        self.stale = false;
    }

    pub fn stale(&self) -> bool {
        self.stale
    }

    /// Pointer identity, used for set membership.
    pub(crate) fn ptr_id(&self) -> usize {
        Arc::as_ptr(&self.obj).cast::<()>() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;

    impl std::fmt::Display for Dummy {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("dummy")
        }
    }

    impl ObjectBase for Dummy {
        fn sweep(&self) {}
        fn replay(&self) {}
    }

    #[test]
    fn stale_bit_is_not_identity() {
        let obj: Arc<dyn ObjectBase> = Arc::new(Dummy);
        let mut a = ObjectRef::new(obj.clone());
        let b = ObjectRef::new(obj);
        a.mark();
        assert!(a.stale());
        assert!(!b.stale());
        assert_eq!(a.ptr_id(), b.ptr_id());
        a.clear();
        assert!(!a.stale());
    }
}
