//! The GL context the bridge runs in.

use std::ffi::c_void;

/// A GL context that shares images with the producer.
///
/// Owned by the embedder; the bridge only makes it current around its own
/// work and resolves entry points through it.
pub trait BridgingContext {
    /// Make the context current on the calling thread. Returns false if that
    /// failed.
    fn make_current(&self) -> bool;

    /// Release the context from the calling thread.
    fn clear_current(&self);

    /// Address of a GL entry point, or null if the driver does not export it.
    fn get_proc_address(&self, name: &str) -> *const c_void;
}

/// Keeps a [`BridgingContext`] current until dropped.
pub struct CurrentContext<'a, C: BridgingContext + ?Sized> {
    context: &'a C,
}

impl<'a, C: BridgingContext + ?Sized> CurrentContext<'a, C> {
    /// `None` if the context could not be made current.
    pub fn acquire(context: &'a C) -> Option<Self> {
        context.make_current().then_some(Self { context })
    }
}

impl<C: BridgingContext + ?Sized> Drop for CurrentContext<'_, C> {
    fn drop(&mut self) {
        self.context.clear_current();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    struct Counting {
        refuse: bool,
        current: Cell<bool>,
        clears: Cell<usize>,
    }

    impl BridgingContext for Counting {
        fn make_current(&self) -> bool {
            self.current.set(!self.refuse);
            !self.refuse
        }

        fn clear_current(&self) {
            self.current.set(false);
            self.clears.set(self.clears.get() + 1);
        }

        fn get_proc_address(&self, _name: &str) -> *const c_void {
            std::ptr::null()
        }
    }

    #[test]
    fn clears_on_drop() {
        let context = Counting::default();
        {
            let _current = CurrentContext::acquire(&context).unwrap();
            assert!(context.current.get());
        }
        assert!(!context.current.get());
        assert_eq!(context.clears.get(), 1);
    }

    #[test]
    fn refused_context_is_never_cleared() {
        let context = Counting {
            refuse: true,
            ..Default::default()
        };
        assert!(CurrentContext::acquire(&context).is_none());
        assert_eq!(context.clears.get(), 0);
    }
}
