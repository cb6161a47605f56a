//! Functionality for calling application callbacks.

use std::{cell::RefCell, rc::Rc};

/// Wrapper for a single argument callback function set by an application.
pub struct Callback<A>(RefCell<Option<Rc<dyn Fn(A)>>>);

impl<A> Callback<A> {
    /// Sets an inner function, replacing the previous one.
    #[inline]
    pub fn set_func<F: Fn(A) + 'static>(&self, f: F) {
        self.0.borrow_mut().replace(Rc::new(f));
    }

    /// Indicates whether this [`Callback`] is set.
    #[inline]
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.borrow().as_ref().is_some()
    }

    /// Invokes the underlying function (if any) passing the single provided
    /// argument to it.
    ///
    /// The function may safely replace itself while being called.
    pub fn call1<T: Into<A>>(&self, arg: T) {
        let f = self.0.borrow().as_ref().map(Rc::clone);
        if let Some(f) = f {
            f(arg.into());
        }
    }
}

impl<A> Default for Callback<A> {
    #[inline]
    fn default() -> Self {
        Self(RefCell::new(None))
    }
}
