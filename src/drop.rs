//! Scope guards.

/// Guard returned by [`defer`], running its callback on drop (including during unwinding).
#[must_use = "`Defer` should be assigned to a variable, or it will run immediately"]
pub struct Defer<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(cb) = self.0.take() {
            cb();
        }
    }
}

/// Returns a guard that runs `cb` when it goes out of scope.
pub fn defer<F: FnOnce()>(cb: F) -> Defer<F> {
    Defer(Some(cb))
}
