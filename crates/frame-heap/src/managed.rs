//! The Managed-Base capability.
//!
//! Types that want a finalize hook and identity-stable lifetimes behind
//! [`Handle`](crate::Handle)s implement [`Managed`] and are allocated with
//! [`Arena::alloc_managed`](crate::Arena::alloc_managed) (or a
//! [`SlotType`](crate::SlotType) built with `.managed()`).

/// Finalize-before-delete contract for handle targets.
///
/// The finalizer runs exactly once, before the value is dropped. A value
/// whose [`is_collectable`](Managed::is_collectable) returns `false` (for
/// example a process-wide singleton) is finalized when its last handle goes
/// away but keeps its storage; its bytes are reclaimed only when the frame
/// that holds it is cleared, and it is not finalized a second time.
///
/// Prefer `#[derive(Managed)]`:
///
/// ```ignore
/// use frame_heap::Managed;
///
/// #[derive(Managed)]
/// #[managed(finalize = Mailbox::flush)]
/// struct Mailbox {
///     pending: Vec<u32>,
/// }
///
/// impl Mailbox {
///     fn flush(&mut self) {
///         self.pending.clear();
///     }
/// }
/// ```
pub trait Managed: 'static {
    /// Called once before the value is dropped or abandoned.
    fn finalize(&mut self) {}

    /// Whether releasing the last handle may free the value's storage.
    fn is_collectable(&self) -> bool {
        true
    }
}
