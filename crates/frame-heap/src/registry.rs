//! Per-type slot tables.
//!
//! Slots do not carry a vtable inside the value. Instead every slot header
//! points at a [`SlotVTable`] holding the type-erased destroy, copy and
//! finalize callbacks for its type. Tables are created once per
//! `(type, capability set)` by the process-wide registrar and live for the
//! rest of the process.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::LazyLock;

use parking_lot::RwLock;

use crate::managed::Managed;

/// Numeric id of a registered slot table. Tag 0 marks an untyped slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeTag(pub u32);

impl TypeTag {
    /// Tag carried by raw `malloc` slots that never had a type bound.
    pub const UNTYPED: Self = Self(0);
}

#[derive(Clone, Copy)]
pub(crate) struct ManagedOps {
    pub(crate) finalize: unsafe fn(*mut u8),
    pub(crate) is_collectable: unsafe fn(*const u8) -> bool,
}

/// Type-erased behavior of one slot type.
pub struct SlotVTable {
    type_id: TypeId,
    type_name: &'static str,
    tag: TypeTag,
    size: usize,
    align: usize,
    pub(crate) drop_fn: unsafe fn(*mut u8),
    pub(crate) drop_boxed_fn: unsafe fn(*mut u8),
    pub(crate) copy_fn: Option<unsafe fn(*const u8, *mut u8)>,
    pub(crate) managed: Option<ManagedOps>,
}

impl SlotVTable {
    /// `TypeId` of the payload type.
    #[must_use]
    pub const fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Name of the payload type.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Tag assigned at registration.
    #[must_use]
    pub const fn tag(&self) -> TypeTag {
        self.tag
    }

    /// `size_of` the payload type.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// `align_of` the payload type.
    #[must_use]
    pub const fn align(&self) -> usize {
        self.align
    }

    /// Capability check: does the payload implement [`Managed`]?
    #[must_use]
    pub const fn is_managed(&self) -> bool {
        self.managed.is_some()
    }

    /// Whether a copy callback was registered.
    #[must_use]
    pub const fn is_cloneable(&self) -> bool {
        self.copy_fn.is_some()
    }

    pub(crate) fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl fmt::Debug for SlotVTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotVTable")
            .field("type_name", &self.type_name)
            .field("tag", &self.tag)
            .field("size", &self.size)
            .field("managed", &self.is_managed())
            .field("cloneable", &self.is_cloneable())
            .finish()
    }
}

// ============================================================================
// Type-erased callbacks
// ============================================================================

unsafe fn drop_value<T>(ptr: *mut u8) {
    // SAFETY: caller passes the payload of a live slot holding a `T`.
    unsafe { std::ptr::drop_in_place(ptr.cast::<T>()) }
}

unsafe fn drop_boxed<T>(ptr: *mut u8) {
    // SAFETY: caller passes a pointer obtained from `Box::<T>::into_raw`.
    drop(unsafe { Box::from_raw(ptr.cast::<T>()) });
}

unsafe fn copy_value<T: Clone>(src: *const u8, dst: *mut u8) {
    // SAFETY: `src` holds a live `T`, `dst` is uninitialized room for one.
    unsafe { dst.cast::<T>().write((*src.cast::<T>()).clone()) }
}

unsafe fn finalize_value<T: Managed>(ptr: *mut u8) {
    // SAFETY: caller passes the payload of a live `T` with no outstanding borrows.
    unsafe { (*ptr.cast::<T>()).finalize() }
}

unsafe fn collectable_value<T: Managed>(ptr: *const u8) -> bool {
    // SAFETY: caller passes the payload of a live `T`.
    unsafe { (*ptr.cast::<T>()).is_collectable() }
}

// ============================================================================
// SlotType - registration builder
// ============================================================================

const CAP_COPY: u8 = 1;
const CAP_MANAGED: u8 = 2;

/// Selects the callbacks registered for a payload type.
///
/// ```ignore
/// let ty = SlotType::<Vec<u8>>::plain().cloneable();
/// let handle = arena.alloc_with(frame, vec![1, 2, 3], ty)?;
/// ```
pub struct SlotType<T: 'static> {
    copy_fn: Option<unsafe fn(*const u8, *mut u8)>,
    managed: Option<ManagedOps>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> SlotType<T> {
    /// Destroy callback only.
    #[must_use]
    pub const fn plain() -> Self {
        Self {
            copy_fn: None,
            managed: None,
            _marker: PhantomData,
        }
    }

    const fn capabilities(&self) -> u8 {
        let mut caps = 0;
        if self.copy_fn.is_some() {
            caps |= CAP_COPY;
        }
        if self.managed.is_some() {
            caps |= CAP_MANAGED;
        }
        caps
    }

    /// Returns the process-wide table for this type and capability set,
    /// creating it on first use.
    #[must_use]
    pub fn register(&self) -> &'static SlotVTable {
        let key = (TypeId::of::<T>(), self.capabilities());
        if let Some(vtable) = REGISTRY.read().by_key.get(&key) {
            return vtable;
        }

        let mut registry = REGISTRY.write();
        if let Some(vtable) = registry.by_key.get(&key) {
            return vtable;
        }

        let tag = TypeTag(u32::try_from(registry.by_tag.len() + 1).unwrap_or(u32::MAX));
        let vtable: &'static SlotVTable = Box::leak(Box::new(SlotVTable {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            tag,
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            drop_fn: drop_value::<T>,
            drop_boxed_fn: drop_boxed::<T>,
            copy_fn: self.copy_fn,
            managed: self.managed,
        }));
        registry.by_key.insert(key, vtable);
        registry.by_tag.push(vtable);
        vtable
    }
}

impl<T: Clone + 'static> SlotType<T> {
    /// Adds the copy-to-another-region callback.
    #[must_use]
    pub const fn cloneable(mut self) -> Self {
        self.copy_fn = Some(copy_value::<T>);
        self
    }
}

impl<T: Managed> SlotType<T> {
    /// Adds the Managed-Base finalize and collectable callbacks.
    #[must_use]
    pub const fn managed(mut self) -> Self {
        self.managed = Some(ManagedOps {
            finalize: finalize_value::<T>,
            is_collectable: collectable_value::<T>,
        });
        self
    }
}

impl<T: 'static> Clone for SlotType<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: 'static> Copy for SlotType<T> {}

impl<T: 'static> Default for SlotType<T> {
    fn default() -> Self {
        Self::plain()
    }
}

impl<T: 'static> fmt::Debug for SlotType<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotType")
            .field("type_name", &std::any::type_name::<T>())
            .field("cloneable", &self.copy_fn.is_some())
            .field("managed", &self.managed.is_some())
            .finish()
    }
}

// ============================================================================
// Registrar
// ============================================================================

#[derive(Default)]
struct Registry {
    by_key: HashMap<(TypeId, u8), &'static SlotVTable>,
    by_tag: Vec<&'static SlotVTable>,
}

static REGISTRY: LazyLock<RwLock<Registry>> = LazyLock::new(|| RwLock::new(Registry::default()));

/// Looks up a registered table by its tag.
#[must_use]
pub fn lookup(tag: TypeTag) -> Option<&'static SlotVTable> {
    let index = usize::try_from(tag.0).ok()?.checked_sub(1)?;
    REGISTRY.read().by_tag.get(index).copied()
}

/// Every table registered so far, in registration order.
#[must_use]
pub fn registered_types() -> Vec<&'static SlotVTable> {
    REGISTRY.read().by_tag.clone()
}
