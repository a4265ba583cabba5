//! Component type registration and metadata.
//!
//! Component types are registered lazily in a process-global registry the
//! first time they are used. Registration produces a [`ComponentId`] (a small
//! dense integer used as a bit index in archetype masks) and a leaked
//! `&'static ComponentInfo` carrying the layout, storage kind, and the
//! type-erased operations the storage layer needs.
//!
//! Tags are registered separately and get a [`TagId`] in `0..MAX_TAGS`; an
//! entity's tags are stored in its [`TagBits`] component.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::OnceLock;

use parking_lot::RwLock;

use crate::column::{Column, ManagedColumn, ManagedVec};
use crate::command::VirtualColumn;
use crate::sparse_set::SparseSet;

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// Any plain data type that can be attached to an entity.
///
/// Implemented automatically for every `Clone + Default + Send + Sync + 'static`
/// type. `Default` supplies the value of rows that are created without an
/// explicit value (type-erased adds, unmatched columns after a transition).
pub trait Component: Clone + Default + Send + Sync + 'static {}

impl<T: Clone + Default + Send + Sync + 'static> Component for T {}

// ---------------------------------------------------------------------------
// ComponentId
// ---------------------------------------------------------------------------

/// Process-wide identifier of a registered component type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub(crate) u32);

impl ComponentId {
    /// The id as a bit index.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId({})", self.0)
    }
}

/// How a component's column stores its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// Raw aligned bytes. Rows are moved with a byte copy.
    Unmanaged,
    /// A typed vector. Rows are moved with `mem::take`.
    Managed,
}

// ---------------------------------------------------------------------------
// ComponentInfo
// ---------------------------------------------------------------------------

/// Type-erased operations for one component type.
pub(crate) struct ComponentVtable {
    pub new_managed: fn(usize) -> Box<dyn ManagedColumn>,
    pub new_virtual: fn() -> Box<dyn VirtualColumn>,
    pub default_boxed: fn() -> Box<dyn Any + Send>,
    pub write_boxed: fn(&mut Column, usize, Box<dyn Any + Send>),
}

fn new_managed<T: Component>(capacity: usize) -> Box<dyn ManagedColumn> {
    Box::new(ManagedVec::<T>::with_capacity(capacity))
}

fn new_virtual<T: Component>() -> Box<dyn VirtualColumn> {
    Box::new(SparseSet::<T>::new())
}

fn default_boxed<T: Component>() -> Box<dyn Any + Send> {
    Box::new(T::default())
}

fn write_boxed<T: Component>(column: &mut Column, row: usize, value: Box<dyn Any + Send>) {
    let value = value
        .downcast::<T>()
        .unwrap_or_else(|_| panic!("boxed value is not a {}", std::any::type_name::<T>()));
    column.set::<T>(row, *value);
}

/// Metadata about a registered component type.
pub struct ComponentInfo {
    /// Dense id assigned at registration time.
    pub id: ComponentId,
    /// `std::any::type_name::<T>()`.
    pub name: &'static str,
    /// Byte size for unmanaged types, 0 for managed ones.
    pub size: usize,
    /// `std::mem::align_of::<T>()`
    pub align: usize,
    /// Rust `TypeId` for runtime type checking.
    pub type_id: TypeId,
    /// Which column representation this type uses.
    pub storage: StorageKind,
    /// Bytes of `T::default()`, used to initialise unmanaged rows.
    pub(crate) default_bytes: Box<[MaybeUninit<u8>]>,
    pub(crate) vtable: ComponentVtable,
}

impl ComponentInfo {
    fn of<T: Component>(id: ComponentId) -> Self {
        let managed = std::mem::needs_drop::<T>();
        let size = std::mem::size_of::<T>();
        let default_bytes = if managed {
            Box::default()
        } else {
            let value = T::default();
            #[allow(unsafe_code)]
            // SAFETY: `value` is a live `T` of exactly `size` bytes; reading it
            // as `MaybeUninit<u8>` tolerates padding.
            let bytes = unsafe {
                std::slice::from_raw_parts(&value as *const T as *const MaybeUninit<u8>, size)
            };
            let copy: Box<[MaybeUninit<u8>]> = bytes.into();
            // No drop glue, forgetting is equivalent to dropping.
            std::mem::forget(value);
            copy
        };
        Self {
            id,
            name: std::any::type_name::<T>(),
            size: if managed { 0 } else { size },
            align: std::mem::align_of::<T>(),
            type_id: TypeId::of::<T>(),
            storage: if managed {
                StorageKind::Managed
            } else {
                StorageKind::Unmanaged
            },
            default_bytes,
            vtable: ComponentVtable {
                new_managed: new_managed::<T>,
                new_virtual: new_virtual::<T>,
                default_boxed: default_boxed::<T>,
                write_boxed: write_boxed::<T>,
            },
        }
    }

    /// Allocate an empty column for this type with room for `capacity` rows.
    pub(crate) fn new_column(&'static self, capacity: usize) -> Column {
        match self.storage {
            StorageKind::Unmanaged => {
                Column::new_unmanaged(capacity, self.size, self.align, &self.default_bytes)
            }
            StorageKind::Managed => Column::Managed((self.vtable.new_managed)(capacity)),
        }
    }

    /// Whether this info describes `T`.
    #[inline]
    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl fmt::Debug for ComponentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("storage", &self.storage)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Global registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ComponentRegistry {
    by_type: HashMap<TypeId, &'static ComponentInfo>,
    infos: Vec<&'static ComponentInfo>,
}

fn registry() -> &'static RwLock<ComponentRegistry> {
    static REGISTRY: OnceLock<RwLock<ComponentRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(ComponentRegistry::default()))
}

/// Metadata for `T`, registering it on first use.
pub fn component_info<T: Component>() -> &'static ComponentInfo {
    let type_id = TypeId::of::<T>();
    let found = registry().read().by_type.get(&type_id).copied();
    if let Some(info) = found {
        return info;
    }

    let mut reg = registry().write();
    // Another thread may have registered it between the two locks.
    if let Some(&info) = reg.by_type.get(&type_id) {
        return info;
    }
    let id = ComponentId(reg.infos.len() as u32);
    let info: &'static ComponentInfo = Box::leak(Box::new(ComponentInfo::of::<T>(id)));
    reg.by_type.insert(type_id, info);
    reg.infos.push(info);
    tracing::debug!(component = info.name, id = id.0, storage = ?info.storage, "registered component");
    info
}

/// Shorthand for `component_info::<T>().id`.
#[inline]
pub fn component_id<T: Component>() -> ComponentId {
    component_info::<T>().id
}

/// Metadata for an already registered id.
pub fn component_info_by_id(id: ComponentId) -> Option<&'static ComponentInfo> {
    registry().read().infos.get(id.index()).copied()
}

/// Number of component types registered so far in this process.
pub fn registered_component_count() -> usize {
    registry().read().infos.len()
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

/// Maximum number of distinct tag types per process.
pub const MAX_TAGS: usize = 256;

/// Identifier of a registered tag type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagId(pub(crate) u16);

impl TagId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

fn tag_registry() -> &'static RwLock<HashMap<TypeId, TagId>> {
    static TAGS: OnceLock<RwLock<HashMap<TypeId, TagId>>> = OnceLock::new();
    TAGS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Tag id for marker type `T`, registering it on first use.
///
/// # Panics
///
/// Panics if more than [`MAX_TAGS`] tag types are registered.
pub fn tag_id<T: 'static>() -> TagId {
    let type_id = TypeId::of::<T>();
    let found = tag_registry().read().get(&type_id).copied();
    if let Some(id) = found {
        return id;
    }
    let mut tags = tag_registry().write();
    if let Some(&id) = tags.get(&type_id) {
        return id;
    }
    assert!(
        tags.len() < MAX_TAGS,
        "tag limit of {MAX_TAGS} reached while registering {}",
        std::any::type_name::<T>()
    );
    let id = TagId(tags.len() as u16);
    tags.insert(type_id, id);
    id
}

/// Per-entity tag bitmap, stored as an ordinary component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TagBits(pub [u64; MAX_TAGS / 64]);

impl TagBits {
    #[inline]
    pub fn get(&self, tag: TagId) -> bool {
        let i = tag.index();
        self.0[i / 64] & (1 << (i % 64)) != 0
    }

    /// Set `tag`, returning whether it changed.
    pub fn set(&mut self, tag: TagId) -> bool {
        let was = self.get(tag);
        let i = tag.index();
        self.0[i / 64] |= 1 << (i % 64);
        !was
    }

    /// Clear `tag`, returning whether it changed.
    pub fn clear(&mut self, tag: TagId) -> bool {
        let was = self.get(tag);
        let i = tag.index();
        self.0[i / 64] &= !(1 << (i % 64));
        was
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }

    /// Every bit of `self` is set in `other`.
    pub fn all_set_in(&self, other: &TagBits) -> bool {
        self.0.iter().zip(other.0.iter()).all(|(&a, &b)| a & b == a)
    }

    /// At least one bit of `self` is set in `other`.
    pub fn any_set_in(&self, other: &TagBits) -> bool {
        self.0.iter().zip(other.0.iter()).any(|(&a, &b)| a & b != 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
