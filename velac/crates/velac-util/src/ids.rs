//! Small index newtypes shared across crate boundaries.

/// Index of a type in the compiler's type arena.
///
/// Types form an arbitrary (possibly cyclic) graph; arena indices stand in
/// for the pointers a C implementation would use. `TypeId` lives here rather
/// than in `velac-sem` so the heap crate can tag chunks with the type used
/// for tracing their children without depending on the whole type system.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl TypeId {
    #[inline]
    pub const fn new(index: usize) -> Self {
        Self(index as u32)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}
