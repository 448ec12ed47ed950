//! Per-object descriptor bits and the bucket-family classification derived
//! from them. Every small/medium object carries one info byte in its heap
//! block; large blocks keep the byte in their header.

use enum_map::Enum;

/// No attributes: a plain traceable object.
pub const NO_BIT: u8 = 0;
/// The object contains no traceable references; mark skips its payload.
pub const LEAF_BIT: u8 = 0x01;
/// The object has a finalizer that runs in-thread before its slot is freed.
pub const FINALIZE_BIT: u8 = 0x02;
/// Stores into the object go through the software write barrier; its pages
/// participate in incremental rescan.
pub const WITH_BARRIER_BIT: u8 = 0x04;
/// The host traces this object itself through a visit callback.
pub const VISITED_HOST_BIT: u8 = 0x08;
/// Treat the object as live without any incoming reference.
pub const IMPLICIT_ROOT_BIT: u8 = 0x10;
/// Allocated since the last collection started; used by partial collection
/// bookkeeping.
pub const NEW_TRACK_BIT: u8 = 0x20;
/// Tombstone for an explicitly freed slot; sweep treats it as unmarked.
pub const DELETED_BIT: u8 = 0x40;
/// Host-defined enumeration class, reported through heap enumeration.
pub const ENUM_CLASS_MASK: u8 = 0x80;

/// Finalizable object behind the write barrier; a distinct bucket family.
pub const FINALIZABLE_WITH_BARRIER_BITS: u8 = FINALIZE_BIT | WITH_BARRIER_BIT;
/// Leaf object pinned by its info byte.
pub const IMPLICIT_ROOT_LEAF_BITS: u8 = IMPLICIT_ROOT_BIT | LEAF_BIT;

/// The attribute bits that select a bucket family. Implicit-root, new-track,
/// deleted and enum-class bits ride along without affecting placement.
pub const BUCKET_SELECTION_MASK: u8 =
    LEAF_BIT | FINALIZE_BIT | WITH_BARRIER_BIT | VISITED_HOST_BIT;

/// One bucket family per object-info class, per size class.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum BucketKind {
    Normal,
    Leaf,
    Finalizable,
    NormalWithBarrier,
    FinalizableWithBarrier,
    VisitedHost,
}

impl BucketKind {
    pub const COUNT: usize = 6;

    /// Classify allocation attributes into a bucket family.
    pub fn of(attributes: u8) -> BucketKind {
        match attributes & BUCKET_SELECTION_MASK {
            0 => BucketKind::Normal,
            LEAF_BIT => BucketKind::Leaf,
            FINALIZE_BIT => BucketKind::Finalizable,
            WITH_BARRIER_BIT => BucketKind::NormalWithBarrier,
            FINALIZABLE_WITH_BARRIER_BITS => BucketKind::FinalizableWithBarrier,
            VISITED_HOST_BIT => BucketKind::VisitedHost,
            // Unsupported combinations degrade to the most conservative
            // family that still honors every requested behavior.
            bits if bits & FINALIZE_BIT != 0 && bits & WITH_BARRIER_BIT != 0 => {
                BucketKind::FinalizableWithBarrier
            }
            bits if bits & FINALIZE_BIT != 0 => BucketKind::Finalizable,
            bits if bits & WITH_BARRIER_BIT != 0 => BucketKind::NormalWithBarrier,
            bits if bits & VISITED_HOST_BIT != 0 => BucketKind::VisitedHost,
            _ => BucketKind::Normal,
        }
    }

    pub fn is_finalizable(self) -> bool {
        matches!(
            self,
            BucketKind::Finalizable | BucketKind::FinalizableWithBarrier
        )
    }

    pub fn is_leaf(self) -> bool {
        matches!(self, BucketKind::Leaf)
    }

    pub fn is_with_barrier(self) -> bool {
        matches!(
            self,
            BucketKind::NormalWithBarrier | BucketKind::FinalizableWithBarrier
        )
    }

    /// Stable code for the telemetry bucket-name packing.
    pub fn event_code(self) -> u16 {
        match self {
            BucketKind::Normal => 0,
            BucketKind::Leaf => 1,
            BucketKind::Finalizable => 2,
            BucketKind::NormalWithBarrier => 3,
            BucketKind::FinalizableWithBarrier => 4,
            BucketKind::VisitedHost => 5,
        }
    }

    pub const ALL: [BucketKind; BucketKind::COUNT] = [
        BucketKind::Normal,
        BucketKind::Leaf,
        BucketKind::Finalizable,
        BucketKind::NormalWithBarrier,
        BucketKind::FinalizableWithBarrier,
        BucketKind::VisitedHost,
    ];
}

/// Every heap block variant, used for per-kind block counts and the block
/// map tag dispatch.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum HeapBlockKind {
    SmallNormal,
    SmallLeaf,
    SmallFinalizable,
    SmallNormalWithBarrier,
    SmallFinalizableWithBarrier,
    SmallVisitedHost,
    MediumNormal,
    MediumLeaf,
    MediumFinalizable,
    MediumNormalWithBarrier,
    MediumFinalizableWithBarrier,
    MediumVisitedHost,
    Large,
}

impl HeapBlockKind {
    pub fn small(bucket: BucketKind) -> HeapBlockKind {
        match bucket {
            BucketKind::Normal => HeapBlockKind::SmallNormal,
            BucketKind::Leaf => HeapBlockKind::SmallLeaf,
            BucketKind::Finalizable => HeapBlockKind::SmallFinalizable,
            BucketKind::NormalWithBarrier => HeapBlockKind::SmallNormalWithBarrier,
            BucketKind::FinalizableWithBarrier => HeapBlockKind::SmallFinalizableWithBarrier,
            BucketKind::VisitedHost => HeapBlockKind::SmallVisitedHost,
        }
    }

    pub fn medium(bucket: BucketKind) -> HeapBlockKind {
        match bucket {
            BucketKind::Normal => HeapBlockKind::MediumNormal,
            BucketKind::Leaf => HeapBlockKind::MediumLeaf,
            BucketKind::Finalizable => HeapBlockKind::MediumFinalizable,
            BucketKind::NormalWithBarrier => HeapBlockKind::MediumNormalWithBarrier,
            BucketKind::FinalizableWithBarrier => HeapBlockKind::MediumFinalizableWithBarrier,
            BucketKind::VisitedHost => HeapBlockKind::MediumVisitedHost,
        }
    }

    pub fn is_small_family(self) -> bool {
        matches!(
            self,
            HeapBlockKind::SmallNormal
                | HeapBlockKind::SmallLeaf
                | HeapBlockKind::SmallFinalizable
                | HeapBlockKind::SmallNormalWithBarrier
                | HeapBlockKind::SmallFinalizableWithBarrier
                | HeapBlockKind::SmallVisitedHost
        )
    }

    /// Code packed into telemetry bucket names: block family in the high
    /// byte, info class in the low byte.
    pub fn event_family_code(self) -> u16 {
        if self.is_small_family() {
            0
        } else if self == HeapBlockKind::Large {
            2
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_kind_classification() {
        assert_eq!(BucketKind::of(NO_BIT), BucketKind::Normal);
        assert_eq!(BucketKind::of(LEAF_BIT), BucketKind::Leaf);
        assert_eq!(BucketKind::of(FINALIZE_BIT), BucketKind::Finalizable);
        assert_eq!(BucketKind::of(WITH_BARRIER_BIT), BucketKind::NormalWithBarrier);
        assert_eq!(
            BucketKind::of(FINALIZABLE_WITH_BARRIER_BITS),
            BucketKind::FinalizableWithBarrier
        );
        assert_eq!(BucketKind::of(VISITED_HOST_BIT), BucketKind::VisitedHost);
        // Riders do not change placement.
        assert_eq!(BucketKind::of(IMPLICIT_ROOT_LEAF_BITS), BucketKind::Leaf);
        assert_eq!(BucketKind::of(IMPLICIT_ROOT_BIT), BucketKind::Normal);
        assert_eq!(
            BucketKind::of(NEW_TRACK_BIT | FINALIZE_BIT),
            BucketKind::Finalizable
        );
    }

    #[test]
    fn block_kind_families() {
        assert!(HeapBlockKind::small(BucketKind::Leaf).is_small_family());
        assert!(!HeapBlockKind::medium(BucketKind::Leaf).is_small_family());
        assert_eq!(HeapBlockKind::Large.event_family_code(), 2);
        assert_eq!(HeapBlockKind::medium(BucketKind::Normal).event_family_code(), 1);
    }
}
