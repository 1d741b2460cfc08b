use crate::firestore::core::TargetId;

const RESERVED_BITS: i32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GeneratorId {
    TargetCache = 0,
    SyncEngine = 1,
}

/// Hands out target ids from one of two disjoint sequences: even ids for
/// targets persisted in the target cache and odd ids for the sync engine's
/// limbo resolution targets.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    generator_id: GeneratorId,
    next_id: TargetId,
}

impl TargetIdGenerator {
    /// Generator for the target cache, continuing after `highest_target_id`.
    pub fn for_target_cache(highest_target_id: TargetId) -> Self {
        Self::seeded(GeneratorId::TargetCache, highest_target_id)
    }

    pub fn for_sync_engine() -> Self {
        Self::seeded(GeneratorId::SyncEngine, 0)
    }

    fn seeded(generator_id: GeneratorId, after: TargetId) -> Self {
        let id = generator_id as i32;
        let mut next_id = (after & !RESERVED_BITS) | id;
        if next_id <= after {
            next_id += 1 << RESERVED_BITS;
        }
        Self {
            generator_id,
            next_id,
        }
    }

    pub fn next_id(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 1 << RESERVED_BITS;
        id
    }
}
