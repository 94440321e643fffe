use cmwatch_core::ResourceIdentity;

/// Maps an identity onto one of `lanes` delivery lanes.
///
/// The mapping is a pure function of the identity, so every event for one
/// resource lands on the same lane and keeps its order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanePlanner {
    lanes: usize,
}

impl LanePlanner {
    pub fn new(lanes: usize) -> Self { Self { lanes: lanes.max(1) } }

    pub fn lanes(&self) -> usize { self.lanes }

    pub fn lane(&self, id: &ResourceIdentity) -> usize {
        if self.lanes <= 1 {
            return 0;
        }
        let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
        let bytes = id.namespace.as_bytes().iter().chain(b"/").chain(id.name.as_bytes());
        for b in bytes {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        (h % self.lanes as u64) as usize
    }
}
