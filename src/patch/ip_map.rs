/// Where each moved instruction lives, in the target and in the trampoline.
///
/// A thread paused on one of the moved instructions while the head of the
/// target is rewritten continues at the same instruction on the other side.
pub(super) struct IpMap {
    target: usize,
    trampoline: usize,
    // (offset in the target, offset in the trampoline); the last pair is the
    // jump back, whose target offset is the end of the stolen range
    offsets: Vec<(usize, usize)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Direction {
    /// The jump is going in: threads on stolen instructions move to the
    /// trampoline.
    IntoTrampoline,
    /// The original bytes are coming back: threads in the trampoline move to
    /// the target.
    BackToTarget,
}

impl IpMap {
    pub fn new(target: usize, trampoline: usize, offsets: Vec<(usize, usize)>) -> Self {
        Self {
            target,
            trampoline,
            offsets,
        }
    }

    fn stolen(&self) -> &[(usize, usize)] {
        &self.offsets[..self.offsets.len().saturating_sub(1)]
    }

    /// The address a thread at `ip` has to continue at, if it has to move.
    ///
    /// Runs while other threads are frozen, so it must not allocate.
    pub fn remap(&self, ip: usize, direction: Direction) -> Option<usize> {
        match direction {
            Direction::IntoTrampoline => self
                .stolen()
                .iter()
                .find(|(old, _)| self.target + old == ip)
                .map(|(_, new)| self.trampoline + new),
            Direction::BackToTarget => self
                .offsets
                .iter()
                .find(|(_, new)| self.trampoline + new == ip)
                .map(|(old, _)| self.target + old),
        }
    }
}

/// One head rewrite: the map plus the way threads move.
pub(super) struct Fixup<'a> {
    pub map: &'a IpMap,
    pub direction: Direction,
}

impl Fixup<'_> {
    pub fn apply(&self, ip: usize) -> Option<usize> {
        self.map.remap(ip, self.direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // push rbp; mov rbp, rsp; sub rsp, 0x20 moved to 0x9000, jmp back at +8
    fn map() -> IpMap {
        IpMap::new(0x1000, 0x9000, vec![(0, 0), (1, 1), (4, 4), (8, 8)])
    }

    #[test]
    fn stolen_instructions_move_into_the_trampoline() {
        let map = map();
        assert_eq!(map.remap(0x1000, Direction::IntoTrampoline), Some(0x9000));
        assert_eq!(map.remap(0x1004, Direction::IntoTrampoline), Some(0x9004));
        // mid instruction, past the stolen range, or unrelated
        assert_eq!(map.remap(0x1002, Direction::IntoTrampoline), None);
        assert_eq!(map.remap(0x1008, Direction::IntoTrampoline), None);
        assert_eq!(map.remap(0x5000, Direction::IntoTrampoline), None);
    }

    #[test]
    fn trampoline_threads_move_back() {
        let map = map();
        assert_eq!(map.remap(0x9001, Direction::BackToTarget), Some(0x1001));
        // the jump back continues where the stolen range ends
        assert_eq!(map.remap(0x9008, Direction::BackToTarget), Some(0x1008));
        assert_eq!(map.remap(0x1001, Direction::BackToTarget), None);
    }

    #[test]
    fn relocated_offsets_may_differ() {
        // a short jcc grown into a near one
        let map = IpMap::new(0x1000, 0x9000, vec![(0, 0), (2, 6), (5, 9)]);
        let fixup = Fixup {
            map: &map,
            direction: Direction::BackToTarget,
        };
        assert_eq!(fixup.apply(0x9006), Some(0x1002));
        assert_eq!(fixup.apply(0x9002), None);
    }
}
