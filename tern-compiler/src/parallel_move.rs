//! Sequentializes a set of moves that semantically happen in parallel.

use crate::hir::DataType;
use crate::locations::{Location, MoveOperands};

/// Emits the machine code for single moves and swaps.
pub trait MoveEmitter {
    fn emit_move(&mut self, mv: &MoveOperands);

    /// Exchanges the contents of `mv.source` and `mv.destination`.
    fn emit_swap(&mut self, mv: &MoveOperands);
}

pub fn resolve_parallel_move<E: MoveEmitter>(emitter: &mut E, moves: &[MoveOperands]) {
    let mut pending: Vec<MoveOperands> = moves.iter().filter(|m| !m.is_redundant()).copied().collect();

    if pending.is_empty() {
        return;
    }

    debug_assert!(destinations_unique(&pending), "parallel move writes location twice");
    split_partial_overlaps(&mut pending);
    pending.retain(|m| !m.is_redundant());

    while !pending.is_empty() {
        if let Some(idx) = find_unblocked(&pending) {
            let mv = pending.remove(idx);
            emitter.emit_move(&mv);
            continue;
        }

        // Only cycles remain. Every location in a cycle is read exactly once.
        let mv = pending.remove(0);
        emitter.emit_swap(&mv);

        for other in pending.iter_mut() {
            if other.source == mv.destination {
                other.source = mv.source;
            }
        }
        pending.retain(|m| !m.is_redundant());
    }
}

fn destinations_unique(moves: &[MoveOperands]) -> bool {
    for (i, a) in moves.iter().enumerate() {
        for b in &moves[i + 1..] {
            if a.destination.overlaps(&b.destination) {
                return false;
            }
        }
    }
    true
}

fn find_unblocked(pending: &[MoveOperands]) -> Option<usize> {
    (0..pending.len()).find(|&i| {
        let destination = pending[i].destination;
        pending
            .iter()
            .enumerate()
            .all(|(j, other)| i == j || !other.blocks(&destination))
    })
}

fn is_wide(location: &Location) -> bool {
    matches!(
        location,
        Location::RegisterPair(..) | Location::FpuRegisterPair(..) | Location::DoubleStackSlot(_)
    )
}

fn partially_overlaps(a: &Location, b: &Location) -> bool {
    a != b && a.overlaps(b)
}

/// Splits 64-bit moves that only partially overlap another location into
/// two word moves, so the remaining moves either alias exactly or not at all.
fn split_partial_overlaps(moves: &mut Vec<MoveOperands>) {
    loop {
        let mut split = None;

        'search: for (i, mv) in moves.iter().enumerate() {
            if mv.source.is_constant() || !(is_wide(&mv.source) || is_wide(&mv.destination)) {
                continue;
            }

            if partially_overlaps(&mv.source, &mv.destination) {
                split = Some(i);
                break;
            }

            for (j, other) in moves.iter().enumerate() {
                if i == j {
                    continue;
                }

                let locations = [other.source, other.destination];
                if locations.iter().any(|loc| {
                    !loc.is_constant()
                        && (partially_overlaps(&mv.source, loc) || partially_overlaps(&mv.destination, loc))
                }) {
                    split = Some(i);
                    break 'search;
                }
            }
        }

        let idx = match split {
            Some(idx) => idx,
            None => return,
        };

        let mv = moves.remove(idx);
        let half_ty = if mv.source.is_fpu_register_pair() || mv.destination.is_fpu_register_pair() {
            DataType::Float32
        } else {
            DataType::Int32
        };

        moves.push(MoveOperands::new(
            mv.source.to_low(),
            mv.destination.to_low(),
            half_ty,
            mv.value,
        ));
        moves.push(MoveOperands::new(
            mv.source.to_high(),
            mv.destination.to_high(),
            half_ty,
            mv.value,
        ));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;
    use crate::hir::InstId;

    #[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
    enum Unit {
        Core(u8),
        Fp(u8),
        Stack(i32),
    }

    fn units(location: Location) -> Vec<Unit> {
        match location {
            Location::Register(r) => vec![Unit::Core(r)],
            Location::RegisterPair(lo, hi) => vec![Unit::Core(lo), Unit::Core(hi)],
            Location::FpuRegister(r) => vec![Unit::Fp(r)],
            Location::FpuRegisterPair(lo, hi) => vec![Unit::Fp(lo), Unit::Fp(hi)],
            Location::StackSlot(o) => vec![Unit::Stack(o)],
            Location::DoubleStackSlot(o) => vec![Unit::Stack(o), Unit::Stack(o + 4)],
            _ => panic!("no units for {:?}", location),
        }
    }

    /// Abstract machine: every unit initially holds a value naming itself.
    struct Machine {
        state: HashMap<Unit, String>,
        instructions: usize,
    }

    impl Machine {
        fn new() -> Machine {
            Machine {
                state: HashMap::new(),
                instructions: 0,
            }
        }

        fn read(&self, unit: Unit) -> String {
            self.state
                .get(&unit)
                .cloned()
                .unwrap_or_else(|| format!("{:?}", unit))
        }
    }

    impl MoveEmitter for Machine {
        fn emit_move(&mut self, mv: &MoveOperands) {
            self.instructions += 1;
            let dst = units(mv.destination);
            let values: Vec<String> = match mv.source {
                Location::Constant(id) => (0..dst.len()).map(|h| format!("c{}.{}", id.0, h)).collect(),
                source => units(source).into_iter().map(|u| self.read(u)).collect(),
            };
            assert_eq!(values.len(), dst.len());
            for (unit, value) in dst.into_iter().zip(values) {
                self.state.insert(unit, value);
            }
        }

        fn emit_swap(&mut self, mv: &MoveOperands) {
            self.instructions += 1;
            let a = units(mv.source);
            let b = units(mv.destination);
            assert_eq!(a.len(), b.len());
            for (ua, ub) in a.into_iter().zip(b) {
                let va = self.read(ua);
                let vb = self.read(ub);
                self.state.insert(ua, vb);
                self.state.insert(ub, va);
            }
        }
    }

    fn mv(source: Location, destination: Location) -> MoveOperands {
        let ty = if is_wide(&destination) {
            DataType::Int64
        } else {
            DataType::Int32
        };
        MoveOperands::new(source, destination, ty, None)
    }

    fn check(moves: &[MoveOperands]) -> Machine {
        let mut machine = Machine::new();
        resolve_parallel_move(&mut machine, moves);

        let reference = Machine::new();
        let mut expected: HashMap<Unit, String> = HashMap::new();
        for m in moves {
            let dst = units(m.destination);
            let values: Vec<String> = match m.source {
                Location::Constant(id) => (0..dst.len()).map(|h| format!("c{}.{}", id.0, h)).collect(),
                source => units(source).into_iter().map(|u| reference.read(u)).collect(),
            };
            for (unit, value) in dst.into_iter().zip(values) {
                expected.insert(unit, value);
            }
        }
        for (unit, value) in expected {
            assert_eq!(machine.read(unit), value, "wrong value in {:?}", unit);
        }
        machine
    }

    #[test]
    fn test_self_moves_emit_nothing() {
        let moves = [
            mv(Location::Register(1), Location::Register(1)),
            mv(Location::StackSlot(8), Location::StackSlot(8)),
            mv(Location::register_pair(2, 3), Location::register_pair(2, 3)),
        ];
        let machine = check(&moves);
        assert_eq!(machine.instructions, 0);
    }

    #[test]
    fn test_chain() {
        let moves = [
            mv(Location::Register(0), Location::Register(1)),
            mv(Location::Register(1), Location::Register(2)),
            mv(Location::Register(2), Location::Register(3)),
        ];
        let machine = check(&moves);
        assert_eq!(machine.instructions, 3);
    }

    #[test]
    fn test_swap() {
        let moves = [
            mv(Location::Register(0), Location::Register(1)),
            mv(Location::Register(1), Location::Register(0)),
        ];
        let machine = check(&moves);
        assert_eq!(machine.instructions, 1);
    }

    #[test]
    fn test_three_cycle_with_fan_out() {
        let moves = [
            mv(Location::Register(0), Location::Register(1)),
            mv(Location::Register(1), Location::Register(2)),
            mv(Location::Register(2), Location::Register(0)),
            mv(Location::Register(0), Location::StackSlot(4)),
            mv(Location::Constant(InstId(9)), Location::Register(5)),
        ];
        check(&moves);
    }

    #[test]
    fn test_pair_partially_overlapping_singles() {
        let moves = [
            mv(Location::register_pair(0, 1), Location::register_pair(2, 3)),
            mv(Location::Register(2), Location::Register(1)),
            mv(Location::Register(3), Location::Register(0)),
        ];
        check(&moves);
    }

    #[test]
    fn test_double_stack_diagonal() {
        let moves = [mv(Location::DoubleStackSlot(4), Location::DoubleStackSlot(8))];
        check(&moves);
    }

    #[test]
    fn test_fpu_pair_to_core_pair_cycle() {
        let moves = [
            mv(Location::fpu_register_pair(0, 1), Location::fpu_register_pair(2, 3)),
            mv(Location::fpu_register_pair(2, 3), Location::fpu_register_pair(0, 1)),
            mv(Location::FpuRegister(4), Location::Register(4)),
        ];
        check(&moves);
    }

    fn location_strategy() -> impl Strategy<Value = Location> {
        prop_oneof![
            (0u8..6).prop_map(Location::Register),
            (0u8..4).prop_map(Location::FpuRegister),
            (0i32..4).prop_map(|i| Location::StackSlot(i * 4)),
        ]
    }

    proptest! {
        #[test]
        fn prop_random_parallel_moves(
            destinations in proptest::collection::hash_set(location_strategy(), 1..10),
            picks in proptest::collection::vec(any::<proptest::sample::Index>(), 10),
            constants in proptest::collection::vec(any::<bool>(), 10),
        ) {
            let destinations: Vec<Location> = destinations.into_iter().collect();
            let all: Vec<Location> = {
                let mut all = Vec::new();
                for r in 0u8..6 { all.push(Location::Register(r)); }
                for s in 0u8..4 { all.push(Location::FpuRegister(s)); }
                for o in 0i32..4 { all.push(Location::StackSlot(o * 4)); }
                all
            };
            let moves: Vec<MoveOperands> = destinations
                .iter()
                .enumerate()
                .map(|(i, &dst)| {
                    let src = if constants[i] && i % 3 == 0 {
                        Location::Constant(InstId(i as u32))
                    } else {
                        *picks[i].get(&all)
                    };
                    mv(src, dst)
                })
                .collect();
            check(&moves);
        }

        #[test]
        fn prop_pair_permutations(perm in Just(vec![0u8, 2, 4, 6]).prop_shuffle()) {
            let moves: Vec<MoveOperands> = perm
                .iter()
                .enumerate()
                .map(|(i, &lo)| mv(Location::register_pair(2 * i as u8, 2 * i as u8 + 1), Location::register_pair(lo, lo + 1)))
                .collect();
            check(&moves);
        }
    }
}
