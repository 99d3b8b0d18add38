use crate::hir::{BlockId, Graph, InstId, InstructionKind};

/// Verifies structural invariants of a graph. Collects every violation
/// instead of stopping at the first one.
pub struct GraphChecker<'a> {
    graph: &'a Graph,
    errors: Vec<String>,
}

impl<'a> GraphChecker<'a> {
    pub fn new(graph: &'a Graph) -> GraphChecker<'a> {
        GraphChecker {
            graph,
            errors: Vec::new(),
        }
    }

    pub fn run(mut self) -> Vec<String> {
        for idx in 0..self.graph.blocks.len() {
            self.check_block(BlockId(idx as u32));
        }
        self.errors
    }

    fn error(&mut self, msg: String) {
        self.errors.push(msg);
    }

    fn check_block(&mut self, id: BlockId) {
        let graph = self.graph;
        let block = graph.block(id);

        for &succ in &block.successors {
            if !graph.block(succ).predecessors.contains(&id) {
                self.error(format!("{:?} lists {:?} as successor but not vice versa", id, succ));
            }
        }
        for &pred in &block.predecessors {
            if !graph.block(pred).successors.contains(&id) {
                self.error(format!("{:?} lists {:?} as predecessor but not vice versa", id, pred));
            }
        }

        for &phi in &block.phis {
            if !graph.inst(phi).is_phi() {
                self.error(format!("{:?} in phi list of {:?} is not a phi", phi, id));
            }
            if graph.inst(phi).inputs.len() != block.predecessors.len() {
                self.error(format!(
                    "phi {:?} has {} inputs but {:?} has {} predecessors",
                    phi,
                    graph.inst(phi).inputs.len(),
                    id,
                    block.predecessors.len()
                ));
            }
            self.check_instruction(id, phi);
        }

        if !block.phis.is_empty() {
            for &pred in &block.predecessors {
                if graph.block(pred).successors.len() > 1 {
                    self.error(format!("critical edge {:?} -> {:?} into block with phis", pred, id));
                }
            }
        }

        let count = block.instructions.len();
        if count == 0 {
            self.error(format!("{:?} has no terminator", id));
        }
        for (pos, &inst) in block.instructions.iter().enumerate() {
            let kind = graph.kind(inst);
            if *kind == InstructionKind::Phi {
                self.error(format!("phi {:?} in instruction list of {:?}", inst, id));
            }
            let last = pos + 1 == count;
            if kind.is_control_flow() != last {
                if last {
                    self.error(format!("{:?} ends with non-terminator {:?}", id, inst));
                } else {
                    self.error(format!("terminator {:?} in the middle of {:?}", inst, id));
                }
            }
            self.check_instruction(id, inst);
        }
    }

    fn check_instruction(&mut self, block: BlockId, id: InstId) {
        let graph = self.graph;
        let inst = graph.inst(id);

        if inst.block != block {
            self.error(format!("{:?} owned by {:?} but listed in {:?}", id, inst.block, block));
        }
        if inst.removed {
            self.error(format!("removed instruction {:?} still listed in {:?}", id, block));
        }

        for &input in &inst.inputs {
            let def = graph.inst(input);
            if def.removed {
                self.error(format!("{:?} uses removed {:?}", id, input));
            }
            if !def.uses.contains(&id) {
                self.error(format!("{:?} missing from use list of {:?}", id, input));
            }
        }

        if let Some(env) = &inst.environment {
            let mut missing = Vec::new();
            env.for_each_value(&mut |value| {
                if graph.inst(value).removed {
                    missing.push(value);
                }
            });
            for value in missing {
                self.error(format!("environment of {:?} holds removed {:?}", id, value));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::{DataType, MethodInfo};

    #[test]
    fn test_valid_graph() {
        let mut graph = Graph::new(MethodInfo::new("ok", true, vec![DataType::Void]));
        let entry = graph.entry_block;
        let exit = graph.add_block();
        graph.add_edge(entry, exit);
        graph.add(entry, InstructionKind::ReturnVoid, DataType::Void, &[]);
        graph.add(exit, InstructionKind::Exit, DataType::Void, &[]);
        graph.set_exit_block(exit);
        assert!(GraphChecker::new(&graph).run().is_empty());
    }

    #[test]
    fn test_reports_missing_terminator_and_asymmetric_edge() {
        let mut graph = Graph::new(MethodInfo::new("bad", true, vec![DataType::Void]));
        let entry = graph.entry_block;
        let other = graph.add_block();
        graph.add(entry, InstructionKind::IntConstant(1), DataType::Int32, &[]);
        graph.block_mut(entry).successors.push(other);
        graph.add(other, InstructionKind::ReturnVoid, DataType::Void, &[]);

        let errors = GraphChecker::new(&graph).run();
        assert!(errors.iter().any(|e| e.contains("non-terminator")));
        assert!(errors.iter().any(|e| e.contains("as successor")));
    }
}
