// recompile.rs — Flag functions for recompile-on-entry
//
// A function whose body contains a loop, or a block that needs dynamic
// recompilation inside a loop, is recompiled once as a whole on entry.
//
// Preconditions: per-block recompile requirements are set by the front-end.
// Postconditions: `recompile_once` set on every flagged script function;
//   existing flags are never cleared.
// Side effects: mutates function flags only.

use tracing::debug;

use crate::id::FunctionKey;
use crate::program::{Block, FunctionTable};

/// Flag every script function that needs recompile-on-entry. Returns the
/// flagged keys.
pub fn flag_recompile_once(functions: &mut FunctionTable) -> Vec<FunctionKey> {
    let mut flagged = Vec::new();
    for key in functions.keys() {
        let Some(function) = functions.get_mut(&key) else {
            continue;
        };
        let needs = function
            .blocks()
            .is_some_and(|blocks| blocks.iter().any(|b| requires_recompile(b, false)));
        if needs {
            function.recompile_once = true;
            debug!(function = %key, "flagged for recompile-once");
            flagged.push(key);
        }
    }
    flagged
}

/// Whether `block` needs recompilation when executed inside a loop.
/// Loop sizes are not decidable here, so loops always report true.
pub fn requires_recompile(block: &Block, in_loop: bool) -> bool {
    match block {
        Block::While { .. } | Block::For { .. } => true,
        Block::If {
            if_body,
            else_body,
            predicate_requires_recompile,
            ..
        } => {
            (in_loop && *predicate_requires_recompile)
                || if_body
                    .iter()
                    .chain(else_body)
                    .any(|b| requires_recompile(b, in_loop))
        }
        Block::Generic {
            requires_recompile, ..
        } => in_loop && *requires_recompile,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ProgramBuilder;
    use crate::dag::DataKind;
    use crate::program::DEFAULT_NAMESPACE;

    fn define(
        b: &mut ProgramBuilder,
        name: &str,
        blocks: impl FnOnce(&mut ProgramBuilder) -> Vec<Block>,
    ) {
        b.function(
            FunctionKey::new(DEFAULT_NAMESPACE, name),
            &[("A", DataKind::Matrix)],
            &[("B", DataKind::Matrix)],
            blocks,
        );
    }

    #[test]
    fn loops_flag_straight_line_does_not() {
        let mut b = ProgramBuilder::new();
        define(&mut b, "looping", |b| {
            let p = b.lit(true);
            let a = b.read("A");
            let w = b.write("B", a);
            vec![Block::If {
                predicate: p,
                if_body: vec![Block::While {
                    predicate: p,
                    body: vec![ProgramBuilder::generic(vec![w])],
                }],
                else_body: vec![],
                predicate_requires_recompile: false,
            }]
        });
        define(&mut b, "flat", |b| {
            let a = b.read("A");
            let w = b.write("B", a);
            vec![Block::Generic {
                roots: vec![w],
                requires_recompile: true,
            }]
        });
        let mut program = b.finish();

        let flagged = flag_recompile_once(&mut program.functions);
        let looping = FunctionKey::new(DEFAULT_NAMESPACE, "looping");
        assert_eq!(flagged, vec![looping.clone()]);
        assert!(program.functions.get(&looping).unwrap().recompile_once);
        let flat = FunctionKey::new(DEFAULT_NAMESPACE, "flat");
        assert!(!program.functions.get(&flat).unwrap().recompile_once);
    }

    #[test]
    fn generic_blocks_count_only_inside_loops() {
        let block = Block::Generic {
            roots: vec![],
            requires_recompile: true,
        };
        assert!(!requires_recompile(&block, false));
        assert!(requires_recompile(&block, true));
    }
}
