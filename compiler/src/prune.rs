// prune.rs — Removal of functions never reached from the main program
//
// Preconditions: `reachable` holds every function key seen by candidate
//   selection before pruning.
// Postconditions: the function table holds only reachable functions.
// Side effects: removes entries (and emptied namespaces) from the table.

use std::collections::BTreeSet;

use tracing::debug;

use crate::id::FunctionKey;
use crate::program::FunctionTable;

/// Remove every function whose key is not in `reachable`. Returns the
/// removed keys in table order.
pub fn remove_unused_functions<'k>(
    functions: &mut FunctionTable,
    reachable: impl IntoIterator<Item = &'k FunctionKey>,
) -> Vec<FunctionKey> {
    let keep: BTreeSet<&FunctionKey> = reachable.into_iter().collect();
    let mut removed = Vec::new();
    for key in functions.keys() {
        if !keep.contains(&key) {
            functions.remove(&key);
            debug!(function = %key, "removed unused function");
            removed.push(key);
        }
    }
    removed
}
