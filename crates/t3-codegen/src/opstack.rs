//! Compile-time simulation of the runtime operand-stack depth (§3, §4.4).
//!
//! Each opcode has a known push/pop count (dynamic for the call family, which
//! the generator resolves itself since it has the argc in hand). `OpStack`
//! just adds and subtracts, tracking both the current depth and the peak
//! depth seen so far within one method; the generator reads `peak()` back at
//! method close to fill in the method header's `max_stack` field.
//!
//! `snapshot`/`restore` exist so `FunctionBuilder` can undo an already-
//! applied instruction's effect when the peephole optimizer later erases
//! that instruction during fusion -- otherwise a transient push that never
//! survives to the final bytecode could inflate `peak` past what the
//! method actually needs.

/// Per-method operand-stack depth tracker. `FunctionBuilder` constructs a
/// fresh one for every method body rather than reusing and clearing one
/// (§3's lifecycle rule -- this is not shared process-wide state).
#[derive(Debug, Clone)]
pub struct OpStack {
    depth: i32,
    peak: i32,
}

impl Default for OpStack {
    fn default() -> Self {
        Self::new()
    }
}

impl OpStack {
    pub fn new() -> Self {
        OpStack { depth: 0, peak: 0 }
    }

    pub fn depth(&self) -> i32 {
        self.depth
    }

    pub fn peak(&self) -> i32 {
        self.peak
    }

    pub fn note_pop(&mut self, n: u16) {
        self.depth -= n as i32;
    }

    pub fn note_push(&mut self, n: u16) {
        self.depth += n as i32;
        if self.depth > self.peak {
            self.peak = self.depth;
        }
    }

    /// Apply an opcode's net effect in pop-then-push order, matching the
    /// runtime (an opcode always consumes its operands before producing a
    /// result).
    pub fn apply(&mut self, pops: u16, pushes: u16) {
        self.note_pop(pops);
        self.note_push(pushes);
    }

    /// Whether depth has returned to `entry_depth` -- the contract every
    /// statement in non-expression context must satisfy (§4.4). Checked by
    /// `codegen::gen_stmt` around every statement it generates.
    pub fn balanced_since(&self, entry_depth: i32) -> bool {
        self.depth == entry_depth
    }

    /// Capture `(depth, peak)` so a caller can undo a provisional `apply`
    /// later -- used when the peephole optimizer erases an already-applied
    /// instruction during fusion (see `FunctionBuilder::emit`).
    pub fn snapshot(&self) -> (i32, i32) {
        (self.depth, self.peak)
    }

    pub fn restore(&mut self, snapshot: (i32, i32)) {
        self.depth = snapshot.0;
        self.peak = snapshot.1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_peak_above_current_depth() {
        let mut s = OpStack::new();
        s.apply(0, 3);
        s.apply(2, 0);
        assert_eq!(s.depth(), 1);
        assert_eq!(s.peak(), 3);
    }

    #[test]
    fn depth_can_underflow_to_negative_for_a_buggy_sequence() {
        // The model doesn't panic on underflow -- it records whatever depth
        // results so the caller (or `t3_bytecode::verify`) can report it as
        // a precise error instead of a debug-only assertion failure.
        let mut s = OpStack::new();
        s.apply(1, 0);
        assert_eq!(s.depth(), -1);
    }

    #[test]
    fn balanced_since_checks_statement_exit_contract() {
        let mut s = OpStack::new();
        let entry = s.depth();
        s.apply(0, 1);
        assert!(!s.balanced_since(entry));
        s.apply(1, 0);
        assert!(s.balanced_since(entry));
    }
}
