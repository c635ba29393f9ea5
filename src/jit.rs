//! Compiled tier for hot methods.
//!
//! There is no machine code generation. Promoting a method decodes its
//! whole body once into a `CompiledPlan`, an array of ready-to-dispatch
//! instructions indexed by code unit, and every later invocation runs from
//! that plan instead of decoding the instruction stream on each step.
use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};

use crate::bytecode::{decode_all, Decoded};
use crate::profiler::Profiler;
use crate::program::{CodeItem, MethodKey};

/// Execution path a call was routed to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Tier {
    Interpreted,
    Compiled,
    Native,
}

/// Pre-decoded method body.
#[derive(Debug)]
pub struct CompiledPlan {
    // Instruction starting at each code unit; `None` inside multi-unit
    // instructions, payload tables and past the first undecodable unit.
    ops: Vec<Option<Decoded>>,
    instructions: usize,
}

impl CompiledPlan {
    pub fn compile(code: &CodeItem) -> Self {
        let (decoded, err) = decode_all(code);
        if let Some(err) = err {
            // The interpreter decodes from here on and reports the fault if
            // execution ever reaches it.
            warn!(target: "jit", "partial plan: {}", err);
        }
        let instructions = decoded.len();
        let mut ops = vec![None; code.len()];
        for (pc, op) in decoded {
            ops[pc] = Some(op);
        }
        Self { ops, instructions }
    }

    pub fn get(&self, pc: usize) -> Option<&Decoded> {
        self.ops.get(pc).and_then(Option::as_ref)
    }

    /// Number of decoded instructions.
    pub fn instructions(&self) -> usize {
        self.instructions
    }
}

#[derive(Debug)]
pub struct CompiledMethod {
    pub plan: Arc<CompiledPlan>,
    /// Invocation count at promotion.
    pub promoted_at: u64,
}

/// Per-method invocation accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodStats {
    pub invocations: u64,
    pub interpreted_runs: u64,
    pub compiled_runs: u64,
}

/// `JitCache` owns the invocation profiler and the compiled plans, and
/// decides which tier each invocation runs in.
#[derive(Debug)]
pub struct JitCache {
    enabled: bool,
    profiler: Profiler,
    methods: HashMap<MethodKey, CompiledMethod>,
    stats: HashMap<MethodKey, MethodStats>,
    promotions: u64,
}

impl JitCache {
    pub fn new(threshold: u64, enabled: bool) -> Self {
        Self {
            enabled,
            profiler: Profiler::new(threshold),
            methods: HashMap::new(),
            stats: HashMap::new(),
            promotions: 0,
        }
    }

    /// Counts an invocation of `key`. Returns true exactly once: on the
    /// invocation that brings the count to the threshold, provided the
    /// method has no compiled entry yet.
    pub fn should_promote(&mut self, key: &MethodKey) -> bool {
        let count = self.profiler.count_invocation(key);
        self.stats.entry(key.clone()).or_default().invocations += 1;
        self.enabled && count == self.profiler.threshold() && !self.methods.contains_key(key)
    }

    /// Compiles `code` and installs it as the entry point of `key`.
    pub fn promote(&mut self, key: &MethodKey, code: &CodeItem) -> Arc<CompiledPlan> {
        let plan = Arc::new(CompiledPlan::compile(code));
        let promoted_at = self.profiler.count(key);
        info!(
            target: "jit",
            "promoted {} after {} invocations ({} instructions)",
            key,
            promoted_at,
            plan.instructions()
        );
        self.methods.insert(
            key.clone(),
            CompiledMethod {
                plan: Arc::clone(&plan),
                promoted_at,
            },
        );
        self.promotions += 1;
        plan
    }

    pub fn has_compiled(&self, key: &MethodKey) -> bool {
        self.methods.contains_key(key)
    }

    pub fn compiled(&self, key: &MethodKey) -> Option<&CompiledMethod> {
        self.methods.get(key)
    }

    /// Tiering gate run on every bytecode method entry. Returns the plan to
    /// execute from, or `None` to interpret.
    pub fn enter(&mut self, key: &MethodKey, code: &CodeItem) -> Option<Arc<CompiledPlan>> {
        if self.should_promote(key) {
            self.promote(key, code);
        }
        let plan = self.methods.get(key).map(|m| Arc::clone(&m.plan));
        let stats = self.stats.entry(key.clone()).or_default();
        match plan {
            Some(_) => stats.compiled_runs += 1,
            None => stats.interpreted_runs += 1,
        }
        plan
    }

    pub fn stats(&self, key: &MethodKey) -> Option<&MethodStats> {
        self.stats.get(key)
    }

    pub fn promotions(&self) -> u64 {
        self.promotions
    }

    /// Forgets plans and counters for a class whose definition was
    /// replaced.
    pub fn invalidate_class(&mut self, class: &str) {
        self.methods.retain(|key, _| key.class != class);
        self.profiler.forget_class(class);
    }
}

impl Default for JitCache {
    fn default() -> Self {
        Self::new(10, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Op;
    use crate::program::Instruction;

    fn key() -> MethodKey {
        MethodKey {
            class: "LHot;".into(),
            name: "f".into(),
            signature: "()I".into(),
        }
    }

    fn code() -> CodeItem {
        // const/16 v0, 42; return v0
        let units: [u16; 3] = [0x0013, 42, 0x000f];
        CodeItem {
            registers_size: 1,
            ins_size: 0,
            outs_size: 0,
            debug_info_off: 0,
            insns: units
                .iter()
                .map(|u| Instruction {
                    opcode: (u & 0xff) as u8,
                    operand: (u >> 8) as u8,
                    offset: 0,
                })
                .collect(),
            tries: Vec::new(),
        }
    }

    #[test]
    fn promotes_exactly_once_at_threshold() {
        let mut jit = JitCache::new(10, true);
        let (key, code) = (key(), code());
        for _ in 0..9 {
            assert!(jit.enter(&key, &code).is_none());
        }
        assert!(!jit.has_compiled(&key));
        assert!(jit.enter(&key, &code).is_some());
        assert_eq!(jit.promotions(), 1);
        assert!(jit.enter(&key, &code).is_some());
        assert_eq!(jit.promotions(), 1);
        assert_eq!(jit.compiled(&key).unwrap().promoted_at, 10);
        let stats = jit.stats(&key).unwrap();
        assert_eq!(stats.invocations, 11);
        assert_eq!(stats.interpreted_runs, 9);
        assert_eq!(stats.compiled_runs, 2);
    }

    #[test]
    fn disabled_cache_never_promotes() {
        let mut jit = JitCache::new(1, false);
        let (key, code) = (key(), code());
        for _ in 0..5 {
            assert!(jit.enter(&key, &code).is_none());
        }
        assert_eq!(jit.promotions(), 0);
    }

    #[test]
    fn plan_holds_decoded_instructions_by_address() {
        let plan = CompiledPlan::compile(&code());
        assert_eq!(plan.instructions(), 2);
        assert_eq!(plan.get(0).unwrap().op, Op::Const { dst: 0, value: 42 });
        assert!(plan.get(1).is_none());
        assert!(plan.get(2).is_some());
    }

    #[test]
    fn invalidation_restarts_profiling() {
        let mut jit = JitCache::new(2, true);
        let (key, code) = (key(), code());
        jit.enter(&key, &code);
        jit.enter(&key, &code);
        assert!(jit.has_compiled(&key));
        jit.invalidate_class("LHot;");
        assert!(!jit.has_compiled(&key));
        assert!(jit.enter(&key, &code).is_none());
        assert!(jit.enter(&key, &code).is_some());
    }
}
