//! The linear-scan register allocator (§4.3): rewrites an `HInstr` list
//! over virtual registers into one over physical registers, inserting
//! spills and reloads where pressure forces eviction.

use std::collections::HashMap;

use crate::common::Map;
use crate::error::CoreError;
use crate::middle::hreg::{HReg, HRegClass};
use crate::middle::host_instr::HInstr;

/// Per-class pool of allocable physical registers and the caller's choice
/// of spill-slot base offset, threaded through from the driver (§4.3
/// "a caller-provided stack frame offset").
pub struct AllocPolicy {
    pub allocable: Map<HRegClass, Vec<HReg>>,
    pub spill_base: i32,
    pub slot_size: i32,
}

#[derive(Debug, Clone, Copy)]
struct Interval {
    first_def: usize,
    last_use: usize,
}

/// Allocate `instrs` in place, replacing every virtual register with a
/// physical one and inserting `Spill`/`Reload` instructions as needed.
pub fn allocate(instrs: Vec<HInstr>, policy: &AllocPolicy) -> Result<Vec<HInstr>, CoreError> {
    let intervals = compute_intervals(&instrs);
    let mut alloc = Allocator::new(policy);
    alloc.run(instrs, &intervals)
}

/// One backward sweep computing `[first_def, last_use]` per vreg (§4.3
/// step 1–2): a `read` extends the range back to the definition, a
/// `written` starts a fresh range, `modified` does both.
fn compute_intervals(instrs: &[HInstr]) -> HashMap<HReg, Interval> {
    let mut intervals: HashMap<HReg, Interval> = HashMap::new();
    for (i, instr) in instrs.iter().enumerate() {
        let usage = instr.reg_usage();
        for r in usage.read.iter().chain(usage.modified.iter()) {
            if !r.is_virtual() {
                continue;
            }
            intervals
                .entry(*r)
                .and_modify(|iv| iv.last_use = iv.last_use.max(i))
                .or_insert(Interval { first_def: i, last_use: i });
        }
        for r in usage.written.iter().chain(usage.modified.iter()) {
            if !r.is_virtual() {
                continue;
            }
            intervals
                .entry(*r)
                .and_modify(|iv| iv.first_def = iv.first_def.min(i))
                .or_insert(Interval { first_def: i, last_use: i });
        }
    }
    intervals
}

struct ActiveEntry {
    vreg: HReg,
    preg: HReg,
    ends_at: usize,
}

struct Allocator<'a> {
    policy: &'a AllocPolicy,
    free: Map<HRegClass, Vec<HReg>>,
    free_slots: Map<HRegClass, Vec<i32>>,
    next_slot: Map<HRegClass, i32>,
    active: Vec<ActiveEntry>,
    assigned: HashMap<HReg, HReg>,
    spilled_to: HashMap<HReg, i32>,
}

impl<'a> Allocator<'a> {
    fn new(policy: &'a AllocPolicy) -> Self {
        Allocator {
            policy,
            free: policy.allocable.clone(),
            free_slots: Map::new(),
            next_slot: Map::new(),
            active: Vec::new(),
            assigned: HashMap::new(),
            spilled_to: HashMap::new(),
        }
    }

    fn run(&mut self, instrs: Vec<HInstr>, intervals: &HashMap<HReg, Interval>) -> Result<Vec<HInstr>, CoreError> {
        let mut out = Vec::with_capacity(instrs.len());

        for i in 0..instrs.len() {
            self.expire_active(i);

            // Reload any spilled vreg this instruction reads before
            // rewriting it (§4.3 step 4).
            //
            // Every vreg this instruction touches — read, written, or
            // modified — is off limits as a spill victim for the rest of
            // this instruction's allocation: it is either already assigned
            // a register this instruction is about to read, or it is about
            // to be assigned one below, and in both cases evicting it mid-
            // instruction would either emit an unmapped vreg (`map_regs`
            // hasn't run yet) or silently read back stale spilled contents.
            let usage = instrs[i].reg_usage();
            let current_vregs: Vec<HReg> = usage
                .read
                .iter()
                .chain(usage.written.iter())
                .chain(usage.modified.iter())
                .filter(|r| r.is_virtual())
                .copied()
                .collect();

            for r in usage.read.iter().chain(usage.modified.iter()) {
                if r.is_virtual() && !self.assigned.contains_key(r) {
                    if let Some(slot) = self.spilled_to.get(r).copied() {
                        let iv = intervals.get(r).copied().unwrap_or(Interval { first_def: i, last_use: i });
                        let preg = self.acquire(r.class(), &current_vregs, &mut out)?;
                        out.push(HInstr::Reload { dst: preg, slot });
                        self.assigned.insert(*r, preg);
                        self.active.push(ActiveEntry { vreg: *r, preg, ends_at: iv.last_use });
                    }
                }
            }

            // Move coalescing (§4.3 step 2): if this instruction is a move
            // from a still-live vreg into a fresh one, and this is the
            // source's last use, splice the destination onto the same
            // physical register instead of handing it a fresh one — the
            // move then encodes as `reg <- reg` and is dropped below. This
            // has to run on the pre-mapping (virtual) src/dst, before the
            // generic def-allocation loop claims a register for `dst`.
            if let Some((src, dst)) = instrs[i].is_move() {
                if src.is_virtual() && dst.is_virtual() && !self.assigned.contains_key(&dst) {
                    if let Some(&preg) = self.assigned.get(&src) {
                        let src_ends = intervals.get(&src).map(|iv| iv.last_use).unwrap_or(i);
                        if src_ends == i {
                            let dst_ends = intervals.get(&dst).map(|iv| iv.last_use).unwrap_or(i);
                            if let Some(entry) = self.active.iter_mut().find(|e| e.vreg == src) {
                                entry.vreg = dst;
                                entry.ends_at = dst_ends;
                            }
                            self.assigned.insert(dst, preg);
                        }
                    }
                }
            }

            // Allocate fresh vregs defined here (§4.3 step 3).
            for r in usage.written.iter().chain(usage.modified.iter()) {
                if r.is_virtual() && !self.assigned.contains_key(r) {
                    let iv = intervals.get(r).copied().unwrap_or(Interval { first_def: i, last_use: i });
                    let preg = self.acquire(r.class(), &current_vregs, &mut out)?;
                    self.assigned.insert(*r, preg);
                    self.active.push(ActiveEntry { vreg: *r, preg, ends_at: iv.last_use });
                }
            }

            let assigned = &self.assigned;
            let mut instr = instrs[i].clone();
            instr.map_regs(&|r| if r.is_virtual() { *assigned.get(&r).unwrap_or(&r) } else { r });

            // Move coalescing (§4.3 "Move coalescing"): drop a move whose
            // src and dst landed on the same physical register.
            if let Some((src, dst)) = instr.is_move() {
                if src == dst {
                    continue;
                }
            }
            out.push(instr);
        }

        Ok(out)
    }

    fn expire_active(&mut self, i: usize) {
        let mut still_active = Vec::with_capacity(self.active.len());
        for entry in self.active.drain(..) {
            if entry.ends_at < i {
                self.free.entry(entry.preg.class()).or_default().push(entry.preg);
                // This vreg's interval is over; if it had been spilled and
                // later reloaded, its slot can now be reused (§4.3 "Spill
                // slots are reused in LIFO order per class").
                if let Some(slot) = self.spilled_to.remove(&entry.vreg) {
                    self.free_slots.entry(entry.preg.class()).or_default().push(slot);
                }
            } else {
                still_active.push(entry);
            }
        }
        self.active = still_active;
    }

    /// Acquire a physical register of `class`, spilling the longest-lived
    /// active vreg of that class (emitting its `Spill` instruction into
    /// `out`) if none is free (§4.3 step 3). `protect` lists vregs the
    /// current instruction itself touches — never eligible as a spill
    /// victim here, since they are already (or about to be) bound to a
    /// register this same instruction depends on.
    fn acquire(&mut self, class: HRegClass, protect: &[HReg], out: &mut Vec<HInstr>) -> Result<HReg, CoreError> {
        if let Some(preg) = self.free.entry(class).or_default().pop() {
            return Ok(preg);
        }
        self.spill_longest_lived(class, protect, out)
    }

    fn spill_longest_lived(&mut self, class: HRegClass, protect: &[HReg], out: &mut Vec<HInstr>) -> Result<HReg, CoreError> {
        let victim_idx = self
            .active
            .iter()
            .enumerate()
            .filter(|(_, e)| e.preg.class() == class && !protect.contains(&e.vreg))
            .max_by_key(|(_, e)| e.ends_at)
            .map(|(idx, _)| idx);

        let Some(victim_idx) = victim_idx else {
            return Err(CoreError::AllocationExhausted(class));
        };
        let victim = self.active.remove(victim_idx);

        let slot = self.alloc_slot(class);
        out.push(HInstr::Spill { src: victim.preg, slot });
        self.spilled_to.insert(victim.vreg, slot);
        self.assigned.remove(&victim.vreg);
        Ok(victim.preg)
    }

    /// Spill slots are reused LIFO per class (§4.3 "Guarantees"); a slot
    /// freed by expiry goes back on `free_slots` rather than growing the
    /// frame further.
    fn alloc_slot(&mut self, class: HRegClass) -> i32 {
        if let Some(slot) = self.free_slots.entry(class).or_default().pop() {
            return slot;
        }
        let next = self.next_slot.entry(class).or_insert(0);
        let slot = self.policy.spill_base + *next * self.policy.slot_size;
        *next += 1;
        slot
    }
}
