//! Dumps one of a handful of hand-built example blocks through the
//! pipeline, at whichever stage the caller asks for. There is no guest
//! decoder in this crate (front ends are out of scope, see
//! `front::GuestFrontEnd`), so the inputs here are built directly with
//! `ir::Builder` rather than read from a file.
//!
//! Run with `--help` for the scenario/stage catalogue.

use clap::{Parser, ValueEnum};

use xlate_core::context::{TranslationContext, TranslationControls};
use xlate_core::front::NullFrontEnd;
use xlate_core::ir::check::typecheck;
use xlate_core::ir::{Binop, Builder, IRBB, IRConst, IRType, JumpKind};
use xlate_core::middle::selector::Selector;
use xlate_core::middle::{allocate, optimize};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// which example block to build
    #[arg(value_enum, default_value_t = Scenario::Add)]
    scenario: Scenario,
    /// which pipeline stage to print
    #[arg(value_enum, short, long, default_value_t = Stage::Code)]
    stage: Stage,
    /// skip `middle::optimize` (useful for eyeballing its effect)
    #[arg(short = 'O', long, default_value_t = false)]
    no_optimize: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Scenario {
    /// `t1 := Get(rax) + Get(rbx); Put(rax, t1)`
    Add,
    /// `t1 := Const(0x1122334455667788); Put(rax, t1)` — exercises the
    /// 10-byte `movabs` tile.
    Movabs,
    /// a guarded side exit: `Exit(t1 != 0, Boring, 0xDEAD)` falling
    /// through to `next = rip + 4`.
    SideExit,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Stage {
    /// the IR, pretty-printed via `{:?}`
    Ir,
    /// the selected host-instruction list, over virtual registers
    Selected,
    /// the allocated host-instruction list, over physical registers
    Allocated,
    /// the final machine code, as hex
    Code,
}

fn build(scenario: Scenario) -> IRBB {
    let mut b = Builder::new(0x1000);
    match scenario {
        Scenario::Add => {
            let rax = b.get(0, IRType::I64);
            let rbx = b.get(8, IRType::I64);
            let sum = b.binop(Binop::Add(IRType::I64), rax, rbx);
            let t1 = b.assign_fresh(IRType::I64, sum);
            let t1r = b.tmp_ref(t1);
            b.put(0, t1r);
            let next = b.konst(IRConst::U64(0x1004));
            b.finish(next, JumpKind::Boring)
        }
        Scenario::Movabs => {
            let k = b.konst(IRConst::U64(0x1122334455667788));
            let t1 = b.assign_fresh(IRType::I64, k);
            let t1r = b.tmp_ref(t1);
            b.put(0, t1r);
            let next = b.konst(IRConst::U64(0x1009));
            b.finish(next, JumpKind::Boring)
        }
        Scenario::SideExit => {
            let rax = b.get(0, IRType::I64);
            let zero = b.konst(IRConst::U64(0));
            let guard = b.binop(Binop::CmpNe(IRType::I64), rax, zero);
            let t1 = b.assign_fresh(IRType::I1, guard);
            let t1r = b.tmp_ref(t1);
            b.exit(t1r, JumpKind::Boring, IRConst::U64(0xDEAD));
            let next = b.konst(IRConst::U64(0x1004));
            b.finish(next, JumpKind::Boring)
        }
    }
}

fn main() {
    let args = Args::parse();
    let mut bb = build(args.scenario);

    typecheck(&bb).expect("hand-built example block should already be well-typed");

    let front = NullFrontEnd;
    if !args.no_optimize {
        optimize(&mut bb, &front);
    }

    if args.stage == Stage::Ir {
        println!("{bb:?}");
        return;
    }

    let selected = Selector::select_block(&bb);
    if args.stage == Stage::Selected {
        for i in &selected {
            println!("{i:?}");
        }
        return;
    }

    let ctx = TranslationContext::new(TranslationControls::default(), 0);
    let allocated = allocate(selected, &ctx.alloc_policy).expect("example block should allocate cleanly");
    if args.stage == Stage::Allocated {
        for i in &allocated {
            println!("{i:?}");
        }
        return;
    }

    let code = xlate_core::back::amd64::assemble(&allocated).expect("example block should assemble cleanly");
    let hex: String = code.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ");
    println!("{hex}");
}
