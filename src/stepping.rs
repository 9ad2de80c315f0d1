//! Interactive stepping: one tick per ENTER, with register diffs, bus
//! counters and cache dumps after each tick.

use crate::isa::NUM_REGS;
use crate::sim::Simulator;
use crate::{pe_id, word};
use console::style;
use std::io::BufRead;

fn fmt_reg(r: usize, value: word) -> String {
    match r {
        // R1..R3 hold addresses in the canonical workload
        1..=3 => format!("R{r}={value:#x} ({value})"),
        // upper registers carry doubles
        4.. => format!("R{r}={value:#x} (f64={:.6})", f64::from_bits(value)),
        _ => format!("R{r}={value:#x}"),
    }
}

fn print_regs(sim: &Simulator, pe: pe_id) {
    let core = sim.core(pe).lock().unwrap();
    println!("{}", style(format!("registers PE{pe}:")).bold());
    for r in 0..NUM_REGS {
        println!("  {}", fmt_reg(r, core.reg(r)));
    }
}

fn print_bus(sim: &Simulator) {
    let bus = sim.bus().lock().unwrap();
    let stats = bus.stats();
    let counts: Vec<String> = stats
        .command_counts()
        .filter(|(_, count)| *count > 0)
        .map(|(cmd, count)| format!("{cmd}={count}"))
        .collect();
    println!(
        "{} bytes={} flushes={} pending={} {}",
        style("[bus]").cyan(),
        stats.bytes,
        stats.flushes,
        sim.queue().len(),
        counts.join(" "),
    );
}

fn snapshot(sim: &Simulator) -> Vec<[word; NUM_REGS]> {
    (0..sim.config().num_pes)
        .map(|pe| {
            let core = sim.core(pe).lock().unwrap();
            std::array::from_fn(|r| core.reg(r))
        })
        .collect()
}

fn print_diffs(sim: &Simulator, before: &[[word; NUM_REGS]]) {
    for (pe, regs_before) in before.iter().enumerate() {
        let core = sim.core(pe).lock().unwrap();
        let mut any = false;
        for r in 0..NUM_REGS {
            let now = core.reg(r);
            if now != regs_before[r] {
                if !any {
                    println!("[PE{pe}]");
                    any = true;
                }
                println!("  R{r}: {:#x} -> {now:#x}", regs_before[r]);
            }
        }
        if !any {
            println!("[PE{pe}] {}", style("(no register changes)").dim());
        }
    }
}

fn one_tick(sim: &Simulator, step: u64) {
    println!("\n{}", style(format!("===== step {step} =====")).bold());
    for pe in 0..sim.config().num_pes {
        if sim.core(pe).lock().unwrap().is_done() {
            println!("[PE{pe}] {}", style("done").dim());
        }
    }
    let before = snapshot(sim);
    sim.advance_one_tick();
    print_diffs(sim, &before);
    print_bus(sim);
    for pe in 0..sim.config().num_pes {
        println!("[PE{pe}] cache:");
        print!("{}", sim.cache(pe).lock().unwrap().dump(None, false));
    }
}

/// Run the simulation one tick at a time from stdin.
///
/// ENTER = one tick, `c` = free-run to completion, `r` = registers,
/// `b` = bus counters, `q` = quit.
pub fn run(sim: &Simulator) {
    println!(
        "{}",
        style("interactive stepping: ENTER=step c=continue r=regs b=bus q=quit").bold()
    );

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    let mut auto_run = false;
    let mut step = 0;

    while !sim.all_done() {
        if !auto_run {
            println!("[step {step}] >");
            let Some(Ok(line)) = lines.next() else {
                println!("stdin closed, leaving stepping mode");
                break;
            };
            match line.trim() {
                "q" | "Q" => break,
                "c" | "C" => auto_run = true,
                "r" | "R" => {
                    for pe in 0..sim.config().num_pes {
                        print_regs(sim, pe);
                    }
                    continue;
                }
                "b" | "B" => {
                    print_bus(sim);
                    continue;
                }
                _ => {}
            }
        }
        one_tick(sim, step);
        step += 1;
    }
    println!("stepping finished after {step} steps");
}
