#![allow(dead_code)]
#![allow(unused_variables)]
#![allow(unused_imports)]
use viewrules::{*, error::*, settings::*, context::*, registry::*, watch::*, viz::*, demo::*, util::*};
use std::{process, str::FromStr, sync::Arc, io::{self, Write}};

// Evaluates watch expressions against a built-in demo program state and prints the visible rows.
//   viewrules [--rules text] [--window a..b] [--depth N] [--chars N] [--expand path]... [--child expr=rules]... [--hex] expr...
// Paths are dot-separated child indices: --expand 1.0 expands the first child of the root's second child. The root is expanded
// unless --collapse is given.

fn usage(prog: &str) -> ! {
    eprintln!("usage: {} [--rules text] [--window a..b] [--depth N] [--chars N] [--expand path]... [--child expr=rules]... [--hex] [--collapse] [--threads N] [--list-rules] expr...", prog);
    process::exit(1);
}

fn parse_usize(args: &[String], i: usize) -> usize {
    match args.get(i+1).and_then(|s| usize::from_str(s).ok()) {
        Some(x) => x,
        None => {
            eprintln!("{} requires a number", args[i]);
            process::exit(1);
        }
    }
}

fn parse_path(s: &str) -> Result<Vec<usize>> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    let mut res: Vec<usize> = Vec::new();
    for p in s.split('.') {
        res.push(usize::from_str(p)?);
    }
    Ok(res)
}

fn parse_window(s: &str) -> Result<std::ops::Range<usize>> {
    let Some((a, b)) = s.split_once("..") else { return err!(Usage, "expected a..b, got '{}'", s) };
    let a = if a.is_empty() {0} else {usize::from_str(a)?};
    let b = if b.is_empty() {usize::MAX} else {usize::from_str(b)?};
    Ok(a..b)
}

fn main() {
    let mut settings = Settings::default();
    let mut rules = String::new();
    let mut state = ExpansionState::root_expanded();
    let mut window = 0..usize::MAX;
    let mut list_rules = false;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1usize;
    while i < args.len() && args[i].starts_with("--") {
        match &args[i][..] {
            "--rules" => {
                let Some(r) = args.get(i+1) else { usage(&args[0]) };
                if !rules.is_empty() {
                    rules.push(' ');
                }
                rules.push_str(r);
                i += 2;
            }
            "--hex" => {
                rules.push_str(" hex");
                i += 1;
            }
            "--window" => {
                let Some(w) = args.get(i+1) else { usage(&args[0]) };
                window = match parse_window(w) {
                    Ok(w) => w,
                    Err(e) => { eprintln!("--window: {}", e); process::exit(1); }
                };
                i += 2;
            }
            "--depth" => { settings.max_depth = parse_usize(&args, i); i += 2; }
            "--chars" => { settings.max_line_chars = parse_usize(&args, i).max(1); i += 2; }
            "--threads" => { settings.max_threads = parse_usize(&args, i).max(1); i += 2; }
            "--expand" => {
                let Some(p) = args.get(i+1) else { usage(&args[0]) };
                match parse_path(p) {
                    Ok(p) => state.expand(&p),
                    Err(e) => { eprintln!("--expand: bad path '{}': {}", p, e); process::exit(1); }
                }
                i += 2;
            }
            "--child" => {
                let Some((expr, r)) = args.get(i+1).and_then(|s| s.split_once('=')) else {
                    eprintln!("--child requires expr=rules");
                    process::exit(1);
                };
                state.set_child_rules(expr.trim(), r);
                i += 2;
            }
            "--collapse" => {
                state.collapse(&[]);
                i += 1;
            }
            "--list-rules" => {
                list_rules = true;
                i += 1;
            }
            x => {
                eprintln!("unrecognized argument: '{}'", x);
                usage(&args[0]);
            }
        }
    }
    let exprs = args[i..].to_vec();
    if exprs.is_empty() && !list_rules {
        usage(&args[0]);
    }

    if let Err(e) = run(settings, rules, state, window, exprs, list_rules) {
        eprintln!("fatal: {}", e);
        process::exit(1);
    }
}

fn print_rules(registry: &RuleRegistry, out: &mut impl Write) -> Result<()> {
    for spec in registry.enumerate() {
        let mut flags: Vec<&str> = Vec::new();
        if spec.flags.inherited { flags.push("inherited"); }
        if spec.flags.forced_expandable { flags.push("expandable"); }
        writeln!(out, "{:<28} {:<40} {}", spec.signature(), spec.description, flags.join(","))?;
    }
    Ok(())
}

fn run(settings: Settings, rules: String, state: ExpansionState, window: std::ops::Range<usize>, exprs: Vec<String>, list_rules: bool) -> Result<()> {
    let num_threads = std::thread::available_parallelism().map_or(8, |n| n.get()).min(settings.max_threads).max(1);
    let context = Context::new(Settings {max_threads: num_threads, ..settings}, Arc::new(RuleRegistry::with_builtins()))?;
    let mut out = io::stdout().lock();
    if list_rules {
        print_rules(&context.registry, &mut out)?;
    }

    let demo = DemoProgram::new();
    let env = context.env(demo.types.clone(), demo.memory.clone(), demo.evaluator.clone());
    // All watches evaluate concurrently; print in order.
    let handles: Vec<WatchHandle> = exprs.iter().map(|e| {
        let req = WatchRequest {expr: e.clone(), annotation: rules.trim().to_string(), state: state.clone(), window: window.clone()};
        context.submit(req, env.clone())
    }).collect();
    for (expr, h) in exprs.iter().zip(handles) {
        let res = h.wait()?;
        writeln!(out, "{} ({} rows)", expr, PrettyCount(res.total_rows))?;
        for row in &res.rows {
            let marker = if !row.expandable { "  " } else if row.expanded { "▾ " } else { "▸ " };
            let warn = if row.has_warning() { " !" } else { "" };
            let path: Vec<String> = row.path.iter().map(|p| p.to_string()).collect();
            writeln!(out, "{:indent$}{}{} = {}{}    [{}] {}", "", marker, row.name, row.display, warn, path.join("."), row.expr, indent = row.depth * 2)?;
        }
        for line in &res.log {
            writeln!(out, "  warning: {}", line)?;
        }
    }
    Ok(())
}
